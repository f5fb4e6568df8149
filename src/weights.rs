//! Normalization of the per-view weights and OSEM acceleration.
//!
//! After [`WeightNormalizer::process`] the weights of all views sum to at most one in every voxel.
//! Voxels where the raw weights already sum to less than one are left as they are, which keeps the
//! fade-out at view borders.

use crate::config::OsemMode;
use crate::error::{DeconvolutionError, Result};
use crate::volume::{flat_mut, shape_of};
use ndarray::Array3;
use rayon::prelude::*;
use voxel_portions::{
    default_portion_count, divide_into_portions, par_for_each_portion, split_portions_mut,
};

/// How many views contribute to the voxels of the volume.
///
/// Uncovered voxels count as zero views. Both values are floored to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapStatistics {
    pub min_overlapping_views: f64,
    pub avg_overlapping_views: f64,
}

impl Default for OverlapStatistics {
    fn default() -> Self {
        OverlapStatistics {
            min_overlapping_views: 1.0,
            avg_overlapping_views: 1.0,
        }
    }
}

/// Per-portion tally of [`WeightNormalizer::process`].
#[derive(Debug, Clone, Copy)]
struct Tally {
    covered: usize,
    contributions: usize,
    min_views: usize,
    negative: usize,
}

impl Tally {
    const EMPTY: Tally = Tally {
        covered: 0,
        contributions: 0,
        min_views: usize::MAX,
        negative: 0,
    };

    fn merge(self, other: Tally) -> Tally {
        Tally {
            covered: self.covered + other.covered,
            contributions: self.contributions + other.contributions,
            min_views: self.min_views.min(other.min_views),
            negative: self.negative + other.negative,
        }
    }
}

/// Owns the weights of all views of a run and normalizes them in place.
#[derive(Debug, Clone)]
pub struct WeightNormalizer {
    weights: Vec<Array3<f32>>,
    statistics: Option<OverlapStatistics>,
}

impl WeightNormalizer {
    /// Takes the raw weights, all of one shape.
    pub fn new(weights: Vec<Array3<f32>>) -> Result<Self> {
        let Some(first) = weights.first() else {
            return Err(DeconvolutionError::config("no weights to normalize"));
        };
        let shape = shape_of(&first.view());
        if weights.iter().any(|w| shape_of(&w.view()) != shape) {
            return Err(DeconvolutionError::config(
                "all weights must have the same shape",
            ));
        }
        let weights = weights
            .into_iter()
            .map(|w| {
                if w.is_standard_layout() {
                    w
                } else {
                    w.as_standard_layout().into_owned()
                }
            })
            .collect();
        Ok(WeightNormalizer {
            weights,
            statistics: None,
        })
    }

    /// Normalizes the weights and counts the overlapping views.
    ///
    /// Per voxel the weight sum `S` is computed with negative weights treated as zero. If `S > 1`
    /// every weight is divided by `S`. The minimum and average number of views with a positive
    /// weight are taken over all voxels, uncovered ones counting as zero, and each is floored to 1.
    pub fn process(&mut self) -> Result<OverlapStatistics> {
        let len = self.weights[0].len();
        let num_views = self.weights.len();
        let portions = divide_into_portions(len, default_portion_count());

        let mut per_portion: Vec<Vec<&mut [f32]>> = portions
            .iter()
            .map(|_| Vec::with_capacity(num_views))
            .collect();
        for weight in self.weights.iter_mut() {
            let chunks = split_portions_mut(flat_mut(weight)?, &portions);
            for (slot, chunk) in per_portion.iter_mut().zip(chunks) {
                slot.push(chunk);
            }
        }

        let tally = per_portion
            .into_par_iter()
            .map(|mut chunks| {
                let mut tally = Tally::EMPTY;
                let portion_len = chunks.first().map_or(0, |c| c.len());
                for i in 0..portion_len {
                    let mut sum = 0.0f64;
                    let mut views = 0usize;
                    for chunk in chunks.iter_mut() {
                        let w = &mut chunk[i];
                        if *w < 0.0 {
                            *w = 0.0;
                            tally.negative += 1;
                        }
                        if *w > 0.0 {
                            sum += *w as f64;
                            views += 1;
                        }
                    }
                    if sum > 1.0 {
                        for chunk in chunks.iter_mut() {
                            chunk[i] = (chunk[i] as f64 / sum) as f32;
                        }
                    }
                    if views > 0 {
                        tally.covered += 1;
                    }
                    tally.contributions += views;
                    tally.min_views = tally.min_views.min(views);
                }
                tally
            })
            .reduce(|| Tally::EMPTY, Tally::merge);

        if tally.negative > 0 {
            log::warn!("{} negative weights were set to 0", tally.negative);
        }
        if tally.covered == 0 {
            log::warn!("no voxel is covered by any view");
        }
        let statistics = if len == 0 {
            OverlapStatistics::default()
        } else {
            OverlapStatistics {
                min_overlapping_views: (tally.min_views as f64).max(1.0),
                avg_overlapping_views: (tally.contributions as f64 / len as f64).max(1.0),
            }
        };
        log::info!(
            "{} of {len} voxels covered, min overlap {}, avg overlap {:.3}",
            tally.covered,
            statistics.min_overlapping_views,
            statistics.avg_overlapping_views
        );
        self.statistics = Some(statistics);
        Ok(statistics)
    }

    /// `None` before [`WeightNormalizer::process`] ran.
    pub fn min_overlapping_views(&self) -> Option<f64> {
        self.statistics.map(|s| s.min_overlapping_views)
    }

    pub fn avg_overlapping_views(&self) -> Option<f64> {
        self.statistics.map(|s| s.avg_overlapping_views)
    }

    pub fn statistics(&self) -> Option<OverlapStatistics> {
        self.statistics
    }

    /// Scales every weight by `speedup`, capped at 1.
    pub fn adjust_for_osem(&mut self, speedup: f64) -> Result<()> {
        if !(speedup > 0.0 && speedup.is_finite()) {
            return Err(DeconvolutionError::config(format!(
                "invalid OSEM speedup {speedup}"
            )));
        }
        if speedup == 1.0 {
            return Ok(());
        }
        log::info!("OSEM speedup {speedup:.3}");
        for weight in self.weights.iter_mut() {
            let data = flat_mut(weight)?;
            let portions = divide_into_portions(data.len(), default_portion_count());
            par_for_each_portion(data, &portions, |_, chunk| {
                for w in chunk.iter_mut() {
                    *w = ((*w as f64 * speedup).min(1.0)) as f32;
                }
            });
        }
        Ok(())
    }

    pub fn weights(&self) -> &[Array3<f32>] {
        &self.weights
    }

    pub fn into_weights(self) -> Vec<Array3<f32>> {
        self.weights
    }
}

/// Speedup factor selected by `mode`.
pub fn osem_speedup(mode: OsemMode, statistics: &OverlapStatistics) -> f64 {
    match mode {
        OsemMode::Off => 1.0,
        OsemMode::MinOverlap => statistics.min_overlapping_views,
        OsemMode::AvgOverlap => statistics.avg_overlapping_views,
        OsemMode::Manual(speedup) => speedup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::s;

    /// Three views overlapping in slabs along the first axis.
    fn slab_weights() -> Vec<Array3<f32>> {
        let mut a = Array3::zeros((9, 4, 4));
        let mut b = Array3::zeros((9, 4, 4));
        let mut c = Array3::zeros((9, 4, 4));
        a.slice_mut(s![0..5, .., ..]).fill(0.8);
        b.slice_mut(s![3..9, .., ..]).fill(0.9);
        c.slice_mut(s![4..6, .., ..]).fill(0.3);
        vec![a, b, c]
    }

    #[test]
    fn sums_are_at_most_one() {
        let mut normalizer = WeightNormalizer::new(slab_weights()).unwrap();
        normalizer.process().unwrap();
        let weights = normalizer.weights();
        for index in ndarray::indices((9, 4, 4)) {
            let sum: f32 = weights.iter().map(|w| w[index]).sum();
            assert!(sum <= 1.0 + 1e-5, "{sum}");
        }
        // single view coverage stays untouched
        assert_eq!(weights[0][[0, 0, 0]], 0.8);
        assert_relative_eq!(weights[0][[3, 1, 1]], 0.8 / 1.7, epsilon = 1e-6);
    }

    #[test]
    fn small_sums_are_not_scaled_up() {
        let mut a = Array3::from_elem((2, 2, 2), 0.2);
        a[[0, 0, 0]] = -0.5;
        let b = Array3::from_elem((2, 2, 2), 0.3);
        let mut normalizer = WeightNormalizer::new(vec![a, b]).unwrap();
        normalizer.process().unwrap();
        assert_eq!(normalizer.weights()[0][[1, 1, 1]], 0.2);
        assert_eq!(normalizer.weights()[0][[0, 0, 0]], 0.0);
    }

    #[test]
    fn overlap_statistics() {
        let mut normalizer = WeightNormalizer::new(slab_weights()).unwrap();
        assert!(normalizer.min_overlapping_views().is_none());
        let statistics = normalizer.process().unwrap();
        // views per slab: 1 1 1 2 3 2 1 1 1
        assert_eq!(statistics.min_overlapping_views, 1.0);
        assert_relative_eq!(statistics.avg_overlapping_views, 13.0 / 9.0, epsilon = 1e-9);
        assert_eq!(normalizer.avg_overlapping_views(), Some(13.0 / 9.0));
    }

    #[test]
    fn uncovered_volume_reports_one_view() {
        let mut normalizer = WeightNormalizer::new(vec![Array3::zeros((3, 3, 3))]).unwrap();
        let statistics = normalizer.process().unwrap();
        assert_eq!(statistics, OverlapStatistics::default());
    }

    #[test]
    fn uncovered_voxels_count_as_zero_views() {
        let mut a = Array3::zeros((16, 4, 4));
        a.slice_mut(s![0..8, .., ..]).fill(1.0);
        let b = a.clone();
        let mut normalizer = WeightNormalizer::new(vec![a, b]).unwrap();
        let statistics = normalizer.process().unwrap();
        // half the voxels see two views, the other half none: min max(0, 1), avg 256 / 256
        assert_eq!(statistics.min_overlapping_views, 1.0);
        assert_relative_eq!(statistics.avg_overlapping_views, 1.0, epsilon = 1e-12);
        assert_eq!(osem_speedup(OsemMode::MinOverlap, &statistics), 1.0);

        let mut c = Array3::zeros((16, 4, 4));
        c.slice_mut(s![0..12, .., ..]).fill(0.5);
        let d = Array3::from_elem((16, 4, 4), 0.5f32);
        let statistics = WeightNormalizer::new(vec![c, d]).unwrap().process().unwrap();
        // 12 slabs with two views, 4 with one
        assert_eq!(statistics.min_overlapping_views, 1.0);
        assert_relative_eq!(statistics.avg_overlapping_views, 28.0 / 16.0, epsilon = 1e-12);
    }

    #[test]
    fn osem_scaling_is_capped() {
        let mut normalizer = WeightNormalizer::new(slab_weights()).unwrap();
        let statistics = normalizer.process().unwrap();
        let before = normalizer.weights().to_vec();

        for mode in [OsemMode::Off, OsemMode::MinOverlap, OsemMode::AvgOverlap] {
            let speedup = osem_speedup(mode, &statistics);
            let mut adjusted = normalizer.clone();
            adjusted.adjust_for_osem(speedup).unwrap();
            for (raw, scaled) in before.iter().zip(adjusted.weights()) {
                for (r, s) in raw.iter().zip(scaled.iter()) {
                    assert!(*s <= 1.0);
                    assert_relative_eq!(*s, (r * speedup as f32).min(1.0), epsilon = 1e-6);
                }
            }
        }
        assert_eq!(osem_speedup(OsemMode::Manual(2.5), &statistics), 2.5);
        assert!(normalizer.adjust_for_osem(0.0).is_err());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let result =
            WeightNormalizer::new(vec![Array3::zeros((2, 2, 2)), Array3::zeros((2, 2, 3))]);
        assert!(result.is_err());
        assert!(WeightNormalizer::new(vec![]).is_err());
    }
}
