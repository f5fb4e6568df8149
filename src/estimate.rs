//! Weighted averaging of the views, used to seed psi and to find the uncovered voxels at the end.

use crate::config::InitialEstimate;
use crate::error::{DeconvolutionError, Result};
use crate::volume::{flat, flat_mut};
use ndarray::Array3;
use rayon::prelude::*;
use voxel_portions::{split_portions_mut, Portion};

/// Summary of one averaging pass.
///
/// # Fields
/// - `covered_voxels`: voxels with a positive weight sum.
/// - `intensity_sum`: sum of the per-voxel averages over the covered voxels.
/// - `max_intensity`: per view the largest image value where its weight is positive, empty if
///   not tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct AverageSummary {
    pub covered_voxels: usize,
    pub intensity_sum: f64,
    pub max_intensity: Vec<f32>,
}

impl AverageSummary {
    fn empty(num_views: usize) -> Self {
        AverageSummary {
            covered_voxels: 0,
            intensity_sum: 0.0,
            max_intensity: vec![0.0; num_views],
        }
    }

    fn merge(mut self, other: AverageSummary) -> AverageSummary {
        self.covered_voxels += other.covered_voxels;
        self.intensity_sum += other.intensity_sum;
        for (a, b) in self.max_intensity.iter_mut().zip(other.max_intensity) {
            *a = a.max(b);
        }
        self
    }

    /// Mean of the per-voxel averages over all covered voxels, NaN if nothing is covered.
    pub fn mean_intensity(&self) -> f64 {
        self.intensity_sum / self.covered_voxels as f64
    }
}

/// Computes the per-voxel weighted average of `images` and the per-voxel weight sum.
///
/// # Arguments
/// - `images`, `weights`: one image and one (normalized) weight per view, all of one shape.
/// - `average`: receives the weighted average, 0 where no view contributes.
/// - `weight_sum`: receives the sum of the weights.
/// - `portions`: partition of the flattened voxel range.
/// - `track_max`: also find the maximum intensity of every view.
pub fn average_overlapping(
    images: &[&Array3<f32>],
    weights: &[&Array3<f32>],
    average: &mut Array3<f32>,
    weight_sum: &mut Array3<f32>,
    portions: &[Portion],
    track_max: bool,
) -> Result<AverageSummary> {
    if images.len() != weights.len() || images.is_empty() {
        return Err(DeconvolutionError::config(format!(
            "averaging needs one weight per image, got {} images and {} weights",
            images.len(),
            weights.len()
        )));
    }
    let dim = average.dim();
    if weight_sum.dim() != dim
        || images.iter().chain(weights.iter()).any(|v| v.dim() != dim)
    {
        return Err(DeconvolutionError::config(
            "images, weights and outputs of the averaging must share one shape",
        ));
    }

    let images: Vec<&[f32]> = images.iter().map(|v| flat(v)).collect::<Result<_>>()?;
    let weights: Vec<&[f32]> = weights.iter().map(|v| flat(v)).collect::<Result<_>>()?;
    let num_views = images.len();

    let average_chunks = split_portions_mut(flat_mut(average)?, portions);
    let sum_chunks = split_portions_mut(flat_mut(weight_sum)?, portions);

    let summary = average_chunks
        .into_par_iter()
        .zip(sum_chunks)
        .zip(portions.par_iter())
        .map(|((average, weight_sum), portion)| {
            let mut summary = AverageSummary::empty(if track_max { num_views } else { 0 });
            for (offset, index) in portion.range().enumerate() {
                let mut sum_w = 0.0f64;
                let mut sum_iw = 0.0f64;
                for view in 0..num_views {
                    let w = weights[view][index];
                    if w > 0.0 {
                        let intensity = images[view][index];
                        sum_w += w as f64;
                        sum_iw += w as f64 * intensity as f64;
                        if track_max {
                            let max = &mut summary.max_intensity[view];
                            *max = max.max(intensity);
                        }
                    }
                }
                weight_sum[offset] = sum_w as f32;
                if sum_w > 0.0 {
                    let mean = sum_iw / sum_w;
                    average[offset] = mean as f32;
                    summary.covered_voxels += 1;
                    summary.intensity_sum += mean;
                } else {
                    average[offset] = 0.0;
                }
            }
            summary
        })
        .reduce(
            || AverageSummary::empty(if track_max { num_views } else { 0 }),
            AverageSummary::merge,
        );
    Ok(summary)
}

/// Fills `psi` with the initial estimate.
///
/// `average` and `weight_sum` must hold the result of [`average_overlapping`]. A non-finite mean
/// (nothing covered, or non-finite images) seeds the constant 0.5. Every seed is at least
/// `min_value`.
pub fn seed_psi(
    mode: InitialEstimate,
    summary: &AverageSummary,
    average: &Array3<f32>,
    weight_sum: &Array3<f32>,
    min_value: f32,
    psi: &mut Array3<f32>,
) -> Result<()> {
    let mut mean = summary.mean_intensity();
    if !mean.is_finite() {
        log::warn!("average intensity is {mean}, starting from 0.5");
        mean = 0.5;
    }
    let mean = (mean as f32).max(min_value);
    log::info!("initial estimate: {mode}, average intensity {mean}");

    match mode {
        InitialEstimate::AverageIntensity => psi.fill(mean),
        InitialEstimate::VoxelwiseAverage => {
            let average = flat(average)?;
            let weight_sum = flat(weight_sum)?;
            flat_mut(psi)?
                .par_iter_mut()
                .zip(average.par_iter().zip(weight_sum.par_iter()))
                .for_each(|(p, (a, w))| {
                    *p = if *w > 0.0 && a.is_finite() {
                        a.max(min_value)
                    } else {
                        mean
                    };
                });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use voxel_portions::divide_into_portions;

    fn setup() -> (Vec<Array3<f32>>, Vec<Array3<f32>>) {
        let a = Array3::from_elem((4, 2, 2), 2.0f32);
        let mut b = Array3::from_elem((4, 2, 2), 6.0f32);
        b[[3, 0, 0]] = 100.0;
        let mut wa = Array3::zeros((4, 2, 2));
        let mut wb = Array3::zeros((4, 2, 2));
        // x = 0: view a only, x = 1: both, x = 2: b only, x = 3: nothing
        for j in 0..2 {
            for k in 0..2 {
                wa[[0, j, k]] = 1.0;
                wa[[1, j, k]] = 0.25;
                wb[[1, j, k]] = 0.75;
                wb[[2, j, k]] = 0.5;
            }
        }
        (vec![a, b], vec![wa, wb])
    }

    fn average(track_max: bool) -> (AverageSummary, Array3<f32>, Array3<f32>) {
        let (images, weights) = setup();
        let mut average = Array3::zeros((4, 2, 2));
        let mut weight_sum = Array3::zeros((4, 2, 2));
        let portions = divide_into_portions(16, 3);
        let summary = average_overlapping(
            &images.iter().collect::<Vec<_>>(),
            &weights.iter().collect::<Vec<_>>(),
            &mut average,
            &mut weight_sum,
            &portions,
            track_max,
        )
        .unwrap();
        (summary, average, weight_sum)
    }

    #[test]
    fn weighted_average_per_voxel() {
        let (summary, average, weight_sum) = average(true);
        assert_eq!(average[[0, 1, 1]], 2.0);
        assert_relative_eq!(average[[1, 0, 1]], 0.25 * 2.0 + 0.75 * 6.0);
        assert_eq!(average[[2, 0, 0]], 6.0);
        assert_eq!(average[[3, 0, 0]], 0.0);
        assert_eq!(weight_sum[[1, 1, 0]], 1.0);
        assert_eq!(weight_sum[[3, 1, 0]], 0.0);

        assert_eq!(summary.covered_voxels, 12);
        assert_relative_eq!(summary.mean_intensity(), (2.0 + 5.0 + 6.0) / 3.0, epsilon = 1e-9);
        // the bright voxel of view b has no weight
        assert_eq!(summary.max_intensity, vec![2.0, 6.0]);
    }

    #[test]
    fn max_tracking_is_optional() {
        let (summary, _, _) = average(false);
        assert!(summary.max_intensity.is_empty());
    }

    #[test]
    fn seeds() {
        let (summary, average, weight_sum) = average(true);
        let mut psi = Array3::zeros((4, 2, 2));
        seed_psi(InitialEstimate::AverageIntensity, &summary, &average, &weight_sum, 1e-4, &mut psi)
            .unwrap();
        assert!(psi.iter().all(|v| (*v - 13.0 / 3.0).abs() < 1e-5));

        seed_psi(InitialEstimate::VoxelwiseAverage, &summary, &average, &weight_sum, 1e-4, &mut psi)
            .unwrap();
        assert_eq!(psi[[0, 0, 0]], 2.0);
        assert_eq!(psi[[2, 0, 0]], 6.0);
        assert_relative_eq!(psi[[3, 0, 0]], 13.0 / 3.0, epsilon = 1e-5);
    }

    #[test]
    fn uncovered_volume_seeds_one_half() {
        let summary = AverageSummary::empty(1);
        let zeros = Array3::zeros((2, 2, 2));
        let mut psi = Array3::zeros((2, 2, 2));
        seed_psi(InitialEstimate::AverageIntensity, &summary, &zeros, &zeros, 1e-4, &mut psi)
            .unwrap();
        assert!(psi.iter().all(|v| *v == 0.5));
    }
}
