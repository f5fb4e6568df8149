//! The multi-view Richardson-Lucy driver.
//!
//! A run goes through four phases:
//!
//! 1. **Uninitialized**: kernels are built, weights normalized and the convolution devices opened.
//! 2. **First estimate**: psi is seeded from the weighted average of the views.
//! 3. **Iterating**: every iteration updates psi once per view, in view order.
//! 4. **Finalized**: voxels not covered by any view are zeroed and the scratch volumes dropped.
//!
//! Each per-view update consists of four stages separated by barriers: blurring psi with the
//! forward kernel, dividing the image by the blurred estimate, applying the adjoint kernel to the
//! quotient and the weighted multiplicative update of psi.

use crate::config::DeconvolutionConfig;
use crate::convolution::{AcceleratorProvider, BlockConvolver, Device};
use crate::error::{DeconvolutionError, Result};
use crate::estimate::{average_overlapping, seed_psi};
use crate::math_tools::tikhonov;
use crate::psf_kernels::build_kernel_pairs;
use crate::view::{ViewDeconvUnit, ViewInput};
use crate::volume::{flat, flat_mut, shape_of, ViewId, Volume};
use crate::weights::{osem_speedup, OverlapStatistics, WeightNormalizer};
use ndarray::Array3;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use voxel_portions::{
    default_portion_count, divide_into_portions, in_pool, par_map_reduce_portions, Portion,
};

/// Lifecycle of a [`MultiViewDeconvolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeconvolutionPhase {
    Uninitialized,
    FirstEstimate,
    /// Number of completed iterations.
    Iterating(usize),
    Finalized,
}

impl Display for DeconvolutionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeconvolutionPhase::Uninitialized => write!(f, "uninitialized"),
            DeconvolutionPhase::FirstEstimate => write!(f, "first estimate"),
            DeconvolutionPhase::Iterating(i) => write!(f, "iteration {i}"),
            DeconvolutionPhase::Finalized => write!(f, "finalized"),
        }
    }
}

/// How much one view changed psi during one iteration.
///
/// # Fields
/// - `view`: the updated view.
/// - `sum_change`: sum of `|change * weight|` over all voxels.
/// - `max_change`: largest `|change * weight|`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewChange {
    pub view: ViewId,
    pub sum_change: f64,
    pub max_change: f32,
}

/// Per-view changes of one completed iteration (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct IterationStatistics {
    pub iteration: usize,
    pub views: Vec<ViewChange>,
}

impl IterationStatistics {
    pub fn total_change(&self) -> f64 {
        self.views.iter().map(|v| v.sum_change).sum()
    }
}

/// Scalars of the update stage of one view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UpdateParameters {
    pub lambda: f64,
    pub max_intensity: f32,
    pub min_value: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UpdateTally {
    pub sum_change: f64,
    pub max_change: f32,
    pub clamped: usize,
}

impl UpdateTally {
    fn merge(self, other: UpdateTally) -> UpdateTally {
        UpdateTally {
            sum_change: self.sum_change + other.sum_change,
            max_change: self.max_change.max(other.max_change),
            clamped: self.clamped + other.clamped,
        }
    }
}

/// Replaces `blurred` by `image / blurred`.
///
/// The quotient is 1 where the image is not positive or the blurred estimate is zero; NaN
/// quotients become `min_value`.
///
/// # Returns
/// The number of NaN quotients.
pub(crate) fn compute_quotient(
    image: &[f32],
    blurred: &mut [f32],
    min_value: f32,
    portions: &[Portion],
) -> usize {
    par_map_reduce_portions(
        blurred,
        portions,
        |portion, chunk| {
            let image = &image[portion.range()];
            let mut nan = 0usize;
            for (b, i) in chunk.iter_mut().zip(image) {
                let quotient = if *i > 0.0 && *b != 0.0 { *i / *b } else { 1.0 };
                *b = if quotient.is_nan() {
                    nan += 1;
                    min_value
                } else {
                    quotient
                };
            }
            nan
        },
        |a, b| a + b,
        0,
    )
}

/// Multiplicative update of psi with the adjoint-blurred quotient `correction`.
///
/// The candidate `psi * correction` is optionally Tikhonov-regularized relative to the view's
/// maximum intensity and kept at or above `min_value`; psi then moves towards the candidate by
/// the view's weight.
pub(crate) fn apply_update(
    psi: &mut [f32],
    correction: &[f32],
    weight: &[f32],
    parameters: UpdateParameters,
    portions: &[Portion],
) -> UpdateTally {
    let UpdateParameters {
        lambda,
        max_intensity,
        min_value,
    } = parameters;
    let regularize = lambda > 0.0 && max_intensity > 0.0;
    let max_intensity = max_intensity as f64;

    par_map_reduce_portions(
        psi,
        portions,
        |portion, chunk| {
            let correction = &correction[portion.range()];
            let weight = &weight[portion.range()];
            let mut tally = UpdateTally::default();
            for ((p, c), w) in chunk.iter_mut().zip(correction).zip(weight) {
                let mut candidate = *p * *c;
                if regularize {
                    candidate =
                        (tikhonov(candidate as f64 / max_intensity, lambda) * max_intensity) as f32;
                }
                if candidate.is_nan() || candidate < min_value {
                    candidate = min_value;
                    tally.clamped += 1;
                }
                let change = (candidate - *p) * *w;
                *p = (*p + change).max(min_value);
                tally.sum_change += change.abs() as f64;
                tally.max_change = tally.max_change.max(change.abs());
            }
            tally
        },
        UpdateTally::merge,
        UpdateTally::default(),
    )
}

/// Iterative multi-view deconvolution of one set of views.
///
/// ```no_run
/// use mvdecon::{DeconvolutionConfig, MultiViewDeconvolution, ViewInput};
///
/// # fn views() -> Vec<ViewInput> { unimplemented!() }
/// let config = DeconvolutionConfig::default();
/// let mut deconvolution = MultiViewDeconvolution::new(views(), config, None)?;
/// let psi = deconvolution.run()?;
/// println!("deconvolved volume of {:?}", psi.shape());
/// # Ok::<(), mvdecon::DeconvolutionError>(())
/// ```
pub struct MultiViewDeconvolution {
    config: DeconvolutionConfig,
    units: Vec<ViewDeconvUnit>,
    convolver: Arc<BlockConvolver>,
    psi: Volume,
    tmp1: Array3<f32>,
    tmp2: Array3<f32>,
    portions: Vec<Portion>,
    overlap: OverlapStatistics,
    phase: DeconvolutionPhase,
    history: Vec<IterationStatistics>,
    rejected: Vec<DeconvolutionError>,
    initial_psi: Option<Array3<f32>>,
    best_effort: Option<Volume>,
    /// Iteration that failed part way through its views.
    interrupted: Option<usize>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for MultiViewDeconvolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiViewDeconvolution")
            .field("phase", &self.phase)
            .field("views", &self.view_ids())
            .field("shape", &self.psi.shape())
            .field("devices", &self.convolver.devices())
            .finish()
    }
}

impl MultiViewDeconvolution {
    /// Prepares a run: validates the inputs, builds the kernels, normalizes the weights and
    /// opens the convolution devices.
    ///
    /// # Arguments
    /// - `views`: all views, their images and weights on one common grid.
    /// - `config`: run parameters.
    /// - `provider`: opens accelerators for non-negative device ids, `None` if there are none.
    ///
    /// # Errors
    /// Configuration errors for inconsistent inputs or when no view is usable. Views that cannot
    /// be used are dropped and reported by [`MultiViewDeconvolution::rejected_views`].
    pub fn new(
        views: Vec<ViewInput>,
        config: DeconvolutionConfig,
        provider: Option<&dyn AcceleratorProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = match config.num_threads {
            Some(num_threads) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|err| {
                        DeconvolutionError::config(format!(
                            "cannot build a pool of {num_threads} threads: {err}"
                        ))
                    })?,
            )),
            None => None,
        };

        let device_pool = pool.clone();
        let prepare = move || Self::prepare(views, config, provider, device_pool);
        let mut deconvolution = in_pool(pool.as_deref(), prepare)?;
        deconvolution.pool = pool;
        Ok(deconvolution)
    }

    fn prepare(
        views: Vec<ViewInput>,
        config: DeconvolutionConfig,
        provider: Option<&dyn AcceleratorProvider>,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Result<Self> {
        let Some(first) = views.first() else {
            return Err(DeconvolutionError::config("no views given"));
        };
        let shape = first.image.shape();
        let origin = first.image.origin;
        if shape.contains(&0) {
            return Err(DeconvolutionError::config(format!(
                "cannot deconvolve an empty volume of {shape:?}"
            )));
        }
        for (index, view) in views.iter().enumerate() {
            if !view.image.same_grid(&first.image) || !view.weight.same_grid(&first.image) {
                return Err(DeconvolutionError::config(format!(
                    "view {index} ({}): image {:?} at {:?} and weight {:?} at {:?} \
                     are not on the grid {shape:?} at {origin:?}",
                    view.id,
                    view.image.shape(),
                    view.image.origin,
                    view.weight.shape(),
                    view.weight.origin
                )));
            }
        }

        let num_views = views.len();
        let mut ids = Vec::with_capacity(num_views);
        let mut images = Vec::with_capacity(num_views);
        let mut weights = Vec::with_capacity(num_views);
        let mut psfs = Vec::with_capacity(num_views);
        for view in views {
            ids.push(view.id);
            images.push(view.image.data);
            weights.push(view.weight.data);
            psfs.push(view.psf);
        }

        let kernel_set = build_kernel_pairs(&psfs, config.psf_type)?;
        drop(psfs);
        let mut kernels: Vec<_> = (0..num_views).map(|_| None).collect();
        for (view, pair) in kernel_set.pairs {
            kernels[view] = Some(pair);
        }

        let mut usable = Vec::with_capacity(num_views);
        let mut raw_weights = Vec::with_capacity(num_views);
        let inputs = ids.into_iter().zip(images).zip(weights).zip(kernels);
        for (((id, image), weight), pair) in inputs {
            if let Some(pair) = pair {
                usable.push((id, image, pair));
                raw_weights.push(weight);
            }
        }

        let mut normalizer = WeightNormalizer::new(raw_weights)?;
        let overlap = normalizer.process()?;
        normalizer.adjust_for_osem(osem_speedup(config.osem, &overlap))?;
        let weights = normalizer.into_weights();

        let kernel_shape = shape_of(&usable[0].2.kernel1.view());
        let convolver = Arc::new(
            BlockConvolver::with_devices(
                shape,
                kernel_shape,
                config.block_size,
                &config.devices,
                provider,
                config.cpu_fallback,
            )?
            .with_thread_pool(pool),
        );
        log::info!(
            "deconvolving {} of {num_views} views ({}) on {:?} in {} blocks of {:?}",
            usable.len(),
            config.psf_type,
            convolver.devices(),
            convolver.tiling().len(),
            convolver.tiling().block_size
        );

        let units = usable
            .into_iter()
            .zip(weights)
            .map(|((id, image, kernels), weight)| {
                ViewDeconvUnit::new(id, image, weight, kernels, convolver.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        let len = shape.iter().product();
        Ok(MultiViewDeconvolution {
            config,
            units,
            convolver,
            psi: Volume::new(Array3::zeros(shape), origin),
            tmp1: Array3::zeros(shape),
            tmp2: Array3::zeros(shape),
            portions: divide_into_portions(len, default_portion_count()),
            overlap,
            phase: DeconvolutionPhase::Uninitialized,
            history: Vec::new(),
            rejected: kernel_set.rejected,
            initial_psi: None,
            best_effort: None,
            interrupted: None,
            pool: None,
        })
    }

    /// Starts from `psi` instead of the weighted average of the views.
    ///
    /// # Errors
    /// A configuration error if `psi` is not on the output grid or the run already started.
    pub fn with_initial_psi(mut self, psi: Volume) -> Result<Self> {
        if self.phase != DeconvolutionPhase::Uninitialized {
            return Err(DeconvolutionError::config(
                "the initial estimate can only be replaced before the first iteration",
            ));
        }
        if !psi.same_grid(&self.psi) {
            return Err(DeconvolutionError::config(format!(
                "initial estimate {:?} at {:?} does not match the output grid {:?} at {:?}",
                psi.shape(),
                psi.origin,
                self.psi.shape(),
                self.psi.origin
            )));
        }
        self.initial_psi = Some(psi.data);
        Ok(self)
    }

    /// Runs the remaining phases and returns the final psi.
    ///
    /// Calling it again after the run finished returns the same volume. After a failed
    /// iteration psi holds the updates of only some views, so the run cannot be resumed; the
    /// last completed iteration is available from [`MultiViewDeconvolution::best_effort_psi`].
    pub fn run(&mut self) -> Result<&Volume> {
        self.run_to_end()?;
        Ok(&self.psi)
    }

    /// Performs one full iteration over all views, computing the first estimate if necessary.
    pub fn run_iteration(&mut self) -> Result<IterationStatistics> {
        self.iterate()
    }

    fn run_to_end(&mut self) -> Result<()> {
        if self.phase == DeconvolutionPhase::Finalized {
            return Ok(());
        }
        self.ensure_not_interrupted()?;
        if self.phase == DeconvolutionPhase::Uninitialized {
            self.first_estimate()?;
        }
        while self.history.len() < self.config.num_iterations {
            self.iterate()?;
        }
        self.finalize()
    }

    // The driver thread stays outside the dedicated pool and only enters it for the voxel
    // stages; the convolver installs the pool itself, also in its device threads.
    fn first_estimate(&mut self) -> Result<()> {
        let pool = self.pool.as_deref();
        let summary = {
            let images: Vec<&Array3<f32>> = self.units.iter().map(|u| u.image()).collect();
            let weights: Vec<&Array3<f32>> = self.units.iter().map(|u| u.weight()).collect();
            let (average, weight_sum) = (&mut self.tmp1, &mut self.tmp2);
            let portions = &self.portions;
            in_pool(pool, || {
                average_overlapping(&images, &weights, average, weight_sum, portions, true)
            })?
        };

        let min_value = self.config.min_value;
        match self.initial_psi.take() {
            Some(psi) => {
                self.psi.data = psi;
                let data = flat_mut(&mut self.psi.data)?;
                let portions = &self.portions;
                let clamped = in_pool(pool, || {
                    par_map_reduce_portions(
                        data,
                        portions,
                        |_, chunk| {
                            let mut clamped = 0usize;
                            for p in chunk.iter_mut() {
                                if p.is_nan() || *p < min_value {
                                    *p = min_value;
                                    clamped += 1;
                                }
                            }
                            clamped
                        },
                        |a, b| a + b,
                        0,
                    )
                });
                log::info!(
                    "initial estimate supplied by the caller, \
                     {clamped} voxels raised to {min_value}"
                );
            }
            None => {
                let mode = self.config.initial_estimate;
                let (average, weight_sum) = (&self.tmp1, &self.tmp2);
                let psi = &mut self.psi.data;
                in_pool(pool, || {
                    seed_psi(mode, &summary, average, weight_sum, min_value, psi)
                })?
            }
        }

        for (unit, max) in self.units.iter_mut().zip(&summary.max_intensity) {
            log::debug!("view {}: max intensity {max}", unit.id());
            unit.set_max_intensity(*max);
        }
        self.phase = DeconvolutionPhase::FirstEstimate;
        Ok(())
    }

    fn iterate(&mut self) -> Result<IterationStatistics> {
        match self.phase {
            DeconvolutionPhase::Finalized => {
                return Err(DeconvolutionError::config(
                    "the deconvolution is already finalized",
                ))
            }
            DeconvolutionPhase::Uninitialized => self.first_estimate()?,
            DeconvolutionPhase::FirstEstimate | DeconvolutionPhase::Iterating(_) => {}
        }
        self.ensure_not_interrupted()?;

        let iteration = self.history.len() + 1;
        let mut views = Vec::with_capacity(self.units.len());
        for index in 0..self.units.len() {
            match self.update_view(index) {
                Ok(change) => views.push(change),
                Err(err) => {
                    log::error!(
                        "iteration {iteration} failed at view {}: {err}",
                        self.units[index].id()
                    );
                    self.interrupted = Some(iteration);
                    return Err(err);
                }
            }
        }

        let len = self.psi.len() as f64;
        for change in &views {
            log::info!(
                "iteration {iteration}, view {}: mean change {:.6}, max change {:.6}",
                change.view,
                change.sum_change / len,
                change.max_change
            );
        }
        let statistics = IterationStatistics { iteration, views };
        self.phase = DeconvolutionPhase::Iterating(iteration);
        if self.config.keep_best_effort {
            self.best_effort = Some(self.psi.clone());
        }
        self.history.push(statistics.clone());
        Ok(statistics)
    }

    fn ensure_not_interrupted(&self) -> Result<()> {
        match self.interrupted {
            Some(iteration) => Err(DeconvolutionError::config(format!(
                "iteration {iteration} failed and left psi partly updated, the run cannot resume"
            ))),
            None => Ok(()),
        }
    }

    fn update_view(&mut self, index: usize) -> Result<ViewChange> {
        let pool = self.pool.as_deref();
        let unit = &self.units[index];
        let min_value = self.config.min_value;
        let portions = &self.portions;

        unit.convolve_forward(&self.psi.data, &mut self.tmp1)?;
        let image = flat(unit.image())?;
        let quotient = flat_mut(&mut self.tmp1)?;
        let nan = in_pool(pool, || compute_quotient(image, quotient, min_value, portions));
        if nan > 0 {
            log::warn!("view {}: {nan} undefined quotients set to {min_value}", unit.id());
        }

        unit.convolve_adjoint(&self.tmp1, &mut self.tmp2)?;
        let parameters = UpdateParameters {
            lambda: self.config.lambda,
            max_intensity: unit.max_intensity(),
            min_value,
        };
        let psi = flat_mut(&mut self.psi.data)?;
        let correction = flat(&self.tmp2)?;
        let weight = flat(unit.weight())?;
        let tally = in_pool(pool, || {
            apply_update(psi, correction, weight, parameters, portions)
        });
        if tally.clamped > 0 {
            log::debug!("view {}: {} voxels clamped to {min_value}", unit.id(), tally.clamped);
        }

        Ok(ViewChange {
            view: unit.id(),
            sum_change: tally.sum_change,
            max_change: tally.max_change,
        })
    }

    fn finalize(&mut self) -> Result<()> {
        let pool = self.pool.as_deref();
        let portions = &self.portions;
        {
            let images: Vec<&Array3<f32>> = self.units.iter().map(|u| u.image()).collect();
            let weights: Vec<&Array3<f32>> = self.units.iter().map(|u| u.weight()).collect();
            let (average, weight_sum) = (&mut self.tmp1, &mut self.tmp2);
            in_pool(pool, || {
                average_overlapping(&images, &weights, average, weight_sum, portions, false)
            })?;
        }

        let weight_sum = flat(&self.tmp2)?;
        let psi = flat_mut(&mut self.psi.data)?;
        let uncovered = in_pool(pool, || {
            par_map_reduce_portions(
                psi,
                portions,
                |portion, chunk| {
                    let weight_sum = &weight_sum[portion.range()];
                    let mut uncovered = 0usize;
                    for (p, w) in chunk.iter_mut().zip(weight_sum) {
                        if *w == 0.0 {
                            *p = 0.0;
                            uncovered += 1;
                        }
                    }
                    uncovered
                },
                |a, b| a + b,
                0,
            )
        });
        log::info!(
            "finalized after {} iterations, {uncovered} voxels without data set to 0",
            self.history.len()
        );

        self.tmp1 = Array3::zeros((0, 0, 0));
        self.tmp2 = Array3::zeros((0, 0, 0));
        self.phase = DeconvolutionPhase::Finalized;
        Ok(())
    }

    pub fn phase(&self) -> DeconvolutionPhase {
        self.phase
    }

    /// Current estimate.
    pub fn psi(&self) -> &Volume {
        &self.psi
    }

    pub fn into_psi(self) -> Volume {
        self.psi
    }

    pub fn config(&self) -> &DeconvolutionConfig {
        &self.config
    }

    /// Ids of the views taking part in the run, in input order.
    pub fn view_ids(&self) -> Vec<ViewId> {
        self.units.iter().map(|u| u.id()).collect()
    }

    pub fn views(&self) -> &[ViewDeconvUnit] {
        &self.units
    }

    pub fn devices(&self) -> Vec<Device> {
        self.convolver.devices()
    }

    pub fn min_overlapping_views(&self) -> f64 {
        self.overlap.min_overlapping_views
    }

    pub fn avg_overlapping_views(&self) -> f64 {
        self.overlap.avg_overlapping_views
    }

    pub fn iteration_history(&self) -> &[IterationStatistics] {
        &self.history
    }

    /// Views dropped while preparing the run, as [`DeconvolutionError::ViewRejected`].
    pub fn rejected_views(&self) -> &[DeconvolutionError] {
        &self.rejected
    }

    /// The iteration that failed part way, if any. psi is then not the result of a completed
    /// iteration.
    pub fn interrupted_iteration(&self) -> Option<usize> {
        self.interrupted
    }

    /// psi after the last completed iteration, only kept with `keep_best_effort`.
    pub fn best_effort_psi(&self) -> Option<&Volume> {
        self.best_effort.as_ref()
    }
}

/// Deconvolves `views` on the CPU (and any accelerator-free device list) with `config`.
pub fn run(views: Vec<ViewInput>, config: &DeconvolutionConfig) -> Result<Volume> {
    let mut deconvolution = MultiViewDeconvolution::new(views, config.clone(), None)?;
    deconvolution.run()?;
    Ok(deconvolution.into_psi())
}

/// Like [`run`], opening accelerators through `provider`.
pub fn run_with_accelerators(
    views: Vec<ViewInput>,
    config: &DeconvolutionConfig,
    provider: &dyn AcceleratorProvider,
) -> Result<Volume> {
    let mut deconvolution = MultiViewDeconvolution::new(views, config.clone(), Some(provider))?;
    deconvolution.run()?;
    Ok(deconvolution.into_psi())
}
