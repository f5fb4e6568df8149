//! Run parameters of a deconvolution.
//!
//! All tunables live in one immutable [`DeconvolutionConfig`] that is handed to the driver,
//! nothing is remembered between runs.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Formula used to derive the adjoint kernel of every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsfType {
    /// Every view is deconvolved as if it were the only one.
    Independent,
    /// Exact Bayesian multi-view update, the adjoint kernel accounts for every other view.
    EfficientBayesian,
    /// Cheaper approximation of the Bayesian update.
    OptimizationI,
    /// Multi-view effect approximated by exponentiating the view's own kernel.
    OptimizationII,
}

impl Display for PsfType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PsfType::Independent => write!(f, "Independent"),
            PsfType::EfficientBayesian => write!(f, "Efficient Bayesian"),
            PsfType::OptimizationI => write!(f, "Optimization I"),
            PsfType::OptimizationII => write!(f, "Optimization II"),
        }
    }
}

/// Selects the OSEM speedup applied to the normalized weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OsemMode {
    /// No acceleration (speedup 1).
    Off,
    /// Speedup equal to the minimal number of overlapping views.
    MinOverlap,
    /// Speedup equal to the average number of overlapping views.
    AvgOverlap,
    /// Explicit speedup factor.
    Manual(f64),
}

impl Display for OsemMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OsemMode::Off => write!(f, "off"),
            OsemMode::MinOverlap => write!(f, "min overlap"),
            OsemMode::AvgOverlap => write!(f, "avg overlap"),
            OsemMode::Manual(speedup) => write!(f, "manual ({speedup})"),
        }
    }
}

/// How psi is seeded before the first iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialEstimate {
    /// Constant volume filled with the average intensity of all covered voxels.
    AverageIntensity,
    /// Per-voxel weighted average of the views, uncovered voxels get the global average.
    VoxelwiseAverage,
}

impl Display for InitialEstimate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialEstimate::AverageIntensity => write!(f, "average intensity"),
            InitialEstimate::VoxelwiseAverage => write!(f, "voxel-wise average"),
        }
    }
}

/// Parameters of one deconvolution run.
///
/// # Fields
/// - `psf_type`: compound kernel formulation, identical for all views.
/// - `num_iterations`: number of full passes over all views.
/// - `lambda`: Tikhonov regularization strength, `0.0` disables it.
/// - `osem`: OSEM acceleration mode.
/// - `devices`: logical device ids, `-1` is the CPU, `n >= 0` an accelerator.
/// - `block_size`: padded block size for memory-bounded processing, `None` convolves whole volumes.
/// - `min_value`: smallest value psi may take during the iterations.
/// - `initial_estimate`: seeding strategy of psi.
/// - `num_threads`: size of a dedicated worker pool, `None` uses one thread per core.
/// - `cpu_fallback`: use the CPU when no requested accelerator can be opened.
/// - `keep_best_effort`: keep a copy of psi after every completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeconvolutionConfig {
    pub psf_type: PsfType,
    pub num_iterations: usize,
    pub lambda: f64,
    pub osem: OsemMode,
    pub devices: Vec<i32>,
    pub block_size: Option<[usize; 3]>,
    pub min_value: f32,
    pub initial_estimate: InitialEstimate,
    pub num_threads: Option<usize>,
    pub cpu_fallback: bool,
    pub keep_best_effort: bool,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        DeconvolutionConfig {
            psf_type: PsfType::EfficientBayesian,
            num_iterations: 10,
            lambda: 0.0006,
            osem: OsemMode::Off,
            devices: vec![-1],
            block_size: None,
            min_value: 0.0001,
            initial_estimate: InitialEstimate::AverageIntensity,
            num_threads: None,
            cpu_fallback: true,
            keep_best_effort: false,
        }
    }
}

impl DeconvolutionConfig {
    /// Checks the scalar parameters. View-dependent checks happen in the driver.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.lambda >= 0.0 && self.lambda.is_finite()) {
            return Err(crate::DeconvolutionError::config(format!(
                "lambda must be a finite value >= 0, got {}",
                self.lambda
            )));
        }
        if !(self.min_value > 0.0 && self.min_value.is_finite()) {
            return Err(crate::DeconvolutionError::config(format!(
                "min_value must be positive, got {}",
                self.min_value
            )));
        }
        if let OsemMode::Manual(speedup) = self.osem {
            if !(speedup > 0.0 && speedup.is_finite()) {
                return Err(crate::DeconvolutionError::config(format!(
                    "manual OSEM speedup must be positive, got {speedup}"
                )));
            }
        }
        if self.devices.is_empty() {
            return Err(crate::DeconvolutionError::config(
                "at least one device id is required",
            ));
        }
        if let Some(block_size) = self.block_size {
            if block_size.contains(&0) {
                return Err(crate::DeconvolutionError::config(
                    "block size must be positive in every dimension",
                ));
            }
        }
        if self.num_threads == Some(0) {
            return Err(crate::DeconvolutionError::config(
                "num_threads must be at least 1",
            ));
        }
        Ok(())
    }
}
