//! mvdecon: multi-view iterative deconvolution of 3D volumes
//!
//! Several differently oriented, partially overlapping acquisitions of one specimen are combined
//! into a single deconvolved volume with a Richardson-Lucy style update per view.
//!
//! # Modules
//! - `config`: run parameters
//! - `volume`: volumes on the output grid and view ids
//! - `kernel_ops`: mirroring, exponentiation and normalization of kernels
//! - `psf_extraction`: PSFs from beads, files or Gaussians, mapped into output coordinates
//! - `psf_kernels`: forward and compound adjoint kernels per view
//! - `fft`: 3D real FFT
//! - `convolution`: block tiling, backends and multi-device scheduling
//! - `weights`: weight normalization and OSEM
//! - `estimate`: weighted averaging for the first estimate and final masking
//! - `view`: input views and the per-view convolution unit
//! - `deconvolution`: the iteration driver
//! - `math_tools`: Tikhonov regularization, trilinear interpolation

// Core modules
pub mod config;
pub mod error;
pub mod volume;

// Kernels and PSFs
pub mod kernel_ops;
pub mod math_tools;
pub mod psf_extraction;
pub mod psf_kernels;

// Convolution
pub mod convolution;
pub mod fft;

// Deconvolution
pub mod deconvolution;
pub mod estimate;
pub mod view;
pub mod weights;

pub use config::{DeconvolutionConfig, InitialEstimate, OsemMode, PsfType};
pub use convolution::{AcceleratorProvider, BoundaryMode, ConvolutionBackend, Device};
pub use deconvolution::{
    run, run_with_accelerators, DeconvolutionPhase, IterationStatistics, MultiViewDeconvolution,
    ViewChange,
};
pub use error::{DeconvolutionError, Result};
pub use psf_kernels::{build_compound_kernel, build_kernel_pairs, KernelPair};
pub use view::ViewInput;
pub use volume::{ViewId, Volume};
