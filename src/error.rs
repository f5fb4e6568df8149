//! Error taxonomy of the deconvolution engine.
//!
//! Configuration problems are reported before any large buffer is allocated, per-view
//! failures are recovered by dropping the affected view, and backend failures abort the run
//! with the originating error kept as the `source`.

use crate::convolution::Device;
use thiserror::Error;

/// Errors reported by the deconvolution engine.
#[derive(Error, Debug)]
pub enum DeconvolutionError {
    /// Invalid input or parameter combination, detected before iterating.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A single view cannot take part in the run (e.g. its PSF sums to zero).
    #[error("view {view} rejected: {reason}")]
    ViewRejected { view: usize, reason: String },

    /// A convolution backend failed while processing a block.
    #[error("convolution backend on {device} failed: {source}")]
    Backend {
        device: Device,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The FFT library rejected a transform.
    #[error("FFT error: {0}")]
    Fft(String),

    /// A volume is not stored contiguously in standard layout.
    #[error("volume is not contiguous in standard layout")]
    NonContiguous,

    #[error("failed to read PSF file: {0}")]
    ReadPsf(#[from] ndarray_npy::ReadNpyError),
}

impl DeconvolutionError {
    /// Shorthand for a [`DeconvolutionError::Configuration`] error.
    pub fn config(message: impl Into<String>) -> Self {
        DeconvolutionError::Configuration(message.into())
    }

    /// Wraps any error raised by a convolution backend.
    pub fn backend(
        device: Device,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        DeconvolutionError::Backend {
            device,
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeconvolutionError>;
