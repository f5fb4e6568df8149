//! FFT convolution of volumes, optionally tiled into blocks and spread over several devices.
//!
//! # Modules
//! - `backend`: devices, the `ConvolutionBackend` trait and the CPU FFT backend.
//! - `block`: tiling, boundary handling, copy-in and paste-back of blocks.
//! - `dispatch`: the `BlockConvolver` scheduling blocks over backends.

pub mod backend;
pub mod block;
pub mod dispatch;

pub use backend::{
    resolve_backends, AcceleratorProvider, ConvolutionBackend, CpuFftBackend, Device,
    KernelSpectrum,
};
pub use block::{copy_block, mirror_index, paste_block, Block, BoundaryMode, Tiling};
pub use dispatch::BlockConvolver;
