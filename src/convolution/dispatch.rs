//! Distribution of blocks over the configured devices.

use super::backend::{
    resolve_backends, AcceleratorProvider, ConvolutionBackend, CpuFftBackend, Device,
    KernelSpectrum,
};
use super::block::{copy_block, paste_block, Block, BoundaryMode, Tiling};
use crate::error::{DeconvolutionError, Result};
use crate::fft::Fft3d;
use crossbeam_channel::bounded;
use ndarray::{Array3, ArrayView3};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use voxel_portions::{for_each_until_aborted, in_pool};

/// Convolves whole volumes block by block on one or more devices.
///
/// With a single backend the blocks are processed in order on the calling thread. With several
/// backends every device gets its own thread and pulls block indices from a shared counter
/// until all blocks are taken. At most one finished block per device waits to be pasted.
pub struct BlockConvolver {
    tiling: Tiling,
    fft: Fft3d,
    backends: Vec<Box<dyn ConvolutionBackend>>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for BlockConvolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockConvolver")
            .field("tiling", &self.tiling)
            .field("devices", &self.devices())
            .finish()
    }
}

impl BlockConvolver {
    /// Uses already opened `backends` for `tiling`.
    pub fn new(tiling: Tiling, backends: Vec<Box<dyn ConvolutionBackend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(DeconvolutionError::config(
                "block convolution needs at least one backend",
            ));
        }
        let fft = Fft3d::new(tiling.block_size);
        Ok(BlockConvolver {
            tiling,
            fft,
            backends,
            pool: None,
        })
    }

    /// Convolves inside `pool` instead of the global rayon pool. With several backends every
    /// device thread runs its blocks in `pool`, so the caller must not be one of its workers.
    pub fn with_thread_pool(mut self, pool: Option<Arc<rayon::ThreadPool>>) -> Self {
        self.pool = pool;
        self
    }

    /// Tiles the volume and opens the backends for `device_ids`.
    pub fn with_devices(
        volume_shape: [usize; 3],
        kernel_shape: [usize; 3],
        block_size: Option<[usize; 3]>,
        device_ids: &[i32],
        provider: Option<&dyn AcceleratorProvider>,
        cpu_fallback: bool,
    ) -> Result<Self> {
        let tiling = Tiling::new(volume_shape, kernel_shape, block_size)?;
        let backends = resolve_backends(device_ids, tiling.block_size, provider, cpu_fallback)?;
        BlockConvolver::new(tiling, backends)
    }

    /// Single CPU backend.
    pub fn cpu(
        volume_shape: [usize; 3],
        kernel_shape: [usize; 3],
        block_size: Option<[usize; 3]>,
    ) -> Result<Self> {
        let tiling = Tiling::new(volume_shape, kernel_shape, block_size)?;
        let backend = CpuFftBackend::new(tiling.block_size);
        BlockConvolver::new(tiling, vec![Box::new(backend)])
    }

    pub fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    pub fn blocks(&self) -> &[Block] {
        &self.tiling.blocks
    }

    pub fn devices(&self) -> Vec<Device> {
        self.backends.iter().map(|b| b.device()).collect()
    }

    /// Transforms a kernel once for all blocks of this tiling.
    pub fn prepare_kernel(&self, kernel: &ArrayView3<f32>) -> Result<KernelSpectrum> {
        let (a, b, c) = kernel.dim();
        if [a, b, c] != self.tiling.kernel_shape {
            return Err(DeconvolutionError::config(format!(
                "kernel {:?} does not match the tiling kernel shape {:?}",
                [a, b, c],
                self.tiling.kernel_shape
            )));
        }
        KernelSpectrum::new(kernel, &self.fft)
    }

    /// Convolves `input` with `kernel` into `output`.
    ///
    /// `boundary` decides how the neighborhood outside `input` is filled. `output` is fully
    /// overwritten and must not alias `input`.
    pub fn convolve(
        &self,
        input: &ArrayView3<f32>,
        kernel: &KernelSpectrum,
        boundary: BoundaryMode,
        output: &mut Array3<f32>,
    ) -> Result<()> {
        let (a, b, c) = input.dim();
        if [a, b, c] != self.tiling.volume_shape || output.dim() != input.dim() {
            return Err(DeconvolutionError::config(format!(
                "convolution of {:?} into {:?} does not match the tiling of {:?}",
                input.dim(),
                output.dim(),
                self.tiling.volume_shape
            )));
        }

        if self.backends.len() == 1 {
            let backend = &self.backends[0];
            let blocks = &self.tiling.blocks;
            let block_size = self.tiling.block_size;
            in_pool(self.pool.as_deref(), || -> Result<()> {
                let mut scratch = Array3::zeros(block_size);
                for block in blocks {
                    copy_block(input, block, boundary, &mut scratch);
                    backend.convolve_block(&mut scratch, kernel)?;
                    paste_block(&scratch.view(), block, output);
                }
                Ok(())
            })
        } else {
            self.convolve_on_devices(input, kernel, boundary, output)
        }
    }

    fn convolve_on_devices(
        &self,
        input: &ArrayView3<f32>,
        kernel: &KernelSpectrum,
        boundary: BoundaryMode,
        output: &mut Array3<f32>,
    ) -> Result<()> {
        let num_blocks = self.tiling.blocks.len();
        let next_block = AtomicUsize::new(0);
        let abort_flag = AtomicBool::new(false);
        let (sender, receiver) = bounded::<Result<(usize, Array3<f32>)>>(self.backends.len());

        std::thread::scope(|scope| {
            for backend in &self.backends {
                let sender = sender.clone();
                let next_block = &next_block;
                let abort_flag = &abort_flag;
                let blocks = &self.tiling.blocks;
                let block_size = self.tiling.block_size;
                let pool = self.pool.as_deref();

                scope.spawn(move || {
                    in_pool(pool, move || {
                        let claimed = std::iter::from_fn(|| {
                            let index = next_block.fetch_add(1, Ordering::SeqCst);
                            (index < num_blocks).then_some(index)
                        });
                        let mut processed = 0usize;
                        for_each_until_aborted(claimed, abort_flag, |index| {
                            let mut scratch = Array3::zeros(block_size);
                            copy_block(input, &blocks[index], boundary, &mut scratch);
                            let result = backend
                                .convolve_block(&mut scratch, kernel)
                                .map(|()| (index, scratch));
                            if result.is_err() {
                                abort_flag.store(true, Ordering::Relaxed);
                            } else {
                                processed += 1;
                            }
                            // the receiver only disappears once the scope ends
                            let _ = sender.send(result);
                        });
                        log::debug!("{} convolved {processed} blocks", backend.device());
                    })
                });
            }
            drop(sender);

            let mut first_error = None;
            for message in receiver {
                match message {
                    Ok((index, block_output)) => {
                        paste_block(&block_output.view(), &self.tiling.blocks[index], output)
                    }
                    Err(err) => {
                        log::error!("block convolution failed: {err}");
                        first_error.get_or_insert(err);
                    }
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}
