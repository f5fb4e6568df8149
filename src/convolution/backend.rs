//! Convolution backends and device selection.
//!
//! A backend convolves one padded block at a time with a kernel that was transformed once
//! into a [`KernelSpectrum`]. The CPU implementation uses the crate's FFT, accelerators are
//! supplied by the caller through an [`AcceleratorProvider`].

use crate::error::{DeconvolutionError, Result};
use crate::fft::Fft3d;
use ndarray::{Array3, ArrayView3, Zip};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A logical compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Device id `-1`.
    Cpu,
    /// Accelerator with a non-negative device id.
    Accelerator(u32),
}

impl Device {
    /// Parses a logical device id: `-1` is the CPU, `n >= 0` accelerator `n`.
    pub fn from_id(id: i32) -> Result<Device> {
        match id {
            -1 => Ok(Device::Cpu),
            id if id >= 0 => Ok(Device::Accelerator(id as u32)),
            id => Err(DeconvolutionError::config(format!(
                "invalid device id {id}, expected -1 (CPU) or a non-negative accelerator id"
            ))),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Device::Cpu => -1,
            Device::Accelerator(id) => *id as i32,
        }
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Accelerator(id) => write!(f, "accelerator #{id}"),
        }
    }
}

/// Spectrum of a kernel laid out for circular convolution of blocks of one fixed size.
///
/// The kernel center sits at index 0 with the remaining samples wrapped around, so multiplying
/// a block spectrum with it convolves without shifting the block.
#[derive(Debug, Clone)]
pub struct KernelSpectrum {
    block_size: [usize; 3],
    kernel_shape: [usize; 3],
    spectrum: Array3<Complex32>,
}

impl KernelSpectrum {
    /// Wraps `kernel` into a block of the plan's shape and transforms it.
    pub fn new(kernel: &ArrayView3<f32>, fft: &Fft3d) -> Result<Self> {
        let block_size = fft.shape();
        let (a, b, c) = kernel.dim();
        let kernel_shape = [a, b, c];
        if (0..3).any(|d| kernel_shape[d] > block_size[d]) {
            return Err(DeconvolutionError::config(format!(
                "kernel {kernel_shape:?} does not fit into blocks of {block_size:?}"
            )));
        }

        let mut wrapped = Array3::<f32>::zeros(block_size);
        for ((i, j, k), value) in kernel.indexed_iter() {
            let index = [i, j, k];
            let mut target = [0usize; 3];
            for d in 0..3 {
                let shifted = index[d] as isize - (kernel_shape[d] / 2) as isize;
                target[d] = shifted.rem_euclid(block_size[d] as isize) as usize;
            }
            wrapped[target] += *value;
        }

        Ok(KernelSpectrum {
            block_size,
            kernel_shape,
            spectrum: fft.forward(&wrapped.view())?,
        })
    }

    pub fn block_size(&self) -> [usize; 3] {
        self.block_size
    }

    pub fn kernel_shape(&self) -> [usize; 3] {
        self.kernel_shape
    }

    pub fn spectrum(&self) -> &Array3<Complex32> {
        &self.spectrum
    }
}

/// Convolves padded blocks on one device.
pub trait ConvolutionBackend: Send + Sync {
    /// The device this backend runs on.
    fn device(&self) -> Device;

    /// Circularly convolves `block` with `kernel` in place.
    ///
    /// Only the interior of the block (away from the padding) is a valid linear convolution,
    /// the caller pastes back just that region.
    fn convolve_block(&self, block: &mut Array3<f32>, kernel: &KernelSpectrum) -> Result<()>;
}

/// Opens accelerator backends, e.g. a GPU FFT library.
pub trait AcceleratorProvider: Send + Sync {
    /// Opens device `device_id` for blocks of `block_size`.
    fn open(&self, device_id: u32, block_size: [usize; 3]) -> Result<Box<dyn ConvolutionBackend>>;
}

/// FFT convolution on the CPU, parallel over the lanes of each block.
#[derive(Debug, Clone)]
pub struct CpuFftBackend {
    fft: Fft3d,
}

impl CpuFftBackend {
    pub fn new(block_size: [usize; 3]) -> Self {
        CpuFftBackend {
            fft: Fft3d::new(block_size),
        }
    }

    pub fn fft(&self) -> &Fft3d {
        &self.fft
    }

    fn convolve(&self, block: &mut Array3<f32>, kernel: &KernelSpectrum) -> Result<()> {
        if kernel.block_size() != self.fft.shape() {
            return Err(DeconvolutionError::Fft(format!(
                "kernel prepared for blocks of {:?}, backend planned for {:?}",
                kernel.block_size(),
                self.fft.shape()
            )));
        }
        let mut spectrum = self.fft.forward(&block.view())?;
        Zip::from(&mut spectrum)
            .and(kernel.spectrum())
            .par_for_each(|s, k| *s *= *k);
        self.fft.inverse(&mut spectrum, block)
    }
}

impl ConvolutionBackend for CpuFftBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn convolve_block(&self, block: &mut Array3<f32>, kernel: &KernelSpectrum) -> Result<()> {
        self.convolve(block, kernel)
            .map_err(|err| DeconvolutionError::backend(Device::Cpu, err))
    }
}

/// Opens one backend per requested device.
///
/// Accelerators that cannot be opened are logged and skipped. When no backend remains the CPU
/// is used if `cpu_fallback` is set, otherwise a configuration error is returned.
pub fn resolve_backends(
    device_ids: &[i32],
    block_size: [usize; 3],
    provider: Option<&dyn AcceleratorProvider>,
    cpu_fallback: bool,
) -> Result<Vec<Box<dyn ConvolutionBackend>>> {
    let mut devices: Vec<Device> = Vec::with_capacity(device_ids.len());
    for id in device_ids {
        let device = Device::from_id(*id)?;
        if !devices.contains(&device) {
            devices.push(device);
        }
    }

    let mut backends: Vec<Box<dyn ConvolutionBackend>> = Vec::with_capacity(devices.len());
    for device in devices {
        match device {
            Device::Cpu => backends.push(Box::new(CpuFftBackend::new(block_size))),
            Device::Accelerator(id) => match provider {
                Some(provider) => match provider.open(id, block_size) {
                    Ok(backend) => {
                        log::info!("opened {device} for blocks of {block_size:?}");
                        backends.push(backend);
                    }
                    Err(err) => log::warn!("cannot open {device}: {err}"),
                },
                None => log::warn!("no accelerator library available for {device}"),
            },
        }
    }

    if backends.is_empty() {
        if cpu_fallback {
            log::warn!(
                "none of the requested devices {device_ids:?} is available, falling back to the CPU"
            );
            backends.push(Box::new(CpuFftBackend::new(block_size)));
        } else {
            return Err(DeconvolutionError::config(format!(
                "none of the requested devices {device_ids:?} is available \
                 and CPU fallback is disabled"
            )));
        }
    }
    Ok(backends)
}
