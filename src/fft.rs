//! 3D real-to-complex FFT on fixed-size volumes.
//!
//! The last (contiguous) axis is transformed with `realfft`, the two remaining axes with
//! complex `rustfft` passes. Every pass processes its 1D lanes in parallel.

use crate::error::{DeconvolutionError, Result};
use ndarray::{Array3, ArrayView3, Axis, Zip};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::fmt::Display;
use std::sync::{Arc, Mutex};

/// Cached FFT plans for one volume shape.
///
/// # Fields
/// - `shape`: real-space shape the plans were made for.
/// - `r2c`, `c2r`: real transforms along axis 2.
/// - `forward`, `inverse`: complex transforms along axes 0 and 1.
#[derive(Clone)]
pub struct Fft3d {
    shape: [usize; 3],
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    forward: [Arc<dyn Fft<f32>>; 2],
    inverse: [Arc<dyn Fft<f32>>; 2],
}

impl std::fmt::Debug for Fft3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft3d").field("shape", &self.shape).finish()
    }
}

impl Fft3d {
    /// Plans all transforms for volumes of `shape`.
    ///
    /// # Panics
    /// Panics if any dimension is zero.
    pub fn new(shape: [usize; 3]) -> Self {
        assert!(!shape.contains(&0), "FFT shape must be non-empty");

        let mut real_planner = RealFftPlanner::<f32>::new();
        let r2c = real_planner.plan_fft_forward(shape[2]);
        let c2r = real_planner.plan_fft_inverse(shape[2]);

        let mut planner = FftPlanner::<f32>::new();
        let forward = [
            planner.plan_fft_forward(shape[0]),
            planner.plan_fft_forward(shape[1]),
        ];
        let inverse = [
            planner.plan_fft_inverse(shape[0]),
            planner.plan_fft_inverse(shape[1]),
        ];

        Fft3d {
            shape,
            r2c,
            c2r,
            forward,
            inverse,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Shape of the half spectrum produced by [`Fft3d::forward`].
    pub fn spectrum_shape(&self) -> [usize; 3] {
        [self.shape[0], self.shape[1], self.shape[2] / 2 + 1]
    }

    /// Forward transform of a real volume (unnormalized).
    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<Array3<Complex32>> {
        self.check_shape(input.dim())?;

        let mut spectrum = Array3::<Complex32>::zeros(self.spectrum_shape());
        let failure = Mutex::new(None);

        Zip::from(input.lanes(Axis(2)))
            .and(spectrum.lanes_mut(Axis(2)))
            .par_for_each(|row, mut spectrum_row| {
                let mut buffer = row.to_vec();
                let mut output = self.r2c.make_output_vec();
                match self.r2c.process(&mut buffer, &mut output) {
                    Ok(()) => spectrum_row
                        .iter_mut()
                        .zip(output.iter())
                        .for_each(|(s, o)| *s = *o),
                    Err(err) => record_failure(&failure, err),
                }
            });

        complex_pass(&mut spectrum, Axis(1), &self.forward[1]);
        complex_pass(&mut spectrum, Axis(0), &self.forward[0]);

        finish(failure)?;
        Ok(spectrum)
    }

    /// Inverse transform of a half spectrum into `output`, normalized by the volume size.
    ///
    /// `spectrum` is used as scratch space and is overwritten.
    pub fn inverse(
        &self,
        spectrum: &mut Array3<Complex32>,
        output: &mut Array3<f32>,
    ) -> Result<()> {
        self.check_shape(output.dim())?;
        let [n0, n1, n2] = self.shape;
        let expected = self.spectrum_shape();
        if spectrum.dim() != (expected[0], expected[1], expected[2]) {
            return Err(DeconvolutionError::Fft(format!(
                "spectrum shape {:?} does not match the planned shape {:?}",
                spectrum.dim(),
                expected
            )));
        }

        complex_pass(spectrum, Axis(0), &self.inverse[0]);
        complex_pass(spectrum, Axis(1), &self.inverse[1]);

        let scale = 1.0 / (n0 * n1 * n2) as f32;
        let nyquist = (n2 % 2 == 0).then_some(n2 / 2);
        let failure = Mutex::new(None);

        Zip::from(spectrum.lanes(Axis(2)))
            .and(output.lanes_mut(Axis(2)))
            .par_for_each(|spectrum_row, mut row| {
                let mut buffer = spectrum_row.to_vec();
                // the real transform only accepts purely real DC and Nyquist bins
                buffer[0].im = 0.0;
                if let Some(nyquist) = nyquist {
                    buffer[nyquist].im = 0.0;
                }
                let mut real = self.c2r.make_output_vec();
                match self.c2r.process(&mut buffer, &mut real) {
                    Ok(()) => row
                        .iter_mut()
                        .zip(real.iter())
                        .for_each(|(r, v)| *r = *v * scale),
                    Err(err) => record_failure(&failure, err),
                }
            });

        finish(failure)
    }

    fn check_shape(&self, dim: (usize, usize, usize)) -> Result<()> {
        if [dim.0, dim.1, dim.2] != self.shape {
            return Err(DeconvolutionError::Fft(format!(
                "volume shape {:?} does not match the planned shape {:?}",
                dim, self.shape
            )));
        }
        Ok(())
    }
}

/// Transforms every lane of `spectrum` along `axis` in place.
fn complex_pass(spectrum: &mut Array3<Complex32>, axis: Axis, fft: &Arc<dyn Fft<f32>>) {
    Zip::from(spectrum.lanes_mut(axis)).par_for_each(|mut lane| {
        let mut buffer = lane.to_vec();
        fft.process(&mut buffer);
        lane.iter_mut()
            .zip(buffer.iter())
            .for_each(|(l, b)| *l = *b);
    });
}

fn record_failure(failure: &Mutex<Option<String>>, err: impl Display) {
    if let Ok(mut slot) = failure.lock() {
        slot.get_or_insert_with(|| err.to_string());
    }
}

fn finish(failure: Mutex<Option<String>>) -> Result<()> {
    match failure.into_inner() {
        Ok(None) => Ok(()),
        Ok(Some(message)) => Err(DeconvolutionError::Fft(message)),
        Err(_) => Err(DeconvolutionError::Fft(
            "FFT worker panicked while reporting an error".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn test_volume(shape: [usize; 3]) -> Array3<f32> {
        Array3::from_shape_fn(shape, |(i, j, k)| {
            ((i * 7 + j * 3 + k) as f32 * 0.37).sin() + 0.1 * k as f32
        })
    }

    #[test]
    fn forward_then_inverse_restores_volume() {
        for shape in [[4, 6, 8], [5, 3, 7], [1, 1, 2], [3, 1, 1]] {
            let fft = Fft3d::new(shape);
            let volume = test_volume(shape);
            let mut spectrum = fft.forward(&volume.view()).unwrap();
            let mut restored = Array3::zeros(shape);
            fft.inverse(&mut spectrum, &mut restored).unwrap();
            for (a, b) in volume.iter().zip(restored.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn dc_bin_is_the_sum() {
        let shape = [3, 4, 5];
        let fft = Fft3d::new(shape);
        let volume = test_volume(shape);
        let spectrum = fft.forward(&volume.view()).unwrap();
        assert_abs_diff_eq!(spectrum[[0, 0, 0]].re, volume.sum(), epsilon = 1e-3);
        assert_abs_diff_eq!(spectrum[[0, 0, 0]].im, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn rejects_wrong_shape() {
        let fft = Fft3d::new([4, 4, 4]);
        let volume = test_volume([4, 4, 5]);
        assert!(fft.forward(&volume.view()).is_err());
    }
}
