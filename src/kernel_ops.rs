//! Stateless utilities on convolution kernels: mirroring, exponentiation, normalization and
//! centered padding.

use crate::error::{DeconvolutionError, Result};
use ndarray::{s, Array3, Axis};

/// Reverses the sample order of `kernel` along `axis` in place by swapping symmetric pairs.
///
/// # Panics
/// Panics if `axis >= 3`.
pub fn mirror_axis(kernel: &mut Array3<f32>, axis: usize) {
    let n = kernel.len_of(Axis(axis));
    let mut half = kernel.raw_dim();
    half[axis] = n / 2;

    for (i, j, k) in ndarray::indices(half) {
        let index = [i, j, k];
        let mut opposite = index;
        opposite[axis] = n - 1 - index[axis];
        kernel.swap(index, opposite);
    }
}

/// Point reflection of `kernel` (mirrored along every axis).
///
/// The caller's kernel is left untouched, so mirroring an already mirrored kernel returns the
/// original samples exactly.
pub fn mirror(kernel: &Array3<f32>) -> Array3<f32> {
    let mut mirrored = kernel.to_owned();
    for axis in 0..3 {
        mirror_axis(&mut mirrored, axis);
    }
    mirrored
}

/// Raises every sample of `kernel` to the integer power `exponent`.
pub fn power(kernel: &Array3<f32>, exponent: u32) -> Result<Array3<f32>> {
    if exponent == 0 {
        return Err(DeconvolutionError::config(
            "kernel exponent must be at least 1",
        ));
    }
    let exponent = i32::try_from(exponent)
        .map_err(|_| DeconvolutionError::config("kernel exponent is too large"))?;
    Ok(kernel.mapv(|v| v.powi(exponent)))
}

/// Returns `kernel` rescaled so its samples sum to 1.
///
/// `None` if the sum is zero or not finite.
pub fn normalize(kernel: &Array3<f32>) -> Option<Array3<f32>> {
    let sum: f64 = kernel.iter().map(|v| *v as f64).sum();
    if sum == 0.0 || !sum.is_finite() {
        return None;
    }
    Some(kernel.mapv(|v| (v as f64 / sum) as f32))
}

/// Zero-pads `kernel` to `shape`, keeping it centered.
///
/// # Panics
/// Panics if `shape` is smaller than the kernel in any dimension.
pub fn pad_centered(kernel: &Array3<f32>, shape: [usize; 3]) -> Array3<f32> {
    let (a, b, c) = kernel.dim();
    assert!(
        shape[0] >= a && shape[1] >= b && shape[2] >= c,
        "padding target is smaller than the kernel"
    );
    let offset = [(shape[0] - a) / 2, (shape[1] - b) / 2, (shape[2] - c) / 2];

    let mut padded = Array3::zeros(shape);
    padded
        .slice_mut(s![
            offset[0]..offset[0] + a,
            offset[1]..offset[1] + b,
            offset[2]..offset[2] + c
        ])
        .assign(kernel);
    padded
}

/// Smallest odd size that is at least `size`.
pub fn odd_size(size: usize) -> usize {
    if size % 2 == 0 { size + 1 } else { size }
}
