//! Synthetic volumes and helpers shared by the integration tests

#![allow(dead_code)]

use mvdecon::convolution::{BlockConvolver, BoundaryMode};
use mvdecon::{ViewId, ViewInput, Volume};
use ndarray::{s, Array3};

/// Background `low` with a cube of `high` between `start` and `end` on every axis.
pub fn cube_phantom(
    shape: [usize; 3],
    start: usize,
    end: usize,
    low: f32,
    high: f32,
) -> Array3<f32> {
    let mut volume = Array3::from_elem(shape, low);
    volume.slice_mut(s![start..end, start..end, start..end]).fill(high);
    volume
}

/// Blurs `volume` with `psf`, mirroring at the border like the forward model.
pub fn blur(volume: &Array3<f32>, psf: &Array3<f32>) -> Array3<f32> {
    let (a, b, c) = volume.dim();
    let (ka, kb, kc) = psf.dim();
    let sum = psf.sum();
    let kernel = psf / sum;
    let convolver = BlockConvolver::cpu([a, b, c], [ka, kb, kc], None).unwrap();
    let spectrum = convolver.prepare_kernel(&kernel.view()).unwrap();
    let mut blurred = Array3::zeros((a, b, c));
    convolver
        .convolve(&volume.view(), &spectrum, BoundaryMode::Mirror, &mut blurred)
        .unwrap();
    blurred
}

/// Weight of 1 where `axis` index is inside `range`, 0 elsewhere.
pub fn slab_weight(shape: [usize; 3], axis: usize, range: std::ops::Range<usize>) -> Volume {
    let data = Array3::from_shape_fn(shape, |(i, j, k)| {
        let index = [i, j, k];
        if range.contains(&index[axis]) { 1.0 } else { 0.0 }
    });
    Volume::from_array(data)
}

/// Root mean square difference over all voxels
pub fn rms(a: &Array3<f32>, b: &Array3<f32>) -> f64 {
    let sum_sq: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum();
    (sum_sq / a.len() as f64).sqrt()
}

pub fn max_abs_difference(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// A view that observes `truth` through `psf`.
pub fn observed_view(
    setup: u32,
    truth: &Array3<f32>,
    psf: Array3<f32>,
    weight: Volume,
) -> ViewInput {
    let image = Volume::from_array(blur(truth, &psf));
    ViewInput::new(ViewId::new(0, setup), image, weight, psf)
}
