//! Scalar helpers shared by the update step and the PSF tools: Tikhonov regularization and
//! trilinear sampling of volumes.

use ndarray::ArrayView3;

/// Tikhonov-regularized value of a normalized intensity.
///
/// Computes `(sqrt(1 + 2 * lambda * y) - 1) / lambda`, which damps large values while leaving
/// small ones almost untouched. For `lambda <= 0` the value is returned unchanged.
///
/// # Arguments
/// - `y`: intensity divided by the maximum intensity of the view.
/// - `lambda`: regularization strength.
///
/// # Returns
/// The regularized intensity, still normalized to the view maximum.
pub fn tikhonov(y: f64, lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return y;
    }
    ((1.0 + 2.0 * lambda * y).sqrt() - 1.0) / lambda
}

/// How samples outside the volume are treated by [`trilinear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfBounds {
    /// The volume repeats periodically in every direction.
    Periodic,
    /// Everything outside the volume is zero.
    Zero,
}

/// Samples `volume` at a fractional position with trilinear interpolation.
///
/// # Arguments
/// - `volume`: the sampled volume.
/// - `position`: position in voxel coordinates (`[0, 0, 0]` is the first voxel center).
/// - `out_of_bounds`: treatment of the eight neighbors that lie outside the volume.
///
/// # Returns
/// The interpolated value, `0.0` for an empty volume.
pub fn trilinear(volume: &ArrayView3<f32>, position: [f64; 3], out_of_bounds: OutOfBounds) -> f32 {
    let (a, b, c) = volume.dim();
    let dims = [a, b, c];
    if dims.contains(&0) {
        return 0.0;
    }

    let mut base = [0isize; 3];
    let mut fraction = [0.0f64; 3];
    for d in 0..3 {
        let floor = position[d].floor();
        base[d] = floor as isize;
        fraction[d] = position[d] - floor;
    }

    let mut value = 0.0f64;
    for corner in 0..8usize {
        let mut index = [0usize; 3];
        let mut weight = 1.0f64;
        let mut inside = true;
        for d in 0..3 {
            let step = (corner >> d) & 1;
            weight *= if step == 1 { fraction[d] } else { 1.0 - fraction[d] };
            let p = base[d] + step as isize;
            match out_of_bounds {
                OutOfBounds::Periodic => index[d] = p.rem_euclid(dims[d] as isize) as usize,
                OutOfBounds::Zero => {
                    if p < 0 || p >= dims[d] as isize {
                        inside = false;
                    } else {
                        index[d] = p as usize;
                    }
                }
            }
        }
        if inside && weight > 0.0 {
            value += weight * volume[index] as f64;
        }
    }
    value as f32
}
