//! Preparation of raw point spread functions before kernels are derived from them.
//!
//! PSFs are either measured from bead images, loaded from `.npy` files or generated
//! synthetically. All of them are brought into the output coordinate system with the linear part
//! of the view's affine transform.

use crate::error::{DeconvolutionError, Result};
use crate::kernel_ops::{normalize, odd_size, pad_centered};
use crate::math_tools::{trilinear, OutOfBounds};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, ArrayView3, Zip};
use std::path::Path;

/// Affine transform from view to output coordinates, axes in array order.
///
/// # Fields
/// - `linear`: rotation, scaling and shearing part.
/// - `translation`: offset, irrelevant for PSFs which are always centered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform3 {
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl AffineTransform3 {
    pub fn new(linear: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        AffineTransform3 {
            linear,
            translation,
        }
    }

    pub fn identity() -> Self {
        AffineTransform3::new(Matrix3::identity(), Vector3::zeros())
    }

    /// Builds the transform from the 12 values of a row-major 3x4 matrix.
    pub fn from_rows(rows: &[f64; 12]) -> Self {
        AffineTransform3 {
            linear: Matrix3::new(
                rows[0], rows[1], rows[2], //
                rows[4], rows[5], rows[6], //
                rows[8], rows[9], rows[10],
            ),
            translation: Vector3::new(rows[3], rows[7], rows[11]),
        }
    }
}

impl Default for AffineTransform3 {
    fn default() -> Self {
        AffineTransform3::identity()
    }
}

fn center_of(shape: [usize; 3]) -> Vector3<f64> {
    Vector3::new(
        (shape[0] / 2) as f64,
        (shape[1] / 2) as f64,
        (shape[2] / 2) as f64,
    )
}

/// Averages the neighborhoods of all bead locations into one PSF.
///
/// Beads are given in voxel coordinates of `image` and may lie between voxels, the neighborhood is
/// sampled with trilinear interpolation. The image is treated as periodic so beads close to the
/// border still contribute a full neighborhood.
///
/// # Arguments
/// - `image`: the bead image of one view.
/// - `beads`: bead centers in voxel coordinates.
/// - `size`: PSF size, even entries are increased to the next odd number.
///
/// # Returns
/// The averaged, unnormalized PSF.
pub fn extract_psf_from_beads(
    image: &ArrayView3<f32>,
    beads: &[[f64; 3]],
    size: [usize; 3],
) -> Result<Array3<f32>> {
    if beads.is_empty() {
        return Err(DeconvolutionError::config(
            "at least one bead is required to extract a PSF",
        ));
    }
    if image.is_empty() || size.contains(&0) {
        return Err(DeconvolutionError::config(format!(
            "cannot extract a PSF of size {size:?} from an image of {:?}",
            image.dim()
        )));
    }
    let size = size.map(odd_size);
    let center = center_of(size);
    let count = beads.len() as f64;

    let mut psf = Array3::zeros(size);
    Zip::indexed(&mut psf).par_for_each(|(i, j, k), value| {
        let offset = [
            i as f64 - center[0],
            j as f64 - center[1],
            k as f64 - center[2],
        ];
        let sum: f64 = beads
            .iter()
            .map(|bead| {
                let position = [
                    bead[0] + offset[0],
                    bead[1] + offset[1],
                    bead[2] + offset[2],
                ];
                trilinear(image, position, OutOfBounds::Periodic) as f64
            })
            .sum();
        *value = (sum / count) as f32;
    });

    log::debug!("extracted a PSF of {size:?} from {} beads", beads.len());
    Ok(psf)
}

/// Maps `psf` through the linear part of `affine` around its center.
///
/// The output box is the smallest odd-sized box containing the transformed input box, with the PSF
/// center in its middle. Samples mapping outside the input are zero.
pub fn transform_psf(psf: &Array3<f32>, affine: &AffineTransform3) -> Result<Array3<f32>> {
    let inverse = affine.linear.try_inverse().ok_or_else(|| {
        DeconvolutionError::config("the linear part of the view transform is not invertible")
    })?;

    if psf.is_empty() {
        return Err(DeconvolutionError::config("cannot transform an empty PSF"));
    }
    let (a, b, c) = psf.dim();
    let input_shape = [a, b, c];
    let input_center = center_of(input_shape);

    let mut extent = [0.0f64; 3];
    for corner in 0..8usize {
        let mut position = Vector3::<f64>::zeros();
        for d in 0..3 {
            position[d] = if (corner >> d) & 1 == 1 {
                (input_shape[d] - 1) as f64 - input_center[d]
            } else {
                -input_center[d]
            };
        }
        let mapped = affine.linear * position;
        for d in 0..3 {
            extent[d] = extent[d].max(mapped[d].abs());
        }
    }
    // guards against 2.0000000001 growing the box by two voxels
    let output_shape = extent.map(|e| 2 * (e - 1e-6).ceil().max(0.0) as usize + 1);
    let output_center = center_of(output_shape);

    let source = psf.view();
    let mut transformed = Array3::zeros(output_shape);
    Zip::indexed(&mut transformed).par_for_each(|(i, j, k), value| {
        let relative = Vector3::new(i as f64, j as f64, k as f64) - output_center;
        let position = inverse * relative + input_center;
        *value = trilinear(
            &source,
            [position[0], position[1], position[2]],
            OutOfBounds::Zero,
        );
    });
    Ok(transformed)
}

/// Loads a PSF stored as a 3D `f32` `.npy` array, optionally mapping it with `affine`.
pub fn load_psf(path: impl AsRef<Path>, affine: Option<&AffineTransform3>) -> Result<Array3<f32>> {
    let path = path.as_ref();
    let psf: Array3<f32> = ndarray_npy::read_npy(path)?;
    log::info!("loaded PSF {:?} from {}", psf.dim(), path.display());
    match affine {
        Some(affine) => transform_psf(&psf, affine),
        None => Ok(psf),
    }
}

/// Zero-pads all PSFs to one common size: the largest size per axis, rounded up to odd.
pub fn reconcile_psf_sizes(psfs: &[Array3<f32>]) -> Vec<Array3<f32>> {
    let mut shape = [1usize; 3];
    for psf in psfs {
        let (a, b, c) = psf.dim();
        shape = [shape[0].max(a), shape[1].max(b), shape[2].max(c)];
    }
    let shape = shape.map(odd_size);
    psfs.iter().map(|psf| pad_centered(psf, shape)).collect()
}

/// Voxel-wise mean of several PSFs, e.g. for channels that share one PSF.
pub fn average_psfs(psfs: &[Array3<f32>]) -> Result<Array3<f32>> {
    let reconciled = reconcile_psf_sizes(psfs);
    let mut iter = reconciled.into_iter();
    let Some(mut sum) = iter.next() else {
        return Err(DeconvolutionError::config("no PSFs to average"));
    };
    let mut count = 1usize;
    for psf in iter {
        sum += &psf;
        count += 1;
    }
    Ok(sum / count as f32)
}

/// A normalized, axis-aligned Gaussian PSF.
///
/// # Arguments
/// - `size`: PSF size, even entries are increased to the next odd number.
/// - `sigma`: standard deviation per axis in voxels.
pub fn gaussian_psf(size: [usize; 3], sigma: [f64; 3]) -> Result<Array3<f32>> {
    if size.contains(&0) || sigma.iter().any(|s| !(*s > 0.0 && s.is_finite())) {
        return Err(DeconvolutionError::config(format!(
            "invalid Gaussian PSF of size {size:?} with sigma {sigma:?}"
        )));
    }
    let size = size.map(odd_size);
    let center = center_of(size);
    let psf = Array3::from_shape_fn(size, |(i, j, k)| {
        let index = [i, j, k];
        let exponent: f64 = (0..3)
            .map(|d| {
                let x = index[d] as f64 - center[d];
                x * x / (2.0 * sigma[d] * sigma[d])
            })
            .sum();
        (-exponent).exp() as f32
    });
    normalize(&psf).ok_or_else(|| DeconvolutionError::config("Gaussian PSF underflowed to zero"))
}
