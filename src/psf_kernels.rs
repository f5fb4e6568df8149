//! Derivation of the forward/adjoint kernel pair of every view.
//!
//! The forward kernel is always the normalized PSF of the view. The adjoint kernel depends on the
//! [`PsfType`]: apart from `Independent` it folds in the PSFs of all other views so that the
//! sequential per-view updates approximate the joint multi-view update.

use crate::config::PsfType;
use crate::convolution::{BlockConvolver, BoundaryMode};
use crate::error::{DeconvolutionError, Result};
use crate::kernel_ops::{mirror, normalize, power};
use crate::psf_extraction::reconcile_psf_sizes;
use crate::volume::shape_of;
use ndarray::Array3;

/// Forward and adjoint kernel of one view, both of the same odd size.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelPair {
    /// Normalized PSF, used to blur the estimate.
    pub kernel1: Array3<f32>,
    /// Compound kernel applied to the quotient image.
    pub kernel2: Array3<f32>,
}

/// Kernel pairs of all usable views plus the views that had to be dropped.
///
/// # Fields
/// - `pairs`: `(view index, kernels)` in view order.
/// - `rejected`: one [`DeconvolutionError::ViewRejected`] per dropped view.
#[derive(Debug)]
pub struct KernelSet {
    pub pairs: Vec<(usize, KernelPair)>,
    pub rejected: Vec<DeconvolutionError>,
}

/// "Same"-size convolution of kernels with zero boundary, all kernels sharing one shape.
struct KernelConvolver {
    convolver: BlockConvolver,
}

impl KernelConvolver {
    fn new(shape: [usize; 3]) -> Result<Self> {
        Ok(KernelConvolver {
            convolver: BlockConvolver::cpu(shape, shape, None)?,
        })
    }

    fn convolve(&self, input: &Array3<f32>, kernel: &Array3<f32>) -> Result<Array3<f32>> {
        let spectrum = self.convolver.prepare_kernel(&kernel.view())?;
        let mut output = Array3::zeros(input.raw_dim());
        self.convolver.convolve(
            &input.view(),
            &spectrum,
            BoundaryMode::Constant(0.0),
            &mut output,
        )?;
        Ok(output)
    }
}

/// Computes the adjoint kernel of one view.
///
/// `own` and `peers` must be normalized and share one shape; `num_views` is the number of usable
/// views of the run (only used by [`PsfType::OptimizationII`]).
///
/// # Returns
/// `Ok(None)` if the compound kernel cannot be normalized.
pub fn build_compound_kernel(
    psf_type: PsfType,
    own: &Array3<f32>,
    peers: &[Array3<f32>],
    num_views: usize,
) -> Result<Option<Array3<f32>>> {
    let shape = shape_of(&own.view());
    if peers.iter().any(|peer| shape_of(&peer.view()) != shape) {
        return Err(DeconvolutionError::config(
            "all kernels must share one shape to build a compound kernel",
        ));
    }
    let peers: Vec<&Array3<f32>> = peers.iter().collect();
    let convolver = KernelConvolver::new(shape)?;
    compound_kernel(&convolver, psf_type, own, &peers, num_views)
}

fn compound_kernel(
    convolver: &KernelConvolver,
    psf_type: PsfType,
    own: &Array3<f32>,
    peers: &[&Array3<f32>],
    num_views: usize,
) -> Result<Option<Array3<f32>>> {
    match psf_type {
        PsfType::Independent => Ok(Some(mirror(own))),
        PsfType::EfficientBayesian => {
            let mirrored = mirror(own);
            let mut product = mirrored.clone();
            for peer in peers {
                let blurred = convolver.convolve(&mirrored, peer)?;
                product *= &convolver.convolve(&blurred, &mirror(peer))?;
            }
            Ok(normalize(&product))
        }
        PsfType::OptimizationI => {
            let mut product = own.clone();
            for peer in peers {
                product *= &convolver.convolve(own, &mirror(peer))?;
            }
            Ok(normalize(&product).map(|kernel| mirror(&kernel)))
        }
        PsfType::OptimizationII => {
            let Some(normalized) = normalize(own) else {
                return Ok(None);
            };
            let exponent = u32::try_from(num_views.max(1))
                .map_err(|_| DeconvolutionError::config("too many views"))?;
            Ok(normalize(&power(&normalized, exponent)?).map(|kernel| mirror(&kernel)))
        }
    }
}

/// Builds the kernel pairs of all views.
///
/// PSFs are reconciled to a common odd size and normalized first. Views whose PSF or compound
/// kernel cannot be normalized are rejected and take no part in the kernels of the other views.
/// With a single usable view every type reduces to [`PsfType::Independent`].
///
/// # Errors
/// A configuration error if no view is usable.
pub fn build_kernel_pairs(psfs: &[Array3<f32>], psf_type: PsfType) -> Result<KernelSet> {
    if psfs.is_empty() {
        return Err(DeconvolutionError::config("no PSFs given"));
    }
    let reconciled = reconcile_psf_sizes(psfs);
    let shape = shape_of(&reconciled[0].view());

    let mut rejected = Vec::new();
    let mut usable: Vec<(usize, Array3<f32>)> = Vec::with_capacity(reconciled.len());
    for (view, psf) in reconciled.iter().enumerate() {
        match normalize(psf) {
            Some(kernel) => usable.push((view, kernel)),
            None => rejected.push(DeconvolutionError::ViewRejected {
                view,
                reason: "PSF sums to zero or is not finite".to_string(),
            }),
        }
    }
    if usable.is_empty() {
        return Err(DeconvolutionError::config(
            "none of the views has a usable PSF",
        ));
    }

    let num_views = usable.len();
    let psf_type = if num_views == 1 {
        PsfType::Independent
    } else {
        psf_type
    };
    log::info!("building {psf_type} kernels of {shape:?} for {num_views} views");

    let convolver = KernelConvolver::new(shape)?;
    let mut pairs = Vec::with_capacity(num_views);
    for (view, kernel1) in &usable {
        let peers: Vec<&Array3<f32>> = usable
            .iter()
            .filter(|(other, _)| other != view)
            .map(|(_, kernel)| kernel)
            .collect();
        match compound_kernel(&convolver, psf_type, kernel1, &peers, num_views)? {
            Some(kernel2) => pairs.push((
                *view,
                KernelPair {
                    kernel1: kernel1.clone(),
                    kernel2,
                },
            )),
            None => rejected.push(DeconvolutionError::ViewRejected {
                view: *view,
                reason: format!("{psf_type} kernel cannot be normalized"),
            }),
        }
    }

    for err in &rejected {
        log::warn!("{err}");
    }
    if pairs.is_empty() {
        return Err(DeconvolutionError::config(
            "no view has a usable compound kernel",
        ));
    }
    Ok(KernelSet { pairs, rejected })
}
