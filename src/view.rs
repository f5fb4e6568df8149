//! Input views and the per-view convolution unit used during the iterations.

use crate::convolution::{BlockConvolver, BoundaryMode, KernelSpectrum};
use crate::error::{DeconvolutionError, Result};
use crate::psf_kernels::KernelPair;
use crate::volume::{ViewId, Volume};
use ndarray::Array3;
use std::sync::Arc;

/// One acquisition as handed to the engine.
///
/// # Fields
/// - `id`: timepoint and setup of the view.
/// - `image`: observed intensities on the output grid.
/// - `weight`: raw weight on the output grid, zero outside the view.
/// - `psf`: raw PSF already mapped into output coordinates.
#[derive(Debug, Clone)]
pub struct ViewInput {
    pub id: ViewId,
    pub image: Volume,
    pub weight: Volume,
    pub psf: Array3<f32>,
}

impl ViewInput {
    pub fn new(id: ViewId, image: Volume, weight: Volume, psf: Array3<f32>) -> Self {
        ViewInput {
            id,
            image,
            weight,
            psf,
        }
    }

    /// Combines parallel lists of ids, images, weights and PSFs into views.
    ///
    /// # Errors
    /// A configuration error if the lists differ in length.
    pub fn zip(
        ids: Vec<ViewId>,
        images: Vec<Volume>,
        weights: Vec<Volume>,
        psfs: Vec<Array3<f32>>,
    ) -> Result<Vec<ViewInput>> {
        let n = ids.len();
        if images.len() != n || weights.len() != n || psfs.len() != n {
            return Err(DeconvolutionError::config(format!(
                "got {n} view ids, {} images, {} weights and {} PSFs",
                images.len(),
                weights.len(),
                psfs.len()
            )));
        }
        Ok(ids
            .into_iter()
            .zip(images)
            .zip(weights)
            .zip(psfs)
            .map(|(((id, image), weight), psf)| ViewInput::new(id, image, weight, psf))
            .collect())
    }
}

/// Everything one view needs during the iterations: its image, normalized weight and the two
/// prepared kernels.
///
/// All units of a run share one [`BlockConvolver`].
#[derive(Debug)]
pub struct ViewDeconvUnit {
    id: ViewId,
    image: Array3<f32>,
    weight: Array3<f32>,
    kernels: KernelPair,
    forward: KernelSpectrum,
    adjoint: KernelSpectrum,
    convolver: Arc<BlockConvolver>,
    max_intensity: f32,
}

impl ViewDeconvUnit {
    /// Transforms both kernels for the blocks of `convolver`.
    pub fn new(
        id: ViewId,
        image: Array3<f32>,
        weight: Array3<f32>,
        kernels: KernelPair,
        convolver: Arc<BlockConvolver>,
    ) -> Result<Self> {
        let volume_shape = convolver.tiling().volume_shape;
        if image.dim() != weight.dim()
            || image.dim() != (volume_shape[0], volume_shape[1], volume_shape[2])
        {
            return Err(DeconvolutionError::config(format!(
                "view {id}: image {:?} and weight {:?} do not match the volume {volume_shape:?}",
                image.dim(),
                weight.dim()
            )));
        }
        let forward = convolver.prepare_kernel(&kernels.kernel1.view())?;
        let adjoint = convolver.prepare_kernel(&kernels.kernel2.view())?;
        let image = into_standard_layout(image);
        let weight = into_standard_layout(weight);
        Ok(ViewDeconvUnit {
            id,
            image,
            weight,
            kernels,
            forward,
            adjoint,
            convolver,
            max_intensity: 0.0,
        })
    }

    /// Blurs `psi` with the forward kernel, mirroring at the volume border.
    pub fn convolve_forward(&self, psi: &Array3<f32>, output: &mut Array3<f32>) -> Result<()> {
        self.convolver
            .convolve(&psi.view(), &self.forward, BoundaryMode::Mirror, output)
    }

    /// Applies the adjoint kernel to a quotient image, assuming a quotient of 1 outside.
    pub fn convolve_adjoint(&self, quotient: &Array3<f32>, output: &mut Array3<f32>) -> Result<()> {
        self.convolver.convolve(
            &quotient.view(),
            &self.adjoint,
            BoundaryMode::Constant(1.0),
            output,
        )
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn image(&self) -> &Array3<f32> {
        &self.image
    }

    pub fn weight(&self) -> &Array3<f32> {
        &self.weight
    }

    pub fn kernels(&self) -> &KernelPair {
        &self.kernels
    }

    /// Largest image value inside the view, known after the first estimate.
    pub fn max_intensity(&self) -> f32 {
        self.max_intensity
    }

    pub(crate) fn set_max_intensity(&mut self, max_intensity: f32) {
        self.max_intensity = max_intensity;
    }
}

fn into_standard_layout(data: Array3<f32>) -> Array3<f32> {
    if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    }
}
