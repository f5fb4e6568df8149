//! Volumes and view identifiers shared by all stages of the engine.

use crate::error::{DeconvolutionError, Result};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Identifies one acquisition by timepoint and setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ViewId {
    pub timepoint: u32,
    pub setup: u32,
}

impl ViewId {
    pub fn new(timepoint: u32, setup: u32) -> Self {
        ViewId { timepoint, setup }
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tp={} setup={}", self.timepoint, self.setup)
    }
}

/// A 3D block of 32-bit samples placed on the output grid.
///
/// # Fields
/// - `data`: samples in standard (row-major) layout.
/// - `origin`: position of `data[[0, 0, 0]]` on the output grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Volume {
    pub data: Array3<f32>,
    pub origin: [i64; 3],
}

impl Volume {
    /// Wraps `data` located at `origin`, converting it to standard layout if necessary.
    pub fn new(data: Array3<f32>, origin: [i64; 3]) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Volume { data, origin }
    }

    /// Wraps `data` located at the grid origin.
    pub fn from_array(data: Array3<f32>) -> Self {
        Volume::new(data, [0; 3])
    }

    /// A volume filled with `value`.
    pub fn filled(shape: [usize; 3], value: f32) -> Self {
        Volume::from_array(Array3::from_elem(shape, value))
    }

    pub fn zeros(shape: [usize; 3]) -> Self {
        Volume::filled(shape, 0.0)
    }

    pub fn shape(&self) -> [usize; 3] {
        shape_of(&self.data.view())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Sum of all samples, accumulated in double precision.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|v| *v as f64).sum()
    }

    /// Largest sample, `None` for an empty volume.
    pub fn max(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::max)
    }

    /// Flattened samples in standard layout.
    pub fn as_slice(&self) -> Result<&[f32]> {
        self.data.as_slice().ok_or(DeconvolutionError::NonContiguous)
    }

    pub fn as_slice_mut(&mut self) -> Result<&mut [f32]> {
        self.data
            .as_slice_mut()
            .ok_or(DeconvolutionError::NonContiguous)
    }

    /// Same shape and origin as `other`.
    pub fn same_grid(&self, other: &Volume) -> bool {
        self.shape() == other.shape() && self.origin == other.origin
    }
}

/// Shape of a 3D view as a fixed-size array.
pub fn shape_of(data: &ArrayView3<f32>) -> [usize; 3] {
    let (a, b, c) = data.dim();
    [a, b, c]
}

/// Flattened samples of an owned array in standard layout.
pub(crate) fn flat(data: &Array3<f32>) -> Result<&[f32]> {
    data.as_slice().ok_or(DeconvolutionError::NonContiguous)
}

pub(crate) fn flat_mut(data: &mut Array3<f32>) -> Result<&mut [f32]> {
    data.as_slice_mut().ok_or(DeconvolutionError::NonContiguous)
}
