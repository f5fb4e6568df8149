//! Tiling of volumes into padded blocks for bounded-memory convolution.
//!
//! Each block is copied out of the source volume together with the neighborhood the kernel
//! needs, convolved on its own and pasted back without the padding. The pasted regions of one
//! tiling never overlap and cover the whole volume.

use crate::error::{DeconvolutionError, Result};
use ndarray::{s, Array3, ArrayView3, Zip};

/// How samples outside the source volume are generated when copying a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundaryMode {
    /// Mirror at the volume border without repeating the border sample.
    Mirror,
    /// A constant value everywhere outside the volume.
    Constant(f32),
}

/// One tile of a volume.
///
/// # Fields
/// - `offset`: position of the padded block in source coordinates, may be negative.
/// - `size`: padded size, identical for all blocks of a tiling.
/// - `effective_offset`: first output voxel written by this block.
/// - `effective_size`: number of output voxels written per axis.
/// - `padding`: distance from the padded block origin to the first output voxel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub offset: [isize; 3],
    pub size: [usize; 3],
    pub effective_offset: [usize; 3],
    pub effective_size: [usize; 3],
    pub padding: [usize; 3],
}

/// An ordered, output-disjoint set of blocks covering a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tiling {
    pub volume_shape: [usize; 3],
    pub kernel_shape: [usize; 3],
    pub block_size: [usize; 3],
    pub blocks: Vec<Block>,
}

impl Tiling {
    /// Tiles a volume for convolution with kernels of `kernel_shape`.
    ///
    /// Without `block_size` a single block of `volume + kernel - 1` covers the volume. A
    /// requested block size is capped at that value; each block then writes
    /// `block_size - kernel + 1` output voxels per axis.
    pub fn new(
        volume_shape: [usize; 3],
        kernel_shape: [usize; 3],
        block_size: Option<[usize; 3]>,
    ) -> Result<Self> {
        if volume_shape.contains(&0) || kernel_shape.contains(&0) {
            return Err(DeconvolutionError::config(format!(
                "cannot tile volume {volume_shape:?} for kernel {kernel_shape:?}"
            )));
        }

        let mut size = [0usize; 3];
        let mut effective = [0usize; 3];
        let mut padding = [0usize; 3];
        let mut counts = [0usize; 3];
        for d in 0..3 {
            let whole = volume_shape[d] + kernel_shape[d] - 1;
            size[d] = block_size.map_or(whole, |b| b[d].min(whole));
            if size[d] < kernel_shape[d] {
                return Err(DeconvolutionError::config(format!(
                    "block size {:?} is smaller than the kernel {kernel_shape:?}",
                    block_size.unwrap_or(size)
                )));
            }
            effective[d] = size[d] - kernel_shape[d] + 1;
            padding[d] = kernel_shape[d] - 1 - kernel_shape[d] / 2;
            counts[d] = volume_shape[d].div_ceil(effective[d]);
        }

        let mut blocks = Vec::with_capacity(counts.iter().product());
        for (i, j, k) in ndarray::indices(counts) {
            let grid = [i, j, k];
            let mut block = Block {
                offset: [0; 3],
                size,
                effective_offset: [0; 3],
                effective_size: [0; 3],
                padding,
            };
            for d in 0..3 {
                let start = grid[d] * effective[d];
                block.effective_offset[d] = start;
                block.effective_size[d] = effective[d].min(volume_shape[d] - start);
                block.offset[d] = start as isize - padding[d] as isize;
            }
            blocks.push(block);
        }

        Ok(Tiling {
            volume_shape,
            kernel_shape,
            block_size: size,
            blocks,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Maps a coordinate outside `0..n` back into the volume by mirroring without repeating the
/// border sample (`-1 -> 1`, `n -> n - 2`).
pub fn mirror_index(position: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut m = position.rem_euclid(period);
    if m >= n as isize {
        m = period - m;
    }
    m as usize
}

/// Copies the padded neighborhood of `block` out of `source` into `target`.
///
/// `target` must have the block's padded size.
pub fn copy_block(
    source: &ArrayView3<f32>,
    block: &Block,
    boundary: BoundaryMode,
    target: &mut Array3<f32>,
) {
    let (a, b, c) = source.dim();
    let dims = [a as isize, b as isize, c as isize];
    debug_assert_eq!(target.dim(), (block.size[0], block.size[1], block.size[2]));

    Zip::indexed(target).par_for_each(|(i, j, k), value| {
        let position = [
            block.offset[0] + i as isize,
            block.offset[1] + j as isize,
            block.offset[2] + k as isize,
        ];
        let inside = (0..3).all(|d| position[d] >= 0 && position[d] < dims[d]);
        *value = if inside {
            source[[position[0] as usize, position[1] as usize, position[2] as usize]]
        } else {
            match boundary {
                BoundaryMode::Constant(constant) => constant,
                BoundaryMode::Mirror => source[[
                    mirror_index(position[0], a),
                    mirror_index(position[1], b),
                    mirror_index(position[2], c),
                ]],
            }
        };
    });
}

/// Writes the unpadded region of a convolved block into `target`.
pub fn paste_block(block_output: &ArrayView3<f32>, block: &Block, target: &mut Array3<f32>) {
    let [o0, o1, o2] = block.effective_offset;
    let [e0, e1, e2] = block.effective_size;
    let [p0, p1, p2] = block.padding;
    target
        .slice_mut(s![o0..o0 + e0, o1..o1 + e1, o2..o2 + e2])
        .assign(&block_output.slice(s![p0..p0 + e0, p1..p1 + e1, p2..p2 + e2]));
}
