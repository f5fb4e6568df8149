//! # voxel_portions
//!
//! Splits a flattened voxel buffer into contiguous, non-overlapping *portions* and runs one
//! portion per parallel task.
//!
//! Every portion owns a disjoint slice of the output buffer, so no locking is needed while a
//! stage runs. All functions here return only after every portion has been processed, which
//! makes each call a barrier between consecutive processing stages.
//!
//! ## Example
//!
//! ```
//! use voxel_portions::{divide_into_portions, par_map_reduce_portions};
//!
//! let mut data = vec![1.0f32; 1000];
//! let portions = divide_into_portions(data.len(), 8);
//!
//! // double every value and count the processed voxels
//! let processed = par_map_reduce_portions(
//!     &mut data,
//!     &portions,
//!     |_portion, chunk| {
//!         chunk.iter_mut().for_each(|v| *v *= 2.0);
//!         chunk.len()
//!     },
//!     |a, b| a + b,
//!     0,
//! );
//!
//! assert_eq!(processed, 1000);
//! assert!(data.iter().all(|v| *v == 2.0));
//! ```

use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// A contiguous range of the flattened voxel iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portion {
    /// First flattened index of the portion.
    pub start: usize,
    /// Number of voxels in the portion.
    pub len: usize,
}

impl Portion {
    /// One past the last flattened index of the portion.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// The flattened index range covered by the portion.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Number of portions used when the caller has no preference: a few per worker thread so that
/// uneven portions still balance out.
pub fn default_portion_count() -> usize {
    rayon::current_num_threads().max(1) * 4
}

/// Divides `total` voxels into at most `num_portions` contiguous portions.
///
/// The portions are ordered, cover `0..total` exactly once and differ in length by at most one.
/// Empty portions are never produced, so fewer than `num_portions` portions are returned when
/// `total < num_portions`.
///
/// # Examples
///
/// ```
/// use voxel_portions::divide_into_portions;
///
/// let portions = divide_into_portions(10, 3);
/// assert_eq!(portions.len(), 3);
/// assert_eq!(portions[0].range(), 0..4);
/// assert_eq!(portions[2].end(), 10);
/// ```
pub fn divide_into_portions(total: usize, num_portions: usize) -> Vec<Portion> {
    let num_portions = num_portions.max(1).min(total.max(1));
    if total == 0 {
        return Vec::new();
    }

    let base = total / num_portions;
    let remainder = total % num_portions;

    let mut portions = Vec::with_capacity(num_portions);
    let mut start = 0;
    for i in 0..num_portions {
        let len = base + usize::from(i < remainder);
        portions.push(Portion { start, len });
        start += len;
    }
    portions
}

/// Splits `data` into one mutable slice per portion.
///
/// # Panics
///
/// Panics if the portions are not sorted, overlap, or reach past the end of `data`.
pub fn split_portions_mut<'a, T>(data: &'a mut [T], portions: &[Portion]) -> Vec<&'a mut [T]> {
    let mut chunks = Vec::with_capacity(portions.len());
    let mut rest = data;
    let mut consumed = 0;
    for portion in portions {
        assert!(
            portion.start >= consumed,
            "portions must be sorted and disjoint"
        );
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(portion.start - consumed);
        let (chunk, tail) = tail.split_at_mut(portion.len);
        chunks.push(chunk);
        rest = tail;
        consumed = portion.end();
    }
    chunks
}

/// Runs `func` once per portion in parallel, handing it the portion's slice of `data`.
///
/// Returns after all portions are done.
pub fn par_for_each_portion<T, F>(data: &mut [T], portions: &[Portion], func: F)
where
    T: Send,
    F: Fn(&Portion, &mut [T]) + Sync + Send,
{
    split_portions_mut(data, portions)
        .into_par_iter()
        .zip(portions.par_iter())
        .for_each(|(chunk, portion)| func(portion, chunk));
}

/// Runs `func` once per portion in parallel on the portion's slice of `data` and combines the
/// per-portion results with `reducer`.
///
/// `init` is returned when there are no portions.
pub fn par_map_reduce_portions<T, R, F, G>(
    data: &mut [T],
    portions: &[Portion],
    func: F,
    reducer: G,
    init: R,
) -> R
where
    T: Send,
    R: Send + Sync + Clone,
    F: Fn(&Portion, &mut [T]) -> R + Sync + Send,
    G: Fn(R, R) -> R + Sync + Send,
{
    split_portions_mut(data, portions)
        .into_par_iter()
        .zip(portions.par_iter())
        .map(|(chunk, portion)| func(portion, chunk))
        .reduce(|| init.clone(), reducer)
}

/// Runs `op` inside `pool`, or on the current thread's pool if there is none.
pub fn in_pool<R, F>(pool: Option<&rayon::ThreadPool>, op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

/// Executes a sequential loop that stops as soon as `abort_flag` is set.
///
/// The flag is checked before every item; an item that is already running is always finished.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use voxel_portions::for_each_until_aborted;
///
/// let abort_flag = AtomicBool::new(false);
/// let mut sum = 0;
///
/// for_each_until_aborted(1..=10, &abort_flag, |i| {
///     sum += i;
///     if sum > 15 {
///         abort_flag.store(true, Ordering::Relaxed);
///     }
/// });
///
/// // 1 + 2 + 3 + 4 + 5 + 6 = 21 is the first sum above 15
/// assert_eq!(sum, 21);
/// ```
pub fn for_each_until_aborted<I, F, T>(iter: I, abort_flag: &AtomicBool, mut func: F)
where
    I: IntoIterator<Item = T>,
    F: FnMut(T),
{
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            break;
        }
        func(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portions_cover_range_exactly_once() {
        for total in [0usize, 1, 7, 64, 1001] {
            for count in [1usize, 3, 8, 2000] {
                let portions = divide_into_portions(total, count);
                let covered: usize = portions.iter().map(|p| p.len).sum();
                assert_eq!(covered, total);
                for pair in portions.windows(2) {
                    assert_eq!(pair[0].end(), pair[1].start);
                }
                assert!(portions.iter().all(|p| p.len > 0));
            }
        }
    }

    #[test]
    fn split_matches_portion_ranges() {
        let mut data: Vec<usize> = (0..23).collect();
        let portions = divide_into_portions(data.len(), 5);
        let chunks = split_portions_mut(&mut data, &portions);
        for (chunk, portion) in chunks.iter().zip(&portions) {
            assert_eq!(chunk.first().copied(), Some(portion.start));
            assert_eq!(chunk.len(), portion.len);
        }
    }

    #[test]
    fn reduction_sees_every_voxel() {
        let mut data = vec![1u64; 10_000];
        let portions = divide_into_portions(data.len(), 13);
        let sum = par_map_reduce_portions(
            &mut data,
            &portions,
            |_, chunk| chunk.iter().sum::<u64>(),
            |a, b| a + b,
            0,
        );
        assert_eq!(sum, 10_000);
    }

    #[test]
    fn in_pool_uses_the_given_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        assert_eq!(in_pool(Some(&pool), rayon::current_num_threads), 3);
        assert_eq!(
            in_pool(None, rayon::current_num_threads),
            rayon::current_num_threads()
        );
    }

    #[test]
    fn for_each_portion_writes_disjoint_ranges() {
        let mut data = vec![0usize; 97];
        let portions = divide_into_portions(data.len(), 6);
        par_for_each_portion(&mut data, &portions, |portion, chunk| {
            for (offset, value) in chunk.iter_mut().enumerate() {
                *value = portion.start + offset;
            }
        });
        assert!(data.iter().enumerate().all(|(i, v)| i == *v));
    }

    #[test]
    fn aborted_loop_stops_early() {
        let abort_flag = AtomicBool::new(true);
        let mut visited = 0;
        for_each_until_aborted(0..10, &abort_flag, |_| visited += 1);
        assert_eq!(visited, 0);
    }
}
