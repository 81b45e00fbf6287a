//! Selection geometry
//!
//! Boxes are described by a start and a count per dimension in row-major
//! order. Two boxes intersect iff, in every dimension,
//! `max(start_a, start_b) < min(start_a + count_a, start_b + count_b)`.
//! A zero-dimensional box is a single value and intersects everything.

use alloc::vec::Vec;
use core::ops::Range;

use crate::error::{FormatError, Result};

/// Axis-aligned box in a global index space
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Region {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Region {
    pub fn new(start: impl Into<Vec<u64>>, count: impl Into<Vec<u64>>) -> Self {
        Self {
            start: start.into(),
            count: count.into(),
        }
    }

    /// Box covering a whole shape
    pub fn whole(shape: &[u64]) -> Self {
        Self {
            start: alloc::vec![0; shape.len()],
            count: shape.to_vec(),
        }
    }

    pub fn ndims(&self) -> usize {
        self.count.len()
    }

    /// Number of elements covered, `None` on overflow
    pub fn element_count(&self) -> Option<u64> {
        self.count.iter().try_fold(1u64, |acc, &c| acc.checked_mul(c))
    }

    /// Exclusive end of every dimension, `None` on overflow
    pub fn end(&self) -> Option<Vec<u64>> {
        self.start
            .iter()
            .zip(&self.count)
            .map(|(&s, &c)| s.checked_add(c))
            .collect()
    }

    /// Overlap of two boxes of equal rank
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.ndims() != other.ndims() || self.start.len() != other.start.len() {
            return None;
        }
        let mut out = Region::default();
        for d in 0..self.ndims() {
            let lo = self.start[d].max(other.start[d]);
            let hi = (self.start[d].saturating_add(self.count[d]))
                .min(other.start[d].saturating_add(other.count[d]));
            if lo >= hi {
                return None;
            }
            out.start.push(lo);
            out.count.push(hi - lo);
        }
        Some(out)
    }

    pub fn contains_point(&self, point: &[u64]) -> bool {
        point.len() == self.ndims()
            && point
                .iter()
                .zip(self.start.iter().zip(&self.count))
                .all(|(&p, (&s, &c))| p >= s && p - s < c)
    }

    /// Whether the box lies inside `[0, shape)`
    pub fn is_within(&self, shape: &[u64]) -> bool {
        self.ndims() == shape.len()
            && self.start.len() == shape.len()
            && self
                .start
                .iter()
                .zip(&self.count)
                .zip(shape)
                .all(|((&s, &c), &n)| s.checked_add(c).is_some_and(|e| e <= n))
    }

    /// Offset of `self` relative to `origin`, used to map global indices
    /// into a block or a destination buffer
    pub fn relative_to(&self, origin: &[u64]) -> Result<Vec<u64>> {
        self.start
            .iter()
            .zip(origin)
            .map(|(&s, &o)| s.checked_sub(o).ok_or(FormatError::InvalidRange))
            .collect()
    }
}

/// What a reader asks for
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Selection {
    /// Box in global index space
    BoundingBox(Region),
    /// Individual global coordinates, one output element per point
    Points(Vec<Vec<u64>>),
    /// A whole block as it was written, by block id within the step
    WriteBlock(u32),
}

/// Test whether two boxes intersect
pub fn boxes_intersect(a_start: &[u64], a_count: &[u64], b_start: &[u64], b_count: &[u64]) -> bool {
    a_start.len() == b_start.len()
        && (0..a_start.len()).all(|d| {
            a_start[d].max(b_start[d])
                < a_start[d]
                    .saturating_add(a_count[d])
                    .min(b_start[d].saturating_add(b_count[d]))
        })
}

/// Row-major linear offset of `index` within a box of extent `dims`
pub fn linear_offset(dims: &[u64], index: &[u64]) -> u64 {
    dims.iter()
        .zip(index)
        .fold(0u64, |acc, (&d, &i)| acc.wrapping_mul(d).wrapping_add(i))
}

/// Smallest element range of a row-major box `dims` that contains the
/// sub-box at `origin` with the given `extent`
pub fn covering_range(dims: &[u64], origin: &[u64], extent: &[u64]) -> Range<u64> {
    if extent.iter().any(|&e| e == 0) {
        return 0..0;
    }
    let first = linear_offset(dims, origin);
    let last: Vec<u64> = origin.iter().zip(extent).map(|(&o, &e)| o + e - 1).collect();
    first..linear_offset(dims, &last) + 1
}

/// One side of a strided copy
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    /// Extent of the row-major array the bytes belong to
    pub dims: &'a [u64],
    /// Corner of the copied sub-box inside `dims`
    pub origin: &'a [u64],
    /// Linear element index of the first byte of the slice
    pub base: u64,
}

impl<'a> View<'a> {
    pub fn new(dims: &'a [u64], origin: &'a [u64]) -> Self {
        Self {
            dims,
            origin,
            base: 0,
        }
    }

    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    fn byte_offset(&self, index: &[u64], elem_size: usize) -> Result<usize> {
        let linear = linear_offset(self.dims, index)
            .checked_sub(self.base)
            .ok_or(FormatError::IndexOutOfBounds)?;
        usize::try_from(linear)
            .ok()
            .and_then(|l| l.checked_mul(elem_size))
            .ok_or(FormatError::ArraySizeOverflow)
    }
}

/// Copy a sub-box of `extent` elements between two row-major arrays
///
/// The innermost dimension is copied as one contiguous run per row.
pub fn copy_region(
    src: &[u8],
    src_view: View<'_>,
    dst: &mut [u8],
    dst_view: View<'_>,
    extent: &[u64],
    elem_size: usize,
) -> Result<()> {
    let ndims = extent.len();
    if src_view.origin.len() != ndims || dst_view.origin.len() != ndims {
        return Err(FormatError::InvalidRange);
    }
    if extent.iter().any(|&e| e == 0) {
        return Ok(());
    }
    if ndims == 0 {
        let s = src.get(..elem_size).ok_or(FormatError::InsufficientBuffer)?;
        let d = dst.get_mut(..elem_size).ok_or(FormatError::InsufficientBuffer)?;
        d.copy_from_slice(s);
        return Ok(());
    }

    let run = usize::try_from(extent[ndims - 1])
        .ok()
        .and_then(|e| e.checked_mul(elem_size))
        .ok_or(FormatError::ArraySizeOverflow)?;
    let mut counter = alloc::vec![0u64; ndims];
    let mut src_idx = src_view.origin.to_vec();
    let mut dst_idx = dst_view.origin.to_vec();

    loop {
        for d in 0..ndims {
            src_idx[d] = src_view.origin[d] + counter[d];
            dst_idx[d] = dst_view.origin[d] + counter[d];
        }
        let s_off = src_view.byte_offset(&src_idx, elem_size)?;
        let d_off = dst_view.byte_offset(&dst_idx, elem_size)?;
        let s = src
            .get(s_off..s_off + run)
            .ok_or(FormatError::InsufficientBuffer)?;
        dst.get_mut(d_off..d_off + run)
            .ok_or(FormatError::InsufficientBuffer)?
            .copy_from_slice(s);

        // advance the odometer over every dimension but the innermost
        let mut d = ndims - 1;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            counter[d] += 1;
            if counter[d] < extent[d] {
                break;
            }
            counter[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn grid(rows: u64, cols: u64) -> Vec<u8> {
        (0..rows * cols).map(|v| v as u8).collect()
    }

    #[test]
    fn test_intersection_rule() {
        let a = Region::new([0, 0], [4, 4]);
        let b = Region::new([2, 3], [4, 4]);
        assert_eq!(a.intersect(&b), Some(Region::new([2, 3], [2, 1])));

        // touching edges do not intersect
        let c = Region::new([4, 0], [2, 2]);
        assert_eq!(a.intersect(&c), None);
        assert!(!boxes_intersect(&a.start, &a.count, &c.start, &c.count));
        assert!(boxes_intersect(&a.start, &a.count, &b.start, &b.count));
    }

    #[test]
    fn test_scalar_boxes_always_intersect() {
        let scalar = Region::default();
        assert_eq!(scalar.intersect(&scalar), Some(Region::default()));
        assert_eq!(scalar.element_count(), Some(1));
    }

    #[test]
    fn test_within_shape() {
        assert!(Region::new([5], [5]).is_within(&[10]));
        assert!(!Region::new([6], [5]).is_within(&[10]));
        assert!(!Region::new([u64::MAX], [2]).is_within(&[10]));
        assert!(!Region::new([0, 0], [1, 1]).is_within(&[10]));
    }

    #[test]
    fn test_copy_sub_box() {
        // 4x5 source, copy the 2x3 box at (1,1) into a 2x3 destination
        let src = grid(4, 5);
        let mut dst = vec![0u8; 6];
        copy_region(
            &src,
            View::new(&[4, 5], &[1, 1]),
            &mut dst,
            View::new(&[2, 3], &[0, 0]),
            &[2, 3],
            1,
        )
        .unwrap();
        assert_eq!(dst, vec![6, 7, 8, 11, 12, 13]);
    }

    #[test]
    fn test_copy_from_covering_range() {
        let src = grid(4, 5);
        let range = covering_range(&[4, 5], &[2, 1], &[2, 2]);
        assert_eq!(range, 11..18);

        let partial = &src[range.start as usize..range.end as usize];
        let mut dst = vec![0u8; 4];
        copy_region(
            partial,
            View::new(&[4, 5], &[2, 1]).with_base(range.start),
            &mut dst,
            View::new(&[2, 2], &[0, 0]),
            &[2, 2],
            1,
        )
        .unwrap();
        assert_eq!(dst, vec![11, 12, 16, 17]);
    }

    #[test]
    fn test_copy_rejects_short_destination() {
        let src = grid(2, 2);
        let mut dst = vec![0u8; 3];
        let err = copy_region(
            &src,
            View::new(&[2, 2], &[0, 0]),
            &mut dst,
            View::new(&[2, 2], &[0, 0]),
            &[2, 2],
            1,
        );
        assert_eq!(err, Err(FormatError::InsufficientBuffer));
    }

    #[test]
    fn test_random_boxes_match_pointwise_membership() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = Region::new(
                [rng.gen_range(0..8), rng.gen_range(0..8)],
                [rng.gen_range(1..5), rng.gen_range(1..5)],
            );
            let b = Region::new(
                [rng.gen_range(0..8), rng.gen_range(0..8)],
                [rng.gen_range(1..5), rng.gen_range(1..5)],
            );
            let overlap = a.intersect(&b);
            for i in 0..12 {
                for j in 0..12 {
                    let p = [i, j];
                    let inside = a.contains_point(&p) && b.contains_point(&p);
                    let in_overlap = overlap.as_ref().is_some_and(|o| o.contains_point(&p));
                    assert_eq!(inside, in_overlap);
                }
            }
        }
    }
}
