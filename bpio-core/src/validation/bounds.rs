//! Array bounds and dimension validation
//!
//! Pure checks used both when a variable is defined and when block records
//! are decoded from disk.

use crate::format::constants::{JOINED_DIM, LOCAL_VALUE_DIM, MAX_DIMS};
use crate::FormatError;

/// Validate array bounds for a given element type
///
/// Returns the number of elements in `byte_len` bytes, rejecting lengths
/// that are not a whole number of elements.
pub const fn validate_array_bounds<T>(byte_len: usize) -> Result<usize, FormatError> {
    let element_size = core::mem::size_of::<T>();
    if element_size == 0 {
        return Err(FormatError::ArrayAlignment);
    }

    if byte_len % element_size != 0 {
        return Err(FormatError::ArrayAlignment);
    }

    let count = byte_len / element_size;

    // Conservative overflow protection for downstream offset math
    if count > usize::MAX / 16 {
        return Err(FormatError::ArraySizeOverflow);
    }

    Ok(count)
}

/// Validate a define-time `shape`/`start`/`count` triple
///
/// Ranks must agree when a shape is given and `start + count` must stay
/// inside `shape` in every dimension. Joined and local-value marker
/// dimensions are exempt from the extent check.
pub fn validate_dims(shape: &[u64], start: &[u64], count: &[u64]) -> Result<(), FormatError> {
    if shape.len() > MAX_DIMS || count.len() > MAX_DIMS {
        return Err(FormatError::ArraySizeOverflow);
    }

    if shape.is_empty() {
        // local arrays carry no start; scalars carry nothing
        if !start.is_empty() && start.len() != count.len() {
            return Err(FormatError::InvalidRange);
        }
        return Ok(());
    }

    if shape.len() == 1 && shape[0] == LOCAL_VALUE_DIM {
        return Ok(());
    }

    // joined arrays may leave the start to the reader
    let joined_without_start = start.is_empty() && shape.contains(&JOINED_DIM);
    if count.len() != shape.len() || (start.len() != shape.len() && !joined_without_start) {
        return Err(FormatError::InvalidRange);
    }

    for d in 0..shape.len() {
        if shape[d] == JOINED_DIM {
            continue;
        }
        let end = start
            .get(d)
            .copied()
            .unwrap_or(0)
            .checked_add(count[d])
            .ok_or(FormatError::ArraySizeOverflow)?;
        if end > shape[d] {
            return Err(FormatError::IndexOutOfBounds);
        }
    }
    Ok(())
}

/// Number of elements of a count vector with overflow protection
pub fn checked_element_count(count: &[u64]) -> Result<u64, FormatError> {
    count
        .iter()
        .try_fold(1u64, |acc, &c| acc.checked_mul(c))
        .ok_or(FormatError::ArraySizeOverflow)
}
