//! Allocation granularity.
//!
//! Every region the arena hands out, and every free block it tracks, is a
//! whole number of _units_. A unit is as large as the strictest alignment any
//! scalar type on the platform needs, so a pointer one unit past a unit
//! boundary is suitably aligned for anything.

use core::mem::{align_of, size_of};

use static_assertions::const_assert;

use crate::error::AllocError;

/// The size, in bytes, of one unit. Also the alignment of every pointer the
/// arena returns.
pub const UNIT_SIZE: usize = 16;

// A unit must satisfy the alignment of every scalar a caller could store.
const_assert!(UNIT_SIZE >= align_of::<libc::max_align_t>());
const_assert!(UNIT_SIZE >= align_of::<u128>());
const_assert!(UNIT_SIZE >= align_of::<f64>());
const_assert!(UNIT_SIZE >= align_of::<usize>());
const_assert!(UNIT_SIZE >= size_of::<usize>() * 2);
const_assert!(UNIT_SIZE.is_power_of_two());

/// Round `value` up to the nearest multiple of `increment`, or `None` on
/// overflow.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

/// Compute the number of units needed to hold `count` elements of `size`
/// bytes each, plus one unit for the block header.
///
/// Fails with [`AllocError::InvalidArgument`] if `count * size` overflows, is
/// zero, or cannot be rounded up to a whole unit. A successful result is
/// always at least 2.
pub fn units_for(count: usize, size: usize) -> Result<usize, AllocError> {
    let byte_count = count
        .checked_mul(size)
        .filter(|&bytes| bytes != 0)
        .ok_or(AllocError::InvalidArgument)?;

    let rounded = byte_count
        .checked_add(UNIT_SIZE - 1)
        .ok_or(AllocError::InvalidArgument)?;

    Ok(rounded / UNIT_SIZE + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_units_for() {
        assert_eq!(units_for(1, 1), Ok(2));
        assert_eq!(units_for(UNIT_SIZE, 1), Ok(2));
        assert_eq!(units_for(UNIT_SIZE + 1, 1), Ok(3));
        assert_eq!(units_for(100, 1), Ok(8));
        assert_eq!(units_for(25, 4), Ok(8));
        assert_eq!(units_for(50, 1), Ok(5));
    }

    #[test]
    fn test_unit_covers_platform_alignment() {
        let max_align = core::mem::align_of::<libc::max_align_t>();
        assert!(max_align <= UNIT_SIZE);
        assert_eq!(UNIT_SIZE % max_align, 0);
        assert_eq!(core::mem::size_of::<crate::freelist::Header>(), UNIT_SIZE);
    }

    #[test]
    fn test_units_for_rejects_bad_sizes() {
        assert_eq!(units_for(0, 8), Err(AllocError::InvalidArgument));
        assert_eq!(units_for(8, 0), Err(AllocError::InvalidArgument));
        assert_eq!(units_for(usize::MAX, 2), Err(AllocError::InvalidArgument));
        assert_eq!(units_for(2, usize::MAX), Err(AllocError::InvalidArgument));
        // The product fits, but rounding it up to a unit does not.
        assert_eq!(units_for(usize::MAX, 1), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 64), Some(0));
        assert_eq!(round_up(1, 64), Some(64));
        assert_eq!(round_up(64, 64), Some(64));
        assert_eq!(round_up(65, 64), Some(128));
        assert_eq!(round_up(usize::MAX, 64), None);
    }
}
