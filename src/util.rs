//! Utility functions.

use core::ptr::NonNull;

/// Returns whether `x` is a nonzero power of two.
#[inline(always)]
pub const fn is_power_of_two(x: usize) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Returns the smallest `align`-aligned address greater or equal to `addr`
/// or `None` if no such address exists.
///
/// # Panics
/// Panics in debug builds if `align` is not a power-of-two.
#[inline]
pub fn align_up(addr: usize, align: usize) -> Option<usize> {
    debug_assert!(is_power_of_two(align), "alignment should be a power of two.");
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Returns the largest `align`-aligned address smaller or equal to `addr`.
///
/// # Panics
/// Panics in debug builds if `align` is not a power-of-two.
#[inline]
pub fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align), "alignment should be a power of two.");
    addr & !(align - 1)
}

/// Rounds `value` up to a multiple of `multiple`, which must be a power of two.
#[inline]
pub fn round_up(value: usize, multiple: usize) -> Option<usize> {
    align_up(value, multiple)
}

/// Returns the smallest `k` such that `2^k >= x`.
///
/// `log2_ceil(0)` and `log2_ceil(1)` are both 0.
#[inline]
pub fn log2_ceil(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}

/// Returns the largest `k` such that `2^k <= x`, `x` must be nonzero.
#[inline]
pub fn log2_floor(x: usize) -> u32 {
    debug_assert_ne!(x, 0);
    usize::BITS - 1 - x.leading_zeros()
}

#[inline(always)]
pub(crate) fn addr_of(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}
