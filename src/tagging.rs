//! Poisoning of payload memory.
//!
//! [`Tagging`] fills fresh payloads with [`ALLOCATED_TAG`] and freed ones with
//! [`FREED_TAG`], so reads of uninitialized or dangling memory stand out in a debugger.

use core::mem::size_of;
use core::ptr::NonNull;

pub const ALLOCATED_TAG: u32 = 0xBAADF00D;
pub const FREED_TAG: u32 = 0xDEADBEEF;

pub trait TagPolicy {
    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes.
    unsafe fn tag_allocation(ptr: NonNull<u8>, len: usize);

    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes.
    unsafe fn tag_deallocation(ptr: NonNull<u8>, len: usize);
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NoTagging;

impl TagPolicy for NoTagging {
    #[inline(always)]
    unsafe fn tag_allocation(_ptr: NonNull<u8>, _len: usize) {}

    #[inline(always)]
    unsafe fn tag_deallocation(_ptr: NonNull<u8>, _len: usize) {}
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Tagging;

/// Repeats `pattern` over `[ptr, ptr + len)` in native byte order. A tail shorter
/// than the pattern gets its leading bytes.
unsafe fn fill(ptr: NonNull<u8>, len: usize, pattern: u32) {
    let words = len / size_of::<u32>();
    let p = ptr.as_ptr();
    for i in 0..words {
        p.add(i * size_of::<u32>()).cast::<u32>().write_unaligned(pattern);
    }
    let tail = words * size_of::<u32>();
    for (i, byte) in pattern.to_ne_bytes().into_iter().take(len - tail).enumerate() {
        p.add(tail + i).write(byte);
    }
}

impl TagPolicy for Tagging {
    #[inline]
    unsafe fn tag_allocation(ptr: NonNull<u8>, len: usize) {
        fill(ptr, len, ALLOCATED_TAG);
    }

    #[inline]
    unsafe fn tag_deallocation(ptr: NonNull<u8>, len: usize) {
        fill(ptr, len, FREED_TAG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1() {
        let mut buf = [0_u8; 11];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe { Tagging::tag_allocation(ptr, 10) };
        let bytes = ALLOCATED_TAG.to_ne_bytes();
        for i in 0..10 {
            assert_eq!(buf[i], bytes[i % 4]);
        }
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn test_2() {
        let mut buf = [0_u8; 3];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe { Tagging::tag_deallocation(ptr, 3) };
        assert_eq!(buf[..], FREED_TAG.to_ne_bytes()[..3]);
        unsafe { NoTagging::tag_allocation(ptr, 3) };
        assert_eq!(buf[..], FREED_TAG.to_ne_bytes()[..3]);
    }
}
