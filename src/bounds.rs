//! Guard bytes around payloads.
//!
//! [`BoundsChecking`] puts a 4 byte [`FRONT_GUARD`] right before and a 4 byte
//! [`BACK_GUARD`] right after every payload and verifies both when the payload is
//! freed, catching buffer under- and overruns after the fact.

use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::error::{AllocError, GuardSide};

pub const FRONT_GUARD: u32 = 0xCAFECAFE;
pub const BACK_GUARD: u32 = 0xBADDCAFE;

const GUARD_SIZE: usize = size_of::<u32>();

const_assert_eq!(GUARD_SIZE, 4);

pub trait BoundsPolicy {
    /// Bytes reserved before the payload.
    const FRONT: usize;
    /// Bytes reserved after the payload.
    const BACK: usize;

    /// Writes the front guard to the [`FRONT`](BoundsPolicy::FRONT) bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `FRONT` bytes.
    unsafe fn guard_front(ptr: NonNull<u8>);

    /// Writes the back guard to the [`BACK`](BoundsPolicy::BACK) bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `BACK` bytes.
    unsafe fn guard_back(ptr: NonNull<u8>);

    /// # Safety
    /// `ptr` must be valid for reads of `FRONT` bytes.
    unsafe fn check_front(ptr: NonNull<u8>) -> Result<(), AllocError>;

    /// # Safety
    /// `ptr` must be valid for reads of `BACK` bytes.
    unsafe fn check_back(ptr: NonNull<u8>) -> Result<(), AllocError>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NoBoundsChecking;

impl BoundsPolicy for NoBoundsChecking {
    const FRONT: usize = 0;
    const BACK: usize = 0;

    #[inline(always)]
    unsafe fn guard_front(_ptr: NonNull<u8>) {}

    #[inline(always)]
    unsafe fn guard_back(_ptr: NonNull<u8>) {}

    #[inline(always)]
    unsafe fn check_front(_ptr: NonNull<u8>) -> Result<(), AllocError> {
        Ok(())
    }

    #[inline(always)]
    unsafe fn check_back(_ptr: NonNull<u8>) -> Result<(), AllocError> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BoundsChecking;

#[inline]
unsafe fn check(ptr: NonNull<u8>, expected: u32, guard: GuardSide) -> Result<(), AllocError> {
    let found = ptr.as_ptr().cast::<u32>().read_unaligned();
    if found != expected {
        return Err(AllocError::Corruption {
            guard,
            addr: ptr.as_ptr() as usize,
            found,
        });
    }
    Ok(())
}

impl BoundsPolicy for BoundsChecking {
    const FRONT: usize = GUARD_SIZE;
    const BACK: usize = GUARD_SIZE;

    #[inline]
    unsafe fn guard_front(ptr: NonNull<u8>) {
        ptr.as_ptr().cast::<u32>().write_unaligned(FRONT_GUARD);
    }

    #[inline]
    unsafe fn guard_back(ptr: NonNull<u8>) {
        ptr.as_ptr().cast::<u32>().write_unaligned(BACK_GUARD);
    }

    #[inline]
    unsafe fn check_front(ptr: NonNull<u8>) -> Result<(), AllocError> {
        check(ptr, FRONT_GUARD, GuardSide::Front)
    }

    #[inline]
    unsafe fn check_back(ptr: NonNull<u8>) -> Result<(), AllocError> {
        check(ptr, BACK_GUARD, GuardSide::Back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1() {
        let mut buf = [0_u8; 16];
        let front = NonNull::new(buf.as_mut_ptr().wrapping_add(1)).unwrap();
        let back = NonNull::new(buf.as_mut_ptr().wrapping_add(9)).unwrap();
        unsafe {
            BoundsChecking::guard_front(front);
            BoundsChecking::guard_back(back);
            assert_eq!(BoundsChecking::check_front(front), Ok(()));
            assert_eq!(BoundsChecking::check_back(back), Ok(()));
            back.as_ptr().add(2).write(0);
            assert_eq!(
                BoundsChecking::check_back(back),
                Err(AllocError::Corruption {
                    guard: GuardSide::Back,
                    addr: back.as_ptr() as usize,
                    found: back.as_ptr().cast::<u32>().read_unaligned(),
                })
            );
            assert!(BoundsChecking::check_front(back).is_err());
        }
    }

    #[test]
    fn test_2() {
        let mut buf = [0xFF_u8; 4];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe {
            NoBoundsChecking::guard_front(ptr);
            assert_eq!(NoBoundsChecking::check_front(ptr), Ok(()));
            assert_eq!(NoBoundsChecking::check_back(ptr), Ok(()));
        }
        assert_eq!(buf, [0xFF; 4]);
    }
}
