//! Defines the [`HeaderPolicy`] trait and its implementations.
//!
//! The header is the first thing in every block the facade lays out and stores the
//! total size of the block (header, guards and payload). Without it the facade cannot
//! reallocate, check back guards or tag freed memory.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use tracing::error;

use crate::error::AllocError;

mod private {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// An unsigned integer a [`SizeHeader`] can be made of.
pub trait HeaderWord: private::Sealed + Copy + TryFrom<usize> + TryInto<usize> {}

impl HeaderWord for u8 {}
impl HeaderWord for u16 {}
impl HeaderWord for u32 {}
impl HeaderWord for u64 {}

/// How the total block size is remembered.
pub trait HeaderPolicy {
    /// Bytes the header occupies at the start of the block.
    const SIZE: usize;

    /// Stores `total` at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of [`SIZE`](HeaderPolicy::SIZE) bytes.
    unsafe fn store(ptr: NonNull<u8>, total: usize) -> Result<(), AllocError>;

    /// Loads the size stored at `ptr`, if the policy stores one.
    ///
    /// # Safety
    /// `ptr` must point to a header previously written with [`store`](HeaderPolicy::store).
    unsafe fn load(ptr: NonNull<u8>) -> Option<usize>;

    /// Zeroes the header of a released block, a second free then finds no size.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of [`SIZE`](HeaderPolicy::SIZE) bytes.
    #[inline]
    unsafe fn clear(ptr: NonNull<u8>) {
        ptr.as_ptr().write_bytes(0, Self::SIZE);
    }
}

/// Stores nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoHeader;

impl HeaderPolicy for NoHeader {
    const SIZE: usize = 0;

    #[inline(always)]
    unsafe fn store(_ptr: NonNull<u8>, _total: usize) -> Result<(), AllocError> {
        Ok(())
    }

    #[inline(always)]
    unsafe fn load(_ptr: NonNull<u8>) -> Option<usize> {
        None
    }
}

/// Stores the total block size in a `W`.
///
/// Blocks larger than `W::MAX` fail with [`AllocError::HeaderOverflow`].
#[derive(Copy, Clone, Debug, Default)]
pub struct SizeHeader<W: HeaderWord = u32>(PhantomData<W>);

impl<W: HeaderWord> HeaderPolicy for SizeHeader<W> {
    const SIZE: usize = size_of::<W>();

    #[inline]
    unsafe fn store(ptr: NonNull<u8>, total: usize) -> Result<(), AllocError> {
        let Ok(word) = W::try_from(total) else {
            error!(total, width = Self::SIZE, "Block size does not fit the header.");
            return Err(AllocError::HeaderOverflow { size: total });
        };
        ptr.as_ptr().cast::<W>().write_unaligned(word);
        Ok(())
    }

    #[inline]
    unsafe fn load(ptr: NonNull<u8>) -> Option<usize> {
        ptr.as_ptr().cast::<W>().read_unaligned().try_into().ok()
    }
}
