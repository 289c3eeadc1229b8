//! Defines the [`Region`] struct, the byte range a strategy manages.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;
use std::alloc::{alloc, dealloc};

use tracing::trace;

use crate::error::{ensure, AllocError};
use crate::util::addr_of;
use crate::virtual_memory;

/// Alignment of buffers a region allocates for itself.
pub const REGION_ALIGN: usize = 16;

#[derive(Debug)]
enum Owner {
    /// Somebody else owns the memory and outlives the region.
    Borrowed,
    /// Allocated from the global allocator with this layout.
    Heap(Layout),
    /// Reserved with [`virtual_memory::reserve`].
    Virtual,
}

/// A contiguous `[start, end)` byte range owned by exactly one strategy.
///
/// All metadata a strategy keeps inside its memory goes through
/// [`read`](Region::read) and [`write`](Region::write), which check that the
/// accessed bytes lie inside the region and tolerate unaligned addresses.
#[derive(Debug)]
pub struct Region {
    start: NonNull<u8>,
    len: usize,
    owner: Owner,
}

// The region is the only handle to its memory.
unsafe impl Send for Region {}

impl Region {
    /// Allocates a `size` byte buffer from the global allocator.
    pub fn heap(size: usize) -> Result<Self, AllocError> {
        ensure!(size > 0, AllocError::ZeroSize);
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|_| AllocError::OutOfMemory { requested: size })?;
        let start = NonNull::new(unsafe { alloc(layout) })
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        trace!(?start, size, "Allocated heap region.");
        Ok(Region {
            start,
            len: size,
            owner: Owner::Heap(layout),
        })
    }

    /// Reserves `size` bytes of address space, none of which is committed.
    pub fn reserve(size: usize) -> Result<Self, AllocError> {
        ensure!(size > 0, AllocError::ZeroSize);
        let start = virtual_memory::reserve(size)?;
        Ok(Region {
            start,
            len: size,
            owner: Owner::Virtual,
        })
    }

    /// Creates a region over memory owned by the caller.
    ///
    /// # Safety
    /// `[start, end)` must be valid for reads and writes, must not be used by anything else
    /// and must outlive the returned region.
    pub unsafe fn from_raw_parts(start: *mut u8, end: *mut u8) -> Result<Self, AllocError> {
        let start = NonNull::new(start).ok_or(AllocError::ForeignPointer { addr: 0 })?;
        ensure!(
            (end as usize) > addr_of(start),
            AllocError::ForeignPointer { addr: end as usize }
        );
        Ok(Region {
            start,
            len: end as usize - addr_of(start),
            owner: Owner::Borrowed,
        })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        addr_of(self.start)
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether `[addr, addr + size)` lies inside the region.
    #[inline]
    pub fn contains(&self, addr: usize, size: usize) -> bool {
        addr >= self.start() && addr.checked_add(size).is_some_and(|end| end <= self.end())
    }

    /// Returns a pointer to `addr`, which must lie inside the region (or be its end).
    #[inline]
    pub fn ptr(&self, addr: usize) -> NonNull<u8> {
        debug_assert!(self.contains(addr, 0), "{addr:#x} is outside of the region.");
        unsafe { self.start.add(addr - self.start()) }
    }

    /// Reads a `T` stored at `addr`.
    ///
    /// # Safety
    /// The bytes at `addr` must have been written as a `T` before.
    #[inline]
    pub unsafe fn read<T: Copy>(&self, addr: usize) -> T {
        debug_assert!(
            self.contains(addr, size_of::<T>()),
            "Read of {} bytes at {addr:#x} is outside of the region.",
            size_of::<T>()
        );
        self.ptr(addr).as_ptr().cast::<T>().read_unaligned()
    }

    /// Stores `value` at `addr`.
    ///
    /// # Safety
    /// The bytes at `addr` must be writable and not in use by a live allocation.
    #[inline]
    pub unsafe fn write<T: Copy>(&self, addr: usize, value: T) {
        debug_assert!(
            self.contains(addr, size_of::<T>()),
            "Write of {} bytes at {addr:#x} is outside of the region.",
            size_of::<T>()
        );
        self.ptr(addr).as_ptr().cast::<T>().write_unaligned(value);
    }

    /// Fills `[addr, addr + size)` with `byte`.
    ///
    /// # Safety
    /// The range must be writable and not in use by a live allocation.
    #[inline]
    pub unsafe fn fill(&self, addr: usize, size: usize, byte: u8) {
        debug_assert!(self.contains(addr, size));
        self.ptr(addr).as_ptr().write_bytes(byte, size);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.owner {
            Owner::Borrowed => {}
            Owner::Heap(layout) => unsafe { dealloc(self.start.as_ptr(), layout) },
            Owner::Virtual => unsafe { virtual_memory::release(self.start, self.len) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region() {
        let region = Region::heap(256).unwrap();
        assert_eq!(region.len(), 256);
        assert_eq!(region.start() % REGION_ALIGN, 0);
        assert!(region.contains(region.start(), 256));
        assert!(!region.contains(region.start(), 257));
        assert!(!region.contains(region.start() - 1, 1));
        assert!(region.contains(region.end(), 0));
    }

    #[test]
    fn test_read_write() {
        let region = Region::heap(64).unwrap();
        unsafe {
            region.write::<u32>(region.start() + 3, 0xDEADBEEF);
            assert_eq!(region.read::<u32>(region.start() + 3), 0xDEADBEEF);
            region.write::<usize>(region.end() - size_of::<usize>(), 42);
            assert_eq!(region.read::<usize>(region.end() - size_of::<usize>()), 42);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn test_out_of_bounds_write() {
        let region = Region::heap(64).unwrap();
        unsafe { region.write::<u64>(region.end() - 4, 0) };
    }

    #[test]
    fn test_borrowed_region() {
        let mut buf = [0_u8; 128];
        let range = buf.as_mut_ptr_range();
        let region = unsafe { Region::from_raw_parts(range.start, range.end).unwrap() };
        assert_eq!(region.len(), 128);
        unsafe { region.fill(region.start(), 128, 7) };
        drop(region);
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_invalid_regions() {
        assert_eq!(Region::heap(0).unwrap_err(), AllocError::ZeroSize);
        let mut buf = [0_u8; 8];
        let p = buf.as_mut_ptr();
        assert!(unsafe { Region::from_raw_parts(p, p) }.is_err());
    }
}
