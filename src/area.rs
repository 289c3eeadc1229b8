//! Address providers the facade can be placed in.
//!
//! An [`Area`] hands out a fixed `[start, end)` range that outlives the allocator
//! using it. [`DynamicArea`] only describes the start and maximum size of a growable
//! range, the strategy reserves the addresses itself.

use core::cell::UnsafeCell;
use core::fmt::{self, Debug};
use core::mem::MaybeUninit;

use crate::error::AllocError;
use crate::region::Region;

/// A contiguous range of writable memory.
///
/// # Safety
/// `[start(), end())` must be valid for reads and writes for as long as the area lives
/// and `start() < end()` must hold.
pub unsafe trait Area {
    fn start(&self) -> *mut u8;
    fn end(&self) -> *mut u8;

    #[inline]
    fn size(&self) -> usize {
        self.end() as usize - self.start() as usize
    }
}

/// An area living inside the struct itself, e.g. on the stack or in a static.
#[repr(C, align(16))]
pub struct FixedArea<const N: usize> {
    buf: UnsafeCell<[MaybeUninit<u8>; N]>,
}

impl<const N: usize> FixedArea<N> {
    #[inline]
    pub const fn new() -> Self {
        FixedArea {
            buf: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }
}

impl<const N: usize> Default for FixedArea<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Debug for FixedArea<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedArea").field("size", &N).finish()
    }
}

unsafe impl<const N: usize> Area for FixedArea<N> {
    #[inline]
    fn start(&self) -> *mut u8 {
        self.buf.get().cast()
    }

    #[inline]
    fn end(&self) -> *mut u8 {
        self.start().wrapping_add(N)
    }
}

/// An area allocated from the global allocator.
#[derive(Debug)]
pub struct HeapArea {
    region: Region,
}

impl HeapArea {
    pub fn new(size: usize) -> Result<Self, AllocError> {
        Ok(HeapArea {
            region: Region::heap(size)?,
        })
    }
}

unsafe impl Area for HeapArea {
    #[inline]
    fn start(&self) -> *mut u8 {
        self.region.ptr(self.region.start()).as_ptr()
    }

    #[inline]
    fn end(&self) -> *mut u8 {
        self.region.ptr(self.region.end()).as_ptr()
    }
}

/// An area of reserved address space, committed in full up front.
#[derive(Debug)]
pub struct VirtualArea {
    region: Region,
}

impl VirtualArea {
    pub fn new(size: usize) -> Result<Self, AllocError> {
        let size = crate::util::round_up(size, crate::virtual_memory::page_size())
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        let region = Region::reserve(size)?;
        unsafe { crate::virtual_memory::commit(region.ptr(region.start()), size)? };
        Ok(VirtualArea { region })
    }
}

unsafe impl Area for VirtualArea {
    #[inline]
    fn start(&self) -> *mut u8 {
        self.region.ptr(self.region.start()).as_ptr()
    }

    #[inline]
    fn end(&self) -> *mut u8 {
        self.region.ptr(self.region.end()).as_ptr()
    }
}

/// Parameters of a growable range: `start_size` bytes are committed up front and
/// the range may grow up to `max_size` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DynamicArea {
    pub start_size: usize,
    pub max_size: usize,
}

impl DynamicArea {
    #[inline]
    pub const fn new(start_size: usize, max_size: usize) -> Self {
        DynamicArea {
            start_size,
            max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_area() {
        let area = FixedArea::<1024>::new();
        assert_eq!(area.size(), 1024);
        assert_eq!(area.start() as usize % 16, 0);
    }

    #[test]
    fn test_heap_area() {
        let area = HeapArea::new(300).unwrap();
        assert_eq!(area.size(), 300);
        unsafe { area.start().write_bytes(1, area.size()) };
    }

    #[test]
    fn test_virtual_area() {
        let area = VirtualArea::new(10).unwrap();
        assert_eq!(area.size(), crate::virtual_memory::page_size());
        unsafe {
            area.start().write_bytes(0xFF, area.size());
            assert_eq!(*area.end().sub(1), 0xFF);
        }
    }
}
