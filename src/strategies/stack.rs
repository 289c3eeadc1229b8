//! A LIFO allocator growing from either end of its region.
//!
//! Every block is preceded by an 8 byte header holding two `u32` distances: back
//! to the cursor before the allocation and back to the previously allocated block.
//! Freeing the most recent block restores both, anything else is an
//! [`OutOfOrderFree`](AllocError::OutOfOrderFree).

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;
use tracing::{debug, instrument, Level};

use super::{GrowableStrategy, Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::{align_down, align_up, round_up};
use crate::virtual_memory::{self, page_size};

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct StackHeader {
    cursor_distance: u32,
    last_distance: u32,
}

const STACK_HEADER_SIZE: usize = size_of::<StackHeader>();

const_assert_eq!(STACK_HEADER_SIZE, 8);

mod private {
    pub trait Sealed {}
    impl Sealed for super::FromBottom {}
    impl Sealed for super::FromTop {}
}

/// The end of the region a stack grows from.
pub trait Direction: private::Sealed {
    /// Cursor of an empty stack over `[start, end)`.
    fn origin(start: usize, end: usize) -> usize;

    /// Places a `size` byte block and its header at `cursor`.
    /// Returns the block and the cursor after it or `None` on address overflow.
    fn place(cursor: usize, size: usize, align: usize, offset: usize) -> Option<(usize, usize)>;

    /// Inverts a distance stored in a block header.
    fn unwind(block: usize, distance: usize) -> usize;

    /// The closest page boundary on the free side of `cursor`.
    fn page_boundary(cursor: usize, page: usize) -> Option<usize>;

    /// The committed `[low, high)` range for a commit limit of `limit`.
    fn committed(start: usize, end: usize, limit: usize) -> (usize, usize);
}

/// Grows upwards from the region start.
#[derive(Copy, Clone, Debug, Default)]
pub struct FromBottom;

/// Grows downwards from the region end.
#[derive(Copy, Clone, Debug, Default)]
pub struct FromTop;

impl Direction for FromBottom {
    #[inline]
    fn origin(start: usize, _end: usize) -> usize {
        start
    }

    #[inline]
    fn place(cursor: usize, size: usize, align: usize, offset: usize) -> Option<(usize, usize)> {
        let block = align_up(cursor.checked_add(STACK_HEADER_SIZE + offset)?, align)? - offset;
        Some((block, block.checked_add(size)?))
    }

    #[inline]
    fn unwind(block: usize, distance: usize) -> usize {
        block - distance
    }

    #[inline]
    fn page_boundary(cursor: usize, page: usize) -> Option<usize> {
        round_up(cursor, page)
    }

    #[inline]
    fn committed(start: usize, _end: usize, limit: usize) -> (usize, usize) {
        (start, limit)
    }
}

impl Direction for FromTop {
    #[inline]
    fn origin(_start: usize, end: usize) -> usize {
        end
    }

    #[inline]
    fn place(cursor: usize, size: usize, align: usize, offset: usize) -> Option<(usize, usize)> {
        let block = align_down(cursor.checked_sub(size)?.checked_add(offset)?, align)
            .checked_sub(offset)?;
        Some((block, block.checked_sub(STACK_HEADER_SIZE)?))
    }

    #[inline]
    fn unwind(block: usize, distance: usize) -> usize {
        block + distance
    }

    #[inline]
    fn page_boundary(cursor: usize, page: usize) -> Option<usize> {
        Some(align_down(cursor, page))
    }

    #[inline]
    fn committed(_start: usize, end: usize, limit: usize) -> (usize, usize) {
        (limit, end)
    }
}

/// A stack allocator. Only the most recent live block may be freed.
#[derive(Debug)]
pub struct StackStrategy<D: Direction = FromBottom> {
    region: Region,
    cursor: usize,
    last: Option<usize>,
    /// The committed boundary, the region end (start for [`FromTop`]) unless growable.
    limit: usize,
    growable: bool,
    _direction: PhantomData<D>,
}

impl<D: Direction> StackStrategy<D> {
    fn new(region: Region, limit: usize, growable: bool) -> Self {
        let cursor = D::origin(region.start(), region.end());
        StackStrategy {
            region,
            cursor,
            last: None,
            limit,
            growable,
            _direction: PhantomData,
        }
    }

    fn origin(&self) -> usize {
        D::origin(self.region.start(), self.region.end())
    }

    /// Commits pages until `[low, high)` is backed by memory.
    #[instrument(level = "debug", skip(self), err(level = Level::DEBUG))]
    fn grow(&mut self, new_cursor: usize, requested: usize) -> Result<(), AllocError> {
        let oom = AllocError::OutOfMemory { requested };
        ensure!(self.growable, oom);
        let target = D::page_boundary(new_cursor, page_size()).ok_or(oom)?;
        ensure!(
            target >= self.region.start() && target <= self.region.end(),
            oom
        );
        let low = self.limit.min(target);
        let high = self.limit.max(target);
        unsafe { virtual_memory::commit(self.region.ptr(low), high - low)? };
        self.limit = target;
        debug!(committed = high - low, "Grew stack.");
        Ok(())
    }
}

impl<D: Direction> Strategy for StackStrategy<D> {
    const SUPPORTS_REALLOC: bool = false;

    fn with_region(region: Region, _overhead: Overhead) -> Result<Self, AllocError> {
        let limit = D::origin(region.end(), region.start());
        Ok(Self::new(region, limit, false))
    }

    #[instrument(level = "trace", skip(self), ret(level = Level::TRACE), err(level = Level::DEBUG))]
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        check_request(size, align)?;
        let oom = AllocError::OutOfMemory { requested: size };
        let (block, new_cursor) = D::place(self.cursor, size, align, offset).ok_or(oom)?;
        let header = block.checked_sub(STACK_HEADER_SIZE).ok_or(oom)?;
        let end = block.checked_add(size).ok_or(oom)?;
        ensure!(
            header >= self.region.start() && end <= self.region.end(),
            oom
        );
        let (low, high) = D::committed(self.region.start(), self.region.end(), self.limit);
        if header < low || end > high {
            self.grow(new_cursor, size)?;
        }

        let cursor_distance = self.cursor.abs_diff(block);
        let last_distance = self.last.map_or(0, |last| last.abs_diff(block));
        let header_value = StackHeader {
            cursor_distance: u32::try_from(cursor_distance)
                .map_err(|_| AllocError::HeaderOverflow { size: cursor_distance })?,
            last_distance: u32::try_from(last_distance)
                .map_err(|_| AllocError::HeaderOverflow { size: last_distance })?,
        };
        unsafe { self.region.write(header, header_value) };
        self.cursor = new_cursor;
        self.last = Some(block);
        Ok(self.region.ptr(block))
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        ensure!(
            self.last == Some(addr),
            AllocError::OutOfOrderFree { addr }
        );
        Ok(())
    }

    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError> {
        self.check_free(block)?;
        let addr = block.as_ptr() as usize;
        let header: StackHeader = self.region.read(addr - STACK_HEADER_SIZE);
        self.cursor = D::unwind(addr, header.cursor_distance as usize);
        self.last = match header.last_distance {
            0 => None,
            distance => Some(D::unwind(addr, distance as usize)),
        };
        Ok(())
    }

    fn reset(&mut self) {
        self.cursor = self.origin();
        self.last = None;
    }

    fn purge(&mut self) {
        if !self.growable {
            return;
        }
        let Some(target) = D::page_boundary(self.cursor, page_size()) else {
            return;
        };
        if target == self.limit {
            return;
        }
        let low = self.limit.min(target);
        let high = self.limit.max(target);
        match unsafe { virtual_memory::decommit(self.region.ptr(low), high - low) } {
            Ok(()) => {
                debug!(released = high - low, "Purged stack.");
                self.limit = target;
            }
            Err(err) => debug!(%err, "Failed to purge stack."),
        }
    }

    fn used_size(&self) -> usize {
        self.cursor.abs_diff(self.origin())
    }

    fn physical_size(&self) -> usize {
        self.limit.abs_diff(self.origin())
    }

    fn virtual_size(&self) -> usize {
        self.region.len()
    }
}

impl<D: Direction> GrowableStrategy for StackStrategy<D> {
    fn growable(
        start_size: usize,
        max_size: usize,
        _overhead: Overhead,
    ) -> Result<Self, AllocError> {
        ensure!(
            start_size <= max_size,
            AllocError::OutOfMemory {
                requested: start_size
            }
        );
        let start_size = if start_size == 0 { max_size / 2 } else { start_size };
        let page = page_size();
        let oom = AllocError::OutOfMemory { requested: max_size };
        let max_size = round_up(max_size, page).ok_or(oom)?;
        let start_size = round_up(start_size, page).ok_or(oom)?.min(max_size);
        let region = Region::reserve(max_size)?;

        let origin = D::origin(region.start(), region.end());
        let limit = D::origin(region.end(), region.start());
        let limit = if limit > origin {
            origin + start_size
        } else {
            origin - start_size
        };
        let low = origin.min(limit);
        unsafe { virtual_memory::commit(region.ptr(low), start_size)? };
        Ok(Self::new(region, limit, true))
    }
}
