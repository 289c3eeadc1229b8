//! A fixed size slot allocator.
//!
//! The region is cut into equally sized slots. Free slots form an intrusive stack
//! threaded through their first word, so allocation and free are both *O*(1).
//!
//! With an overhead of `front` bytes the slots are placed so that
//! `slot + front` is `ALIGN`-aligned, which is exactly where the facade puts the payload.

use core::mem::size_of;
use core::ptr::NonNull;

use tracing::{debug, instrument, Level};

use super::{GrowableStrategy, Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::{align_up, round_up};
use crate::virtual_memory::{self, page_size};

const NIL: usize = 0;

/// A pool of `SLOT` byte objects aligned to at most `ALIGN`.
///
/// A growable pool commits memory for `GROW` more slots whenever it runs dry.
#[derive(Debug)]
pub struct PoolStrategy<const SLOT: usize, const ALIGN: usize, const GROW: usize = 64> {
    region: Region,
    offset: usize,
    stride: usize,
    first_slot: usize,
    /// End of the last complete slot.
    slots_end: usize,
    /// End of the committed memory, equal to the region end unless growable.
    committed_end: usize,
    head: usize,
    live: usize,
    growable: bool,
}

impl<const SLOT: usize, const ALIGN: usize, const GROW: usize> PoolStrategy<SLOT, ALIGN, GROW> {
    /// Distance between two consecutive slots.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of slots currently carved out of committed memory.
    #[inline]
    pub fn slot_count(&self) -> usize {
        (self.slots_end - self.first_slot) / self.stride
    }

    fn new(
        region: Region,
        overhead: Overhead,
        committed: usize,
        growable: bool,
    ) -> Result<Self, AllocError> {
        ensure!(SLOT > 0, AllocError::ZeroSize);
        ensure!(
            crate::util::is_power_of_two(ALIGN),
            AllocError::InvalidAlignment(ALIGN)
        );
        let stride = round_up((SLOT + overhead.total()).max(size_of::<usize>()), ALIGN)
            .ok_or(AllocError::OutOfMemory { requested: SLOT })?;
        let first_slot = region
            .start()
            .checked_add(overhead.front)
            .and_then(|p| align_up(p, ALIGN))
            .ok_or(AllocError::OutOfMemory { requested: SLOT })?
            - overhead.front;
        let committed_end = region.start() + committed;
        let mut pool = PoolStrategy {
            offset: overhead.front,
            stride,
            first_slot,
            slots_end: first_slot,
            committed_end,
            head: NIL,
            live: 0,
            growable,
            region,
        };
        pool.slots_end = pool.last_slot_end(committed_end);
        pool.reset();
        debug!(
            stride,
            slots = pool.slot_count(),
            wasted = pool.wasted_size(),
            "Created pool."
        );
        Ok(pool)
    }

    /// Returns the end of the last slot that fits below `limit`.
    fn last_slot_end(&self, limit: usize) -> usize {
        if limit <= self.first_slot {
            return self.first_slot;
        }
        self.first_slot + (limit - self.first_slot) / self.stride * self.stride
    }

    fn wasted_size(&self) -> usize {
        (self.first_slot.min(self.committed_end) - self.region.start())
            + (self.committed_end - self.slots_end)
    }

    #[inline]
    fn push(&mut self, slot: usize) {
        unsafe { self.region.write::<usize>(slot, self.head) };
        self.head = slot;
    }

    #[inline]
    fn pop(&mut self) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let slot = self.head;
        self.head = unsafe { self.region.read::<usize>(slot) };
        Some(slot)
    }

    /// Walks the free stack looking for `slot`, *O*(n) in the free slots.
    fn is_free(&self, slot: usize) -> bool {
        let mut node = self.head;
        while node != NIL {
            if node == slot {
                return true;
            }
            node = unsafe { self.region.read::<usize>(node) };
        }
        false
    }

    /// Pushes the slots in `[from, to)` so that the lowest one is popped first.
    fn push_slots(&mut self, from: usize, to: usize) {
        let mut slot = to;
        while slot > from {
            slot -= self.stride;
            self.push(slot);
        }
    }

    /// Commits memory for `GROW` more slots and carves them out.
    #[instrument(level = "debug", skip(self), err(level = Level::DEBUG))]
    fn extend(&mut self) -> Result<(), AllocError> {
        let oom = AllocError::OutOfMemory {
            requested: self.stride,
        };
        ensure!(self.committed_end < self.region.end(), oom);
        let wanted = GROW.max(1).saturating_mul(self.stride);
        let grow = round_up(wanted, page_size())
            .unwrap_or(usize::MAX)
            .min(self.region.end() - self.committed_end);
        unsafe { virtual_memory::commit(self.region.ptr(self.committed_end), grow)? };
        self.committed_end += grow;

        let new_end = self.last_slot_end(self.committed_end);
        ensure!(new_end > self.slots_end, oom);
        let old_end = self.slots_end;
        self.slots_end = new_end;
        self.push_slots(old_end, new_end);
        debug!(
            grow,
            slots = self.slot_count(),
            "Extended pool."
        );
        Ok(())
    }
}

impl<const SLOT: usize, const ALIGN: usize, const GROW: usize> Strategy
    for PoolStrategy<SLOT, ALIGN, GROW>
{
    const SUPPORTS_ARRAYS: bool = false;

    fn with_region(region: Region, overhead: Overhead) -> Result<Self, AllocError> {
        let len = region.len();
        Self::new(region, overhead, len, false)
    }

    #[instrument(level = "trace", skip(self), ret(level = Level::TRACE), err(level = Level::DEBUG))]
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        check_request(size, align)?;
        ensure!(
            size <= self.stride && align <= ALIGN && offset == self.offset,
            AllocError::SlotMismatch { size, align }
        );
        let slot = match self.pop() {
            Some(slot) => slot,
            None if self.growable => {
                self.extend()?;
                self.pop().ok_or(AllocError::OutOfMemory { requested: size })?
            }
            None => {
                debug!(slots = self.slot_count(), "Pool exhausted.");
                return Err(AllocError::OutOfMemory { requested: size });
            }
        };
        self.live += 1;
        Ok(self.region.ptr(slot))
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        ensure!(
            addr >= self.first_slot
                && addr < self.slots_end
                && (addr - self.first_slot) % self.stride == 0
                && self.live > 0,
            AllocError::ForeignPointer { addr }
        );
        // Release builds skip the O(n) double free scan.
        ensure!(
            !cfg!(debug_assertions) || !self.is_free(addr),
            AllocError::ForeignPointer { addr }
        );
        Ok(())
    }

    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError> {
        self.check_free(block)?;
        self.push(block.as_ptr() as usize);
        self.live -= 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.head = NIL;
        self.live = 0;
        self.push_slots(self.first_slot, self.slots_end);
    }

    fn purge(&mut self) {
        self.reset();
    }

    fn used_size(&self) -> usize {
        self.live * self.stride + self.wasted_size()
    }

    fn physical_size(&self) -> usize {
        self.committed_end - self.region.start()
    }

    fn virtual_size(&self) -> usize {
        self.region.len()
    }
}

impl<const SLOT: usize, const ALIGN: usize, const GROW: usize> GrowableStrategy
    for PoolStrategy<SLOT, ALIGN, GROW>
{
    fn growable(
        start_size: usize,
        max_size: usize,
        overhead: Overhead,
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
        unsafe { virtual_memory::commit(region.ptr(region.start()), start_size)? };
        Self::new(region, overhead, start_size, true)
    }
}
