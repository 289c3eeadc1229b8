//! A binary buddy allocator.
//!
//! The managed range is a single block of `2^max_order` bytes. Allocation splits
//! blocks in halves until the smallest power of two holding the request is reached,
//! free merges a block with its buddy (the other half of its parent) as long as the
//! buddy is free too.
//!
//! A `u32` right before the returned address stores the block order in its high
//! 8 bits and the distance from the block start in its low 24 bits.

use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;
use tracing::{debug, instrument, trace, Level};

use super::{Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::{align_up, log2_ceil, log2_floor};

type BuddyHeader = u32;

const BUDDY_HEADER_SIZE: usize = size_of::<BuddyHeader>();
const OFFSET_BITS: u32 = 24;
const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

const_assert_eq!(BUDDY_HEADER_SIZE, 4);

/// Order of the smallest block, 16 bytes.
pub const MIN_ORDER: u32 = 4;

const ORDERS: usize = usize::BITS as usize;
const NIL: usize = 0;

#[derive(Debug)]
pub struct BuddyStrategy {
    region: Region,
    base: usize,
    max_order: u32,
    free_lists: [usize; ORDERS],
    live_bytes: usize,
}

impl BuddyStrategy {
    #[inline]
    fn block_size(order: u32) -> usize {
        1 << order
    }

    /// Size of the whole managed block.
    #[inline]
    pub fn capacity(&self) -> usize {
        Self::block_size(self.max_order)
    }

    #[inline]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Total size of all free blocks.
    pub fn free_size(&self) -> usize {
        (MIN_ORDER..=self.max_order)
            .map(|order| self.list(order).count() * Self::block_size(order))
            .sum()
    }

    fn list(&self, order: u32) -> impl Iterator<Item = usize> + '_ {
        let mut addr = self.free_lists[order as usize];
        core::iter::from_fn(move || {
            if addr == NIL {
                return None;
            }
            let item = addr;
            addr = unsafe { self.region.read::<usize>(addr) };
            Some(item)
        })
    }

    #[inline]
    fn push(&mut self, order: u32, block: usize) {
        unsafe { self.region.write::<usize>(block, self.free_lists[order as usize]) };
        self.free_lists[order as usize] = block;
    }

    #[inline]
    fn pop(&mut self, order: u32) -> Option<usize> {
        let block = self.free_lists[order as usize];
        if block == NIL {
            return None;
        }
        self.free_lists[order as usize] = unsafe { self.region.read::<usize>(block) };
        Some(block)
    }

    /// Unlinks `block` from the list of `order` if it is there.
    /// This operation has a time complexity of *O*(n).
    fn remove(&mut self, order: u32, block: usize) -> bool {
        let mut prev = NIL;
        let mut addr = self.free_lists[order as usize];
        while addr != NIL {
            let next = unsafe { self.region.read::<usize>(addr) };
            if addr == block {
                if prev == NIL {
                    self.free_lists[order as usize] = next;
                } else {
                    unsafe { self.region.write::<usize>(prev, next) };
                }
                return true;
            }
            prev = addr;
            addr = next;
        }
        false
    }

    #[inline]
    fn buddy_of(&self, block: usize, order: u32) -> usize {
        self.base + ((block - self.base) ^ Self::block_size(order))
    }

    fn decode(header: BuddyHeader) -> (u32, usize) {
        (header >> OFFSET_BITS, (header & OFFSET_MASK) as usize)
    }
}

impl Strategy for BuddyStrategy {
    fn with_region(region: Region, _overhead: Overhead) -> Result<Self, AllocError> {
        let too_small = AllocError::OutOfMemory {
            requested: 1 << MIN_ORDER,
        };
        let base = align_up(region.start(), size_of::<usize>()).ok_or(too_small)?;
        ensure!(base < region.end(), too_small);
        let max_order = log2_floor(region.end() - base);
        ensure!(max_order >= MIN_ORDER, too_small);
        let mut buddy = BuddyStrategy {
            region,
            base,
            max_order,
            free_lists: [NIL; ORDERS],
            live_bytes: 0,
        };
        buddy.reset();
        debug!(base, max_order, "Created buddy allocator.");
        Ok(buddy)
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
        ensure!(
            BUDDY_HEADER_SIZE + offset + align - 1 <= OFFSET_MASK as usize,
            AllocError::HeaderOverflow {
                size: BUDDY_HEADER_SIZE + offset + align - 1
            }
        );
        let needed = size
            .checked_add(BUDDY_HEADER_SIZE + offset + align - 1)
            .ok_or(oom)?;
        let order = log2_ceil(needed).max(MIN_ORDER);
        if order > self.max_order {
            debug!(order, max_order = self.max_order, "Request larger than the buddy.");
            return Err(oom);
        }

        let Some(mut current) =
            (order..=self.max_order).find(|&o| self.free_lists[o as usize] != NIL)
        else {
            debug!(order, free = self.free_size(), "No free block large enough.");
            return Err(oom);
        };
        let block = self.pop(current).ok_or(oom)?;
        while current > order {
            current -= 1;
            let upper = block + Self::block_size(current);
            if cfg!(debug_assertions) {
                unsafe { self.region.fill(upper, Self::block_size(current), 0) };
            }
            trace!(upper, order = current, "Split block.");
            self.push(current, upper);
        }

        let addr = align_up(block + BUDDY_HEADER_SIZE + offset, align).ok_or(oom)? - offset;
        let header = (order << OFFSET_BITS) | (addr - block) as u32;
        unsafe { self.region.write::<BuddyHeader>(addr - BUDDY_HEADER_SIZE, header) };
        self.live_bytes += Self::block_size(order);
        Ok(self.region.ptr(addr))
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        let foreign = AllocError::ForeignPointer { addr };
        ensure!(
            addr >= self.base + BUDDY_HEADER_SIZE && addr < self.base + self.capacity(),
            foreign
        );
        let header: BuddyHeader = unsafe { self.region.read(addr - BUDDY_HEADER_SIZE) };
        let (order, offset) = Self::decode(header);
        let start = addr.wrapping_sub(offset);
        ensure!(
            (MIN_ORDER..=self.max_order).contains(&order)
                && offset >= BUDDY_HEADER_SIZE
                && offset <= addr - self.base
                && (start - self.base) % Self::block_size(order) == 0,
            foreign
        );
        // A freed block may have merged into any of its enclosing blocks since.
        ensure!(
            (order..=self.max_order).all(|o| {
                let enclosing = self.base + ((start - self.base) & !(Self::block_size(o) - 1));
                !self.list(o).any(|free| free == enclosing)
            }),
            foreign
        );
        ensure!(self.live_bytes >= Self::block_size(order), foreign);
        Ok(())
    }

    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError> {
        self.check_free(block)?;
        let addr = block.as_ptr() as usize;
        let (mut order, offset) = Self::decode(self.region.read(addr - BUDDY_HEADER_SIZE));
        let mut start = addr - offset;
        self.live_bytes -= Self::block_size(order);

        while order < self.max_order {
            let buddy = self.buddy_of(start, order);
            if !self.remove(order, buddy) {
                break;
            }
            trace!(start, buddy, order, "Merged with buddy.");
            start = start.min(buddy);
            order += 1;
        }
        self.push(order, start);
        Ok(())
    }

    fn reset(&mut self) {
        self.free_lists = [NIL; ORDERS];
        self.live_bytes = 0;
        self.push(self.max_order, self.base);
    }

    fn purge(&mut self) {}

    fn used_size(&self) -> usize {
        self.live_bytes
    }

    fn physical_size(&self) -> usize {
        self.region.len()
    }

    fn virtual_size(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::random_no_overlap;

    #[test]
    fn test_1() {
        let mut buddy = BuddyStrategy::with_capacity(1000, Overhead::NONE).unwrap();
        assert_eq!(buddy.capacity(), 512);
        let a = buddy.allocate(100, 8, 0).unwrap();
        assert_eq!(buddy.used_size(), 128);
        assert_eq!(buddy.free_size(), 384);
        let b = buddy.allocate(20, 8, 0).unwrap();
        assert_eq!(buddy.used_size(), 128 + 32);
        assert_eq!(buddy.free_size() + buddy.used_size(), buddy.capacity());
        unsafe {
            buddy.free(a).unwrap();
            buddy.free(b).unwrap();
        }
        assert_eq!(buddy.free_size(), 512);
        assert_eq!(buddy.list(buddy.max_order()).count(), 1);
    }

    #[test]
    fn test_2() {
        let mut buddy = BuddyStrategy::with_capacity(1024, Overhead::NONE).unwrap();
        let mut blocks = vec![];
        while let Ok(p) = buddy.allocate(1, 1, 0) {
            blocks.push(p);
        }
        assert_eq!(blocks.len(), 1024 / 16);
        assert_eq!(buddy.free_size(), 0);
        for p in blocks.into_iter().step_by(2) {
            unsafe { buddy.free(p).unwrap() };
        }
        assert_eq!(buddy.free_size(), 512);
        assert!(buddy.allocate(17, 1, 0).is_err());
    }

    #[test]
    fn test_header_layout() {
        let mut buddy = BuddyStrategy::with_capacity(4096, Overhead::NONE).unwrap();
        let p = buddy.allocate(40, 64, 4).unwrap();
        let addr = p.as_ptr() as usize;
        assert_eq!((addr + 4) % 64, 0);
        let header: u32 = unsafe { buddy.region.read(addr - 4) };
        let (order, offset) = BuddyStrategy::decode(header);
        assert_eq!(order, log2_ceil(40 + 4 + 4 + 63));
        assert!(offset >= 4);
        assert_eq!((addr - offset - buddy.base) % (1 << order), 0);
    }

    #[test]
    fn test_double_free() {
        let mut buddy = BuddyStrategy::with_capacity(256, Overhead::NONE).unwrap();
        let a = buddy.allocate(8, 8, 0).unwrap();
        let _b = buddy.allocate(8, 8, 0).unwrap();
        unsafe { buddy.free(a).unwrap() };
        assert!(buddy.check_free(a).is_err());
    }

    #[test]
    fn test_double_free_after_merge() {
        let mut buddy = BuddyStrategy::with_capacity(1024, Overhead::NONE).unwrap();
        let a = buddy.allocate(8, 64, 0).unwrap();
        let b = buddy.allocate(8, 64, 0).unwrap();
        unsafe {
            buddy.free(a).unwrap();
            buddy.free(b).unwrap();
        }
        assert_eq!(buddy.free_size(), buddy.capacity());
        assert!(buddy.check_free(a).is_err());
        assert!(unsafe { buddy.free(a) }.is_err());
        assert!(buddy.check_free(b).is_err());
        assert_eq!(buddy.used_size(), 0);
        assert_eq!(buddy.list(buddy.max_order()).count(), 1);
    }

    #[test]
    fn test_conservation() {
        let mut buddy = BuddyStrategy::with_capacity(64 * 1024, Overhead::NONE).unwrap();
        assert!(random_no_overlap(&mut buddy, 3, 700) > 0);
        assert_eq!(buddy.used_size(), 0);
        assert_eq!(buddy.free_size(), buddy.capacity());
        assert_eq!(buddy.list(buddy.max_order()).count(), 1);
    }
}
