//! A general purpose allocator keeping its free blocks in an address ordered list.
//!
//! # Layout
//! Free memory is a singly linked list of `Node`s embedded in the free blocks
//! themselves, sorted by address so that neighbours can be coalesced on free.
//! Every occupied block starts with an `AllocationHeader` placed right before the
//! address handed out:
//!
//! ```text
//! node                 block - 16     block
//! |<----- padding ------------------->|
//! |  alignment slack   | block_size | padding | payload ... |
//! |<-------------------- block_size ------------------------->|
//! ```
//!
//! All node addresses and block sizes are multiples of [`GRANULARITY`].

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;
use tracing::{debug, instrument, trace, Level};

use super::{Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::{align_down, align_up, round_up};

pub const GRANULARITY: usize = 8;

const NIL: usize = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
struct Node {
    size: usize,
    next: usize,
}

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct AllocationHeader {
    block_size: usize,
    padding: usize,
}

const NODE_SIZE: usize = size_of::<Node>();
const HEADER_SIZE: usize = size_of::<AllocationHeader>();

/// Smallest block that can be split off and turned into a node.
pub const MIN_BLOCK_SIZE: usize = NODE_SIZE;

const_assert!(NODE_SIZE % GRANULARITY == 0);
const_assert!(HEADER_SIZE % GRANULARITY == 0);
const_assert!(HEADER_SIZE <= 16);

/// How a free block is chosen among those large enough.
pub trait Fit {
    /// Whether the search stops at the first candidate.
    const FIRST: bool;
}

/// Take the first free block large enough.
#[derive(Copy, Clone, Debug, Default)]
pub struct FirstFit;

/// Take the free block that leaves the smallest remainder.
#[derive(Copy, Clone, Debug, Default)]
pub struct BestFit;

impl Fit for FirstFit {
    const FIRST: bool = true;
}

impl Fit for BestFit {
    const FIRST: bool = false;
}

/// A free block chosen for an allocation.
#[derive(Copy, Clone, Debug)]
struct Candidate {
    prev: usize,
    node: usize,
    block: usize,
    padding: usize,
    required: usize,
    remainder: usize,
}

/// A free list allocator, see the [module](self) documentation.
#[derive(Debug)]
pub struct FreeListStrategy<F: Fit = FirstFit> {
    region: Region,
    head: usize,
    used: usize,
    _fit: PhantomData<F>,
}

impl<F: Fit> FreeListStrategy<F> {
    #[inline]
    fn node(&self, addr: usize) -> Node {
        unsafe { self.region.read(addr) }
    }

    #[inline]
    fn set_node(&self, addr: usize, node: Node) {
        unsafe { self.region.write(addr, node) }
    }

    /// Links `next` after `prev`, or makes it the head if `prev` is [`NIL`].
    #[inline]
    fn link(&mut self, prev: usize, next: usize) {
        if prev == NIL {
            self.head = next;
        } else {
            let node = self.node(prev);
            self.set_node(prev, Node { next, ..node });
        }
    }

    fn nodes(&self) -> impl Iterator<Item = (usize, Node)> + '_ {
        let mut addr = self.head;
        core::iter::from_fn(move || {
            if addr == NIL {
                return None;
            }
            let node = self.node(addr);
            let item = (addr, node);
            addr = node.next;
            Some(item)
        })
    }

    /// Total size of all free blocks.
    pub fn free_size(&self) -> usize {
        self.nodes().map(|(_, node)| node.size).sum()
    }

    /// Number of free blocks.
    pub fn free_blocks(&self) -> usize {
        self.nodes().count()
    }

    /// Checks whether the block at `node` can hold `size` bytes such that the
    /// returned address plus `offset` is `align`-aligned.
    fn fit(
        &self,
        prev: usize,
        node: usize,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Option<Candidate> {
        let free = self.node(node).size;
        let block = align_up(node.checked_add(HEADER_SIZE + offset)?, align)? - offset;
        let padding = block - node;
        let required = round_up(padding.checked_add(size)?, GRANULARITY)?;
        if required > free {
            return None;
        }
        Some(Candidate {
            prev,
            node,
            block,
            padding,
            required,
            remainder: free - required,
        })
    }

    /// Walks the list looking for a block according to `F`.
    /// This operation has a time complexity of *O*(n).
    fn find(&self, size: usize, align: usize, offset: usize) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        let mut prev = NIL;
        for (addr, _) in self.nodes() {
            if let Some(candidate) = self.fit(prev, addr, size, align, offset) {
                if F::FIRST || candidate.remainder == 0 {
                    return Some(candidate);
                }
                if best.map_or(true, |b| candidate.remainder < b.remainder) {
                    best = Some(candidate);
                }
            }
            prev = addr;
        }
        best
    }

    /// Inserts the free block `[addr, addr + size)` keeping the list sorted and
    /// merges it with the byte adjacent neighbours.
    #[instrument(level = "trace", skip(self))]
    fn insert(&mut self, addr: usize, size: usize) {
        let mut prev = NIL;
        let mut next = self.head;
        while next != NIL && next < addr {
            prev = next;
            next = self.node(next).next;
        }

        let mut node = Node { size, next };
        if next != NIL && addr + size == next {
            let following = self.node(next);
            trace!(next, "Merging with following block.");
            node = Node {
                size: size + following.size,
                next: following.next,
            };
        }

        if prev != NIL {
            let preceding = self.node(prev);
            if prev + preceding.size == addr {
                trace!(prev, "Merging with preceding block.");
                self.set_node(
                    prev,
                    Node {
                        size: preceding.size + node.size,
                        next: node.next,
                    },
                );
                return;
            }
        }

        self.set_node(addr, node);
        self.link(prev, addr);
    }
}

impl<F: Fit> Strategy for FreeListStrategy<F> {
    fn with_region(region: Region, _overhead: Overhead) -> Result<Self, AllocError> {
        let mut strategy = FreeListStrategy {
            region,
            head: NIL,
            used: 0,
            _fit: PhantomData,
        };
        ensure!(
            strategy.first_node().is_some(),
            AllocError::OutOfMemory {
                requested: MIN_BLOCK_SIZE
            }
        );
        strategy.reset();
        Ok(strategy)
    }

    #[instrument(level = "trace", skip(self), ret(level = Level::TRACE), err(level = Level::DEBUG))]
    fn allocate(
        &mut self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        check_request(size, align)?;
        let Some(candidate) = self.find(size, align, offset) else {
            debug!(
                size,
                align,
                free = self.free_size(),
                blocks = self.free_blocks(),
                "No free block large enough."
            );
            return Err(AllocError::OutOfMemory { requested: size });
        };

        let next = self.node(candidate.node).next;
        let mut block_size = candidate.required;
        if candidate.remainder >= MIN_BLOCK_SIZE {
            let split = candidate.node + candidate.required;
            self.set_node(
                split,
                Node {
                    size: candidate.remainder,
                    next,
                },
            );
            self.link(candidate.prev, split);
        } else {
            block_size += candidate.remainder;
            self.link(candidate.prev, next);
        }

        unsafe {
            self.region.write(
                candidate.block - HEADER_SIZE,
                AllocationHeader {
                    block_size,
                    padding: candidate.padding,
                },
            )
        };
        self.used += block_size;
        Ok(self.region.ptr(candidate.block))
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        let foreign = AllocError::ForeignPointer { addr };
        ensure!(
            addr >= self.region.start() + HEADER_SIZE && addr < self.region.end(),
            foreign
        );
        let header: AllocationHeader = unsafe { self.region.read(addr - HEADER_SIZE) };
        let node = addr.wrapping_sub(header.padding);
        ensure!(
            header.padding >= HEADER_SIZE
                && header.padding <= addr - self.region.start()
                && node % GRANULARITY == 0
                && header.block_size % GRANULARITY == 0
                && header.block_size > header.padding
                && header.block_size <= self.region.end() - node,
            foreign
        );
        // A block overlapping a free node was already freed.
        ensure!(
            self.nodes()
                .all(|(free, n)| free + n.size <= node || node + header.block_size <= free),
            foreign
        );
        Ok(())
    }

    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError> {
        self.check_free(block)?;
        let addr = block.as_ptr() as usize;
        let header: AllocationHeader = self.region.read(addr - HEADER_SIZE);
        self.used -= header.block_size;
        self.insert(addr - header.padding, header.block_size);
        Ok(())
    }

    fn reset(&mut self) {
        self.used = 0;
        self.head = NIL;
        if let Some((addr, size)) = self.first_node() {
            self.set_node(addr, Node { size, next: NIL });
            self.head = addr;
        }
    }

    fn purge(&mut self) {}

    fn used_size(&self) -> usize {
        self.used
    }

    fn physical_size(&self) -> usize {
        self.region.len()
    }

    fn virtual_size(&self) -> usize {
        self.region.len()
    }
}

impl<F: Fit> FreeListStrategy<F> {
    /// The single node spanning the whole region.
    fn first_node(&self) -> Option<(usize, usize)> {
        let addr = align_up(self.region.start(), GRANULARITY)?;
        let end = align_down(self.region.end(), GRANULARITY);
        (end > addr && end - addr >= MIN_BLOCK_SIZE).then(|| (addr, end - addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::random_no_overlap;

    #[test]
    fn test_1() {
        let mut list = FreeListStrategy::<FirstFit>::with_capacity(1024, Overhead::NONE).unwrap();
        let a = list.allocate(100, 8, 0).unwrap();
        let b = list.allocate(100, 8, 0).unwrap();
        let c = list.allocate(100, 8, 0).unwrap();
        assert_eq!(list.free_blocks(), 1);
        unsafe {
            list.free(a).unwrap();
            list.free(c).unwrap();
            assert_eq!(list.free_blocks(), 2);
            list.free(b).unwrap();
        }
        assert_eq!(list.free_blocks(), 1);
        assert_eq!(list.free_size(), 1024);
        assert_eq!(list.used_size(), 0);

        // Only the merged block can hold this.
        let whole = list.allocate(1024 - HEADER_SIZE, 8, 0).unwrap();
        assert_eq!(whole, a);
        assert_eq!(list.free_blocks(), 0);
        assert_eq!(list.used_size(), 1024);
        unsafe { list.free(whole).unwrap() };
    }

    #[test]
    fn test_2() {
        let mut list = FreeListStrategy::<FirstFit>::with_capacity(1024, Overhead::NONE).unwrap();
        let blocks: Vec<_> = (0..6).map(|_| list.allocate(40, 8, 0).unwrap()).collect();
        for p in blocks.iter().rev() {
            unsafe { list.free(*p).unwrap() };
        }
        assert_eq!(list.free_blocks(), 1);
        assert_eq!(list.free_size(), 1024);
        let blocks: Vec<_> = (0..6).map(|_| list.allocate(40, 8, 0).unwrap()).collect();
        for i in [1, 3, 5, 0, 4, 2] {
            unsafe { list.free(blocks[i]).unwrap() };
        }
        assert_eq!(list.free_blocks(), 1);
        assert_eq!(list.free_size(), 1024);
        let whole = list.allocate(1024 - HEADER_SIZE, 8, 0).unwrap();
        assert_eq!(whole, blocks[0]);
        assert!(list.allocate(8, 8, 0).is_err());
        unsafe { list.free(whole).unwrap() };
        assert_eq!(list.free_size(), 1024);
    }

    #[test]
    fn test_best_fit() {
        let mut list = FreeListStrategy::<BestFit>::with_capacity(1024, Overhead::NONE).unwrap();
        let a = list.allocate(200, 8, 0).unwrap();
        let _b = list.allocate(8, 8, 0).unwrap();
        let c = list.allocate(48, 8, 0).unwrap();
        let _d = list.allocate(8, 8, 0).unwrap();
        unsafe {
            list.free(a).unwrap();
            list.free(c).unwrap();
        }
        // The hole left by `c` fits exactly, the one left by `a` comes first.
        assert_eq!(list.allocate(48, 8, 0), Ok(c));

        let mut list = FreeListStrategy::<FirstFit>::with_capacity(1024, Overhead::NONE).unwrap();
        let a = list.allocate(200, 8, 0).unwrap();
        let _b = list.allocate(8, 8, 0).unwrap();
        let c = list.allocate(48, 8, 0).unwrap();
        let _d = list.allocate(8, 8, 0).unwrap();
        unsafe {
            list.free(a).unwrap();
            list.free(c).unwrap();
        }
        assert_eq!(list.allocate(48, 8, 0), Ok(a));
    }

    #[test]
    fn test_double_free() {
        let mut list = FreeListStrategy::<FirstFit>::with_capacity(512, Overhead::NONE).unwrap();
        let a = list.allocate(32, 16, 0).unwrap();
        let _b = list.allocate(32, 16, 0).unwrap();
        unsafe { list.free(a).unwrap() };
        assert_eq!(
            list.check_free(a),
            Err(AllocError::ForeignPointer {
                addr: a.as_ptr() as usize
            })
        );
    }

    #[test]
    fn test_exhaustion() {
        let mut list = FreeListStrategy::<FirstFit>::with_capacity(256, Overhead::NONE).unwrap();
        assert!(list.allocate(240, 8, 0).is_ok());
        assert_eq!(list.used_size(), 256);
        assert_eq!(
            list.allocate(1, 1, 0),
            Err(AllocError::OutOfMemory { requested: 1 })
        );
        list.reset();
        assert_eq!(list.free_size(), 256);
    }

    #[test]
    fn test_alignment_with_offset() {
        let mut list =
            FreeListStrategy::<BestFit>::with_capacity(8192, Overhead::new(12, 4)).unwrap();
        for i in 0..=9 {
            let align = 1 << i;
            let p = list.allocate(30, align, 12).unwrap();
            assert_eq!((p.as_ptr() as usize + 12) % align, 0);
        }
    }

    #[test]
    fn test_no_overlap() {
        let mut first =
            FreeListStrategy::<FirstFit>::with_capacity(16 * 1024, Overhead::NONE).unwrap();
        assert!(random_no_overlap(&mut first, 1, 300) > 0);
        assert_eq!(first.free_blocks(), 1);
        assert_eq!(first.used_size(), 0);

        let mut best =
            FreeListStrategy::<BestFit>::with_capacity(16 * 1024, Overhead::NONE).unwrap();
        assert!(random_no_overlap(&mut best, 2, 300) > 0);
        assert_eq!(best.free_blocks(), 1);
    }
}
