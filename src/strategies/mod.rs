//! Memory layout strategies.
//!
//! A strategy owns a [`Region`] and decides where blocks go inside it. It knows
//! nothing about headers, guards or tags; the facade asks it for `size` bytes whose
//! address plus `offset` is `align`-aligned and lays its own metadata out in the
//! first `offset` bytes of the block.
//!
//! | Strategy | Placement | Free |
//! |---|---|---|
//! | [`LinearStrategy`] | bump a cursor | no-op, memory returns on reset |
//! | [`PoolStrategy`] | pop a fixed size slot | push the slot |
//! | [`StackStrategy`] | bump a cursor from either end | LIFO only |
//! | [`FreeListStrategy`] | first or best fit over a sorted list | insert and coalesce |
//! | [`BuddyStrategy`] | split power-of-two blocks | merge with the buddy |
//! | [`MallocStrategy`] | `libc::malloc` | `libc::free` |

use core::ptr::NonNull;

use crate::error::AllocError;
use crate::region::Region;

pub mod buddy;
pub mod free_list;
pub mod linear;
pub mod malloc;
pub mod pool;
pub mod stack;

pub use buddy::BuddyStrategy;
pub use free_list::{BestFit, Fit, FirstFit, FreeListStrategy};
pub use linear::LinearStrategy;
pub use malloc::MallocStrategy;
pub use pool::PoolStrategy;
pub use stack::{Direction, FromBottom, FromTop, StackStrategy};

/// Bytes the facade adds in front of and behind every payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Overhead {
    pub front: usize,
    pub back: usize,
}

impl Overhead {
    pub const NONE: Overhead = Overhead { front: 0, back: 0 };

    #[inline]
    pub const fn new(front: usize, back: usize) -> Self {
        Overhead { front, back }
    }

    #[inline]
    pub const fn total(&self) -> usize {
        self.front + self.back
    }
}

/// A memory layout strategy.
pub trait Strategy: Sized {
    /// Whether the array helpers may be used on top of this strategy.
    const SUPPORTS_ARRAYS: bool = true;
    /// Whether a block can be moved by allocating, copying and freeing.
    const SUPPORTS_REALLOC: bool = true;

    /// Creates a strategy managing a fresh `size` byte heap buffer.
    fn with_capacity(size: usize, overhead: Overhead) -> Result<Self, AllocError> {
        Self::with_region(Region::heap(size)?, overhead)
    }

    /// Creates a strategy managing `region`.
    fn with_region(region: Region, overhead: Overhead) -> Result<Self, AllocError>;

    /// Returns a block of `size` bytes such that `block + offset` is `align`-aligned.
    fn allocate(&mut self, size: usize, align: usize, offset: usize)
        -> Result<NonNull<u8>, AllocError>;

    /// Validates that `block` may be freed right now without touching any state.
    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError>;

    /// Returns `block` to the strategy.
    ///
    /// # Safety
    /// `block` must have been returned by [`allocate`](Strategy::allocate) on this
    /// strategy, must not have been freed since and must pass
    /// [`check_free`](Strategy::check_free).
    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError>;

    /// Forgets every live block.
    fn reset(&mut self);

    /// Gives unused committed memory back to the system. Strategies without a
    /// growable backing treat this as [`reset`](Strategy::reset) or do nothing.
    fn purge(&mut self);

    /// Bytes currently handed out, including placement padding.
    fn used_size(&self) -> usize;
    /// Bytes backed by physical memory.
    fn physical_size(&self) -> usize;
    /// Bytes of address space the strategy spans.
    fn virtual_size(&self) -> usize;
}

/// A strategy that can start small and commit more memory on demand.
pub trait GrowableStrategy: Strategy {
    /// Reserves `max_size` bytes of address space and commits `start_size` of them.
    fn growable(start_size: usize, max_size: usize, overhead: Overhead)
        -> Result<Self, AllocError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the strategy tests.

    use core::ptr::NonNull;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::Strategy;

    /// Allocates and frees random blocks, checking that live blocks are aligned and
    /// never overlap. Returns the number of successful allocations.
    pub fn random_no_overlap<S: Strategy>(strategy: &mut S, seed: u64, max_size: usize) -> usize {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut live: Vec<(NonNull<u8>, usize)> = vec![];
        let mut count = 0;
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=max_size);
                let align = 1 << rng.gen_range(0..=5);
                if let Ok(p) = strategy.allocate(size, align, 0) {
                    count += 1;
                    let start = p.as_ptr() as usize;
                    assert_eq!(start % align, 0);
                    for &(q, len) in &live {
                        let q = q.as_ptr() as usize;
                        assert!(start + size <= q || q + len <= start, "Live blocks overlap.");
                    }
                    unsafe { p.as_ptr().write_bytes(0x5A, size) };
                    live.push((p, size));
                }
            } else {
                let (p, _) = live.swap_remove(rng.gen_range(0..live.len()));
                strategy.check_free(p).unwrap();
                unsafe { strategy.free(p).unwrap() };
            }
        }
        for (p, _) in live {
            unsafe { strategy.free(p).unwrap() };
        }
        count
    }
}
