//! Memory allocators composed from a layout strategy and a set of policies.
//!
//! Every [`Allocator`] is a strategy, which decides where blocks go, wrapped in a
//! facade that adds whatever debugging aids the policies ask for. All of it is resolved
//! at compile time, a release allocator without checks costs no more than calling the
//! strategy directly.
//!
//! # Usage
//! ```
//! use eos_alloc::{source_info, DebugAllocator, FreeListStrategy};
//!
//! let allocator = DebugAllocator::<FreeListStrategy>::with_capacity(64 * 1024).unwrap();
//! let ptr = allocator.allocate(100, 16, source_info!()).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 16, 0);
//! assert_eq!(allocator.live_allocations(), 1);
//! unsafe { allocator.free(ptr).unwrap() };
//! ```
//!
//! # Strategies
//! A [`Strategy`] manages one contiguous [`Region`] of memory. The region either comes
//! from the global heap, from reserved virtual memory or from an [`Area`] provided by
//! the caller. Strategies implementing [`GrowableStrategy`] reserve address space up
//! front and commit pages only as they need them.
//!
//! - [`LinearStrategy`] bumps a cursor, memory is reclaimed all at once by `reset`.
//! - [`PoolStrategy`] hands out fixed size slots.
//! - [`StackStrategy`] bumps a cursor from either end and frees in LIFO order.
//! - [`FreeListStrategy`] keeps an address sorted, coalescing list of free blocks and
//!   searches it first fit or best fit.
//! - [`BuddyStrategy`] splits and merges power-of-two blocks.
//! - [`MallocStrategy`] forwards to the system `malloc`.
//!
//! # Policies
//! The facade lays every block out as
//!
//! ```text
//! | size header | front guard | payload | back guard |
//! ```
//!
//! where each part is supplied by a policy:
//!
//! - [`HeaderPolicy`] remembers the block size, needed by `reallocate` and the back guard.
//! - [`BoundsPolicy`] writes guard words and verifies them on free. A block with
//!   overwritten guards is reported as [`AllocError::Corruption`] and never reused.
//! - [`TagPolicy`] fills fresh and freed payloads with recognizable patterns.
//! - [`Tracker`] counts live allocations to detect leaks when the allocator is dropped,
//!   [`CsvTracker`] also writes every event to a CSV file.
//! - [`ThreadPolicy`] decides whether the allocator may be shared between threads.
//!
//! [`DebugAllocator`] enables all of them, [`ReleaseAllocator`] keeps only the header
//! and [`SharedAllocator`] picks per build profile and adds a mutex.
//!
//! # Logging
//! The crate logs through [`tracing`]. Allocations and frees open `debug` spans,
//! strategy internals log at `trace` and `debug`, detected corruption, leaks and
//! violated invariants at `error`. No subscriber is installed.
//!
//! # Containers
//! [`Allocator::adapter`] returns a [`StdAdapter`] implementing the
//! [`allocator_api2`] `Allocator` trait, so `allocator_api2::vec::Vec` and
//! `allocator_api2::boxed::Box` can live in any of the allocators.

pub use crate::adapter::StdAdapter;
pub use crate::allocator::{
    Allocator, DebugAllocator, DefaultBounds, DefaultTagging, DefaultTracking, ReleaseAllocator,
    SharedAllocator,
};
pub use crate::area::{Area, DynamicArea, FixedArea, HeapArea, VirtualArea};
pub use crate::bounds::{BoundsChecking, BoundsPolicy, NoBoundsChecking};
pub use crate::error::{AllocError, GuardSide};
pub use crate::header::{HeaderPolicy, HeaderWord, NoHeader, SizeHeader};
pub use crate::region::Region;
pub use crate::strategies::{
    BestFit, BuddyStrategy, Direction, Fit, FirstFit, FreeListStrategy, FromBottom, FromTop,
    GrowableStrategy, LinearStrategy, MallocStrategy, Overhead, PoolStrategy, StackStrategy,
    Strategy,
};
pub use crate::tagging::{NoTagging, TagPolicy, Tagging};
pub use crate::thread::{MultiThread, SingleThread, ThreadPolicy};
pub use crate::tracking::{CountingTracker, CsvTracker, NoTracking, SourceInfo, Tracker, Usage};
pub use crate::typed::array_padding;

pub mod adapter;
pub mod allocator;
pub mod area;
pub mod bounds;
pub mod error;
pub mod header;
pub mod region;
pub mod strategies;
pub mod tagging;
pub mod thread;
pub mod tracking;
pub mod typed;
mod util;
pub mod virtual_memory;

#[cfg(test)]
mod test_log;
