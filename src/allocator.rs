//! The [`Allocator`] facade composing a strategy with the policies.
//!
//! # Block layout
//! For a request of `n` bytes the facade asks the strategy for
//! `H::SIZE + B::FRONT + n + B::BACK` bytes placed such that the payload is aligned,
//! and lays the block out as
//!
//! ```text
//! | size header | front guard | payload (n bytes) | back guard |
//! ^ block                     ^ returned pointer
//! ```
//!
//! The header stores the total block size, which is how `free` finds the back guard
//! and how `reallocate` knows how many bytes to copy.

use core::cell::UnsafeCell;
use core::fmt::{self, Debug};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use tracing::{error, instrument, Level};

use crate::area::{Area, DynamicArea};
use crate::bounds::{BoundsChecking, BoundsPolicy, NoBoundsChecking};
use crate::error::{check_request, ensure, AllocError};
use crate::header::{HeaderPolicy, SizeHeader};
use crate::region::Region;
use crate::strategies::{GrowableStrategy, Overhead, Strategy};
use crate::tagging::{NoTagging, TagPolicy, Tagging};
use crate::thread::{MultiThread, SingleThread, ThreadPolicy};
use crate::tracking::{CountingTracker, NoTracking, SourceInfo, Tracker, Usage};

/// Guard bytes in debug builds, none in release builds.
#[cfg(debug_assertions)]
pub type DefaultBounds = BoundsChecking;
#[cfg(not(debug_assertions))]
pub type DefaultBounds = NoBoundsChecking;

/// Payload poisoning in debug builds, none in release builds.
#[cfg(debug_assertions)]
pub type DefaultTagging = Tagging;
#[cfg(not(debug_assertions))]
pub type DefaultTagging = NoTagging;

/// Leak detection in debug builds, none in release builds.
#[cfg(debug_assertions)]
pub type DefaultTracking = CountingTracker;
#[cfg(not(debug_assertions))]
pub type DefaultTracking = NoTracking;

/// Every check enabled.
pub type DebugAllocator<S, T = SingleThread> =
    Allocator<S, SizeHeader<u32>, BoundsChecking, Tagging, CountingTracker, T>;

/// Only the size header, which reallocation needs.
pub type ReleaseAllocator<S, T = SingleThread> =
    Allocator<S, SizeHeader<u32>, NoBoundsChecking, NoTagging, NoTracking, T>;

/// A thread safe allocator with the build's default checks.
pub type SharedAllocator<S> =
    Allocator<S, SizeHeader<u32>, DefaultBounds, DefaultTagging, DefaultTracking, MultiThread>;

struct Inner<S, K> {
    strategy: S,
    tracker: K,
}

/// A strategy `S` composed with a header policy `H`, bounds checking `B`, tagging `G`,
/// a tracker `K` and a thread policy `T`.
///
/// All policies are resolved at compile time. A back guard is only reachable through
/// the size header, so combining `B::BACK > 0` with a zero sized header fails to
/// compile.
pub struct Allocator<
    S,
    H = SizeHeader<u32>,
    B = NoBoundsChecking,
    G = NoTagging,
    K = NoTracking,
    T = SingleThread,
> where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    inner: UnsafeCell<Inner<S, K>>,
    thread: T,
    name: &'static str,
    _policies: PhantomData<fn() -> (H, B, G)>,
}

// All access to `inner` happens while holding the mutex of `MultiThread`.
unsafe impl<S, H, B, G, K> Sync for Allocator<S, H, B, G, K, MultiThread>
where
    S: Strategy + Send,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker + Send,
{
}

impl<S, H, B, G, K, T> Allocator<S, H, B, G, K, T>
where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    /// Bytes the facade adds around every payload.
    pub const OVERHEAD: Overhead = Overhead::new(H::SIZE + B::FRONT, B::BACK);

    const VALID_LAYOUT: () = assert!(
        H::SIZE > 0 || B::BACK == 0,
        "a back guard requires a size header"
    );

    /// Wraps an already constructed strategy, which must have been created with
    /// [`OVERHEAD`](Self::OVERHEAD).
    pub fn from_strategy(strategy: S) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_LAYOUT;
        Allocator {
            inner: UnsafeCell::new(Inner {
                strategy,
                tracker: K::default(),
            }),
            thread: T::default(),
            name: "",
            _policies: PhantomData,
        }
    }

    /// Creates an allocator over a `size` byte heap buffer.
    pub fn with_capacity(size: usize) -> Result<Self, AllocError> {
        Ok(Self::from_strategy(S::with_capacity(size, Self::OVERHEAD)?))
    }

    /// Creates an allocator that commits memory on demand, up to `max_size` bytes.
    pub fn growable(start_size: usize, max_size: usize) -> Result<Self, AllocError>
    where
        S: GrowableStrategy,
    {
        Ok(Self::from_strategy(S::growable(
            start_size,
            max_size,
            Self::OVERHEAD,
        )?))
    }

    /// Creates a growable allocator with the sizes of `area`.
    pub fn from_dynamic(area: &DynamicArea) -> Result<Self, AllocError>
    where
        S: GrowableStrategy,
    {
        Self::growable(area.start_size, area.max_size)
    }

    /// Creates an allocator managing `[start, end)`.
    ///
    /// # Safety
    /// The range must be valid for reads and writes, must not be used by anything else
    /// and must outlive the allocator.
    pub unsafe fn from_range(start: *mut u8, end: *mut u8) -> Result<Self, AllocError> {
        let region = Region::from_raw_parts(start, end)?;
        Ok(Self::from_strategy(S::with_region(region, Self::OVERHEAD)?))
    }

    /// Creates an allocator managing the whole of `area`.
    ///
    /// # Safety
    /// `area` must outlive the allocator and must not be used by anything else meanwhile.
    pub unsafe fn in_area<A: Area>(area: &A) -> Result<Self, AllocError> {
        Self::from_range(area.start(), area.end())
    }

    /// Sets the name used in log events.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Replaces the tracker, e.g. with a [`CsvTracker`](crate::tracking::CsvTracker)
    /// writing to a file.
    pub fn with_tracker(mut self, tracker: K) -> Self {
        self.inner.get_mut().tracker = tracker;
        self
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tracker(&mut self) -> &K {
        &self.inner.get_mut().tracker
    }

    pub fn strategy(&mut self) -> &S {
        &self.inner.get_mut().strategy
    }

    /// Runs `f` on the inner state while holding the thread guard.
    #[inline]
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<S, K>) -> R) -> R {
        let _guard = self.thread.enter();
        // The guard serializes access for `MultiThread`, `SingleThread` is `!Sync`.
        f(unsafe { &mut *self.inner.get() })
    }

    /// Allocates `size` bytes aligned to `align`.
    #[instrument(
        level = "debug",
        skip(self),
        fields(allocator = self.name),
        ret(level = Level::DEBUG),
        err(level = Level::DEBUG)
    )]
    pub fn allocate(
        &self,
        size: usize,
        align: usize,
        source: SourceInfo,
    ) -> Result<NonNull<u8>, AllocError> {
        self.with_inner(|inner| Self::allocate_in(inner, size, align, source))
    }

    fn allocate_in(
        inner: &mut Inner<S, K>,
        size: usize,
        align: usize,
        source: SourceInfo,
    ) -> Result<NonNull<u8>, AllocError> {
        check_request(size, align)?;
        let total = size
            .checked_add(Self::OVERHEAD.total())
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        let block = inner.strategy.allocate(total, align, Self::OVERHEAD.front)?;
        unsafe {
            if let Err(err) = H::store(block, total) {
                inner.strategy.free(block)?;
                return Err(err);
            }
            let payload = block.add(Self::OVERHEAD.front);
            B::guard_front(block.add(H::SIZE));
            B::guard_back(payload.add(size));
            G::tag_allocation(payload, size);
            inner.tracker.on_allocation(payload, size, align, source);
            Ok(payload)
        }
    }

    /// Checks that `ptr` may be freed. Returns its block and, if the header
    /// stores it, the payload size.
    ///
    /// Blocks with a corrupted guard are reported and never given back to the
    /// strategy.
    unsafe fn validate(
        &self,
        inner: &Inner<S, K>,
        ptr: NonNull<u8>,
    ) -> Result<(NonNull<u8>, Option<usize>), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let block = NonNull::new(ptr.as_ptr().wrapping_sub(Self::OVERHEAD.front))
            .ok_or(AllocError::ForeignPointer { addr })?;
        inner.strategy.check_free(block)?;

        let size = match H::load(block) {
            Some(total) => {
                ensure!(
                    total > Self::OVERHEAD.total(),
                    AllocError::ForeignPointer { addr }
                );
                Some(total - Self::OVERHEAD.total())
            }
            None => None,
        };
        let guards = match size {
            Some(size) => B::check_back(ptr.add(size)),
            None => Ok(()),
        }
        .and_then(|()| B::check_front(block.add(H::SIZE)));
        if let Err(err) = guards {
            error!(
                allocator = self.name,
                ptr = addr,
                %err,
                "Memory corruption detected, the block is quarantined."
            );
            return Err(err);
        }
        Ok((block, size))
    }

    unsafe fn release(
        inner: &mut Inner<S, K>,
        ptr: NonNull<u8>,
        block: NonNull<u8>,
        size: Option<usize>,
    ) -> Result<(), AllocError> {
        inner.tracker.on_deallocation(ptr, size);
        if let Some(size) = size {
            G::tag_deallocation(ptr, size);
        }
        H::clear(block);
        inner.strategy.free(block)
    }

    /// Frees a pointer returned by this allocator.
    ///
    /// Nothing changes if the strategy rejects the pointer or a guard was overwritten.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this allocator and not been freed since.
    #[instrument(
        level = "debug",
        skip(self),
        fields(allocator = self.name),
        err(level = Level::DEBUG)
    )]
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.with_inner(|inner| {
            let (block, size) = self.validate(inner, ptr)?;
            Self::release(inner, ptr, block, size)
        })
    }

    /// Moves the payload at `ptr` into a new block of `new_size` bytes, or allocates
    /// one if `ptr` is `None`.
    ///
    /// The old block stays untouched if anything fails.
    ///
    /// # Safety
    /// Same as [`free`](Self::free) for `ptr`.
    #[instrument(
        level = "debug",
        skip(self),
        fields(allocator = self.name),
        ret(level = Level::DEBUG),
        err(level = Level::DEBUG)
    )]
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
        source: SourceInfo,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, align, source);
        };
        ensure!(
            S::SUPPORTS_REALLOC,
            AllocError::Unsupported("the strategy cannot reallocate")
        );
        ensure!(H::SIZE > 0, AllocError::MissingHeader);
        self.with_inner(|inner| {
            let (block, old_size) = self.validate(inner, ptr)?;
            let old_size = old_size.ok_or(AllocError::MissingHeader)?;
            let new = Self::allocate_in(inner, new_size, align, source)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
            Self::release(inner, ptr, block, Some(old_size))?;
            Ok(new)
        })
    }

    /// Forgets every live allocation at once.
    pub fn reset(&self) {
        self.with_inner(|inner| {
            inner.strategy.reset();
            inner.tracker.reset();
        })
    }

    /// Returns unused committed memory to the system.
    pub fn purge(&self) {
        self.with_inner(|inner| inner.strategy.purge())
    }

    pub fn used_size(&self) -> usize {
        self.with_inner(|inner| inner.strategy.used_size())
    }

    pub fn physical_size(&self) -> usize {
        self.with_inner(|inner| inner.strategy.physical_size())
    }

    pub fn virtual_size(&self) -> usize {
        self.with_inner(|inner| inner.strategy.virtual_size())
    }

    pub fn live_allocations(&self) -> usize {
        self.with_inner(|inner| inner.tracker.live_allocations())
    }

    pub fn allocated_size(&self) -> usize {
        self.with_inner(|inner| inner.tracker.allocated_size())
    }

    pub fn usage(&self) -> Usage {
        self.with_inner(|inner| Self::usage_of(inner))
    }

    fn usage_of(inner: &Inner<S, K>) -> Usage {
        Usage {
            live_allocations: inner.tracker.live_allocations(),
            allocated_size: inner.tracker.allocated_size(),
            used_size: inner.strategy.used_size(),
            physical_size: inner.strategy.physical_size(),
            virtual_size: inner.strategy.virtual_size(),
        }
    }
}

impl<S, H, B, G, K, T> Debug for Allocator<S, H, B, G, K, T>
where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("name", &self.name)
            .field("usage", &self.usage())
            .finish()
    }
}

impl<S, H, B, G, K, T> Drop for Allocator<S, H, B, G, K, T>
where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let usage = Self::usage_of(inner);
        inner.tracker.on_shutdown(&usage);
        if usage.live_allocations != 0 {
            error!(
                allocator = self.name,
                live_allocations = usage.live_allocations,
                allocated_size = usage.allocated_size,
                "Memory leak detected."
            );
            if !std::thread::panicking() {
                debug_assert_eq!(
                    usage.live_allocations, 0,
                    "Allocator dropped with live allocations."
                );
            }
        }
    }
}
