//! Lets `allocator_api2` containers allocate from an [`Allocator`].

use core::alloc::Layout;
use core::fmt::{self, Debug};
use core::ptr::{self, NonNull};

use allocator_api2::alloc::{AllocError as StdAllocError, Allocator as StdAllocator};
use tracing::error;

use crate::allocator::Allocator;
use crate::bounds::BoundsPolicy;
use crate::header::HeaderPolicy;
use crate::strategies::Strategy;
use crate::tagging::TagPolicy;
use crate::thread::ThreadPolicy;
use crate::tracking::{SourceInfo, Tracker};

/// A borrowed facade implementing [`allocator_api2::alloc::Allocator`].
///
/// ```
/// use eos_alloc::{DebugAllocator, FreeListStrategy};
///
/// let allocator = DebugAllocator::<FreeListStrategy>::with_capacity(4096).unwrap();
/// let mut v = allocator_api2::vec::Vec::new_in(allocator.adapter());
/// v.extend_from_slice(&[1, 2, 3]);
/// assert_eq!(allocator.live_allocations(), 1);
/// ```
pub struct StdAdapter<'a, A> {
    allocator: &'a A,
}

impl<A> Clone for StdAdapter<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for StdAdapter<'_, A> {}

impl<A: Debug> Debug for StdAdapter<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StdAdapter").field(self.allocator).finish()
    }
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
    pub fn adapter(&self) -> StdAdapter<'_, Self> {
        StdAdapter { allocator: self }
    }
}

impl<S, H, B, G, K, T> StdAdapter<'_, Allocator<S, H, B, G, K, T>>
where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    unsafe fn move_block(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, StdAllocError> {
        if S::SUPPORTS_REALLOC && H::SIZE > 0 {
            let new = self
                .allocator
                .reallocate(
                    Some(ptr),
                    new_layout.size().max(1),
                    new_layout.align(),
                    SourceInfo::UNKNOWN,
                )
                .map_err(|_| StdAllocError)?;
            return Ok(NonNull::slice_from_raw_parts(new, new_layout.size()));
        }
        let new = self.allocate(new_layout)?;
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new.cast::<u8>().as_ptr(),
            old_layout.size().min(new_layout.size()),
        );
        self.deallocate(ptr, old_layout);
        Ok(new)
    }
}

unsafe impl<S, H, B, G, K, T> StdAllocator for StdAdapter<'_, Allocator<S, H, B, G, K, T>>
where
    S: Strategy,
    H: HeaderPolicy,
    B: BoundsPolicy,
    G: TagPolicy,
    K: Tracker,
    T: ThreadPolicy,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, StdAllocError> {
        let ptr = self
            .allocator
            .allocate(layout.size().max(1), layout.align(), SourceInfo::UNKNOWN)
            .map_err(|_| StdAllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        if let Err(err) = self.allocator.free(ptr) {
            error!(allocator = self.allocator.name(), %err, "Failed to free a container block.");
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, StdAllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.move_block(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, StdAllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.move_block(ptr, old_layout, new_layout)
    }
}

#[cfg(test)]
mod tests {
    use crate::allocator::{DebugAllocator, ReleaseAllocator};
    use crate::strategies::{BuddyStrategy, FreeListStrategy, LinearStrategy, StackStrategy};

    use allocator_api2::boxed::Box;
    use allocator_api2::vec::Vec;

    #[test]
    fn test_1() {
        let allocator = DebugAllocator::<FreeListStrategy>::with_capacity(16 * 1024).unwrap();
        {
            let mut v = Vec::new_in(allocator.adapter());
            for i in 0..1000_u32 {
                v.push(i);
            }
            assert_eq!(allocator.live_allocations(), 1);
            assert_eq!(allocator.allocated_size(), v.capacity() * 4);
            assert!(v.iter().copied().eq(0..1000));
            v.truncate(10);
            v.shrink_to_fit();
            assert_eq!(v[..], [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        }
        assert_eq!(allocator.live_allocations(), 0);
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn test_2() {
        let allocator = ReleaseAllocator::<BuddyStrategy>::with_capacity(4096).unwrap();
        let boxed = Box::new_in([7_u64; 16], allocator.adapter());
        assert_eq!(boxed.iter().sum::<u64>(), 112);
        assert!(allocator.used_size() >= 128);
        drop(boxed);
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn test_3() {
        // Growing a stack vector moves it without reallocate.
        let allocator = DebugAllocator::<StackStrategy>::with_capacity(16 * 1024).unwrap();
        let mut v = Vec::with_capacity_in(4, allocator.adapter());
        v.extend_from_slice(&[1_u8, 2, 3, 4]);
        v.reserve(100);
        assert_eq!(v[..], [1, 2, 3, 4]);
        drop(v);
        // The old block could not be freed out of order and stays live.
        assert_eq!(allocator.live_allocations(), 1);
        allocator.reset();
    }

    #[test]
    fn test_4() {
        let allocator = DebugAllocator::<LinearStrategy>::with_capacity(1024).unwrap();
        let empty: Vec<u8, _> = Vec::new_in(allocator.adapter());
        assert_eq!(allocator.live_allocations(), 0);
        drop(empty);
        let mut v = Vec::new_in(allocator.adapter());
        v.push(1_u16);
        assert_eq!(allocator.live_allocations(), 1);
        drop(v);
        assert_eq!(allocator.live_allocations(), 0);
    }
}
