//! Typed object and array helpers on top of [`Allocator`].
//!
//! Arrays of element types that need dropping store their length in a `usize` right
//! before the first element, so [`Allocator::delete_array`] knows how many elements to
//! drop. The word is padded to the element alignment, see [`array_padding`].

use core::mem::{align_of, needs_drop, size_of};
use core::ptr::{self, NonNull};

use crate::allocator::Allocator;
use crate::bounds::BoundsPolicy;
use crate::error::{ensure, AllocError};
use crate::header::HeaderPolicy;
use crate::strategies::Strategy;
use crate::tagging::TagPolicy;
use crate::thread::ThreadPolicy;
use crate::tracking::{SourceInfo, Tracker};

/// Bytes in front of the first element of an array of `V`.
pub const fn array_padding<V>() -> usize {
    if !needs_drop::<V>() {
        return 0;
    }
    let align = align_of::<V>();
    (size_of::<usize>() + align - 1) / align * align
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
    /// Moves `value` into a new allocation.
    pub fn new_object<V>(&self, value: V, source: SourceInfo) -> Result<NonNull<V>, AllocError> {
        let ptr = self
            .allocate(size_of::<V>().max(1), align_of::<V>(), source)?
            .cast::<V>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drops the object at `ptr` and frees its memory.
    ///
    /// # Safety
    /// `ptr` must come from [`new_object`](Self::new_object) on this allocator and
    /// must not be used afterwards.
    pub unsafe fn delete_object<V>(&self, ptr: NonNull<V>) -> Result<(), AllocError> {
        ptr::drop_in_place(ptr.as_ptr());
        self.free(ptr.cast())
    }

    /// Allocates `count` elements, initializing element `i` with `f(i)`.
    ///
    /// If `f` panics the elements written so far and the memory are leaked.
    pub fn new_array_with<V>(
        &self,
        count: usize,
        mut f: impl FnMut(usize) -> V,
        source: SourceInfo,
    ) -> Result<NonNull<V>, AllocError> {
        ensure!(
            S::SUPPORTS_ARRAYS,
            AllocError::Unsupported("the strategy cannot hold arrays")
        );
        let padding = array_padding::<V>();
        let size = count
            .checked_mul(size_of::<V>())
            .and_then(|n| n.checked_add(padding))
            .ok_or(AllocError::OutOfMemory {
                requested: usize::MAX,
            })?;
        let align = if padding > 0 {
            align_of::<V>().max(align_of::<usize>())
        } else {
            align_of::<V>()
        };
        let base = self.allocate(size.max(1), align, source)?;
        unsafe {
            let first = base.as_ptr().add(padding).cast::<V>();
            if padding > 0 {
                first.cast::<usize>().sub(1).write(count);
            }
            for i in 0..count {
                first.add(i).write(f(i));
            }
            Ok(NonNull::new_unchecked(first))
        }
    }

    /// Drops every element of the array at `ptr` and frees its memory.
    ///
    /// # Safety
    /// `ptr` must come from [`new_array_with`](Self::new_array_with) on this allocator
    /// and must not be used afterwards.
    pub unsafe fn delete_array<V>(&self, ptr: NonNull<V>) -> Result<(), AllocError> {
        let padding = array_padding::<V>();
        if padding > 0 {
            let count = ptr.as_ptr().cast::<usize>().sub(1).read();
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), count));
        }
        self.free(NonNull::new_unchecked(ptr.as_ptr().cast::<u8>().sub(padding)))
    }
}
