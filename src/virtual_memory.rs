//! A thin layer over the operating system's virtual memory calls.
//!
//! Growable strategies reserve their whole address range up front with [`reserve`]
//! and then [`commit`] and [`decommit`] page-aligned pieces of it as they grow and
//! purge. [`release`] unmaps the range again.

use core::ptr::{null_mut, NonNull};
use std::io;
use std::sync::OnceLock;

use tracing::{error, trace};

use crate::error::AllocError;

fn last_errno() -> AllocError {
    AllocError::VirtualMemory {
        errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

/// Returns the size of a memory page.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// Reserves `size` bytes of address space without backing them with memory.
/// The returned address is page aligned.
pub fn reserve(size: usize) -> Result<NonNull<u8>, AllocError> {
    let ptr = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = last_errno();
        error!(size, %err, "Failed to reserve address space.");
        return Err(err);
    }
    trace!(?ptr, size, "Reserved address space.");
    NonNull::new(ptr.cast()).ok_or(AllocError::VirtualMemory { errno: 0 })
}

/// Makes `[ptr, ptr + size)` readable and writable.
///
/// # Safety
/// The range must be page aligned and lie inside a range returned by [`reserve`].
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
    if size == 0 {
        return Ok(());
    }
    if libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        let err = last_errno();
        error!(?ptr, size, %err, "Failed to commit memory.");
        return Err(err);
    }
    trace!(?ptr, size, "Committed memory.");
    Ok(())
}

/// Gives the physical memory behind `[ptr, ptr + size)` back to the system
/// and makes the range inaccessible again.
///
/// # Safety
/// The range must be page aligned, lie inside a range returned by [`reserve`]
/// and contain no data that is still in use.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
    if size == 0 {
        return Ok(());
    }
    if libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) != 0
        || libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) != 0
    {
        let err = last_errno();
        error!(?ptr, size, %err, "Failed to decommit memory.");
        return Err(err);
    }
    trace!(?ptr, size, "Decommitted memory.");
    Ok(())
}

/// Unmaps a range previously returned by [`reserve`].
///
/// # Safety
/// `ptr` and `size` must describe exactly one reserved range which is not used afterwards.
pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
    if libc::munmap(ptr.as_ptr().cast(), size) != 0 {
        error!(?ptr, size, err = %last_errno(), "Failed to release address space.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(crate::util::is_power_of_two(size));
    }

    #[test]
    fn test_reserve_commit_decommit() {
        let page = page_size();
        let ptr = reserve(4 * page).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        unsafe {
            commit(ptr, 2 * page).unwrap();
            ptr.as_ptr().write_bytes(0xAB, 2 * page);
            assert_eq!(*ptr.as_ptr().add(2 * page - 1), 0xAB);
            decommit(ptr.add(page), page).unwrap();
            commit(ptr.add(page), page).unwrap();
            // Decommitted pages come back zeroed.
            assert_eq!(*ptr.as_ptr().add(page), 0);
            assert_eq!(*ptr.as_ptr(), 0xAB);
            release(ptr, 4 * page);
        }
    }
}
