//! A strategy forwarding to the C allocator.

use core::mem::size_of;
use core::ptr::NonNull;

use tracing::{debug, instrument, Level};

use super::{GrowableStrategy, Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::align_up;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct MallocHeader {
    raw: usize,
    size: usize,
}

const MALLOC_HEADER_SIZE: usize = size_of::<MallocHeader>();

/// Forwards every request to `libc::malloc` and `libc::free`.
///
/// The only state kept is the number of live bytes, which is capped at the maximum
/// given on construction.
#[derive(Debug)]
pub struct MallocStrategy {
    max_size: usize,
    live_bytes: usize,
    live: usize,
}

impl MallocStrategy {
    pub fn new(max_size: usize) -> Self {
        MallocStrategy {
            max_size,
            live_bytes: 0,
            live: 0,
        }
    }
}

impl Strategy for MallocStrategy {
    fn with_capacity(size: usize, _overhead: Overhead) -> Result<Self, AllocError> {
        Ok(Self::new(size))
    }

    fn with_region(_region: Region, _overhead: Overhead) -> Result<Self, AllocError> {
        Err(AllocError::Unsupported(
            "the malloc strategy cannot manage a given range",
        ))
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
        if self.live_bytes.saturating_add(size) > self.max_size {
            debug!(size, live = self.live_bytes, max = self.max_size, "Maximum size reached.");
            return Err(oom);
        }
        let total = size
            .checked_add(MALLOC_HEADER_SIZE + offset)
            .and_then(|s| s.checked_add(align - 1))
            .ok_or(oom)?;
        let raw = unsafe { libc::malloc(total) } as usize;
        ensure!(raw != 0, oom);

        let block = align_up(raw + MALLOC_HEADER_SIZE + offset, align).ok_or(oom)? - offset;
        unsafe {
            (block as *mut u8)
                .sub(MALLOC_HEADER_SIZE)
                .cast::<MallocHeader>()
                .write_unaligned(MallocHeader { raw, size });
        }
        self.live_bytes += size;
        self.live += 1;
        NonNull::new(block as *mut u8).ok_or(oom)
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        ensure!(
            self.live > 0 && addr > MALLOC_HEADER_SIZE,
            AllocError::ForeignPointer { addr }
        );
        Ok(())
    }

    unsafe fn free(&mut self, block: NonNull<u8>) -> Result<(), AllocError> {
        self.check_free(block)?;
        let header = block
            .as_ptr()
            .sub(MALLOC_HEADER_SIZE)
            .cast::<MallocHeader>()
            .read_unaligned();
        libc::free(header.raw as *mut libc::c_void);
        self.live_bytes -= header.size;
        self.live -= 1;
        Ok(())
    }

    fn reset(&mut self) {}

    fn purge(&mut self) {}

    fn used_size(&self) -> usize {
        self.live_bytes
    }

    fn physical_size(&self) -> usize {
        self.live_bytes
    }

    fn virtual_size(&self) -> usize {
        self.max_size
    }
}

impl GrowableStrategy for MallocStrategy {
    fn growable(
        _start_size: usize,
        max_size: usize,
        _overhead: Overhead,
    ) -> Result<Self, AllocError> {
        Ok(Self::new(max_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::random_no_overlap;

    #[test]
    fn test_1() {
        let mut malloc = MallocStrategy::with_capacity(1000, Overhead::NONE).unwrap();
        let a = malloc.allocate(600, 64, 0).unwrap();
        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert_eq!(malloc.used_size(), 600);
        assert_eq!(
            malloc.allocate(401, 8, 0),
            Err(AllocError::OutOfMemory { requested: 401 })
        );
        let b = malloc.allocate(400, 8, 4).unwrap();
        assert_eq!((b.as_ptr() as usize + 4) % 8, 0);
        unsafe {
            malloc.free(a).unwrap();
            malloc.free(b).unwrap();
        }
        assert_eq!(malloc.used_size(), 0);
        assert_eq!(malloc.virtual_size(), 1000);
    }

    #[test]
    fn test_region_unsupported() {
        let region = Region::heap(64).unwrap();
        assert!(matches!(
            MallocStrategy::with_region(region, Overhead::NONE),
            Err(AllocError::Unsupported(_))
        ));
    }

    #[test]
    fn test_no_overlap() {
        let mut malloc = MallocStrategy::growable(0, 1 << 20, Overhead::NONE).unwrap();
        assert!(random_no_overlap(&mut malloc, 4, 512) > 0);
        assert_eq!(malloc.used_size(), 0);
    }
}
