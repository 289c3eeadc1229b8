//! A bump allocator.

use core::ptr::NonNull;

use tracing::{debug, instrument, Level};

use super::{Overhead, Strategy};
use crate::error::{check_request, ensure, AllocError};
use crate::region::Region;
use crate::util::align_up;

/// Hands out blocks by advancing a cursor through its region.
///
/// Individual frees do nothing, all memory comes back at once on
/// [`reset`](Strategy::reset).
#[derive(Debug)]
pub struct LinearStrategy {
    region: Region,
    cursor: usize,
}

impl Strategy for LinearStrategy {
    fn with_region(region: Region, _overhead: Overhead) -> Result<Self, AllocError> {
        let cursor = region.start();
        Ok(LinearStrategy { region, cursor })
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
        let block = self
            .cursor
            .checked_add(offset)
            .and_then(|p| align_up(p, align))
            .ok_or(oom)?
            - offset;
        let end = block.checked_add(size).ok_or(oom)?;
        if end > self.region.end() {
            debug!(size, free = self.region.end() - self.cursor, "Arena exhausted.");
            return Err(oom);
        }
        self.cursor = end;
        Ok(self.region.ptr(block))
    }

    fn check_free(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        let addr = block.as_ptr() as usize;
        ensure!(
            addr >= self.region.start() && addr < self.cursor,
            AllocError::ForeignPointer { addr }
        );
        Ok(())
    }

    unsafe fn free(&mut self, _block: NonNull<u8>) -> Result<(), AllocError> {
        Ok(())
    }

    fn reset(&mut self) {
        self.cursor = self.region.start();
    }

    fn purge(&mut self) {
        self.reset();
    }

    fn used_size(&self) -> usize {
        self.cursor - self.region.start()
    }

    fn physical_size(&self) -> usize {
        self.region.len()
    }

    fn virtual_size(&self) -> usize {
        self.region.len()
    }
}
