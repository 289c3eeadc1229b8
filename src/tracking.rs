//! Allocation accounting.
//!
//! A [`Tracker`] sees every allocation and deallocation the facade performs.
//! [`CountingTracker`] keeps the live count and byte total that leak detection
//! relies on, [`CsvTracker`] additionally writes one CSV row per event and a
//! summary when the allocator is dropped.

use core::fmt;
use core::panic::Location;
use core::ptr::NonNull;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use tracing::{error, warn};

/// Where an allocation was requested from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceInfo {
    pub file: &'static str,
    pub line: u32,
}

impl SourceInfo {
    pub const UNKNOWN: SourceInfo = SourceInfo { file: "", line: 0 };

    #[inline]
    pub const fn new(file: &'static str, line: u32) -> Self {
        SourceInfo { file, line }
    }

    /// The location of the caller.
    #[track_caller]
    #[inline]
    pub fn here() -> Self {
        let location = Location::caller();
        SourceInfo {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl Default for SourceInfo {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Expands to the [`SourceInfo`] of the invocation.
#[macro_export]
macro_rules! source_info {
    () => {
        $crate::SourceInfo::new(file!(), line!())
    };
}

/// A snapshot of an allocator's memory usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    /// Allocations not freed yet.
    pub live_allocations: usize,
    /// Payload bytes of the live allocations.
    pub allocated_size: usize,
    /// Bytes the strategy hands out, including headers, guards and padding.
    pub used_size: usize,
    pub physical_size: usize,
    pub virtual_size: usize,
}

impl Usage {
    /// Committed bytes not handed out.
    #[inline]
    pub fn wasted_size(&self) -> usize {
        self.physical_size.saturating_sub(self.used_size)
    }
}

pub trait Tracker: Default {
    fn on_allocation(&mut self, ptr: NonNull<u8>, size: usize, align: usize, source: SourceInfo);

    /// `size` is `None` when the allocator stores no header to read it from.
    fn on_deallocation(&mut self, ptr: NonNull<u8>, size: Option<usize>);

    fn reset(&mut self);

    fn live_allocations(&self) -> usize;

    fn allocated_size(&self) -> usize;

    fn on_shutdown(&mut self, _usage: &Usage) {}
}

/// Tracks nothing, leaks go unnoticed.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoTracking;

impl Tracker for NoTracking {
    #[inline(always)]
    fn on_allocation(
        &mut self,
        _ptr: NonNull<u8>,
        _size: usize,
        _align: usize,
        _source: SourceInfo,
    ) {
    }

    #[inline(always)]
    fn on_deallocation(&mut self, _ptr: NonNull<u8>, _size: Option<usize>) {}

    #[inline(always)]
    fn reset(&mut self) {}

    #[inline(always)]
    fn live_allocations(&self) -> usize {
        0
    }

    #[inline(always)]
    fn allocated_size(&self) -> usize {
        0
    }
}

/// Counts live allocations and their payload bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CountingTracker {
    live: usize,
    bytes: usize,
}

impl Tracker for CountingTracker {
    #[inline]
    fn on_allocation(
        &mut self,
        _ptr: NonNull<u8>,
        size: usize,
        _align: usize,
        _source: SourceInfo,
    ) {
        self.live += 1;
        self.bytes += size;
    }

    #[inline]
    fn on_deallocation(&mut self, ptr: NonNull<u8>, size: Option<usize>) {
        let bytes = size.unwrap_or(0);
        if self.live == 0 || self.bytes < bytes {
            error!(
                ptr = ptr.as_ptr() as usize,
                live = self.live,
                bytes = self.bytes,
                "Deallocation without a matching live allocation."
            );
            return;
        }
        self.live -= 1;
        self.bytes -= bytes;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    fn live_allocations(&self) -> usize {
        self.live
    }

    #[inline]
    fn allocated_size(&self) -> usize {
        self.bytes
    }
}

const CSV_HEADER: &str = "Time(ms),Type,Pointer,Size,Alignment,File,Line";
const SUMMARY_HEADER: &str = "Live allocations,Allocated bytes,Virtual size,Physical size,\
                              Used bytes,Wasted bytes,Total time (ms)";

/// Counts like [`CountingTracker`] and writes every event as a CSV row to `W`.
///
/// The first failed write is reported with [`warn!`] and stops all further output,
/// counting goes on.
#[derive(Debug)]
pub struct CsvTracker<W: Write = BufWriter<File>> {
    counts: CountingTracker,
    sink: Option<W>,
    start: Instant,
}

impl<W: Write> Default for CsvTracker<W> {
    /// A tracker without a sink, it only counts.
    fn default() -> Self {
        CsvTracker {
            counts: CountingTracker::default(),
            sink: None,
            start: Instant::now(),
        }
    }
}

impl CsvTracker<BufWriter<File>> {
    /// Creates (or truncates) the file at `path` and writes the CSV header to it.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }

    /// Writes to `<name>.csv` in the working directory.
    pub fn for_name(name: &str) -> io::Result<Self> {
        Self::create(format!("{name}.csv"))
    }
}

impl<W: Write> CsvTracker<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        writeln!(writer, "{CSV_HEADER}")?;
        Ok(CsvTracker {
            counts: CountingTracker::default(),
            sink: Some(writer),
            start: Instant::now(),
        })
    }

    #[inline]
    fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Runs `write` against the sink, dropping the sink on failure.
    fn emit(&mut self, write: impl FnOnce(&mut W) -> io::Result<()>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(err) = write(sink) {
            warn!(%err, "Failed to write allocation trace, disabling it.");
            self.sink = None;
        }
    }
}

impl<W: Write> Tracker for CsvTracker<W> {
    fn on_allocation(&mut self, ptr: NonNull<u8>, size: usize, align: usize, source: SourceInfo) {
        self.counts.on_allocation(ptr, size, align, source);
        let ms = self.elapsed_ms();
        self.emit(|w| {
            writeln!(
                w,
                "{ms},Allocation,{:#x},{size},{align},{},{}",
                ptr.as_ptr() as usize,
                source.file,
                source.line
            )
        });
    }

    fn on_deallocation(&mut self, ptr: NonNull<u8>, size: Option<usize>) {
        self.counts.on_deallocation(ptr, size);
        let ms = self.elapsed_ms();
        self.emit(|w| {
            write!(w, "{ms},Deallocation,{:#x},", ptr.as_ptr() as usize)?;
            if let Some(size) = size {
                write!(w, "{size}")?;
            }
            writeln!(w, ",,,")
        });
    }

    fn reset(&mut self) {
        self.counts.reset();
    }

    fn live_allocations(&self) -> usize {
        self.counts.live_allocations()
    }

    fn allocated_size(&self) -> usize {
        self.counts.allocated_size()
    }

    fn on_shutdown(&mut self, usage: &Usage) {
        let ms = self.elapsed_ms();
        let usage = *usage;
        self.emit(|w| {
            writeln!(w)?;
            writeln!(w, "{SUMMARY_HEADER}")?;
            writeln!(
                w,
                "{},{},{},{},{},{},{ms}",
                usage.live_allocations,
                usage.allocated_size,
                usage.virtual_size,
                usage.physical_size,
                usage.used_size,
                usage.wasted_size()
            )?;
            w.flush()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).unwrap()
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_source_info() {
        let here = SourceInfo::here();
        assert!(here.file.ends_with("tracking.rs"));
        let line = line!();
        let info = source_info!();
        assert_eq!(info.line, line + 1);
        assert_eq!(SourceInfo::default(), SourceInfo::UNKNOWN);
    }

    #[test]
    fn test_counting() {
        let mut tracker = CountingTracker::default();
        tracker.on_allocation(ptr(0x10), 24, 8, SourceInfo::UNKNOWN);
        tracker.on_allocation(ptr(0x40), 8, 8, SourceInfo::UNKNOWN);
        assert_eq!(tracker.live_allocations(), 2);
        assert_eq!(tracker.allocated_size(), 32);
        tracker.on_deallocation(ptr(0x10), Some(24));
        tracker.on_deallocation(ptr(0x40), None);
        assert_eq!(tracker.live_allocations(), 0);
        assert_eq!(tracker.allocated_size(), 8);
        tracker.reset();
        assert_eq!(tracker, CountingTracker::default());
    }

    #[test]
    fn test_counting_unmatched() {
        let mut tracker = CountingTracker::default();
        tracker.on_deallocation(ptr(0x10), Some(24));
        assert_eq!(tracker, CountingTracker::default());

        tracker.on_allocation(ptr(0x10), 24, 8, SourceInfo::UNKNOWN);
        tracker.on_allocation(ptr(0x40), 8, 8, SourceInfo::UNKNOWN);
        tracker.on_deallocation(ptr(0x10), Some(24));
        tracker.on_deallocation(ptr(0x10), Some(24));
        assert_eq!(tracker.live_allocations(), 1);
        assert_eq!(tracker.allocated_size(), 8);
    }

    #[test]
    fn test_csv() {
        let mut tracker = CsvTracker::new(Vec::new()).unwrap();
        tracker.on_allocation(ptr(0xab0), 24, 16, SourceInfo::new("main.rs", 7));
        tracker.on_deallocation(ptr(0xab0), Some(24));
        tracker.on_shutdown(&Usage {
            live_allocations: 0,
            allocated_size: 0,
            used_size: 10,
            physical_size: 64,
            virtual_size: 128,
        });
        let out = String::from_utf8(tracker.sink.take().unwrap()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].ends_with(",Allocation,0xab0,24,16,main.rs,7"));
        assert!(lines[2].ends_with(",Deallocation,0xab0,24,,,"));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], SUMMARY_HEADER);
        assert!(lines[5].starts_with("0,0,128,64,10,54,"));
    }

    #[test]
    fn test_failing_sink() {
        let mut tracker = CsvTracker::<FailingWriter>::default();
        tracker.sink = Some(FailingWriter);
        tracker.on_allocation(ptr(0x10), 4, 4, SourceInfo::UNKNOWN);
        assert!(tracker.sink.is_none());
        assert_eq!(tracker.live_allocations(), 1);
    }
}
