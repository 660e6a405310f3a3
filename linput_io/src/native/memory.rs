//! Streams over process memory.
//!
//! A [`MemoryReader`] is whatever can copy bytes out of a (possibly remote)
//! address space: a debugger, a core file, a snapshot. [`SegmentMemory`] is
//! the in-process implementation, a sparse set of mapped segments.

use super::{NativeStream, Whence};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Source of process memory.
pub trait MemoryReader: Send + Sync {
    /// Copy memory at `addr` into `buf`, stopping at the first unmapped
    /// byte. Returns the number of bytes copied.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize;

    /// Length of the contiguously mapped memory starting at `addr`; zero if
    /// `addr` itself is unmapped.
    fn mapped_extent(&self, addr: u64) -> u64;
}

// =============================================================================
// SegmentMemory
// =============================================================================

/// Sparse memory image made of mapped segments.
///
/// Segments are keyed by start address and must not overlap; mapping a
/// segment at an existing start replaces it.
#[derive(Debug, Default)]
pub struct SegmentMemory {
    segments: RwLock<BTreeMap<u64, Arc<[u8]>>>,
}

impl SegmentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `start`.
    pub fn map(&self, start: u64, bytes: impl Into<Arc<[u8]>>) {
        self.segments.write().insert(start, bytes.into());
    }

    /// Unmap the segment starting at `start`. Returns whether one existed.
    pub fn unmap(&self, start: u64) -> bool {
        self.segments.write().remove(&start).is_some()
    }

    /// Segment containing `addr` and the offset of `addr` inside it.
    fn locate(segments: &BTreeMap<u64, Arc<[u8]>>, addr: u64) -> Option<(Arc<[u8]>, usize)> {
        let (&start, bytes) = segments.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - start).ok()?;
        (offset < bytes.len()).then(|| (Arc::clone(bytes), offset))
    }
}

impl MemoryReader for SegmentMemory {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize {
        let segments = self.segments.read();
        let mut copied = 0;
        while copied < buf.len() {
            let Some(cur) = addr.checked_add(copied as u64) else {
                break;
            };
            let Some((bytes, offset)) = Self::locate(&segments, cur) else {
                break;
            };
            let n = (bytes.len() - offset).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&bytes[offset..offset + n]);
            copied += n;
        }
        copied
    }

    fn mapped_extent(&self, addr: u64) -> u64 {
        let segments = self.segments.read();
        let mut extent = 0u64;
        loop {
            let Some(cur) = addr.checked_add(extent) else {
                break;
            };
            let Some((bytes, offset)) = Self::locate(&segments, cur) else {
                break;
            };
            extent += (bytes.len() - offset) as u64;
        }
        extent
    }
}

// =============================================================================
// MemoryStream
// =============================================================================

/// A fixed-size window of process memory read through a [`MemoryReader`].
pub struct MemoryStream {
    reader: Arc<dyn MemoryReader>,
    start: u64,
    size: u64,
    pos: u64,
}

impl MemoryStream {
    /// Stream over `start..start + size`. A `size` of zero takes the mapped
    /// extent at `start`; `None` if that is empty too, or if the window
    /// cannot be addressed with signed stream offsets.
    pub fn new(reader: Arc<dyn MemoryReader>, start: u64, size: u64) -> Option<Self> {
        let size = if size == 0 {
            reader.mapped_extent(start)
        } else {
            size
        };
        if size == 0 || i64::try_from(size).is_err() || start.checked_add(size).is_none() {
            return None;
        }
        Some(Self {
            reader,
            start,
            size,
            pos: 0,
        })
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl NativeStream for MemoryStream {
    fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => self.pos as i64,
            Whence::End => self.size as i64,
        };
        match base.checked_add(offset) {
            Some(pos) if pos >= 0 => {
                self.pos = pos as u64;
                pos
            }
            _ => -1,
        }
    }

    fn size(&mut self) -> i64 {
        self.size as i64
    }

    fn read(&mut self, buf: &mut [u8]) -> isize {
        let available = self.size.saturating_sub(self.pos);
        let want = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
        if want == 0 {
            return 0;
        }
        let copied = self.reader.read_memory(self.start + self.pos, &mut buf[..want]);
        if copied == 0 {
            // Inside the window but unreadable.
            return -1;
        }
        self.pos += copied as u64;
        copied as isize
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("start", &format_args!("{:#x}", self.start))
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}
