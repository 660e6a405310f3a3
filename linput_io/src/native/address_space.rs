//! In-memory address space fed from streams.
//!
//! [`AddressSpace`] implements the "load file range" operation: bytes are
//! copied out of a stream into an enabled address range, optionally
//! remembering which file offset each address came from so later patches
//! can be written back.

use super::{AddressSpaceLoader, StreamRef, StreamService, Whence};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An enabled range of the address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRange {
    pub start: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
    /// File offset of `start`, kept for patchable loads.
    pub file_pos: Option<i64>,
}

impl LoadedRange {
    #[inline]
    fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Address space populated by [`load_range`](AddressSpaceLoader::load_range).
pub struct AddressSpace {
    streams: Arc<dyn StreamService>,
    ranges: RwLock<BTreeMap<u64, LoadedRange>>,
}

impl AddressSpace {
    pub fn new(streams: Arc<dyn StreamService>) -> Self {
        Self {
            streams,
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Whether `addr` lies in an enabled range.
    pub fn is_enabled(&self, addr: u64) -> bool {
        self.range_of(addr, |_| ()).is_some()
    }

    /// Copy `len` bytes at `addr`, if they lie in one loaded range.
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        self.range_of(addr, |r| {
            let offset = (addr - r.start) as usize;
            r.bytes.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
        })
        .flatten()
    }

    /// File offset `addr` was loaded from, for patchable loads.
    pub fn file_offset(&self, addr: u64) -> Option<i64> {
        self.range_of(addr, |r| r.file_pos.map(|pos| pos + (addr - r.start) as i64))
            .flatten()
    }

    /// Enabled ranges as `(start, end)` pairs, in address order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.read().values().map(|r| (r.start, r.end)).collect()
    }

    fn range_of<R>(&self, addr: u64, f: impl FnOnce(&LoadedRange) -> R) -> Option<R> {
        let ranges = self.ranges.read();
        let (_, range) = ranges.range(..=addr).next_back()?;
        range.contains(addr).then(|| f(range))
    }

    /// Fill `buf` from the stream, tolerating short chunks.
    fn read_full(&self, stream: StreamRef, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.streams.read_bytes(stream, &mut buf[filled..]);
            if n <= 0 {
                break;
            }
            filled += n as usize;
        }
        filled
    }
}

impl AddressSpaceLoader for AddressSpace {
    fn load_range(
        &self,
        stream: StreamRef,
        file_pos: i64,
        start: u64,
        end: u64,
        patchable: bool,
    ) -> i32 {
        let Some(len) = end.checked_sub(start).and_then(|l| usize::try_from(l).ok()) else {
            tracing::warn!(start, end, "inverted address range");
            return 0;
        };
        if self.streams.seek(stream, file_pos, Whence::Set) != file_pos {
            tracing::warn!(stream = %stream, file_pos, "cannot seek to file position");
            return 0;
        }
        let available = self.streams.size(stream).saturating_sub(file_pos);
        if available >= 0 && (len as u64) > available as u64 {
            tracing::warn!(
                stream = %stream,
                file_pos,
                wanted = len,
                available,
                "range extends past end of stream"
            );
            return 0;
        }
        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(len).is_err() {
            tracing::warn!(stream = %stream, wanted = len, "cannot allocate range");
            return 0;
        }
        bytes.resize(len, 0);
        let got = self.read_full(stream, &mut bytes);
        if got < len {
            tracing::warn!(
                stream = %stream,
                file_pos,
                wanted = len,
                got,
                "read error while loading range"
            );
            return 0;
        }

        let mut ranges = self.ranges.write();
        // A new load replaces whatever it overlaps.
        let overlapping: Vec<u64> = ranges
            .values()
            .filter(|r| r.start < end && start < r.end)
            .map(|r| r.start)
            .collect();
        for key in overlapping {
            ranges.remove(&key);
        }
        if len > 0 {
            ranges.insert(
                start,
                LoadedRange {
                    start,
                    end,
                    bytes,
                    file_pos: patchable.then_some(file_pos),
                },
            );
        }
        1
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("ranges", &self.ranges())
            .finish()
    }
}
