//! Reference implementation of the native stream contracts.
//!
//! [`StreamTable`] issues [`StreamRef`]s for files, memory windows and
//! adapted raw handles, remembers how each stream came to be, and serves the
//! primitive operations on them.
//!
//! # Locking
//!
//! The table lock is held only to look a stream up. Each stream has its own
//! lock for the duration of an operation, so blocking I/O on one stream never
//! holds up another.

use super::{
    FileStream, MemoryAdapter, MemoryReader, MemoryStream, NativeStream, RawHandle,
    RawHandleAdapter, RawStream, StreamRef, StreamService, Whence,
};
use crate::config::StreamConfig;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a registered stream came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Opened by path or over memory; released with `close_created`.
    Created,
    /// Adaptation of a raw handle; released with `teardown_adapted`.
    Adapted,
}

type SharedStream = Arc<Mutex<Box<dyn NativeStream>>>;

struct Entry {
    origin: Origin,
    stream: SharedStream,
}

/// Counters describing the table's history.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Streams registered (created and adapted).
    pub opened: u64,
    /// `close_created` calls that released a stream.
    pub closed: u64,
    /// `teardown_adapted` calls that released a stream.
    pub torn_down: u64,
    /// Streams currently registered.
    pub live: usize,
}

impl TableStats {
    /// Total successful release calls of either kind.
    #[inline]
    pub fn releases(&self) -> u64 {
        self.closed + self.torn_down
    }
}

/// Registry of native streams.
pub struct StreamTable {
    config: StreamConfig,
    memory: Option<Arc<dyn MemoryReader>>,
    entries: Mutex<FxHashMap<StreamRef, Entry>>,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    torn_down: AtomicU64,
}

impl StreamTable {
    /// Create an empty table without process memory access.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            memory: None,
            entries: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            torn_down: AtomicU64::new(0),
        }
    }

    /// Serve memory streams from `reader`.
    pub fn with_memory(mut self, reader: Arc<dyn MemoryReader>) -> Self {
        self.memory = Some(reader);
        self
    }

    #[inline]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register a caller-built stream. It is released with `close_created`.
    pub fn register(&self, stream: Box<dyn NativeStream>) -> StreamRef {
        self.insert(Origin::Created, stream)
    }

    /// Whether `stream` is currently registered.
    pub fn is_live(&self, stream: StreamRef) -> bool {
        self.entries.lock().contains_key(&stream)
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            torn_down: self.torn_down.load(Ordering::Relaxed),
            live: self.entries.lock().len(),
        }
    }

    fn insert(&self, origin: Origin, stream: Box<dyn NativeStream>) -> StreamRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Ids start at 1 and a u64 counter does not wrap in practice.
        let stream_ref = StreamRef::from_raw(id).unwrap_or(StreamRef::new(std::num::NonZeroU64::MIN));
        let entry = Entry {
            origin,
            stream: Arc::new(Mutex::new(stream)),
        };
        self.entries.lock().insert(stream_ref, entry);
        self.opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream = %stream_ref, ?origin, "stream registered");
        stream_ref
    }

    /// Unregister `stream` if it has the expected origin.
    fn release(&self, stream: StreamRef, expected: Origin) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&stream).map(|e| e.origin) {
            Some(origin) if origin == expected => {
                entries.remove(&stream);
                true
            }
            Some(origin) => {
                tracing::warn!(
                    stream = %stream,
                    ?origin,
                    ?expected,
                    "release refused: stream has a different origin"
                );
                false
            }
            None => {
                tracing::warn!(stream = %stream, "release of unknown stream ignored");
                false
            }
        }
    }

    fn with_stream<R>(&self, stream: StreamRef, f: impl FnOnce(&mut dyn NativeStream) -> R) -> Option<R> {
        let shared = self.entries.lock().get(&stream).map(|e| Arc::clone(&e.stream))?;
        let mut guard = shared.lock();
        Some(f(guard.as_mut()))
    }
}

// =============================================================================
// Composite Reads
// =============================================================================

fn next_byte(stream: &mut dyn NativeStream) -> Option<u8> {
    let mut byte = [0u8; 1];
    (stream.read(&mut byte) == 1).then_some(byte[0])
}

fn read_line_into(stream: &mut dyn NativeStream, buf: &mut [u8]) -> bool {
    let Some(limit) = buf.len().checked_sub(1) else {
        return false;
    };
    let mut n = 0;
    while n < limit {
        let Some(b) = next_byte(stream) else { break };
        buf[n] = b;
        n += 1;
        if b == b'\n' {
            break;
        }
    }
    buf[n] = 0;
    n > 0
}

fn read_cstring_into(stream: &mut dyn NativeStream, pos: i64, buf: &mut [u8]) -> bool {
    let Some(limit) = buf.len().checked_sub(1) else {
        return false;
    };
    buf[0] = 0;
    if pos != -1 && stream.seek(pos, Whence::Set) < 0 {
        return false;
    }
    // A lone terminator still reads as an empty string.
    let mut consumed = false;
    let mut n = 0;
    while n < limit {
        let Some(b) = next_byte(stream) else { break };
        consumed = true;
        if b == 0 {
            break;
        }
        buf[n] = b;
        n += 1;
    }
    buf[n] = 0;
    consumed
}

fn read_swapped_into(stream: &mut dyn NativeStream, buf: &mut [u8], big_endian: bool) -> isize {
    let n = stream.read(buf);
    if n < 0 {
        return n;
    }
    let foreign = big_endian != cfg!(target_endian = "big");
    if foreign && n as usize == buf.len() && matches!(buf.len(), 2 | 4 | 8) {
        buf.reverse();
    }
    n
}

// =============================================================================
// Contracts
// =============================================================================

impl StreamService for StreamTable {
    fn open_by_path(&self, path: &str, remote: bool) -> Option<StreamRef> {
        let resolved = if remote {
            match self.config.resolve_remote(path) {
                Some(p) => p,
                None => {
                    tracing::debug!(path, "remote open without a remote root");
                    return None;
                }
            }
        } else {
            path.into()
        };
        match FileStream::open(&resolved) {
            Ok(file) => Some(self.insert(Origin::Created, Box::new(file))),
            Err(error) => {
                tracing::debug!(path = %resolved.display(), %error, "open failed");
                None
            }
        }
    }

    fn close_created(&self, stream: StreamRef) {
        if self.release(stream, Origin::Created) {
            self.closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stream = %stream, "stream closed");
        }
    }

    fn teardown_adapted(&self, stream: StreamRef) {
        if self.release(stream, Origin::Adapted) {
            self.torn_down.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stream = %stream, "adapted stream torn down");
        }
    }

    fn seek(&self, stream: StreamRef, offset: i64, whence: Whence) -> i64 {
        self.with_stream(stream, |s| s.seek(offset, whence)).unwrap_or(-1)
    }

    fn tell(&self, stream: StreamRef) -> i64 {
        self.with_stream(stream, |s| s.tell()).unwrap_or(-1)
    }

    fn size(&self, stream: StreamRef) -> i64 {
        self.with_stream(stream, |s| s.size()).unwrap_or(-1)
    }

    fn read_bytes(&self, stream: StreamRef, buf: &mut [u8]) -> isize {
        self.with_stream(stream, |s| s.read(buf)).unwrap_or(-1)
    }

    fn read_line(&self, stream: StreamRef, buf: &mut [u8]) -> bool {
        self.with_stream(stream, |s| read_line_into(s, buf)).unwrap_or(false)
    }

    fn read_cstring(&self, stream: StreamRef, pos: i64, buf: &mut [u8]) -> bool {
        if let Some(first) = buf.first_mut() {
            *first = 0;
        }
        self.with_stream(stream, |s| read_cstring_into(s, pos, buf))
            .unwrap_or(false)
    }

    fn read_byte(&self, stream: StreamRef) -> Option<u8> {
        self.with_stream(stream, next_byte).flatten()
    }

    fn read_swapped(&self, stream: StreamRef, buf: &mut [u8], big_endian: bool) -> isize {
        self.with_stream(stream, |s| read_swapped_into(s, buf, big_endian))
            .unwrap_or(-1)
    }
}

impl MemoryAdapter for StreamTable {
    fn create_memory_stream(&self, start: u64, size_hint: u64) -> Option<StreamRef> {
        let Some(reader) = self.memory.as_ref() else {
            tracing::debug!(start, "no memory reader configured");
            return None;
        };
        let stream = MemoryStream::new(Arc::clone(reader), start, size_hint)?;
        Some(self.insert(Origin::Created, Box::new(stream)))
    }
}

impl RawHandleAdapter for StreamTable {
    fn adapt_raw_handle(&self, raw: &RawHandle) -> Option<StreamRef> {
        match raw.file().metadata() {
            Ok(meta) if !meta.is_dir() => {}
            Ok(_) => return None,
            Err(error) => {
                tracing::debug!(%error, "raw handle cannot be adapted");
                return None;
            }
        }
        Some(self.insert(Origin::Adapted, Box::new(RawStream::new(raw.share()))))
    }
}

impl fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTable")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::SegmentMemory;
    use std::fs::File;
    use tempfile::NamedTempFile;

    fn temp_with(contents: &[u8]) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), contents).unwrap();
        tmp
    }

    fn open(table: &StreamTable, tmp: &NamedTempFile) -> StreamRef {
        table
            .open_by_path(tmp.path().to_str().unwrap(), false)
            .unwrap()
    }

    // -------------------------------------------------------------------------
    // Registration & Release
    // -------------------------------------------------------------------------

    #[test]
    fn test_open_close_counts() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"data");
        let s = open(&table, &tmp);
        assert!(table.is_live(s));
        table.close_created(s);
        assert!(!table.is_live(s));
        let stats = table.stats();
        assert_eq!((stats.opened, stats.closed, stats.live), (1, 1, 0));
    }

    #[test]
    fn test_open_missing() {
        let table = StreamTable::new(StreamConfig::default());
        assert!(table.open_by_path("/nonexistent/file", false).is_none());
        assert_eq!(table.stats().opened, 0);
    }

    #[test]
    fn test_remote_open_requires_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.bin"), b"remote").unwrap();

        let local = StreamTable::new(StreamConfig::default());
        assert!(local.open_by_path("sample.bin", true).is_none());

        let remote = StreamTable::new(StreamConfig::default().with_remote_root(dir.path()));
        let s = remote.open_by_path("/sample.bin", true).unwrap();
        assert_eq!(remote.size(s), 6);
    }

    #[test]
    fn test_mismatched_release_refused() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"data");
        let s = open(&table, &tmp);
        table.teardown_adapted(s);
        assert!(table.is_live(s));
        assert_eq!(table.stats().releases(), 0);
    }

    #[test]
    fn test_double_close_counts_once() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"data");
        let s = open(&table, &tmp);
        table.close_created(s);
        table.close_created(s);
        assert_eq!(table.stats().closed, 1);
    }

    #[test]
    fn test_adapt_and_teardown_keeps_raw_open() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"raw bytes");
        let raw = RawHandle::new(File::open(tmp.path()).unwrap());
        let s = table.adapt_raw_handle(&raw).unwrap();
        assert_eq!(raw.holders(), 2);
        table.close_created(s);
        assert!(table.is_live(s));
        table.teardown_adapted(s);
        assert_eq!(raw.holders(), 1);
        assert_eq!(table.stats().torn_down, 1);
        assert!(raw.file().metadata().is_ok());
    }

    // -------------------------------------------------------------------------
    // Primitive Reads
    // -------------------------------------------------------------------------

    #[test]
    fn test_unknown_stream_reports_failure() {
        let table = StreamTable::new(StreamConfig::default());
        let ghost = StreamRef::from_raw(99).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(table.seek(ghost, 0, Whence::Set), -1);
        assert_eq!(table.read_bytes(ghost, &mut buf), -1);
        assert!(!table.read_line(ghost, &mut buf));
        assert_eq!(table.read_byte(ghost), None);
    }

    #[test]
    fn test_read_line_like_fgets() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"first\nsecond line\nx");
        let s = open(&table, &tmp);

        let mut buf = [0u8; 64];
        assert!(table.read_line(s, &mut buf));
        assert_eq!(&buf[..7], b"first\n\0");

        let mut small = [0u8; 4];
        assert!(table.read_line(s, &mut small));
        assert_eq!(&small, b"sec\0");

        assert!(table.read_line(s, &mut buf));
        assert_eq!(&buf[..9], b"ond line\n");
        assert!(table.read_line(s, &mut buf));
        assert_eq!(&buf[..2], b"x\0");
        assert!(!table.read_line(s, &mut buf));
    }

    #[test]
    fn test_read_cstring_with_and_without_seek() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"alpha\0beta\0");
        let s = open(&table, &tmp);

        let mut buf = [0xffu8; 16];
        assert!(table.read_cstring(s, 6, &mut buf));
        assert_eq!(&buf[..5], b"beta\0");

        assert!(table.read_cstring(s, 0, &mut buf));
        assert_eq!(&buf[..6], b"alpha\0");
        // Position continues after the terminator.
        assert!(table.read_cstring(s, -1, &mut buf));
        assert_eq!(&buf[..5], b"beta\0");
        assert!(!table.read_cstring(s, -1, &mut buf));
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_read_cstring_failures() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"\0x");
        let s = open(&table, &tmp);

        let mut buf = [0xffu8; 8];
        // An empty string is still a string.
        assert!(table.read_cstring(s, -1, &mut buf));
        assert_eq!(buf[0], 0);
        assert!(!table.read_cstring(s, -5, &mut buf));
        assert!(!table.read_cstring(s, 0, &mut []));

        let ghost = StreamRef::from_raw(99).unwrap();
        assert!(!table.read_cstring(ghost, 0, &mut buf));
    }

    #[test]
    fn test_read_cstring_bounded() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(b"abcdefgh");
        let s = open(&table, &tmp);
        let mut buf = [0xffu8; 4];
        assert!(table.read_cstring(s, -1, &mut buf));
        assert_eq!(&buf, b"abc\0");
    }

    #[test]
    fn test_read_swapped() {
        let table = StreamTable::new(StreamConfig::default());
        let tmp = temp_with(&[0x12, 0x34, 0x56, 0x78, 0x9a]);
        let s = open(&table, &tmp);

        let mut word = [0u8; 4];
        assert_eq!(table.read_swapped(s, &mut word, true), 4);
        assert_eq!(u32::from_ne_bytes(word), 0x1234_5678);

        table.seek(s, 0, Whence::Set);
        assert_eq!(table.read_swapped(s, &mut word, false), 4);
        assert_eq!(u32::from_ne_bytes(word), 0x7856_3412);

        // Odd sizes are never swapped.
        table.seek(s, 0, Whence::Set);
        let mut three = [0u8; 3];
        assert_eq!(table.read_swapped(s, &mut three, true), 3);
        assert_eq!(three, [0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_memory_stream_requires_reader() {
        let table = StreamTable::new(StreamConfig::default());
        assert!(table.create_memory_stream(0x1000, 0).is_none());

        let mem = Arc::new(SegmentMemory::new());
        mem.map(0x1000, vec![7u8; 32]);
        let table = StreamTable::new(StreamConfig::default()).with_memory(mem);
        let s = table.create_memory_stream(0x1000, 0).unwrap();
        assert_eq!(table.size(s), 32);
        assert_eq!(table.read_byte(s), Some(7));
    }
}
