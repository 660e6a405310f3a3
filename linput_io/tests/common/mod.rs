//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use linput_io::{
    AddressSpace, Host, RuntimeLock, SegmentMemory, StreamConfig, StreamRef, StreamService,
    StreamTable, Whence,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;

/// Install a fmt subscriber once per test binary; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn temp_with(contents: &[u8]) -> NamedTempFile {
    let tmp = NamedTempFile::new().expect("create temp file");
    std::fs::write(tmp.path(), contents).expect("write temp file");
    tmp
}

pub fn path_of(tmp: &NamedTempFile) -> &str {
    tmp.path().to_str().expect("utf-8 temp path")
}

/// Forwards to a [`StreamTable`] and counts every release request, including
/// ones the table would ignore.
pub struct CountingStreams {
    inner: Arc<StreamTable>,
    close_calls: AtomicU64,
    teardown_calls: AtomicU64,
}

impl CountingStreams {
    pub fn new(inner: Arc<StreamTable>) -> Self {
        Self {
            inner,
            close_calls: AtomicU64::new(0),
            teardown_calls: AtomicU64::new(0),
        }
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> u64 {
        self.teardown_calls.load(Ordering::SeqCst)
    }
}

impl StreamService for CountingStreams {
    fn open_by_path(&self, path: &str, remote: bool) -> Option<StreamRef> {
        self.inner.open_by_path(path, remote)
    }

    fn close_created(&self, stream: StreamRef) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close_created(stream);
    }

    fn teardown_adapted(&self, stream: StreamRef) {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown_adapted(stream);
    }

    fn seek(&self, stream: StreamRef, offset: i64, whence: Whence) -> i64 {
        self.inner.seek(stream, offset, whence)
    }

    fn tell(&self, stream: StreamRef) -> i64 {
        self.inner.tell(stream)
    }

    fn size(&self, stream: StreamRef) -> i64 {
        self.inner.size(stream)
    }

    fn read_bytes(&self, stream: StreamRef, buf: &mut [u8]) -> isize {
        self.inner.read_bytes(stream, buf)
    }

    fn read_line(&self, stream: StreamRef, buf: &mut [u8]) -> bool {
        self.inner.read_line(stream, buf)
    }

    fn read_cstring(&self, stream: StreamRef, pos: i64, buf: &mut [u8]) -> bool {
        self.inner.read_cstring(stream, pos, buf)
    }

    fn read_byte(&self, stream: StreamRef) -> Option<u8> {
        self.inner.read_byte(stream)
    }

    fn read_swapped(&self, stream: StreamRef, buf: &mut [u8], big_endian: bool) -> isize {
        self.inner.read_swapped(stream, buf, big_endian)
    }
}

/// A table-backed host plus handles on its collaborators. Release requests
/// go through [`CountingStreams`].
pub struct Fixture {
    pub host: Host,
    pub lock: Arc<RuntimeLock>,
    pub table: Arc<StreamTable>,
    pub calls: Arc<CountingStreams>,
    pub memory: Arc<SegmentMemory>,
    pub space: Arc<AddressSpace>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        init_tracing();
        let memory = Arc::new(SegmentMemory::new());
        let table = Arc::new(StreamTable::new(config).with_memory(memory.clone()));
        let space = Arc::new(AddressSpace::new(table.clone()));
        let lock = Arc::new(RuntimeLock::new());
        let calls = Arc::new(CountingStreams::new(Arc::clone(&table)));
        let host = Host::new(
            Arc::clone(&lock),
            table.config().clone(),
            calls.clone(),
            table.clone(),
            table.clone(),
            space.clone(),
        );
        Self {
            host,
            lock,
            table,
            calls,
            memory,
            space,
        }
    }
}
