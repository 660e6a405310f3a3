//! Native collaborators of the stream handle.
//!
//! The handle never touches a file, a memory image or an address space
//! itself. It calls through the contracts defined here:
//!
//! - [`StreamService`]: open/close/seek/read primitives on a [`StreamRef`]
//! - [`MemoryAdapter`]: a stream over a range of process memory
//! - [`RawHandleAdapter`]: a stream over a caller-supplied [`RawHandle`]
//! - [`AddressSpaceLoader`]: copy a stream range into the address space
//!
//! [`Host`] bundles one of each with the runtime lock. The submodules hold
//! the reference implementations: [`StreamTable`] serves the first three,
//! [`AddressSpace`] the last.

mod address_space;
mod memory;
mod stream;
mod table;

pub use address_space::{AddressSpace, LoadedRange};
pub use memory::{MemoryReader, MemoryStream, SegmentMemory};
pub use stream::{FileStream, NativeStream, RawStream};
pub use table::{StreamTable, TableStats};

use crate::config::StreamConfig;
use linput_runtime::RuntimeLock;
use std::fmt;
use std::fs::File;
use std::num::NonZeroU64;
use std::sync::Arc;

// =============================================================================
// Identities
// =============================================================================

/// Opaque reference to a native stream.
///
/// Only the service that issued it can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamRef(NonZeroU64);

impl StreamRef {
    #[inline]
    pub const fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    /// `None` for the null reference.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> NonZeroU64 {
        self.0
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0.get())
    }
}

/// Reference point for [`StreamService::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Whence {
    /// Absolute position.
    Set = 0,
    /// Relative to the current position.
    Current = 1,
    /// Relative to the end of the stream.
    End = 2,
}

impl Whence {
    /// Map the C `SEEK_*` values.
    #[inline]
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Current),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// A platform file handle supplied by the caller.
///
/// The caller keeps ownership: an adapted stream shares the handle (and its
/// file position) but tearing the adaptation down never closes it.
#[derive(Debug, Clone)]
pub struct RawHandle(Arc<File>);

impl RawHandle {
    pub fn new(file: File) -> Self {
        Self(Arc::new(file))
    }

    #[inline]
    pub fn file(&self) -> &File {
        &self.0
    }

    /// Address of the shared handle, for diagnostics.
    #[inline]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Number of live holders, the caller's included.
    #[inline]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub(crate) fn share(&self) -> Arc<File> {
        Arc::clone(&self.0)
    }
}

impl From<File> for RawHandle {
    fn from(file: File) -> Self {
        Self::new(file)
    }
}

// =============================================================================
// Contracts
// =============================================================================

/// Native stream primitives.
///
/// Every call may block. Status conventions follow the C library the
/// contract was modelled on: negative positions and counts report failure.
pub trait StreamService: Send + Sync {
    /// Open `path`; `remote` selects the remote file namespace.
    fn open_by_path(&self, path: &str, remote: bool) -> Option<StreamRef>;

    /// Release a stream created by [`open_by_path`](Self::open_by_path) or a
    /// [`MemoryAdapter`].
    fn close_created(&self, stream: StreamRef);

    /// Dismantle a stream created by a [`RawHandleAdapter`]. The raw handle
    /// itself stays open.
    fn teardown_adapted(&self, stream: StreamRef);

    /// Reposition; returns the new absolute position or `-1`.
    fn seek(&self, stream: StreamRef, offset: i64, whence: Whence) -> i64;

    /// Current absolute position or `-1`.
    fn tell(&self, stream: StreamRef) -> i64;

    /// Total length, or `-1` when unknown.
    fn size(&self, stream: StreamRef) -> i64;

    /// Fill `buf` as far as possible; bytes read, or `-1` on error.
    fn read_bytes(&self, stream: StreamRef, buf: &mut [u8]) -> isize;

    /// Read a line into `buf` as `fgets` would: at most `buf.len() - 1`
    /// bytes, stopping after `\n`, always nul-terminated. `false` when
    /// nothing could be read.
    fn read_line(&self, stream: StreamRef, buf: &mut [u8]) -> bool;

    /// Seek to `pos` unless it is `-1`, then read a nul-terminated string of
    /// at most `buf.len() - 1` bytes into `buf`. `false` when the seek fails
    /// or no byte could be read; `buf` then holds an empty string.
    fn read_cstring(&self, stream: StreamRef, pos: i64, buf: &mut [u8]) -> bool;

    /// One byte, or `None` at end of stream.
    fn read_byte(&self, stream: StreamRef) -> Option<u8>;

    /// Read `buf.len()` bytes stored in the given byte order and convert
    /// 2, 4 and 8 byte quantities to host order. Bytes read, or `-1`.
    fn read_swapped(&self, stream: StreamRef, buf: &mut [u8], big_endian: bool) -> isize;
}

/// Streams over process memory.
pub trait MemoryAdapter: Send + Sync {
    /// Stream over memory starting at `start`. A `size_hint` of zero asks the
    /// adapter to determine the extent itself.
    fn create_memory_stream(&self, start: u64, size_hint: u64) -> Option<StreamRef>;
}

/// Streams over caller-owned platform handles.
pub trait RawHandleAdapter: Send + Sync {
    fn adapt_raw_handle(&self, raw: &RawHandle) -> Option<StreamRef>;
}

/// The "load file range" operation.
pub trait AddressSpaceLoader: Send + Sync {
    /// Copy the stream bytes at `file_pos` into `start..end` and enable that
    /// range. With `patchable`, remember the file offset of every address.
    ///
    /// Returns 1 on success and 0 on a read error.
    fn load_range(&self, stream: StreamRef, file_pos: i64, start: u64, end: u64, patchable: bool)
    -> i32;
}

// =============================================================================
// Host
// =============================================================================

/// Everything a stream handle calls through.
#[derive(Clone)]
pub struct Host {
    lock: Arc<RuntimeLock>,
    config: StreamConfig,
    streams: Arc<dyn StreamService>,
    memory: Arc<dyn MemoryAdapter>,
    raw: Arc<dyn RawHandleAdapter>,
    loader: Arc<dyn AddressSpaceLoader>,
}

impl Host {
    /// Assemble a host from individual collaborators.
    pub fn new(
        lock: Arc<RuntimeLock>,
        config: StreamConfig,
        streams: Arc<dyn StreamService>,
        memory: Arc<dyn MemoryAdapter>,
        raw: Arc<dyn RawHandleAdapter>,
        loader: Arc<dyn AddressSpaceLoader>,
    ) -> Self {
        Self {
            lock,
            config,
            streams,
            memory,
            raw,
            loader,
        }
    }

    /// Host backed by a [`StreamTable`] for every stream contract.
    pub fn with_table(
        lock: Arc<RuntimeLock>,
        table: Arc<StreamTable>,
        loader: Arc<dyn AddressSpaceLoader>,
    ) -> Self {
        let config = table.config().clone();
        Self::new(
            lock,
            config,
            table.clone(),
            table.clone(),
            table,
            loader,
        )
    }

    #[inline]
    pub fn lock(&self) -> &Arc<RuntimeLock> {
        &self.lock
    }

    #[inline]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    #[inline]
    pub fn streams(&self) -> &dyn StreamService {
        &*self.streams
    }

    #[inline]
    pub fn memory(&self) -> &dyn MemoryAdapter {
        &*self.memory
    }

    #[inline]
    pub fn raw(&self) -> &dyn RawHandleAdapter {
        &*self.raw
    }

    #[inline]
    pub fn loader(&self) -> &dyn AddressSpaceLoader {
        &*self.loader
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
