//! The stream handle handed to scripts.
//!
//! A [`LoaderInput`] holds at most one native stream and remembers who is
//! responsible for releasing it:
//!
//! ```text
//!                 open / open_memory
//!        ┌──────────────────────────────► Owned ──────┐
//!        │            attach                          │
//!   Empty ├──────────────────────────────► Borrowed ──┤ close
//!        │       from_raw_handle (new handle)         │
//!        └──────────────────────────────► Adapted ────┤
//!        ▲                                            │
//!        └────────────────────────────────────────────┘
//! ```
//!
//! `Owned` streams are released with `close_created`, `Adapted` ones with
//! `teardown_adapted`, `Borrowed` ones not at all. Dropping a handle runs the
//! same release exactly once.
//!
//! # Locking
//!
//! Every operation that reaches a native stream takes the runtime guard and
//! releases the runtime lock around the native call. `is_open` and
//! `filename` only read local state and need no guard.
//!
//! # Thread Safety
//!
//! A handle is not synchronized. Distinct handles over distinct streams may
//! be used from different threads at the same time.

use crate::error::{Result, StreamError};
use crate::native::{Host, RawHandle, StreamRef, Whence};
use linput_runtime::{RuntimeGuard, ScratchBuffer, Value};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

/// Capsule tag for native stream references.
pub const STREAM_CAPSULE_TAG: &str = "linput.stream";

/// Display name of memory-backed inputs.
pub const MEMORY_NAME: &str = "<memory>";

/// Extra bytes allocated past string and swapped reads, for natives that
/// write a terminator beyond the requested size.
pub const SCRATCH_GUARD: usize = 5;

/// Who releases the native stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Empty,
    /// Created by this handle.
    Owned(StreamRef),
    /// Attached from elsewhere; never released here.
    Borrowed(StreamRef),
    /// Adapted from a raw handle by this handle.
    Adapted(StreamRef),
}

/// Public view of a handle's ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipKind {
    None,
    Owned,
    Borrowed,
    Adapted,
}

/// A seekable input stream exposed to scripts.
pub struct LoaderInput {
    host: Host,
    ownership: Ownership,
    name: String,
}

impl LoaderInput {
    /// An empty handle.
    pub fn new(host: Host) -> Self {
        Self {
            host,
            ownership: Ownership::Empty,
            name: String::new(),
        }
    }

    /// A handle borrowing `stream`.
    pub fn from_stream(host: Host, stream: StreamRef) -> Self {
        Self {
            name: borrowed_name(stream),
            host,
            ownership: Ownership::Borrowed(stream),
        }
    }

    /// A handle borrowing the stream a capsule points to.
    ///
    /// `None` unless `value` is a capsule tagged [`STREAM_CAPSULE_TAG`].
    pub fn from_capsule(host: Host, value: &Value) -> Option<Self> {
        let address = value.as_capsule()?.address_if(STREAM_CAPSULE_TAG)?;
        Some(Self::from_stream(host, StreamRef::new(address)))
    }

    /// A handle owning an adaptation of `raw`.
    ///
    /// The adaptation is torn down when the handle closes; `raw` itself is
    /// never closed here.
    pub fn from_raw_handle(host: Host, rt: &mut RuntimeGuard<'_>, raw: &RawHandle) -> Option<Self> {
        debug_assert!(rt.guards(host.lock()), "guard belongs to another runtime");
        let stream = rt.allow_threads(|| host.raw().adapt_raw_handle(raw))?;
        tracing::debug!(stream = %stream, "adapted raw handle");
        Some(Self {
            name: format!("<raw handle {:#x}>", raw.identity()),
            host,
            ownership: Ownership::Adapted(stream),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open `path`, closing the current stream first.
    pub fn open(&mut self, rt: &mut RuntimeGuard<'_>, path: &str, remote: bool) -> Result<()> {
        self.close(rt);
        let host = &self.host;
        let stream = rt
            .allow_threads(|| host.streams().open_by_path(path, remote))
            .ok_or_else(|| StreamError::OpenFailed {
                name: path.to_string(),
            })?;
        tracing::debug!(stream = %stream, path, remote, "input opened");
        self.ownership = Ownership::Owned(stream);
        self.name = path.to_string();
        Ok(())
    }

    /// Open a window over process memory at `start`.
    ///
    /// A `size` of zero lets the memory adapter pick the extent. The current
    /// stream is only closed once the new one exists.
    pub fn open_memory(&mut self, rt: &mut RuntimeGuard<'_>, start: u64, size: u64) -> Result<()> {
        let host = &self.host;
        let stream = rt
            .allow_threads(|| host.memory().create_memory_stream(start, size))
            .ok_or(StreamError::MemoryUnavailable { start, size })?;
        self.close(rt);
        tracing::debug!(stream = %stream, start, size, "memory input opened");
        self.ownership = Ownership::Owned(stream);
        self.name = MEMORY_NAME.to_string();
        Ok(())
    }

    /// Borrow `stream`, closing the current stream first.
    pub fn attach(&mut self, rt: &mut RuntimeGuard<'_>, stream: StreamRef) {
        self.close(rt);
        self.ownership = Ownership::Borrowed(stream);
        self.name = borrowed_name(stream);
    }

    /// Release the stream as its ownership requires and return to empty.
    pub fn close(&mut self, rt: &mut RuntimeGuard<'_>) {
        if self.ownership == Ownership::Empty {
            return;
        }
        debug_assert!(rt.guards(self.host.lock()), "guard belongs to another runtime");
        let ownership = std::mem::replace(&mut self.ownership, Ownership::Empty);
        let host = &self.host;
        rt.allow_threads(|| release(host, ownership));
        self.name.clear();
    }

    // =========================================================================
    // State
    // =========================================================================

    #[inline]
    pub fn is_open(&self) -> bool {
        self.ownership != Ownership::Empty
    }

    /// Path, `<memory>`, or a tag naming the native reference.
    #[inline]
    pub fn filename(&self) -> &str {
        &self.name
    }

    /// The native reference, if any.
    #[inline]
    pub fn native_ref(&self) -> Option<StreamRef> {
        match self.ownership {
            Ownership::Empty => None,
            Ownership::Owned(s) | Ownership::Borrowed(s) | Ownership::Adapted(s) => Some(s),
        }
    }

    #[inline]
    pub fn ownership(&self) -> OwnershipKind {
        match self.ownership {
            Ownership::Empty => OwnershipKind::None,
            Ownership::Owned(_) => OwnershipKind::Owned,
            Ownership::Borrowed(_) => OwnershipKind::Borrowed,
            Ownership::Adapted(_) => OwnershipKind::Adapted,
        }
    }

    #[inline]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// A non-owning view that cannot outlive this handle.
    pub fn view(&self) -> InputView<'_> {
        InputView {
            alias: self.clone(),
            _owner: PhantomData,
        }
    }

    /// A capsule carrying the native reference, for handing to scripts.
    pub fn to_capsule(&self, rt: &mut RuntimeGuard<'_>) -> Option<Value> {
        let stream = self.native_ref()?;
        Some(rt.new_capsule(STREAM_CAPSULE_TAG, stream.get()))
    }

    fn stream(&self, rt: &RuntimeGuard<'_>) -> Result<StreamRef> {
        debug_assert!(rt.guards(self.host.lock()), "guard belongs to another runtime");
        self.native_ref().ok_or(StreamError::NotOpened)
    }

    fn scratch(&self, len: usize) -> Option<ScratchBuffer> {
        match ScratchBuffer::acquire(len, self.host.config().max_scratch) {
            Ok(buf) => Some(buf),
            Err(error) => {
                tracing::trace!(%error, "scratch acquisition failed");
                None
            }
        }
    }

    // =========================================================================
    // Positioning
    // =========================================================================

    /// Reposition; returns the new absolute position.
    pub fn seek(&self, rt: &mut RuntimeGuard<'_>, offset: i64, whence: Whence) -> Result<i64> {
        let stream = self.stream(rt)?;
        let streams = self.host.streams();
        Ok(rt.allow_threads(|| streams.seek(stream, offset, whence)))
    }

    pub fn tell(&self, rt: &mut RuntimeGuard<'_>) -> Result<i64> {
        let stream = self.stream(rt)?;
        let streams = self.host.streams();
        Ok(rt.allow_threads(|| streams.tell(stream)))
    }

    /// Total length, or a negative value when unknown.
    pub fn size(&self, rt: &mut RuntimeGuard<'_>) -> Result<i64> {
        let stream = self.stream(rt)?;
        let streams = self.host.streams();
        Ok(rt.allow_threads(|| streams.size(stream)))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Up to `n` bytes; fewer only at end of stream. `None` when nothing
    /// could be read.
    pub fn read(&self, rt: &mut RuntimeGuard<'_>, n: usize) -> Result<Option<Vec<u8>>> {
        let stream = self.stream(rt)?;
        let Some(mut buf) = self.scratch(n) else {
            return Ok(None);
        };
        let streams = self.host.streams();
        let got = rt.allow_threads(|| streams.read_bytes(stream, &mut buf));
        if got <= 0 {
            return Ok(None);
        }
        Ok(Some(buf[..got as usize].to_vec()))
    }

    /// One line of at most `max_len - 1` bytes, terminator included.
    pub fn read_line(&self, rt: &mut RuntimeGuard<'_>, max_len: usize) -> Result<Option<Vec<u8>>> {
        let stream = self.stream(rt)?;
        let Some(mut buf) = self.scratch(max_len) else {
            return Ok(None);
        };
        let streams = self.host.streams();
        if !rt.allow_threads(|| streams.read_line(stream, &mut buf)) {
            return Ok(None);
        }
        Ok(Some(until_nul(&buf).to_vec()))
    }

    /// A nul-terminated string of at most `max_size - 1` bytes, read after
    /// seeking to `pos` when given. `None` when the seek fails or the stream
    /// is exhausted.
    pub fn read_cstring(
        &self,
        rt: &mut RuntimeGuard<'_>,
        max_size: usize,
        pos: Option<i64>,
    ) -> Result<Option<Vec<u8>>> {
        let stream = self.stream(rt)?;
        let Some(len) = max_size.checked_add(SCRATCH_GUARD) else {
            return Ok(None);
        };
        let Some(mut buf) = self.scratch(len) else {
            return Ok(None);
        };
        let streams = self.host.streams();
        let pos = pos.unwrap_or(-1);
        if !rt.allow_threads(|| streams.read_cstring(stream, pos, &mut buf[..max_size])) {
            return Ok(None);
        }
        Ok(Some(until_nul(&buf).to_vec()))
    }

    /// The next byte, or `None` at end of stream.
    pub fn read_byte(&self, rt: &mut RuntimeGuard<'_>) -> Result<Option<u8>> {
        let stream = self.stream(rt)?;
        let streams = self.host.streams();
        Ok(rt.allow_threads(|| streams.read_byte(stream)))
    }

    /// `n` bytes stored in the given byte order, converted to host order
    /// for 2, 4 and 8 byte reads. `None` on a native read error; a read of
    /// zero bytes is an empty result.
    pub fn read_swapped(
        &self,
        rt: &mut RuntimeGuard<'_>,
        n: usize,
        big_endian: bool,
    ) -> Result<Option<Vec<u8>>> {
        let stream = self.stream(rt)?;
        let Some(mut buf) = n.checked_add(SCRATCH_GUARD).and_then(|len| self.scratch(len)) else {
            return Ok(None);
        };
        let streams = self.host.streams();
        let got = rt.allow_threads(|| streams.read_swapped(stream, &mut buf[..n], big_endian));
        if got < 0 {
            return Ok(None);
        }
        Ok(Some(buf[..got as usize].to_vec()))
    }

    /// Load `file_pos..` into `start..end` of the address space.
    ///
    /// Returns the loader's status unchanged: 1 on success, 0 on a read
    /// error.
    pub fn copy_range_into_address_space(
        &self,
        rt: &mut RuntimeGuard<'_>,
        file_pos: i64,
        start: u64,
        end: u64,
        patchable: bool,
    ) -> Result<i32> {
        let stream = self.stream(rt)?;
        let loader = self.host.loader();
        Ok(rt.allow_threads(|| loader.load_range(stream, file_pos, start, end, patchable)))
    }
}

/// Run the release primitive `ownership` calls for.
fn release(host: &Host, ownership: Ownership) {
    match ownership {
        Ownership::Empty | Ownership::Borrowed(_) => {}
        Ownership::Owned(stream) => host.streams().close_created(stream),
        Ownership::Adapted(stream) => host.streams().teardown_adapted(stream),
    }
}

fn borrowed_name(stream: StreamRef) -> String {
    format!("<stream {}>", stream)
}

fn until_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Copies alias the stream as borrowed; ownership is never duplicated.
///
/// The alias is not tied to the owner's lifetime. Prefer
/// [`LoaderInput::view`] where the borrow checker can see both.
impl Clone for LoaderInput {
    fn clone(&self) -> Self {
        let ownership = match self.ownership {
            Ownership::Empty => Ownership::Empty,
            Ownership::Owned(s) | Ownership::Borrowed(s) | Ownership::Adapted(s) => {
                Ownership::Borrowed(s)
            }
        };
        Self {
            host: self.host.clone(),
            ownership,
            name: self.name.clone(),
        }
    }
}

/// Runs without the runtime lock being released: drop has no guard to hand
/// back. Call [`LoaderInput::close`] first to release outside the lock.
impl Drop for LoaderInput {
    fn drop(&mut self) {
        let ownership = std::mem::replace(&mut self.ownership, Ownership::Empty);
        if matches!(ownership, Ownership::Owned(_) | Ownership::Adapted(_)) {
            tracing::trace!(
                ?ownership,
                name = %self.name,
                "releasing stream on drop without a lock window"
            );
        }
        release(&self.host, ownership);
    }
}

impl fmt::Debug for LoaderInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderInput")
            .field("ownership", &self.ownership)
            .field("name", &self.name)
            .finish()
    }
}

// =============================================================================
// InputView
// =============================================================================

/// Non-owning, read-side view of a [`LoaderInput`].
///
/// Borrows the owner, so the owner cannot be closed, reopened or dropped
/// while the view exists.
pub struct InputView<'a> {
    alias: LoaderInput,
    _owner: PhantomData<&'a LoaderInput>,
}

impl Deref for InputView<'_> {
    type Target = LoaderInput;

    #[inline]
    fn deref(&self) -> &LoaderInput {
        &self.alias
    }
}

impl fmt::Debug for InputView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InputView").field(&self.alias).finish()
    }
}
