//! Thread-local scratch buffers for native reads.
//!
//! Native read primitives write into caller-provided memory. A
//! [`ScratchBuffer`] is that memory: acquired for one call, handed back to
//! the pool when it goes out of scope, on every exit path.
//!
//! # Design
//!
//! Each thread keeps a few buffers per size class. Requests larger than the
//! largest class are allocated exactly and freed on drop instead of being
//! pooled. Acquisition never aborts: both an over-ceiling request and a
//! failed reservation come back as [`ScratchError`].
//!
//! # Thread Safety
//!
//! The pool is thread-local, so no synchronization is required.

use std::cell::RefCell;
use std::fmt;
use thiserror::Error;

/// Small buffers for line and string reads (1KB).
pub const SMALL_SCRATCH_SIZE: usize = 1024;

/// General purpose buffers (8KB).
pub const MEDIUM_SCRATCH_SIZE: usize = 8 * 1024;

/// Bulk transfer buffers (64KB).
pub const LARGE_SCRATCH_SIZE: usize = 64 * 1024;

/// Buffers kept per size class and thread.
const MAX_POOLED_BUFFERS: usize = 8;

/// Why a scratch buffer could not be provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScratchError {
    /// The request exceeds the configured ceiling.
    #[error("scratch request of {requested} bytes exceeds ceiling of {ceiling} bytes")]
    OverCeiling { requested: usize, ceiling: usize },
    /// The allocator refused the reservation.
    #[error("cannot allocate {requested} bytes of scratch memory")]
    OutOfMemory { requested: usize },
}

/// Size class of a scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    /// Exact-size allocation, never pooled.
    Oversize,
}

impl SizeClass {
    /// Class serving a request of `len` bytes.
    #[inline]
    pub const fn for_len(len: usize) -> Self {
        if len <= SMALL_SCRATCH_SIZE {
            SizeClass::Small
        } else if len <= MEDIUM_SCRATCH_SIZE {
            SizeClass::Medium
        } else if len <= LARGE_SCRATCH_SIZE {
            SizeClass::Large
        } else {
            SizeClass::Oversize
        }
    }

    /// Backing allocation size for a request of `len` bytes.
    #[inline]
    pub const fn capacity_for(self, len: usize) -> usize {
        match self {
            SizeClass::Small => SMALL_SCRATCH_SIZE,
            SizeClass::Medium => MEDIUM_SCRATCH_SIZE,
            SizeClass::Large => LARGE_SCRATCH_SIZE,
            SizeClass::Oversize => len,
        }
    }
}

// =============================================================================
// ScratchBuffer
// =============================================================================

/// A zero-filled buffer of exactly the requested length.
pub struct ScratchBuffer {
    data: Vec<u8>,
    len: usize,
    class: SizeClass,
}

impl ScratchBuffer {
    /// Acquire `len` zeroed bytes, refusing anything above `ceiling`.
    pub fn acquire(len: usize, ceiling: usize) -> Result<Self, ScratchError> {
        if len > ceiling {
            return Err(ScratchError::OverCeiling {
                requested: len,
                ceiling,
            });
        }
        let class = SizeClass::for_len(len);
        let data = match class {
            SizeClass::Oversize => None,
            _ => SCRATCH_POOL.with(|pool| pool.borrow_mut().take(class)),
        };
        let data = match data {
            Some(data) => data,
            None => allocate_zeroed(class.capacity_for(len))?,
        };
        Ok(Self { data, len, class })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn size_class(&self) -> SizeClass {
        self.class
    }
}

impl std::ops::Deref for ScratchBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl std::ops::DerefMut for ScratchBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if self.class == SizeClass::Oversize {
            return;
        }
        let data = std::mem::take(&mut self.data);
        // `try_with` tolerates drops during thread teardown.
        let _ = SCRATCH_POOL.try_with(|pool| pool.borrow_mut().give_back(data, self.class));
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("len", &self.len)
            .field("class", &self.class)
            .finish()
    }
}

fn allocate_zeroed(size: usize) -> Result<Vec<u8>, ScratchError> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| ScratchError::OutOfMemory { requested: size })?;
    data.resize(size, 0);
    Ok(data)
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Default)]
struct ScratchPool {
    small: Vec<Vec<u8>>,
    medium: Vec<Vec<u8>>,
    large: Vec<Vec<u8>>,
}

impl ScratchPool {
    fn class_mut(&mut self, class: SizeClass) -> Option<&mut Vec<Vec<u8>>> {
        match class {
            SizeClass::Small => Some(&mut self.small),
            SizeClass::Medium => Some(&mut self.medium),
            SizeClass::Large => Some(&mut self.large),
            SizeClass::Oversize => None,
        }
    }

    fn take(&mut self, class: SizeClass) -> Option<Vec<u8>> {
        self.class_mut(class)?.pop()
    }

    fn give_back(&mut self, mut data: Vec<u8>, class: SizeClass) {
        let expected = class.capacity_for(0);
        if let Some(pool) = self.class_mut(class) {
            if pool.len() < MAX_POOLED_BUFFERS && data.len() == expected {
                // Reused buffers must read as zeroed.
                data.fill(0);
                pool.push(data);
            }
        }
    }

    fn pooled_count(&self) -> usize {
        self.small.len() + self.medium.len() + self.large.len()
    }
}

thread_local! {
    static SCRATCH_POOL: RefCell<ScratchPool> = RefCell::new(ScratchPool::default());
}

/// Number of buffers pooled on the current thread.
pub fn pooled_count() -> usize {
    SCRATCH_POOL.with(|pool| pool.borrow().pooled_count())
}

/// Drop every buffer pooled on the current thread.
pub fn clear_pool() {
    SCRATCH_POOL.with(|pool| *pool.borrow_mut() = ScratchPool::default());
}

// =============================================================================
// Tests
// =============================================================================
