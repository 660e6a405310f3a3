//! The runtime execution lock.
//!
//! All script-visible work is serialized behind one [`RuntimeLock`]. Holding
//! it is witnessed by a [`RuntimeGuard`] token; anything that allocates
//! script-visible values or touches lock-protected state takes the token by
//! reference, so the requirement is checked at compile time.
//!
//! Native calls that can block for an unbounded time hand the lock back for
//! their duration through [`RuntimeGuard::allow_threads`]:
//!
//! ```text
//!   thread A            runtime lock            thread B
//!   ───────────────────────────────────────────────────────
//!   acquire ─────────────► held by A
//!   allow_threads {       released ◄──────────── acquire
//!       blocking read     held by B              script work
//!   }                     released ◄──────────── drop guard
//!   (reacquired) ◄─────── held by A
//! ```
//!
//! # Thread Safety
//!
//! The guard is `!Send`: a window opened on one thread is always closed on
//! the same thread.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Lock-Protected State
// =============================================================================

/// Accounting for script-visible allocations.
///
/// This is the state the runtime lock protects. The object model itself
/// belongs to the embedding runtime; only the counters live here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of script-visible values allocated.
    pub objects: u64,
    /// Payload bytes handed over to those values.
    pub bytes: u64,
}

// =============================================================================
// RuntimeLock
// =============================================================================

/// The single mutual-exclusion lock of the scripting runtime.
pub struct RuntimeLock {
    heap: Mutex<HeapStats>,
    /// Number of allow-threads windows opened so far.
    windows: AtomicU64,
}

impl RuntimeLock {
    /// Create a new, unlocked runtime lock.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(HeapStats::default()),
            windows: AtomicU64::new(0),
        }
    }

    /// Block until the lock is held by the calling thread.
    #[inline]
    pub fn acquire(&self) -> RuntimeGuard<'_> {
        RuntimeGuard {
            lock: self,
            heap: self.heap.lock(),
        }
    }

    /// Acquire the lock only if nobody holds it.
    #[inline]
    pub fn try_acquire(&self) -> Option<RuntimeGuard<'_>> {
        self.heap.try_lock().map(|heap| RuntimeGuard { lock: self, heap })
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut RuntimeGuard<'_>) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    /// Whether some thread currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.heap.is_locked()
    }

    /// Total number of allow-threads windows opened on this lock.
    #[inline]
    pub fn windows_opened(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }
}

impl Default for RuntimeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLock")
            .field("locked", &self.is_locked())
            .field("windows", &self.windows_opened())
            .finish()
    }
}

// =============================================================================
// RuntimeGuard
// =============================================================================

/// Proof that the current thread holds the runtime lock.
pub struct RuntimeGuard<'a> {
    lock: &'a RuntimeLock,
    heap: MutexGuard<'a, HeapStats>,
}

impl<'a> RuntimeGuard<'a> {
    /// The lock this guard holds.
    #[inline]
    pub fn lock(&self) -> &'a RuntimeLock {
        self.lock
    }

    /// Whether this guard holds `lock`.
    #[inline]
    pub fn guards(&self, lock: &RuntimeLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }

    /// Release the lock while `f` runs, then take it back.
    ///
    /// Waiting threads get a fair hand-off. The lock is reacquired on every
    /// exit path of `f`, unwinding included, before this returns.
    pub fn allow_threads<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.windows.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("runtime lock released for a blocking call");
        MutexGuard::unlocked_fair(&mut self.heap, f)
    }

    /// Snapshot of the lock-protected allocation counters.
    #[inline]
    pub fn heap_stats(&self) -> HeapStats {
        *self.heap
    }

    /// Account for a script-visible allocation of `bytes` payload bytes.
    #[inline]
    pub(crate) fn record_allocation(&mut self, bytes: usize) {
        self.heap.objects += 1;
        self.heap.bytes += bytes as u64;
    }
}

impl fmt::Debug for RuntimeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeGuard")
            .field("heap", &*self.heap)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_marks_locked() {
        let lock = RuntimeLock::new();
        assert!(!lock.is_locked());
        let guard = lock.acquire();
        assert!(lock.is_locked());
        assert!(guard.guards(&lock));
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_acquire_fails_while_held() {
        let lock = RuntimeLock::new();
        let _guard = lock.acquire();
        assert!(lock.try_acquire().is_none());
    }

    #[test]
    fn test_guards_other_lock() {
        let a = RuntimeLock::new();
        let b = RuntimeLock::new();
        let guard = a.acquire();
        assert!(!guard.guards(&b));
    }

    #[test]
    fn test_allow_threads_releases_and_reacquires() {
        let lock = RuntimeLock::new();
        let mut guard = lock.acquire();

        let inside = guard.allow_threads(|| lock.try_acquire().is_some());
        assert!(inside);
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        assert_eq!(lock.windows_opened(), 1);
    }

    #[test]
    fn test_allow_threads_lets_other_thread_run() {
        let lock = Arc::new(RuntimeLock::new());
        let (tx, rx) = mpsc::channel();

        let mut guard = lock.acquire();
        let other = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let mut g = other.acquire();
            g.record_allocation(3);
            tx.send(()).unwrap();
        });

        // The spawned thread can only finish while the lock is handed back.
        let got = guard.allow_threads(|| rx.recv_timeout(Duration::from_secs(5)));
        assert!(got.is_ok());
        handle.join().unwrap();
        assert_eq!(guard.heap_stats().objects, 1);
        assert_eq!(guard.heap_stats().bytes, 3);
    }

    #[test]
    fn test_allow_threads_reacquires_after_panic() {
        let lock = RuntimeLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = lock.acquire();
            guard.allow_threads(|| panic!("native call failed"));
        }));
        assert!(result.is_err());
        // Guard dropped during unwinding after the window was closed.
        assert!(!lock.is_locked());
        assert_eq!(lock.windows_opened(), 1);
    }

    #[test]
    fn test_with_runs_under_lock() {
        let lock = RuntimeLock::new();
        let locked = lock.with(|g| g.lock().is_locked());
        assert!(locked);
        assert!(!lock.is_locked());
    }
}
