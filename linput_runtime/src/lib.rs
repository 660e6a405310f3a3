//! Runtime-side primitives for linput.
//!
//! This crate provides:
//! - The runtime execution lock and its guard token ([`RuntimeLock`], [`RuntimeGuard`])
//! - Scoped release of that lock around blocking native calls
//! - Script-visible values, allocated under the lock ([`Value`], [`Capsule`])
//! - Thread-local scratch buffers for native reads ([`ScratchBuffer`])

pub mod lock;
pub mod scratch;
pub mod value;

pub use lock::{HeapStats, RuntimeGuard, RuntimeLock};
pub use scratch::{ScratchBuffer, ScratchError, SizeClass};
pub use value::{Capsule, Value};
