//! Seekable input-stream handles for an embedded scripting runtime.
//!
//! This crate provides:
//! - The stream handle and its ownership state machine ([`LoaderInput`])
//! - Borrow-checked non-owning views ([`InputView`])
//! - Contracts for the native collaborators, bundled in a [`Host`]
//! - Reference collaborators over files, raw handles and process memory
//! - The script-facing method table ([`binding`])

pub mod binding;
pub mod config;
pub mod error;
pub mod loader_input;
pub mod native;

// Re-export commonly used items
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use loader_input::{InputView, LoaderInput, OwnershipKind, STREAM_CAPSULE_TAG};
pub use native::{
    AddressSpace, AddressSpaceLoader, Host, MemoryAdapter, MemoryReader, NativeStream, RawHandle,
    RawHandleAdapter, SegmentMemory, StreamRef, StreamService, StreamTable, TableStats, Whence,
};

// Re-export the runtime side for convenience
pub use linput_runtime::{RuntimeGuard, RuntimeLock, Value};
