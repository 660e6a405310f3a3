//! Errors surfaced by stream handles.
//!
//! Only construction and state errors are errors. Running out of data, short
//! reads and scratch allocation failure are ordinary results (`Ok(None)` or a
//! shorter buffer) and never show up here.

use thiserror::Error;

/// Failure of a stream-handle operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The native open call refused the path.
    #[error("cannot open input '{name}'")]
    OpenFailed { name: String },

    /// The memory adapter refused the range.
    #[error("cannot create a memory input at {start:#x} (size {size:#x})")]
    MemoryUnavailable { start: u64, size: u64 },

    /// The handle holds no stream.
    #[error("I/O operation on unopened input")]
    NotOpened,
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_open_failed() {
        let e = StreamError::OpenFailed {
            name: "/missing".to_string(),
        };
        assert_eq!(e.to_string(), "cannot open input '/missing'");
    }

    #[test]
    fn test_display_memory() {
        let e = StreamError::MemoryUnavailable {
            start: 0x1000,
            size: 0,
        };
        assert!(e.to_string().contains("0x1000"));
    }
}
