//! Engine error types.

use std::io;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A message variant the terminal writer cannot serialize
    #[error("message type not writable: {0}")]
    BadMessageType(&'static str),

    /// Length field width outside {1, 2, 4, 8}
    #[error("unsupported length field width: {0} (expected 1, 2, 4 or 8)")]
    UnsupportedLengthWidth(usize),

    /// Negative adjustment larger than the length field end offset
    #[error("length adjustment {adjustment} exceeds length field end offset {field_end}")]
    BadLengthAdjustment { adjustment: i64, field_end: usize },

    /// Delimiter decoders reject empty delimiters at construction
    #[error("delimiter must not be empty")]
    EmptyDelimiter,

    /// Synchronous name resolution produced no usable address
    #[error("address did not resolve: {0}")]
    Resolve(String),

    /// Event-loop pools need at least one loop
    #[error("pool size must be nonzero")]
    EmptyPool,

    /// Downward call addressed a session id with no live registration
    #[error("session {0} is not registered")]
    UnknownSession(u32),

    /// The engine's loops stopped before the operation completed
    #[error("engine loops are not running")]
    NotRunning,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
