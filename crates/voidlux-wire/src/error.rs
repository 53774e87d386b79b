//! Wire codec errors.

use thiserror::Error;

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// The opcode is not in the closed namespace.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// The frame is malformed or truncated.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The frame exceeds the 16 MiB limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The payload failed to (de)serialize.
    #[error("payload codec error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
