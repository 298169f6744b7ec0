//! Codec errors

use thiserror::Error;

use crate::CommandType;

/// Result type for command encoding and decoding
pub type CodecResult<T> = Result<T, CodecError>;

/// Command codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer too short to hold the type prefix
    #[error("encoded command is {0} bytes, shorter than its type prefix")]
    Truncated(usize),

    /// No decoder registered for the type prefix
    #[error("no decoder registered for command type {0}")]
    UnknownType(CommandType),

    /// A decoder is already registered for the type
    #[error("command type {0} is already registered")]
    DuplicateType(CommandType),

    /// Command body could not be encoded
    #[error("failed to encode command: {0}")]
    Encode(String),

    /// Command body could not be decoded
    #[error("failed to decode command type {command_type}: {reason}")]
    Decode {
        /// Type prefix of the failing command
        command_type: CommandType,
        /// Decoder failure
        reason: String,
    },

    /// Structured error payload is not valid JSON
    #[error("invalid api error payload: {0}")]
    Json(#[from] serde_json::Error),
}
