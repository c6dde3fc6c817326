//! Codec error types.

use thiserror::Error;

/// Errors raised while decoding (or, rarely, encoding) frames.
///
/// Every variant except [`WireError::UnknownDiffBase`] describes a malformed
/// stream. The gateway treats those as protocol violations and closes the
/// connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame length {0} exceeds the 28-bit header limit")]
    FrameTooLarge(usize),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("unknown misc subtype {0}")]
    UnknownSubtype(u8),

    #[error("unknown content type tag {0}")]
    UnknownContentType(u8),

    #[error("unknown channel mode {0}")]
    UnknownChannelMode(u8),

    #[error("name is {0} bytes, max is 255")]
    NameTooLong(usize),

    #[error("name is not valid utf-8")]
    InvalidName,

    #[error("failed to inflate body: {0}")]
    Inflate(String),

    #[error("invalid json payload: {0}")]
    InvalidJson(String),

    #[error("invalid utf-8 string payload")]
    InvalidUtf8,

    #[error("diff for {id} has base {base}, receiver holds {held}")]
    UnknownDiffBase { id: u64, base: u64, held: u64 },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

/// Result alias for codec operations.
pub type WireResult<T> = Result<T, WireError>;
