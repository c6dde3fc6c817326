//! Sync error taxonomy with wire and HTTP mappings.
//!
//! Every error a client can see is a [`SyncError`]. It serialises as
//! `{type, name, message, code, payload?, requestId?|observableId?|channelId?}`
//! so a WebSocket client can route an error frame to what it concerns.

use axum::http::StatusCode;
use bytes::Bytes;
use qs_wire::Payload;
use serde::ser::SerializeMap;
use serde::Serialize;
use serde_json::Value;

use crate::domain::route::RouteKind;

/// Stable numeric error codes
pub mod codes {
    pub const FUNCTION_NOT_FOUND: u16 = 1001;
    pub const FUNCTION_IS_WRONG_TYPE: u16 = 1002;
    pub const FUNCTION_ERROR: u16 = 1003;
    pub const AUTHORIZE_FUNCTION_ERROR: u16 = 1101;
    pub const AUTHORIZE_REJECTED: u16 = 1102;
    pub const PAYLOAD_TOO_LARGE: u16 = 1201;
    pub const CHUNK_TOO_LARGE: u16 = 1202;
    pub const INVALID_PAYLOAD: u16 = 1203;
    pub const UNSUPPORTED_CONTENT_ENCODING: u16 = 1204;
    pub const LENGTH_REQUIRED: u16 = 1205;
    pub const RATE_LIMIT: u16 = 1301;
    pub const NO_BINARY_PROTOCOL: u16 = 1401;
    pub const CANNOT_STREAM_TO_CLIENT: u16 = 1402;
    pub const INTERNAL: u16 = 1500;
}

/// Errors reported to clients.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("function '{name}' not found")]
    FunctionNotFound { name: String },

    #[error("function '{name}' is a {actual} function, not a {expected}")]
    FunctionIsWrongType {
        name: String,
        expected: RouteKind,
        actual: RouteKind,
    },

    #[error("function '{name}' failed: {message}")]
    FunctionError {
        name: String,
        message: String,
        details: Option<Value>,
    },

    #[error("authorize for '{name}' failed: {message}")]
    AuthorizeFunctionError { name: String, message: String },

    #[error("not authorized to access '{name}'")]
    AuthorizeRejectedError { name: String },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("chunk of {size} bytes exceeds the {limit} byte limit")]
    ChunkTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("invalid payload: {message}")]
    InvalidPayload { name: String, message: String },

    #[error("unsupported content encoding '{encoding}'")]
    UnsupportedContentEncoding { encoding: String },

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("text frames are not supported, use the binary protocol")]
    NoBinaryProtocol,

    #[error("content-length is required for '{name}'")]
    LengthRequired { name: String },

    #[error("'{name}' cannot stream over this transport")]
    CannotStreamToClient { name: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::FunctionNotFound { name: name.into() }
    }

    pub fn function(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FunctionError {
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_payload(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Variant name sent as `type`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FunctionNotFound { .. } => "FunctionNotFound",
            Self::FunctionIsWrongType { .. } => "FunctionIsWrongType",
            Self::FunctionError { .. } => "FunctionError",
            Self::AuthorizeFunctionError { .. } => "AuthorizeFunctionError",
            Self::AuthorizeRejectedError { .. } => "AuthorizeRejectedError",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::ChunkTooLarge { .. } => "ChunkTooLarge",
            Self::InvalidPayload { .. } => "InvalidPayload",
            Self::UnsupportedContentEncoding { .. } => "UnsupportedContentEncoding",
            Self::RateLimit => "RateLimit",
            Self::NoBinaryProtocol => "NoBinaryProtocol",
            Self::LengthRequired { .. } => "LengthRequired",
            Self::CannotStreamToClient { .. } => "CannotStreamToClient",
            Self::Internal { .. } => "Internal",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::FunctionNotFound { .. } => codes::FUNCTION_NOT_FOUND,
            Self::FunctionIsWrongType { .. } => codes::FUNCTION_IS_WRONG_TYPE,
            Self::FunctionError { .. } => codes::FUNCTION_ERROR,
            Self::AuthorizeFunctionError { .. } => codes::AUTHORIZE_FUNCTION_ERROR,
            Self::AuthorizeRejectedError { .. } => codes::AUTHORIZE_REJECTED,
            Self::PayloadTooLarge { .. } => codes::PAYLOAD_TOO_LARGE,
            Self::ChunkTooLarge { .. } => codes::CHUNK_TOO_LARGE,
            Self::InvalidPayload { .. } => codes::INVALID_PAYLOAD,
            Self::UnsupportedContentEncoding { .. } => codes::UNSUPPORTED_CONTENT_ENCODING,
            Self::RateLimit => codes::RATE_LIMIT,
            Self::NoBinaryProtocol => codes::NO_BINARY_PROTOCOL,
            Self::LengthRequired { .. } => codes::LENGTH_REQUIRED,
            Self::CannotStreamToClient { .. } => codes::CANNOT_STREAM_TO_CLIENT,
            Self::Internal { .. } => codes::INTERNAL,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::FunctionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::FunctionIsWrongType { .. } => StatusCode::BAD_REQUEST,
            Self::FunctionError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthorizeFunctionError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthorizeRejectedError { .. } => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge { .. } | Self::ChunkTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Self::UnsupportedContentEncoding { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::NoBinaryProtocol => StatusCode::BAD_REQUEST,
            Self::LengthRequired { .. } => StatusCode::LENGTH_REQUIRED,
            Self::CannotStreamToClient { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Route name the error concerns, if any
    pub fn route_name(&self) -> Option<&str> {
        match self {
            Self::FunctionNotFound { name }
            | Self::FunctionIsWrongType { name, .. }
            | Self::FunctionError { name, .. }
            | Self::AuthorizeFunctionError { name, .. }
            | Self::AuthorizeRejectedError { name }
            | Self::PayloadTooLarge { name, .. }
            | Self::ChunkTooLarge { name, .. }
            | Self::InvalidPayload { name, .. }
            | Self::LengthRequired { name }
            | Self::CannotStreamToClient { name } => Some(name),
            _ => None,
        }
    }

    /// Attach the request/observable/channel the error concerns.
    pub fn report(&self, target: Option<ErrorTarget>) -> ErrorReport<'_> {
        ErrorReport {
            error: self,
            target,
            payload: None,
        }
    }
}

/// What a WebSocket error frame refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTarget {
    Request(u32),
    Observable(u64),
    Channel(u64),
}

/// Serialisable view of an error for the wire.
pub struct ErrorReport<'a> {
    error: &'a SyncError,
    target: Option<ErrorTarget>,
    payload: Option<&'a Payload>,
}

impl<'a> ErrorReport<'a> {
    /// Echo the offending request payload back to the client.
    pub fn with_payload(mut self, payload: &'a Payload) -> Self {
        if !payload.is_undefined() {
            self.payload = Some(payload);
        }
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Encoded error frame
    pub fn to_frame(&self) -> Bytes {
        match qs_wire::frame::encode_error(&self.to_json()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode error frame");
                Bytes::new()
            }
        }
    }
}

impl Serialize for ErrorReport<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.error.kind())?;
        map.serialize_entry("name", self.error.route_name().unwrap_or(""))?;
        map.serialize_entry("message", &self.error.to_string())?;
        map.serialize_entry("code", &self.error.code())?;
        if let SyncError::FunctionError {
            details: Some(details),
            ..
        } = self.error
        {
            map.serialize_entry("details", details)?;
        }
        if let Some(payload) = self.payload {
            map.serialize_entry("payload", &payload.to_json())?;
        }
        match self.target {
            Some(ErrorTarget::Request(id)) => map.serialize_entry("requestId", &id)?,
            // u64 ids travel as strings so JSON clients keep full precision
            Some(ErrorTarget::Observable(id)) => {
                map.serialize_entry("observableId", &id.to_string())?
            }
            Some(ErrorTarget::Channel(id)) => map.serialize_entry("channelId", &id.to_string())?,
            None => {}
        }
        map.end()
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Process-level errors (not sent to clients)
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server bind error: {0}")]
    Bind(String),

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}
