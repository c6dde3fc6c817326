//! Payload model and content-type tagging.
//!
//! A payload travels as a one-byte content-type tag followed by its bytes, so
//! binary payloads need no envelope and JSON is only used when the value is
//! actually structured.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{WireError, WireResult};

/// Content-type tag written in front of every payload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    Json = 0,
    String = 1,
    Bytes = 2,
    Undefined = 3,
    Null = 4,
}

impl ContentType {
    pub fn from_tag(tag: u8) -> WireResult<Self> {
        match tag {
            0 => Ok(Self::Json),
            1 => Ok(Self::String),
            2 => Ok(Self::Bytes),
            3 => Ok(Self::Undefined),
            4 => Ok(Self::Null),
            other => Err(WireError::UnknownContentType(other)),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// MIME type used when the payload is served over HTTP.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json | Self::Null => "application/json",
            Self::String => "text/plain; charset=utf-8",
            Self::Bytes | Self::Undefined => "application/octet-stream",
        }
    }
}

/// A value exchanged between clients, functions and queries.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    Json(Value),
    String(String),
    Bytes(Bytes),
    #[default]
    Undefined,
    Null,
}

impl Payload {
    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Json(Value::Null) | Payload::Null => ContentType::Null,
            Payload::Json(_) => ContentType::Json,
            Payload::String(_) => ContentType::String,
            Payload::Bytes(_) => ContentType::Bytes,
            Payload::Undefined => ContentType::Undefined,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Payload::Undefined)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Best-effort JSON view, used for error payload echoes and logging.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Json(v) => v.clone(),
            Payload::String(s) => Value::String(s.clone()),
            Payload::Bytes(b) => Value::String(format!("<{} bytes>", b.len())),
            Payload::Undefined | Payload::Null => Value::Null,
        }
    }

    /// Serialised payload bytes without the tag.
    pub fn encode_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Json(Value::Null) | Payload::Null => b"null".to_vec(),
            // serializing a Value cannot fail
            Payload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            Payload::String(s) => s.as_bytes().to_vec(),
            Payload::Bytes(b) => b.to_vec(),
            Payload::Undefined => Vec::new(),
        }
    }

    /// Tag byte followed by the payload bytes.
    pub fn encode_body(&self) -> Vec<u8> {
        let bytes = self.encode_bytes();
        let mut body = Vec::with_capacity(bytes.len() + 1);
        body.push(self.content_type().tag());
        body.extend_from_slice(&bytes);
        body
    }

    /// Inverse of [`Payload::encode_body`].
    pub fn decode_body(body: &[u8]) -> WireResult<Self> {
        let (&tag, rest) = body.split_first().ok_or(WireError::Truncated {
            needed: 1,
            available: 0,
        })?;
        Self::decode_tagged(ContentType::from_tag(tag)?, rest)
    }

    pub fn decode_tagged(content_type: ContentType, bytes: &[u8]) -> WireResult<Self> {
        match content_type {
            ContentType::Json => serde_json::from_slice(bytes)
                .map(Payload::Json)
                .map_err(|e| WireError::InvalidJson(e.to_string())),
            ContentType::String => std::str::from_utf8(bytes)
                .map(|s| Payload::String(s.to_owned()))
                .map_err(|_| WireError::InvalidUtf8),
            ContentType::Bytes => Ok(Payload::Bytes(Bytes::copy_from_slice(bytes))),
            ContentType::Undefined => Ok(Payload::Undefined),
            ContentType::Null => Ok(Payload::Null),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            other => Payload::Json(other),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(value))
    }
}
