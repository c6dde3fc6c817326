//! Client identity and the per-request session view handed to collaborators.

use axum::http::HeaderMap;
use qs_wire::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Identity of one transport connection (or one HTTP request).
///
/// UUID v7, so ids sort by connection time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Connection time encoded in the id (milliseconds since Unix epoch)
    pub fn connected_at_ms(&self) -> Option<u64> {
        let bytes = self.0.as_bytes();
        if (bytes[6] >> 4) != 7 {
            return None;
        }
        Some(bytes[..6].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Auth payload carried by a request: the bearer token of the
/// `Authorization` header, or the whole header value for other schemes.
pub fn auth_from_headers(headers: &HeaderMap) -> Payload {
    let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Payload::Undefined;
    };
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    Payload::String(token.to_string())
}

/// HTTP request context
#[derive(Debug, Clone)]
pub struct HttpSession {
    pub client_id: ClientId,
    pub ip: IpAddr,
    /// Bearer token from the Authorization header, if any
    pub auth: Payload,
    pub headers: HeaderMap,
}

/// Snapshot of a WebSocket connection at the time of a call
#[derive(Debug, Clone)]
pub struct WsSession {
    pub client_id: ClientId,
    pub ip: IpAddr,
    /// Last payload the client sent in an auth frame
    pub auth: Payload,
}

/// Transport context passed to authorizers and user functions.
///
/// Decided once when the request or connection is accepted.
#[derive(Debug, Clone)]
pub enum Session {
    Http(HttpSession),
    WebSocket(WsSession),
}

impl Session {
    pub fn client_id(&self) -> ClientId {
        match self {
            Session::Http(s) => s.client_id,
            Session::WebSocket(s) => s.client_id,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            Session::Http(s) => s.ip,
            Session::WebSocket(s) => s.ip,
        }
    }

    pub fn auth(&self) -> &Payload {
        match self {
            Session::Http(s) => &s.auth,
            Session::WebSocket(s) => &s.auth,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Session::WebSocket(_))
    }
}
