//! Outbound ports: collaborators the gateway calls but does not implement.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use qs_wire::Payload;
use serde_json::Value;

use crate::channel::ChannelEmitter;
use crate::domain::error::SyncError;
use crate::domain::route::RouteSpec;
use crate::domain::session::{ClientId, Session};
use crate::observable::ObservableEmitter;

/// Failure raised by user code (query executors, functions, channels).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
    /// Extra structured data forwarded to the client
    pub details: Option<Value>,
}

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wrap as a client-facing error for route `name`
    pub fn into_sync(self, name: &str) -> SyncError {
        SyncError::FunctionError {
            name: name.to_string(),
            message: self.message,
            details: self.details,
        }
    }
}

/// Fault in the authorization policy itself, as opposed to a "no".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct AuthorizeFault(pub String);

/// Releases whatever a query executor or channel publisher holds open.
///
/// The close action runs at most once: on [`CloseHandle::close`] or on drop.
pub struct CloseHandle(Option<Box<dyn FnOnce() + Send>>);

impl CloseHandle {
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(close)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn close(mut self) {
        if let Some(close) = self.0.take() {
            close();
        }
    }
}

impl Drop for CloseHandle {
    fn drop(&mut self) {
        if let Some(close) = self.0.take() {
            close();
        }
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CloseHandle").field(&self.0.is_some()).finish()
    }
}

/// Body of a streamed upload.
pub struct StreamBody {
    inner: BoxStream<'static, Result<Bytes, SyncError>>,
}

impl StreamBody {
    pub fn new(stream: impl Stream<Item = Result<Bytes, SyncError>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for StreamBody {
    type Item = Result<Bytes, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A streamed upload handed to a [`StreamHandler`].
pub struct StreamRequest {
    /// File metadata (File-* headers over HTTP, register payload over WebSocket)
    pub metadata: Payload,
    pub content_size: Option<u64>,
    pub body: StreamBody,
}

/// Delivery target for encoded frames (one per WebSocket connection).
pub trait FrameSink: Send + Sync {
    fn client_id(&self) -> ClientId;

    /// Queue a frame without blocking. `false` once the transport is gone.
    fn send_frame(&self, frame: Bytes) -> bool;
}

/// Computes a query and keeps emitting new values until closed.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn start(
        &self,
        payload: Payload,
        emitter: ObservableEmitter,
    ) -> Result<CloseHandle, FunctionError>;
}

/// Plain request/response function.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, payload: Payload, session: &Session) -> Result<Payload, FunctionError>;
}

/// Function consuming a streamed upload.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn call(&self, request: StreamRequest, session: &Session)
        -> Result<Payload, FunctionError>;
}

/// Pub/sub channel publisher.
#[async_trait]
pub trait ChannelFunction: Send + Sync {
    /// Start publishing into the channel.
    async fn subscribe(
        &self,
        payload: Payload,
        emitter: ChannelEmitter,
    ) -> Result<CloseHandle, FunctionError>;

    /// A client published `message`. Forwards it to subscribers unless overridden.
    async fn publish(
        &self,
        _payload: &Payload,
        message: Payload,
        emitter: &ChannelEmitter,
        _session: &Session,
    ) -> Result<(), FunctionError> {
        emitter.publish(message);
        Ok(())
    }
}

/// Another sync server whose channels can be relayed.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn subscribe_channel(
        &self,
        name: &str,
        payload: Payload,
        emitter: ChannelEmitter,
    ) -> Result<CloseHandle, FunctionError>;
}

/// Access policy.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        session: &Session,
        route: &str,
        payload: &Payload,
    ) -> Result<bool, AuthorizeFault>;
}

/// Resolves route names to route definitions.
#[async_trait]
pub trait FunctionInstaller: Send + Sync {
    async fn install(&self, name: &str) -> Option<Arc<RouteSpec>>;
}

/// Authorizer that allows everything.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &Session, _: &str, _: &Payload) -> Result<bool, AuthorizeFault> {
        Ok(true)
    }
}
