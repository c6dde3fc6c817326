//! Test doubles for the gateway ports.
//!
//! Used by the in-crate suites and the workspace integration tests.
//!
//! ```rust
//! use qs_gateway::test_utils::RecordingSink;
//! use qs_gateway::ports::FrameSink;
//!
//! let sink = RecordingSink::new();
//! assert!(sink.send_frame(bytes::Bytes::new()));
//! assert_eq!(sink.frames().len(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use qs_wire::{OutgoingFrame, Payload};
use tokio::sync::mpsc;

use crate::channel::ChannelEmitter;
use crate::domain::session::{ClientId, Session};
use crate::observable::ObservableEmitter;
use crate::ports::{
    AuthorizeFault, Authorizer, ChannelFunction, CloseHandle, FrameSink, FunctionError,
    FunctionHandler, QueryExecutor,
};

/// Frame sink that keeps everything it is sent.
pub struct RecordingSink {
    id: ClientId,
    frames: Mutex<Vec<Bytes>>,
    open: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::new(),
            frames: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    /// Decode and clear everything received so far.
    pub fn take_decoded(&self) -> Vec<OutgoingFrame> {
        let frames = std::mem::take(&mut *self.frames.lock());
        frames
            .iter()
            .flat_map(|f| OutgoingFrame::decode_all(f).unwrap_or_default())
            .collect()
    }

    /// Make further sends fail, as a dropped transport would.
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn send_frame(&self, frame: Bytes) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.frames.lock().push(frame);
        true
    }
}

/// Query executor driven by the test through the emitters it hands out.
pub struct ManualQuery {
    started: mpsc::UnboundedSender<ObservableEmitter>,
    closed: Arc<AtomicUsize>,
}

impl ManualQuery {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ObservableEmitter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let query = Arc::new(Self {
            started: tx,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        (query, rx)
    }

    /// Close handles run so far
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for ManualQuery {
    async fn start(
        &self,
        _payload: Payload,
        emitter: ObservableEmitter,
    ) -> Result<CloseHandle, FunctionError> {
        let _ = self.started.send(emitter);
        let closed = Arc::clone(&self.closed);
        Ok(CloseHandle::new(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Channel publisher driven by the test.
pub struct ManualChannel {
    started: mpsc::UnboundedSender<ChannelEmitter>,
    closed: Arc<AtomicUsize>,
}

impl ManualChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEmitter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            started: tx,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        (channel, rx)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelFunction for ManualChannel {
    async fn subscribe(
        &self,
        _payload: Payload,
        emitter: ChannelEmitter,
    ) -> Result<CloseHandle, FunctionError> {
        let _ = self.started.send(emitter);
        let closed = Arc::clone(&self.closed);
        Ok(CloseHandle::new(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Query and channel whose start panics.
pub struct Panicking;

#[async_trait]
impl QueryExecutor for Panicking {
    async fn start(
        &self,
        _payload: Payload,
        _emitter: ObservableEmitter,
    ) -> Result<CloseHandle, FunctionError> {
        panic!("query exploded");
    }
}

#[async_trait]
impl ChannelFunction for Panicking {
    async fn subscribe(
        &self,
        _payload: Payload,
        _emitter: ChannelEmitter,
    ) -> Result<CloseHandle, FunctionError> {
        panic!("channel exploded");
    }
}

/// Function returning its payload unchanged.
pub struct Echo;

#[async_trait]
impl FunctionHandler for Echo {
    async fn call(&self, payload: Payload, _session: &Session) -> Result<Payload, FunctionError> {
        Ok(payload)
    }
}

/// Authorizer accepting sessions whose auth payload equals `token`.
///
/// Can be switched to fail with a fault instead of answering.
pub struct TokenAuthorizer {
    token: Payload,
    faulty: AtomicBool,
}

impl TokenAuthorizer {
    pub fn new(token: impl Into<Payload>) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            faulty: AtomicBool::new(false),
        })
    }

    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }
}

#[async_trait]
impl Authorizer for TokenAuthorizer {
    async fn authorize(
        &self,
        session: &Session,
        _route: &str,
        _payload: &Payload,
    ) -> Result<bool, AuthorizeFault> {
        if self.faulty.load(Ordering::SeqCst) {
            return Err(AuthorizeFault("policy store unavailable".into()));
        }
        Ok(session.auth() == &self.token)
    }
}
