//! Per-connection outbound queue.
//!
//! Tables push frames without awaiting the socket. Frames wait here until the
//! writer task takes them. A consumer that lets the queue reach
//! `max_queued_frames`, or leaves its oldest frame waiting longer than
//! `max_staleness`, is cut off.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::config::BackpressureConfig;
use crate::domain::session::ClientId;
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::FrameSink;

/// Why the queue stopped accepting frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Flush what is queued, then close
    Normal,
    Backpressure,
    /// Drop the connection now
    Abort,
}

struct QueueState {
    frames: VecDeque<(Instant, Bytes)>,
    closed: Option<CloseReason>,
}

/// Frames waiting for the socket writer.
pub struct Outbound {
    client_id: ClientId,
    state: Mutex<QueueState>,
    notify: Notify,
    config: BackpressureConfig,
    metrics: Arc<GatewayMetrics>,
}

/// What the writer should do next
#[derive(Debug, PartialEq)]
pub enum Next {
    Send(Bytes),
    Close(CloseReason),
}

impl Outbound {
    pub fn new(client_id: ClientId, config: BackpressureConfig, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
            config,
            metrics,
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    /// Stop accepting frames. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(reason);
        if reason != CloseReason::Normal {
            state.frames.clear();
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Next frame for the writer, waiting if the queue is empty.
    pub async fn next(&self) -> Next {
        loop {
            {
                let mut state = self.state.lock();
                if let Some((_, frame)) = state.frames.pop_front() {
                    return Next::Send(frame);
                }
                if let Some(reason) = state.closed {
                    return Next::Close(reason);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Everything queued, without waiting.
    pub fn drain(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .frames
            .drain(..)
            .map(|(_, frame)| frame)
            .collect()
    }

    fn overloaded(&self, state: &QueueState, now: Instant) -> bool {
        if state.frames.len() >= self.config.max_queued_frames {
            return true;
        }
        state
            .frames
            .front()
            .is_some_and(|(queued_at, _)| now.saturating_duration_since(*queued_at) > self.config.max_staleness)
    }
}

impl FrameSink for Outbound {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn send_frame(&self, frame: Bytes) -> bool {
        if frame.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }
        let now = Instant::now();
        if self.overloaded(&state, now) {
            let queued = state.frames.len();
            state.closed = Some(CloseReason::Backpressure);
            state.frames.clear();
            drop(state);
            warn!(client_id = %self.client_id, queued, "slow consumer disconnected");
            self.metrics.record_backpressure_disconnect();
            self.notify.notify_one();
            return false;
        }
        state.frames.push_back((now, frame));
        drop(state);
        self.notify.notify_one();
        true
    }
}
