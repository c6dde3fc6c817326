//! State of one WebSocket connection.
//!
//! Clients pick their own subscription ids. The tables key entries by the
//! server-side fingerprint of `(name, payload)` instead, so the connection
//! keeps the wire id to table id mapping and the tables alias frames back to
//! the client's id.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use qs_wire::Payload;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::domain::error::{ErrorTarget, SyncError};
use crate::domain::session::{ClientId, Session, WsSession};
use crate::ports::FrameSink;
use crate::ws::outbound::{CloseReason, Outbound};
use crate::ws::streams::Upload;

/// Whether the reader should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Subscription a client asked for while unauthorized, retried on the next
/// auth frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Observable(u64),
    Channel(u64),
    Publisher(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub name: String,
    pub payload: Payload,
    /// Known checksum for observable subscriptions
    pub checksum: u64,
}

/// One WebSocket client.
pub struct WsConnection {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) outbound: Arc<Outbound>,
    client_id: ClientId,
    ip: IpAddr,
    auth: Mutex<Payload>,
    /// wire id -> table id
    pub(crate) observables: Mutex<HashMap<u64, u64>>,
    pub(crate) channels: Mutex<HashMap<u64, u64>>,
    pub(crate) unauthorized: Mutex<HashMap<PendingKey, PendingRequest>>,
    pub(crate) uploads: Mutex<HashMap<u32, Upload>>,
}

impl WsConnection {
    /// Register a new connection with the server.
    pub fn new(ctx: Arc<ServerContext>, ip: IpAddr, auth: Payload) -> Arc<Self> {
        let client_id = ClientId::new();
        let outbound = Outbound::new(
            client_id,
            ctx.config.backpressure.clone(),
            Arc::clone(&ctx.metrics),
        );
        ctx.connections.insert(client_id, Arc::clone(&outbound));
        ctx.metrics.record_ws_connect();
        info!(%client_id, %ip, "websocket connected");

        Arc::new(Self {
            ctx,
            outbound,
            client_id,
            ip,
            auth: Mutex::new(auth),
            observables: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            unauthorized: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    /// Snapshot of the connection for authorizers and functions.
    pub fn session(&self) -> Session {
        Session::WebSocket(WsSession {
            client_id: self.client_id,
            ip: self.ip,
            auth: self.auth.lock().clone(),
        })
    }

    pub(crate) fn set_auth(&self, auth: Payload) {
        *self.auth.lock() = auth;
    }

    pub(crate) fn sink(&self) -> Arc<dyn FrameSink> {
        Arc::clone(&self.outbound) as Arc<dyn FrameSink>
    }

    pub(crate) fn send(&self, frame: Bytes) {
        self.ctx.metrics.record_frame(frame.len(), false);
        self.outbound.send_frame(frame);
    }

    pub(crate) fn send_error(&self, error: &SyncError, target: Option<ErrorTarget>, payload: &Payload) {
        self.send(error.report(target).with_payload(payload).to_frame());
    }

    /// Live subscriptions plus queued unauthorized ones
    pub fn subscription_count(&self) -> usize {
        self.observables.lock().len() + self.channels.lock().len() + self.unauthorized.lock().len()
    }

    /// Drop a queued unauthorized request.
    pub(crate) fn forget_pending(&self, key: PendingKey) -> bool {
        self.unauthorized.lock().remove(&key).is_some()
    }

    /// Malformed input: close immediately.
    pub(crate) fn protocol_violation(&self, reason: &dyn std::fmt::Display) -> Flow {
        warn!(client_id = %self.client_id, ip = %self.ip, %reason, "protocol violation");
        self.ctx.metrics.record_protocol_violation();
        self.outbound.close(CloseReason::Abort);
        Flow::Close
    }

    /// Drop every subscription and upload. Safe to call more than once.
    pub fn disconnect(&self) {
        let observables = std::mem::take(&mut *self.observables.lock());
        for table_id in observables.into_values() {
            self.ctx.observables.unsubscribe(table_id, self.client_id);
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        for table_id in channels.into_values() {
            self.ctx.channels.unsubscribe(table_id, self.client_id);
        }
        self.unauthorized.lock().clear();
        // dropping the senders ends any in-progress stream bodies
        self.uploads.lock().clear();

        if self.ctx.connections.remove(&self.client_id).is_some() {
            self.ctx.metrics.record_ws_disconnect();
            debug!(client_id = %self.client_id, "websocket disconnected");
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
