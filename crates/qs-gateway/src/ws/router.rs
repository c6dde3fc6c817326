//! Inbound frame dispatch.
//!
//! A binary message may hold several frames. Each one is decoded and then
//! passes, in order: the size ceiling, the rate limiter, the authorization
//! gate, and finally the tables. A frame that cannot be decoded ends the
//! connection; the rest of the buffer cannot be trusted.

use std::sync::Arc;

use qs_wire::frame::{self, encode_auth, encode_function_response, encode_get_up_to_date};
use qs_wire::{fingerprint, FrameReader, IncomingFrame, Payload};
use tracing::{debug, warn};

use crate::domain::error::{ErrorTarget, SyncError};
use crate::domain::route::{RouteHandler, RouteSpec};
use crate::observable::GetOutcome;
use crate::ports::FrameSink;
use crate::ws::connection::{Flow, PendingKey, PendingRequest, WsConnection};
use crate::ws::outbound::CloseReason;

/// Outcome of the checks every routed frame goes through
pub(crate) enum Admission {
    Route(Arc<RouteSpec>),
    /// An error frame was sent; drop this frame and continue
    Skip,
    Close,
}

/// What to subscribe once authorization passes
#[derive(Debug, Clone, Copy)]
enum Join {
    Observable { checksum: u64 },
    Channel,
    Publisher,
}

impl Join {
    fn pending_key(self, wire_id: u64) -> PendingKey {
        match self {
            Join::Observable { .. } => PendingKey::Observable(wire_id),
            Join::Channel => PendingKey::Channel(wire_id),
            Join::Publisher => PendingKey::Publisher(wire_id),
        }
    }

    fn target(self, wire_id: u64) -> ErrorTarget {
        match self {
            Join::Observable { .. } => ErrorTarget::Observable(wire_id),
            Join::Channel | Join::Publisher => ErrorTarget::Channel(wire_id),
        }
    }
}

impl WsConnection {
    /// Handle one binary WebSocket message.
    pub async fn handle_binary(self: &Arc<Self>, data: &[u8]) -> Flow {
        let limit = self.ctx.config.limits.max_payload_size;
        for raw in FrameReader::new(data) {
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => return self.protocol_violation(&e),
            };
            if raw.header.length > limit {
                let error = SyncError::PayloadTooLarge {
                    name: String::new(),
                    size: raw.header.length,
                    limit,
                };
                self.send_error(&error, None, &Payload::Undefined);
                continue;
            }
            let frame = match IncomingFrame::decode(&raw, limit) {
                Ok(frame) => frame,
                Err(e) => return self.protocol_violation(&e),
            };
            if self.dispatch(frame, raw.header.length).await == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// Text frames are not part of the protocol.
    pub fn handle_text(&self) -> Flow {
        self.send_error(&SyncError::NoBinaryProtocol, None, &Payload::Undefined);
        self.outbound.close(CloseReason::Normal);
        Flow::Close
    }

    async fn dispatch(self: &Arc<Self>, frame: IncomingFrame, size: usize) -> Flow {
        match frame {
            IncomingFrame::Function {
                req_id,
                name,
                payload,
            } => self.on_function(req_id, &name, payload, size).await,
            IncomingFrame::Subscribe {
                id,
                checksum,
                name,
                payload,
            } => {
                self.on_join(id, Join::Observable { checksum }, &name, payload, size)
                    .await
            }
            IncomingFrame::Unsubscribe { id } => {
                if let Some(flow) = self.charge(1) {
                    return flow;
                }
                self.forget_pending(PendingKey::Observable(id));
                if let Some(table_id) = self.observables.lock().remove(&id) {
                    self.ctx.observables.unsubscribe(table_id, self.client_id());
                }
                Flow::Continue
            }
            IncomingFrame::Get {
                id,
                checksum,
                name,
                payload,
            } => self.on_get(id, checksum, &name, payload, size).await,
            IncomingFrame::Auth { payload } => self.on_auth(payload).await,
            IncomingFrame::ChannelSubscribe { id, name, payload } => {
                self.on_join(id, Join::Channel, &name, payload, size).await
            }
            IncomingFrame::ChannelRegisterPublisher { id, name, payload } => {
                self.on_join(id, Join::Publisher, &name, payload, size).await
            }
            IncomingFrame::ChannelUnsubscribe { id } => {
                if let Some(flow) = self.charge(1) {
                    return flow;
                }
                self.forget_pending(PendingKey::Channel(id));
                self.forget_pending(PendingKey::Publisher(id));
                if let Some(table_id) = self.channels.lock().remove(&id) {
                    self.ctx.channels.unsubscribe(table_id, self.client_id());
                }
                Flow::Continue
            }
            IncomingFrame::ChannelPublish { id, payload } => {
                self.on_publish(id, payload, size).await
            }
            IncomingFrame::StreamRegister {
                req_id,
                content_size,
                name,
                metadata,
            } => {
                self.on_stream_register(req_id, content_size, &name, metadata, size)
                    .await
            }
            IncomingFrame::StreamChunk { req_id, seq, data } => {
                self.on_stream_chunk(req_id, seq, data).await
            }
        }
    }

    /// Charge the WebSocket limiter. `Some` means the connection is closing.
    pub(crate) fn charge(&self, tokens: u64) -> Option<Flow> {
        if self.ctx.limiters.ws.charge(self.ip(), tokens).is_allowed() {
            return None;
        }
        self.send_error(&SyncError::RateLimit, None, &Payload::Undefined);
        self.outbound.close(CloseReason::Normal);
        Some(Flow::Close)
    }

    /// Resolve the route, enforce its size ceiling, then rate limit.
    pub(crate) async fn admit(
        &self,
        name: &str,
        size: usize,
        target: ErrorTarget,
        payload: &Payload,
    ) -> Admission {
        let route = match self.ctx.registry.resolve(name).await {
            Ok(route) => route,
            Err(e) => {
                // unknown routes still cost a token
                if let Some(Flow::Close) = self.charge(1) {
                    return Admission::Close;
                }
                self.send_error(&e, Some(target), payload);
                return Admission::Skip;
            }
        };
        let limit = route.payload_limit(self.ctx.config.limits.max_payload_size);
        if size > limit {
            let error = SyncError::PayloadTooLarge {
                name: name.to_string(),
                size,
                limit,
            };
            self.send_error(&error, Some(target), payload);
            return Admission::Skip;
        }
        if self.charge(route.rate_limit_tokens).is_some() {
            return Admission::Close;
        }
        Admission::Route(route)
    }

    async fn on_function(self: &Arc<Self>, req_id: u32, name: &str, payload: Payload, size: usize) -> Flow {
        let target = ErrorTarget::Request(req_id);
        let route = match self.admit(name, size, target, &payload).await {
            Admission::Route(route) => route,
            Admission::Skip => return Flow::Continue,
            Admission::Close => return Flow::Close,
        };
        let conn = Arc::clone(self);
        let session = self.session();
        tokio::spawn(async move {
            let result = match conn.ctx.gate.check(&route, &session, &payload).await {
                Ok(()) => conn.ctx.runner.call(&route, payload.clone(), &session).await,
                Err(e) => Err(e),
            };
            match result.and_then(|out| {
                encode_function_response(req_id, &out)
                    .map_err(|e| SyncError::internal(e.to_string()))
            }) {
                Ok(frame) => conn.send(frame),
                Err(e) => conn.send_error(&e, Some(target), &payload),
            }
        });
        Flow::Continue
    }

    async fn on_join(self: &Arc<Self>, wire_id: u64, join: Join, name: &str, payload: Payload, size: usize) -> Flow {
        let target = join.target(wire_id);
        let route = match self.admit(name, size, target, &payload).await {
            Admission::Route(route) => route,
            Admission::Skip => return Flow::Continue,
            Admission::Close => return Flow::Close,
        };
        let table_id = fingerprint(&route.name, &payload);
        match self.live_alias(join, table_id) {
            Some(existing) if existing == wire_id => {
                if self.is_attached(join, table_id, wire_id) {
                    return Flow::Continue;
                }
            }
            Some(existing) => {
                let error = SyncError::invalid_payload(
                    name,
                    format!("already subscribed to the same data as id {existing}"),
                );
                self.send_error(&error, Some(target), &payload);
                return Flow::Continue;
            }
            None => {}
        }
        if !self.is_known(join, wire_id)
            && self.subscription_count() >= self.ctx.config.limits.max_subscriptions_per_connection
        {
            let error = SyncError::invalid_payload(name, "too many subscriptions on this connection");
            self.send_error(&error, Some(target), &payload);
            return Flow::Continue;
        }
        self.authorize_and_join(wire_id, join, route, payload).await;
        Flow::Continue
    }

    /// Wire id this connection already uses for `table_id`.
    fn live_alias(&self, join: Join, table_id: u64) -> Option<u64> {
        let live = match join {
            Join::Observable { .. } => self.observables.lock(),
            Join::Channel | Join::Publisher => self.channels.lock(),
        };
        live.iter()
            .find(|(_, mapped)| **mapped == table_id)
            .map(|(wire_id, _)| *wire_id)
    }

    fn is_attached(&self, join: Join, table_id: u64, wire_id: u64) -> bool {
        let client_id = self.client_id();
        match join {
            Join::Observable { .. } => self.ctx.observables.is_attached(table_id, client_id, wire_id),
            Join::Channel => self.ctx.channels.is_attached(table_id, client_id, wire_id, false),
            Join::Publisher => self.ctx.channels.is_attached(table_id, client_id, wire_id, true),
        }
    }

    fn is_known(&self, join: Join, wire_id: u64) -> bool {
        let live = match join {
            Join::Observable { .. } => self.observables.lock().contains_key(&wire_id),
            Join::Channel | Join::Publisher => self.channels.lock().contains_key(&wire_id),
        };
        live || self.unauthorized.lock().contains_key(&join.pending_key(wire_id))
    }

    async fn authorize_and_join(&self, wire_id: u64, join: Join, route: Arc<RouteSpec>, payload: Payload) {
        let target = join.target(wire_id);
        let key = join.pending_key(wire_id);
        match self.ctx.gate.check(&route, &self.session(), &payload).await {
            Ok(()) => {
                self.forget_pending(key);
            }
            Err(e) => {
                if matches!(e, SyncError::AuthorizeRejectedError { .. }) {
                    let checksum = match join {
                        Join::Observable { checksum } => checksum,
                        _ => 0,
                    };
                    self.unauthorized.lock().insert(
                        key,
                        PendingRequest {
                            name: route.name.clone(),
                            payload: payload.clone(),
                            checksum,
                        },
                    );
                }
                self.send_error(&e, Some(target), &payload);
                return;
            }
        }

        let table_id = fingerprint(&route.name, &payload);
        let client_id = self.client_id();
        let joined = match join {
            Join::Observable { checksum } => {
                let previous = self.observables.lock().insert(wire_id, table_id);
                if let Some(old) = previous.filter(|old| *old != table_id) {
                    self.ctx.observables.unsubscribe(old, client_id);
                }
                self.ctx
                    .observables
                    .join(table_id, &route, &payload, self.sink(), wire_id, checksum)
            }
            Join::Channel | Join::Publisher => {
                let previous = self.channels.lock().insert(wire_id, table_id);
                if let Some(old) = previous.filter(|old| *old != table_id) {
                    self.ctx.channels.unsubscribe(old, client_id);
                }
                if let Join::Publisher = join {
                    self.ctx
                        .channels
                        .register_publisher(table_id, &route, &payload, client_id)
                } else {
                    self.ctx
                        .channels
                        .join(table_id, &route, &payload, self.sink(), wire_id)
                }
            }
        };
        if let Err(e) = joined {
            match join {
                Join::Observable { .. } => self.observables.lock().remove(&wire_id),
                _ => self.channels.lock().remove(&wire_id),
            };
            self.send_error(&e, Some(target), &payload);
        }
    }

    async fn on_get(self: &Arc<Self>, wire_id: u64, checksum: u64, name: &str, payload: Payload, size: usize) -> Flow {
        let target = ErrorTarget::Observable(wire_id);
        let route = match self.admit(name, size, target, &payload).await {
            Admission::Route(route) => route,
            Admission::Skip => return Flow::Continue,
            Admission::Close => return Flow::Close,
        };
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = conn.ctx.gate.check(&route, &conn.session(), &payload).await {
                conn.send_error(&e, Some(target), &payload);
                return;
            }
            let table_id = fingerprint(&route.name, &payload);
            match conn.ctx.observables.get(table_id, &route, &payload, checksum).await {
                Ok(GetOutcome::UpToDate { .. }) => match encode_get_up_to_date(wire_id) {
                    Ok(frame) => conn.send(frame),
                    Err(e) => warn!(error = %e, "failed to encode get ack"),
                },
                Ok(GetOutcome::Value(value)) => {
                    // a live subscription under the same id already delivers
                    // values in order; a late GET frame could be older
                    if conn.observables.lock().get(&wire_id) == Some(&table_id) {
                        return;
                    }
                    let Some((cached, is_diff)) = value.frame_for(checksum) else {
                        return;
                    };
                    let aliased = if wire_id == table_id {
                        Ok(cached.clone())
                    } else {
                        frame::with_id(cached, wire_id)
                    };
                    match aliased {
                        Ok(out) => {
                            conn.ctx.metrics.record_frame(out.len(), is_diff);
                            conn.outbound.send_frame(out);
                        }
                        Err(e) => warn!(error = %e, "failed to alias cached frame"),
                    }
                }
                Err(e) => conn.send_error(&e, Some(target), &payload),
            }
        });
        Flow::Continue
    }

    async fn on_auth(self: &Arc<Self>, payload: Payload) -> Flow {
        if let Some(flow) = self.charge(1) {
            return flow;
        }
        self.set_auth(payload.clone());
        match encode_auth(&payload) {
            Ok(frame) => self.send(frame),
            Err(e) => warn!(error = %e, "failed to encode auth ack"),
        }

        let pending: Vec<_> = self.unauthorized.lock().drain().collect();
        if !pending.is_empty() {
            debug!(client_id = %self.client_id(), retried = pending.len(), "retrying unauthorized subscriptions");
        }
        for (key, request) in pending {
            let (wire_id, join) = match key {
                PendingKey::Observable(id) => (
                    id,
                    Join::Observable {
                        checksum: request.checksum,
                    },
                ),
                PendingKey::Channel(id) => (id, Join::Channel),
                PendingKey::Publisher(id) => (id, Join::Publisher),
            };
            match self.ctx.registry.resolve(&request.name).await {
                Ok(route) => {
                    self.authorize_and_join(wire_id, join, route, request.payload)
                        .await
                }
                Err(e) => self.send_error(&e, Some(join.target(wire_id)), &request.payload),
            }
        }
        Flow::Continue
    }

    async fn on_publish(self: &Arc<Self>, wire_id: u64, message: Payload, size: usize) -> Flow {
        let target = ErrorTarget::Channel(wire_id);
        let joined = self.channels.lock().get(&wire_id).copied();
        let Some(table_id) = joined else {
            if let Some(flow) = self.charge(1) {
                return flow;
            }
            let error = SyncError::invalid_payload("", format!("channel {wire_id} is not joined"));
            self.send_error(&error, Some(target), &Payload::Undefined);
            return Flow::Continue;
        };
        let Some(publish) = self.ctx.channels.publisher(table_id) else {
            if let Some(flow) = self.charge(1) {
                return flow;
            }
            self.channels.lock().remove(&wire_id);
            let error = SyncError::invalid_payload("", format!("channel {wire_id} is closed"));
            self.send_error(&error, Some(target), &Payload::Undefined);
            return Flow::Continue;
        };

        let route = &publish.route;
        let limit = route.payload_limit(self.ctx.config.limits.max_payload_size);
        if size > limit {
            let error = SyncError::PayloadTooLarge {
                name: route.name.clone(),
                size,
                limit,
            };
            self.send_error(&error, Some(target), &Payload::Undefined);
            return Flow::Continue;
        }
        if let Some(flow) = self.charge(route.rate_limit_tokens) {
            return flow;
        }

        match &route.handler {
            RouteHandler::Channel(channel) => {
                let channel = Arc::clone(channel);
                let conn = Arc::clone(self);
                let session = self.session();
                tokio::spawn(async move {
                    if let Err(e) = channel
                        .publish(&publish.payload, message, &publish.emitter, &session)
                        .await
                    {
                        let error = e.into_sync(&publish.route.name);
                        conn.send_error(&error, Some(target), &publish.payload);
                    }
                });
            }
            _ => {
                publish.emitter.publish(message);
            }
        }
        Flow::Continue
    }
}
