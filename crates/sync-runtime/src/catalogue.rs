//! Route catalogue installed by the runtime.
//!
//! The demo routes exercise every route kind:
//!
//! | Route | Kind | Behaviour |
//! |-------|------|-----------|
//! | `time` | query | current time, re-emitted every `payload.interval_ms` (default 1000) |
//! | `counter` | query | shared counter value |
//! | `increment` | function | adds `payload.by` (default 1) to the counter |
//! | `echo` | function | returns its payload |
//! | `chat` | channel | forwards client publishes to every subscriber |
//! | `upload` | stream | counts uploaded bytes |
//!
//! Relay routes from the config are channels backed by an upstream server.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use qs_gateway::ports::{
    ChannelFunction, CloseHandle, FunctionError, FunctionHandler, QueryExecutor, StreamHandler,
    StreamRequest,
};
use qs_gateway::{ChannelEmitter, ObservableEmitter, RouteSpec, Session, StaticInstaller, Update, WsUpstream};
use qs_wire::Payload;
use serde_json::json;
use tokio::sync::watch;

use crate::config::RelayRoute;

/// Shortest tick the `time` query accepts
const MIN_TIME_INTERVAL: Duration = Duration::from_millis(100);

/// Current time, ticking.
pub struct TimeQuery;

#[async_trait]
impl QueryExecutor for TimeQuery {
    async fn start(&self, payload: Payload, emitter: ObservableEmitter) -> Result<CloseHandle, FunctionError> {
        let interval = payload
            .as_json()
            .and_then(|p| p.get("interval_ms"))
            .and_then(|v| v.as_u64())
            .map_or(Duration::from_secs(1), Duration::from_millis)
            .max(MIN_TIME_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now();
                if !emitter.update(json!({ "now": now.to_rfc3339(), "unix_ms": now.timestamp_millis() })) {
                    return;
                }
            }
        });
        Ok(CloseHandle::new(move || task.abort()))
    }
}

/// Counter shared by the `counter` query and the `increment` function.
pub struct Counter {
    value: AtomicI64,
    changed: watch::Sender<i64>,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            value: AtomicI64::new(0),
            changed,
        })
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn add(&self, by: i64) -> i64 {
        let value = self.value.fetch_add(by, Ordering::SeqCst) + by;
        self.changed.send_replace(value);
        value
    }
}

pub struct CounterQuery(pub Arc<Counter>);

#[async_trait]
impl QueryExecutor for CounterQuery {
    async fn start(&self, _payload: Payload, emitter: ObservableEmitter) -> Result<CloseHandle, FunctionError> {
        let mut changes = self.0.changed.subscribe();
        emitter.update(Update::new(json!({ "value": self.0.get() })));
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let value = *changes.borrow_and_update();
                if !emitter.update(json!({ "value": value })) {
                    return;
                }
            }
        });
        Ok(CloseHandle::new(move || task.abort()))
    }
}

pub struct Increment(pub Arc<Counter>);

#[async_trait]
impl FunctionHandler for Increment {
    async fn call(&self, payload: Payload, _session: &Session) -> Result<Payload, FunctionError> {
        let by = match payload.as_json().and_then(|p| p.get("by")) {
            None => 1,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| FunctionError::new("`by` must be an integer"))?,
        };
        Ok(Payload::Json(json!({ "value": self.0.add(by) })))
    }
}

pub struct Echo;

#[async_trait]
impl FunctionHandler for Echo {
    async fn call(&self, payload: Payload, _session: &Session) -> Result<Payload, FunctionError> {
        Ok(payload)
    }
}

/// Channel whose only publishers are clients.
pub struct ChatChannel;

#[async_trait]
impl ChannelFunction for ChatChannel {
    async fn subscribe(&self, _payload: Payload, _emitter: ChannelEmitter) -> Result<CloseHandle, FunctionError> {
        Ok(CloseHandle::noop())
    }
}

pub struct ByteCounter;

#[async_trait]
impl StreamHandler for ByteCounter {
    async fn call(&self, mut request: StreamRequest, _session: &Session) -> Result<Payload, FunctionError> {
        let mut total = 0u64;
        while let Some(chunk) = request.body.next().await {
            let chunk = chunk.map_err(|e| FunctionError::new(e.to_string()))?;
            total += chunk.len() as u64;
        }
        Ok(Payload::Json(json!({
            "bytes": total,
            "metadata": request.metadata.to_json(),
        })))
    }
}

/// Demo routes sharing one counter.
pub fn demo_routes() -> Vec<RouteSpec> {
    let counter = Counter::new();
    vec![
        RouteSpec::query("time", Arc::new(TimeQuery)).public(),
        RouteSpec::query("counter", Arc::new(CounterQuery(Arc::clone(&counter)))).public(),
        RouteSpec::function("increment", Arc::new(Increment(counter))).with_rate_limit_tokens(2),
        RouteSpec::function("echo", Arc::new(Echo)).public(),
        RouteSpec::channel("chat", Arc::new(ChatChannel)),
        RouteSpec::stream("upload", Arc::new(ByteCounter)).with_timeout(Duration::from_secs(300)),
    ]
}

pub fn relay_route(relay: &RelayRoute) -> RouteSpec {
    let mut upstream = WsUpstream::new(relay.url.clone());
    if let Some(token) = &relay.token {
        upstream = upstream.with_auth(token.as_str());
    }
    RouteSpec::relay(relay.name.clone(), Arc::new(upstream))
}

/// Installer holding the configured routes.
pub fn build_installer(demo: bool, relays: &[RelayRoute]) -> StaticInstaller {
    let installer = StaticInstaller::new();
    if demo {
        for route in demo_routes() {
            installer.insert(route);
        }
    }
    for relay in relays {
        installer.insert(relay_route(relay));
    }
    installer
}
