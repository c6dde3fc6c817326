//! Server-wide state shared by the HTTP and WebSocket surfaces.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::info;

use crate::channel::ChannelTable;
use crate::domain::config::GatewayConfig;
use crate::domain::session::ClientId;
use crate::middleware::authorize::AuthorizeGate;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::rate_limit::RateLimiters;
use crate::observable::ObservableTable;
use crate::ports::{Authorizer, FrameSink, FunctionInstaller};
use crate::registry::FunctionRegistry;
use crate::runner::FunctionRunner;
use crate::ws::outbound::{CloseReason, Outbound};

/// Owns the tables, limiters and collaborators of one server instance.
pub struct ServerContext {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    pub observables: Arc<ObservableTable>,
    pub channels: Arc<ChannelTable>,
    pub registry: Arc<FunctionRegistry>,
    pub limiters: RateLimiters,
    pub gate: AuthorizeGate,
    pub runner: FunctionRunner,
    /// Open WebSocket connections
    pub connections: DashMap<ClientId, Arc<Outbound>>,
}

impl ServerContext {
    pub fn new(
        config: GatewayConfig,
        installer: Arc<dyn FunctionInstaller>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Arc<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let observables = ObservableTable::new(config.observables.clone(), Arc::clone(&metrics));
        let channels = ChannelTable::new(config.channels.clone(), Arc::clone(&metrics));
        let registry = Arc::new(FunctionRegistry::new(
            installer,
            Arc::clone(&observables),
            Arc::clone(&channels),
            config.functions.clone(),
            config.limits.max_name_length,
        ));
        let limiters = RateLimiters::new(&config.rate_limit, Arc::clone(&metrics));
        let runner = FunctionRunner::new(&config.functions, Arc::clone(&metrics));

        Arc::new(Self {
            config: Arc::new(config),
            metrics,
            observables,
            channels,
            registry,
            limiters,
            gate: AuthorizeGate::new(authorizer),
            runner,
            connections: DashMap::new(),
        })
    }

    /// Ask every connection to reconnect later, then close it once its queue
    /// is flushed. Returns the number of connections drained.
    pub fn drain_connections(&self) -> usize {
        let after = self.config.http.drain_reconnect_after;
        let after_ms = u32::try_from(after.as_millis()).unwrap_or(u32::MAX);
        let frame = match qs_wire::frame::encode_drain(after_ms) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode drain frame");
                return 0;
            }
        };
        let mut drained = 0;
        for conn in self.connections.iter() {
            conn.send_frame(frame.clone());
            conn.close(CloseReason::Normal);
            drained += 1;
        }
        info!(connections = drained, reconnect_after_ms = after_ms, "connections drained");
        drained
    }

    /// Close every observable and channel.
    pub fn close_tables(&self) {
        self.observables.close_all();
        self.channels.close_all();
    }

    /// Table sizes and connection counts for the admin port
    pub fn stats(&self) -> Value {
        json!({
            "connections": self.connections.len(),
            "observables": {
                "active": self.observables.len(),
                "subscribers": self.observables.subscriber_count(),
            },
            "channels": {
                "active": self.channels.len(),
                "subscribers": self.channels.subscriber_count(),
            },
            "routes_installed": self.registry.len(),
            "rate_limit": {
                "ws_sources": self.limiters.ws.tracked_sources(),
                "http_sources": self.limiters.http.tracked_sources(),
                "reconnect_sources": self.limiters.reconnect.tracked_sources(),
            },
            "functions_in_flight": self.runner.in_flight(self.config.functions.max_in_flight),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::installer::StaticInstaller;
    use crate::ports::AllowAll;
    use qs_wire::OutgoingFrame;

    fn context() -> Arc<ServerContext> {
        ServerContext::new(
            GatewayConfig::default(),
            Arc::new(StaticInstaller::new()),
            Arc::new(AllowAll),
        )
    }

    #[tokio::test]
    async fn test_drain_sends_reconnect_hint_then_closes() {
        let ctx = context();
        let out = Outbound::new(
            ClientId::new(),
            ctx.config.backpressure.clone(),
            Arc::clone(&ctx.metrics),
        );
        ctx.connections.insert(out.client_id(), Arc::clone(&out));

        assert_eq!(ctx.drain_connections(), 1);
        let frames: Vec<_> = out
            .drain()
            .iter()
            .flat_map(|f| OutgoingFrame::decode_all(f).unwrap())
            .collect();
        assert!(matches!(frames[..], [OutgoingFrame::Drain { .. }]));
        assert_eq!(out.close_reason(), Some(CloseReason::Normal));
    }

    #[test]
    fn test_stats_shape() {
        let stats = context().stats();
        assert_eq!(stats["connections"], 0);
        assert_eq!(stats["observables"]["active"], 0);
        assert_eq!(stats["functions_in_flight"], 0);
    }
}
