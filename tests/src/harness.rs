//! Drives [`WsConnection`]s without a socket.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use qs_gateway::ports::Authorizer;
use qs_gateway::ws::connection::Flow;
use qs_gateway::{AllowAll, GatewayConfig, RouteSpec, ServerContext, StaticInstaller, WsConnection};
use qs_wire::{OutgoingFrame, Payload};

/// Server context with `routes` installed.
pub fn server(config: GatewayConfig, routes: Vec<RouteSpec>) -> Arc<ServerContext> {
    server_with_authorizer(config, routes, Arc::new(AllowAll))
}

pub fn server_with_authorizer(
    config: GatewayConfig,
    routes: Vec<RouteSpec>,
    authorizer: Arc<dyn Authorizer>,
) -> Arc<ServerContext> {
    let installer = StaticInstaller::new();
    for route in routes {
        installer.insert(route);
    }
    ServerContext::new(config, Arc::new(installer), authorizer)
}

/// A connected client and everything the server queued for it.
pub struct TestClient {
    pub conn: Arc<WsConnection>,
}

impl TestClient {
    pub fn connect(ctx: &Arc<ServerContext>) -> Self {
        Self::connect_from(ctx, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn connect_from(ctx: &Arc<ServerContext>, ip: IpAddr) -> Self {
        Self {
            conn: WsConnection::new(Arc::clone(ctx), ip, Payload::Undefined),
        }
    }

    pub async fn send(&self, frame: Bytes) -> Flow {
        self.conn.handle_binary(&frame).await
    }

    /// Frames queued so far.
    pub fn received(&self) -> Vec<OutgoingFrame> {
        self.conn
            .outbound()
            .drain()
            .iter()
            .flat_map(|frame| OutgoingFrame::decode_all(frame).unwrap_or_default())
            .collect()
    }

    /// Wait until at least `count` frames arrived.
    pub async fn expect(&self, count: usize) -> Vec<OutgoingFrame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while frames.len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} frames, got {frames:?}"
            );
            frames.extend(self.received());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        frames
    }

    /// Let spawned work run, then assert nothing was sent.
    pub async fn expect_silence(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = self.received();
        assert!(frames.is_empty(), "unexpected frames {frames:?}");
    }
}

/// The `type` of an error frame.
pub fn error_type(frame: &OutgoingFrame) -> Option<&str> {
    match frame {
        OutgoingFrame::Error { error } => error.get("type").and_then(|t| t.as_str()),
        _ => None,
    }
}
