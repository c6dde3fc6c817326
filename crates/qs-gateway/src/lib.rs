//! Quantum-Sync gateway - shared query subscriptions and pub/sub channels
//! over WebSocket and HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         SYNC GATEWAY                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐        ┌─────────────┐             │
//! │  │  HTTP + WebSocket (9910) │        │ Admin (9911)│             │
//! │  └────────────┬─────────────┘        └─────────────┘             │
//! │  ┌────────────┴─────────────────────────────────┐                │
//! │  │ CORS → IpProtection → Tracing → RateLimit    │                │
//! │  └────────────┬─────────────────────────────────┘                │
//! │  ┌────────────┴──────────┐   ┌────────────────────┐              │
//! │  │ WS router / HTTP call │ → │ Function registry  │              │
//! │  └────────────┬──────────┘   └────────────────────┘              │
//! │         Authorize gate                                           │
//! │  ┌────────────┴──────────┐   ┌────────────────────┐              │
//! │  │   Observable table    │   │   Channel table    │              │
//! │  └────────────┬──────────┘   └─────────┬──────────┘              │
//! │               └──── outbound queues ───┘                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every distinct `(route, payload)` pair is computed once and shared by all
//! of its subscribers. Values carry a checksum; subscribers that already hold
//! the previous value receive a diff instead of the full value.
//!
//! # Usage
//!
//! ```ignore
//! use qs_gateway::{GatewayConfig, StaticInstaller, SyncGatewayService};
//!
//! let installer = StaticInstaller::new().with_route(RouteSpec::query("region", executor));
//! let service = SyncGatewayService::new(GatewayConfig::default(), Arc::new(installer), Arc::new(AllowAll))?;
//! service.start().await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod channel;
pub mod context;
pub mod domain;
pub mod http;
pub mod lifecycle;
pub mod middleware;
pub mod observable;
pub mod ports;
pub mod registry;
pub mod runner;
pub mod service;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod ws;

// Re-exports for public API
pub use adapters::{StaticInstaller, WsUpstream};
pub use channel::{ChannelEmitter, ChannelTable};
pub use context::ServerContext;
pub use domain::config::GatewayConfig;
pub use domain::error::{GatewayError, SyncError, SyncResult};
pub use domain::route::{RouteKind, RouteSpec};
pub use domain::session::{ClientId, Session};
pub use middleware::GatewayMetrics;
pub use observable::{ObservableEmitter, ObservableTable, Update};
pub use ports::{AllowAll, CloseHandle, FunctionError};
pub use registry::FunctionRegistry;
pub use service::SyncGatewayService;
pub use ws::WsConnection;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server identification sent in logs and the admin API
pub fn server_version() -> String {
    format!("QuantumSync/v{}/rust", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert!(server_version().starts_with("QuantumSync/"));
        assert!(server_version().contains(VERSION));
    }
}
