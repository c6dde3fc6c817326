//! # Sync Runtime
//!
//! Wires the route catalogue and the configuration into a
//! [`SyncGatewayService`]. The `sync-runtime` binary is a thin CLI over
//! [`SyncRuntime`].
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (TOML file, then environment overrides)
//! 2. Validate it
//! 3. Build the installer (demo routes and relays)
//! 4. Bind the listeners and serve
//!
//! Shutdown drains WebSocket clients before the listeners close.

pub mod catalogue;
pub mod config;

use std::sync::Arc;

use qs_gateway::{AllowAll, GatewayError, ServerContext, SyncGatewayService};
use qs_telemetry::log_event;
use tokio::net::TcpListener;

pub use config::{ConfigError, RelayRoute, RuntimeConfig};

/// The running server.
pub struct SyncRuntime {
    service: Arc<SyncGatewayService>,
    config: RuntimeConfig,
}

impl SyncRuntime {
    /// Build the service from a validated configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let installer = catalogue::build_installer(config.demo_routes, &config.relay);
        log_event!(
            info,
            "runtime",
            "route catalogue ready",
            routes = ?installer.names(),
            relays = config.relay.len()
        );
        let service = SyncGatewayService::new(
            config.gateway.clone(),
            Arc::new(installer),
            Arc::new(AllowAll),
        )?;
        Ok(Self {
            service: Arc::new(service),
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.service.context()
    }

    /// Handle for triggering shutdown from another task.
    pub fn service(&self) -> Arc<SyncGatewayService> {
        Arc::clone(&self.service)
    }

    /// Serve on the configured addresses until [`Self::shutdown`].
    pub async fn run(&self) -> Result<(), GatewayError> {
        log_event!(
            info,
            "runtime",
            "starting",
            version = %qs_gateway::server_version(),
            http = %self.config.gateway.http_addr(),
            admin = %self.config.gateway.admin_addr()
        );
        self.service.start().await
    }

    /// Serve on already bound listeners.
    pub async fn run_on(
        &self,
        http: Option<TcpListener>,
        admin: Option<TcpListener>,
    ) -> Result<(), GatewayError> {
        self.service.serve(http, admin).await
    }

    pub fn shutdown(&self) {
        log_event!(info, "runtime", "shutdown requested");
        self.service.shutdown();
    }
}
