//! Sync gateway service - main entry point.
//!
//! Serves HTTP and WebSocket on one listener and the admin API on another,
//! and owns the background tasks (idle sweepers, rate-limit drains, idle
//! route uninstall) for the lifetime of the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::ServerContext;
use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::http;
use crate::lifecycle::sweeper_task;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::rate_limit::drain_task;
use crate::middleware::MiddlewareStack;
use crate::ports::{Authorizer, FunctionInstaller};
use crate::registry::uninstall_task;
use crate::ws::ws_upgrade;

/// Longest wait for drained clients to disconnect on their own
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Sync gateway service state
pub struct SyncGatewayService {
    ctx: Arc<ServerContext>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncGatewayService {
    /// Create a new sync gateway service
    pub fn new(
        config: GatewayConfig,
        installer: Arc<dyn FunctionInstaller>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: ServerContext::new(config, installer, authorizer),
            shutdown_tx,
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Trigger graceful shutdown. Works before or during `start`.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind the configured addresses and serve until [`Self::shutdown`].
    pub async fn start(&self) -> Result<(), GatewayError> {
        let config = &self.ctx.config;
        let http = if config.http.enabled {
            Some(bind(config.http_addr()).await?)
        } else {
            None
        };
        let admin = if config.admin.enabled {
            Some(bind(config.admin_addr()).await?)
        } else {
            None
        };
        self.serve(http, admin).await
    }

    /// Serve on already bound listeners until [`Self::shutdown`].
    pub async fn serve(
        &self,
        http: Option<TcpListener>,
        admin: Option<TcpListener>,
    ) -> Result<(), GatewayError> {
        info!("Starting sync gateway...");
        let (stop_tx, _) = broadcast::channel::<()>(1);
        let tasks = self.start_background_tasks(&stop_tx);

        let mut servers = Vec::new();
        if let Some(listener) = http {
            let router = self.build_http_router();
            servers.push(spawn_server("http", listener, router, stop_tx.subscribe()));
        }
        if let Some(listener) = admin {
            let router = self.build_admin_router();
            servers.push(spawn_server("admin", listener, router, stop_tx.subscribe()));
        }
        info!("Sync gateway started successfully");

        let mut shutdown = self.shutdown_tx.subscribe();
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Received shutdown signal");

        self.ctx.drain_connections();
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while !self.ctx.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = stop_tx.send(());
        for server in servers {
            if let Ok(Err(e)) = server.await {
                error!(error = %e, "server error");
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        self.ctx.close_tables();
        info!("Sync gateway stopped");
        Ok(())
    }

    /// HTTP routes plus the WebSocket upgrade, behind the middleware stack
    pub fn build_http_router(&self) -> Router {
        let ws = Router::new()
            .route(&self.ctx.config.http.websocket_path, get(ws_upgrade))
            .with_state(Arc::clone(&self.ctx));
        MiddlewareStack::from_context(&self.ctx).apply(http::routes(Arc::clone(&self.ctx)), ws)
    }

    /// Admin API: health, Prometheus metrics and table stats
    pub fn build_admin_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(prometheus_metrics))
            .route("/stats", get(stats))
            .with_state(Arc::clone(&self.ctx))
    }

    fn start_background_tasks(&self, stop: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let ctx = &self.ctx;
        let mut tasks = vec![
            tokio::spawn(sweeper_task(
                Arc::clone(&ctx.observables),
                ctx.config.observables.sweep.clone(),
                stop.subscribe(),
            )),
            tokio::spawn(sweeper_task(
                Arc::clone(&ctx.channels),
                ctx.config.channels.sweep.clone(),
                stop.subscribe(),
            )),
            tokio::spawn(uninstall_task(Arc::clone(&ctx.registry), stop.subscribe())),
        ];
        for limiter in ctx.limiters.all() {
            tasks.push(tokio::spawn(drain_task(limiter, stop.subscribe())));
        }
        tasks
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Bind(format!("{addr}: {e}")))
}

fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut stop: broadcast::Receiver<()>,
) -> JoinHandle<std::io::Result<()>> {
    if let Ok(addr) = listener.local_addr() {
        info!(server = name, %addr, "listening");
    }
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
    })
}

/// Health check endpoint
async fn health_check(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": crate::server_version(),
        "connections": ctx.connections.len(),
    }))
}

async fn prometheus_metrics(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.to_prometheus(),
    )
}

async fn stats(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    let mut body = ctx.stats();
    body["metrics"] = ctx.metrics.to_json();
    Json(body)
}
