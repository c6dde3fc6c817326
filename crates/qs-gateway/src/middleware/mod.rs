//! Middleware for the sync gateway.
//!
//! Layer order: Request → CORS → IpProtection → Tracing → RateLimit (HTTP
//! routes only) → Handler. The WebSocket upgrade is charged against the
//! reconnect limiter by its handler instead, and every frame after it
//! against the ws limiter. Authorization runs per route inside the handlers.

pub mod authorize;
pub mod cors;
pub mod ip_protection;
pub mod metrics;
pub mod rate_limit;
pub mod tracing;

pub use authorize::AuthorizeGate;
pub use cors::create_cors_layer;
pub use ip_protection::{ClientIp, IpProtectionLayer};
pub use metrics::{GatewayMetrics, RequestTimer};
pub use rate_limit::{RateDecision, RateLimitLayer, RateLimiter, RateLimiters};
pub use tracing::TracingLayer;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::context::ServerContext;

/// Middleware stack builder
pub struct MiddlewareStack {
    pub cors: CorsLayer,
    pub ip_protection: IpProtectionLayer,
    pub tracing: TracingLayer,
    pub rate_limit: RateLimitLayer,
}

impl MiddlewareStack {
    /// Create middleware stack from the server's config and limiters
    pub fn from_context(ctx: &ServerContext) -> Self {
        Self {
            cors: create_cors_layer(&ctx.config.cors),
            ip_protection: IpProtectionLayer::new(ctx.config.security.clone()),
            tracing: TracingLayer::new(),
            rate_limit: RateLimitLayer::new(std::sync::Arc::clone(&ctx.limiters.http)),
        }
    }

    /// Wrap `http` in the per-request rate limit, merge `ws` next to it and
    /// put both behind the shared layers.
    pub fn apply(self, http: Router, ws: Router) -> Router {
        ws.merge(http.layer(self.rate_limit)).layer(
            ServiceBuilder::new()
                .layer(self.cors)
                .layer(self.ip_protection)
                .layer(self.tracing),
        )
    }
}
