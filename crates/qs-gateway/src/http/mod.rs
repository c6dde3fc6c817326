//! HTTP surface: cacheable query GETs plus function, channel and stream POSTs.

pub mod encoding;
pub mod handler;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::context::ServerContext;

pub use handler::{error_response, http_call};

/// Route handlers without middleware, state applied.
pub fn routes(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/:name", get(http_call).post(http_call))
        .with_state(ctx)
}
