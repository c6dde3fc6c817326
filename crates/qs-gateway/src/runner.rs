//! Function execution with an in-flight cap and per-route timeouts.
//!
//! Each call runs on its own task so a panicking or slow function cannot
//! stall the connection that issued it.

use std::sync::Arc;
use std::time::Duration;

use qs_wire::Payload;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::config::FunctionsConfig;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::route::{RouteHandler, RouteKind, RouteSpec};
use crate::domain::session::Session;
use crate::middleware::metrics::GatewayMetrics;
use crate::ports::{FunctionError, StreamRequest};

/// Runs plain and stream functions.
#[derive(Clone)]
pub struct FunctionRunner {
    permits: Arc<Semaphore>,
    default_timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl FunctionRunner {
    pub fn new(config: &FunctionsConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_in_flight.min(Semaphore::MAX_PERMITS))),
            default_timeout: config.default_timeout,
            metrics,
        }
    }

    /// Calls currently running
    pub fn in_flight(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.permits.available_permits())
    }

    /// Call a plain function route.
    pub async fn call(
        &self,
        route: &RouteSpec,
        payload: Payload,
        session: &Session,
    ) -> SyncResult<Payload> {
        let RouteHandler::Function(handler) = &route.handler else {
            return Err(SyncError::FunctionIsWrongType {
                name: route.name.clone(),
                expected: RouteKind::Function,
                actual: route.kind(),
            });
        };
        let handler = Arc::clone(handler);
        let session = session.clone();
        self.run(route, async move { handler.call(payload, &session).await })
            .await
    }

    /// Call a stream route with an upload.
    pub async fn call_stream(
        &self,
        route: &RouteSpec,
        request: StreamRequest,
        session: &Session,
    ) -> SyncResult<Payload> {
        let RouteHandler::Stream(handler) = &route.handler else {
            return Err(SyncError::FunctionIsWrongType {
                name: route.name.clone(),
                expected: RouteKind::Stream,
                actual: route.kind(),
            });
        };
        let handler = Arc::clone(handler);
        let session = session.clone();
        self.run(route, async move { handler.call(request, &session).await })
            .await
    }

    async fn run<F>(&self, route: &RouteSpec, call: F) -> SyncResult<Payload>
    where
        F: std::future::Future<Output = Result<Payload, FunctionError>> + Send + 'static,
    {
        let name = route.name.as_str();
        let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(route = name, "in-flight limit reached");
            self.metrics.record_function_call(false);
            return Err(SyncError::function(name, "too many in-flight requests"));
        };

        let limit = route.timeout.unwrap_or(self.default_timeout);
        let task = tokio::spawn(call);
        let abort = task.abort_handle();

        let result = match tokio::time::timeout(limit, task).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(e))) => {
                debug!(route = name, error = %e, "function returned an error");
                Err(e.into_sync(name))
            }
            Ok(Err(join)) => {
                warn!(route = name, error = %join, "function task failed");
                Err(SyncError::function(name, "function panicked"))
            }
            Err(_) => {
                abort.abort();
                warn!(route = name, timeout_ms = limit.as_millis() as u64, "function timed out");
                Err(SyncError::function(name, "function timed out"))
            }
        };
        self.metrics.record_function_call(result.is_ok());
        result
    }
}
