//! Request spans for the HTTP surface.

use std::task::{Context, Poll};
use std::time::Instant;

use axum::{body::Body, http::Request, response::Response};
use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument, Span};

use crate::middleware::ip_protection::ClientIp;

/// One `sync_request` span per request, closed with status and latency.
#[derive(Clone, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        let span = info_span!(
            "sync_request",
            http.method = %req.method(),
            route = route_name(req.uri().path()),
            ip = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        if let Some(ClientIp(ip)) = req.extensions().get::<ClientIp>() {
            span.record("ip", tracing::field::display(ip));
        }

        Box::pin(
            async move {
                let started = Instant::now();
                let result = inner.call(req).await;
                let span = Span::current();
                span.record("latency_ms", started.elapsed().as_millis() as u64);
                if let Ok(response) = &result {
                    let status = response.status();
                    span.record("status", status.as_u16());
                    if status.is_server_error() {
                        debug!(status = status.as_u16(), "request failed");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Route name addressed by a request path
fn route_name(path: &str) -> &str {
    path.trim_start_matches('/')
}
