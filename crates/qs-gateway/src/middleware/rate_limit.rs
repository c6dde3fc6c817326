//! Per-source rate limiting.
//!
//! Each source IP has a token counter. Requests add tokens; once the counter
//! reaches `max` requests are rejected until a periodic drain brings it back
//! down. The crossing into overflow is logged and counted once, not on every
//! rejected request after it.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::domain::config::{LimiterConfig, RateLimitConfig};
use crate::domain::error::{SyncError, SyncResult};
use crate::middleware::ip_protection::ClientIp;
use crate::middleware::metrics::GatewayMetrics;

/// Outcome of charging a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// `first` is set on the request that crossed the limit
    Rejected { first: bool },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Default)]
struct SourceCounter {
    tokens: u64,
    overflowed: bool,
}

/// One independent limiter (WebSocket, HTTP, or reconnect).
pub struct RateLimiter {
    name: &'static str,
    config: LimiterConfig,
    counters: DashMap<IpAddr, SourceCounter>,
    metrics: Arc<GatewayMetrics>,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: LimiterConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            name,
            config,
            counters: DashMap::new(),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Add `tokens` to the source's counter and decide.
    pub fn charge(&self, ip: IpAddr, tokens: u64) -> RateDecision {
        if !self.config.enabled || self.config.whitelist.contains(&ip) {
            return RateDecision::Allowed;
        }
        let mut counter = self.counters.entry(ip).or_default();
        counter.tokens = counter.tokens.saturating_add(tokens);
        if counter.tokens < self.config.max {
            return RateDecision::Allowed;
        }
        let first = !counter.overflowed;
        counter.overflowed = true;
        drop(counter);

        self.metrics.record_rate_limit_rejection(first);
        if first {
            warn!(limiter = self.name, ip = %ip, max = self.config.max, "rate limit exceeded");
        }
        RateDecision::Rejected { first }
    }

    /// [`RateLimiter::charge`] as a result.
    pub fn check(&self, ip: IpAddr, tokens: u64) -> SyncResult<()> {
        match self.charge(ip, tokens) {
            RateDecision::Allowed => Ok(()),
            RateDecision::Rejected { .. } => Err(SyncError::RateLimit),
        }
    }

    /// Subtract one drain step from every source and forget idle ones.
    pub fn drain(&self) {
        let amount = self.config.drain_amount;
        let max = self.config.max;
        let before = self.counters.len();
        self.counters.retain(|_, counter| {
            counter.tokens = counter.tokens.saturating_sub(amount);
            if counter.tokens < max {
                counter.overflowed = false;
            }
            counter.tokens > 0
        });
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(limiter = self.name, removed, "rate limit sources drained");
        }
    }

    /// Number of tracked sources
    pub fn tracked_sources(&self) -> usize {
        self.counters.len()
    }

    /// Current counter for `ip`
    pub fn tokens(&self, ip: IpAddr) -> u64 {
        self.counters.get(&ip).map_or(0, |c| c.tokens)
    }
}

/// The three limiter instances.
#[derive(Clone)]
pub struct RateLimiters {
    pub ws: Arc<RateLimiter>,
    pub http: Arc<RateLimiter>,
    /// Charged once per WebSocket upgrade
    pub reconnect: Arc<RateLimiter>,
}

impl RateLimiters {
    pub fn new(config: &RateLimitConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            ws: Arc::new(RateLimiter::new("ws", config.ws.clone(), Arc::clone(&metrics))),
            http: Arc::new(RateLimiter::new("http", config.http.clone(), Arc::clone(&metrics))),
            reconnect: Arc::new(RateLimiter::new("reconnect", config.reconnect.clone(), metrics)),
        }
    }

    pub fn all(&self) -> [Arc<RateLimiter>; 3] {
        [
            Arc::clone(&self.ws),
            Arc::clone(&self.http),
            Arc::clone(&self.reconnect),
        ]
    }
}

/// Background task draining one limiter until shutdown.
pub async fn drain_task(limiter: Arc<RateLimiter>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(limiter.config.drain_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => limiter.drain(),
            _ = shutdown.recv() => {
                debug!(limiter = limiter.name, "drain task stopped");
                return;
            }
        }
    }
}

/// 429 response carrying the structured error body
pub fn rate_limit_response(limiter: &RateLimiter) -> Response {
    let body = SyncError::RateLimit.report(None).to_json();
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let retry_after = limiter.config.drain_interval.as_secs().max(1);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Charges one token per HTTP request.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Rate limit service
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = Arc::clone(&self.limiter);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ip = req
                .extensions()
                .get::<ClientIp>()
                .map(|c| c.0)
                .unwrap_or(IpAddr::from([127, 0, 0, 1]));

            if limiter.charge(ip, 1).is_allowed() {
                inner.call(req).await
            } else {
                Ok(rate_limit_response(&limiter))
            }
        })
    }
}
