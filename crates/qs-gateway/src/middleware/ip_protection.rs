//! Client IP resolution.
//!
//! Rate limiting and sessions key on the client IP. `X-Forwarded-For` is only
//! honoured when the direct peer is a trusted proxy, otherwise any client
//! could pick its own rate-limit bucket.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap, Request},
    response::Response,
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::domain::config::SecurityConfig;

/// Resolved client address, stored as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = parts.extensions.get::<ClientIp>() {
            return Ok(*ip);
        }
        // layer not installed: fall back to the socket peer
        let direct = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Ok(ClientIp(direct))
    }
}

/// IP protection layer
#[derive(Clone)]
pub struct IpProtectionLayer {
    config: Arc<SecurityConfig>,
}

impl IpProtectionLayer {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for IpProtectionLayer {
    type Service = IpProtectionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpProtectionService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// IP protection service
#[derive(Clone)]
pub struct IpProtectionService<S> {
    inner: S,
    config: Arc<SecurityConfig>,
}

impl<S> Service<Request<Body>> for IpProtectionService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let direct_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let real_ip = resolve_client_ip(req.headers(), direct_ip, &self.config);
        req.extensions_mut().insert(ClientIp(real_ip));

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

/// Client IP for a request arriving from `direct_ip`.
pub fn resolve_client_ip(headers: &HeaderMap, direct_ip: IpAddr, config: &SecurityConfig) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());

    if !is_trusted_proxy(direct_ip, config) {
        if forwarded.is_some() {
            warn!(direct_ip = %direct_ip, "ignoring X-Forwarded-For from untrusted peer");
        }
        return direct_ip;
    }

    let Some(forwarded) = forwarded else {
        return direct_ip;
    };
    // each trusted hop appended the address it saw; the client is
    // `proxy_count` entries from the right
    let hops: Vec<&str> = forwarded.split(',').map(str::trim).collect();
    let candidate = hops
        .len()
        .checked_sub(config.proxy_count.max(1))
        .and_then(|i| hops.get(i));
    match candidate.and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(ip) => {
            debug!(forwarded, client_ip = %ip, "client IP from X-Forwarded-For");
            ip
        }
        None => direct_ip,
    }
}

fn is_trusted_proxy(ip: IpAddr, config: &SecurityConfig) -> bool {
    config.trusted_proxies.contains(&ip) || (config.trust_localhost && ip.is_loopback())
}
