//! Installed route definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ports::{
    Authorizer, ChannelFunction, FunctionHandler, QueryExecutor, StreamHandler, UpstreamClient,
};

/// How a route is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Query,
    Function,
    Channel,
    Stream,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteKind::Query => "query",
            RouteKind::Function => "function",
            RouteKind::Channel => "channel",
            RouteKind::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Implementation behind a route
#[derive(Clone)]
pub enum RouteHandler {
    Query(Arc<dyn QueryExecutor>),
    Function(Arc<dyn FunctionHandler>),
    Channel(Arc<dyn ChannelFunction>),
    /// Channel forwarded from the same-named channel on an upstream server
    Relay(Arc<dyn UpstreamClient>),
    Stream(Arc<dyn StreamHandler>),
}

impl RouteHandler {
    pub fn kind(&self) -> RouteKind {
        match self {
            RouteHandler::Query(_) => RouteKind::Query,
            RouteHandler::Function(_) => RouteKind::Function,
            RouteHandler::Channel(_) | RouteHandler::Relay(_) => RouteKind::Channel,
            RouteHandler::Stream(_) => RouteKind::Stream,
        }
    }
}

/// One installed route and its per-route overrides.
#[derive(Clone)]
pub struct RouteSpec {
    pub name: String,
    pub handler: RouteHandler,
    /// Skip the authorization gate
    pub public: bool,
    /// Overrides the global payload ceiling (never raises it)
    pub max_payload_size: Option<usize>,
    /// Rate limiter tokens charged per request
    pub rate_limit_tokens: u64,
    pub close_after_idle: Option<Duration>,
    /// Channel publish coalescing window
    pub throttle: Option<Duration>,
    /// Overrides the server-wide diffing switch
    pub diffing: Option<bool>,
    pub timeout: Option<Duration>,
    /// Overrides the server-wide authorizer
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl RouteSpec {
    fn new(name: impl Into<String>, handler: RouteHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            public: false,
            max_payload_size: None,
            rate_limit_tokens: 1,
            close_after_idle: None,
            throttle: None,
            diffing: None,
            timeout: None,
            authorizer: None,
        }
    }

    pub fn query(name: impl Into<String>, executor: Arc<dyn QueryExecutor>) -> Self {
        Self::new(name, RouteHandler::Query(executor))
    }

    pub fn function(name: impl Into<String>, handler: Arc<dyn FunctionHandler>) -> Self {
        Self::new(name, RouteHandler::Function(handler))
    }

    pub fn channel(name: impl Into<String>, channel: Arc<dyn ChannelFunction>) -> Self {
        Self::new(name, RouteHandler::Channel(channel))
    }

    pub fn relay(name: impl Into<String>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self::new(name, RouteHandler::Relay(upstream))
    }

    pub fn stream(name: impl Into<String>, handler: Arc<dyn StreamHandler>) -> Self {
        Self::new(name, RouteHandler::Stream(handler))
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = Some(bytes);
        self
    }

    pub fn with_rate_limit_tokens(mut self, tokens: u64) -> Self {
        self.rate_limit_tokens = tokens.max(1);
        self
    }

    pub fn with_close_after_idle(mut self, idle: Duration) -> Self {
        self.close_after_idle = Some(idle);
        self
    }

    pub fn with_throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }

    pub fn with_diffing(mut self, enabled: bool) -> Self {
        self.diffing = Some(enabled);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn kind(&self) -> RouteKind {
        self.handler.kind()
    }

    /// Effective payload limit given the global ceiling
    pub fn payload_limit(&self, global: usize) -> usize {
        self.max_payload_size.map_or(global, |own| own.min(global))
    }
}

impl fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSpec")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("public", &self.public)
            .field("max_payload_size", &self.max_payload_size)
            .field("rate_limit_tokens", &self.rate_limit_tokens)
            .field("close_after_idle", &self.close_after_idle)
            .field("throttle", &self.throttle)
            .field("diffing", &self.diffing)
            .field("timeout", &self.timeout)
            .finish()
    }
}
