//! # Runtime Configuration
//!
//! The gateway configuration plus the route catalogue settings, read from a
//! TOML file and overridden from the environment.
//!
//! ```toml
//! demo_routes = true
//!
//! [gateway.http]
//! port = 9910
//!
//! [gateway.observables]
//! close_after_idle = "5s"
//!
//! [[relay]]
//! name = "prices"
//! url = "ws://upstream.internal:9910/"
//! ```

use std::path::Path;

use qs_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Complete runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Install the built-in demo routes
    pub demo_routes: bool,
    pub gateway: GatewayConfig,
    /// Channels relayed from other sync servers
    pub relay: Vec<RelayRoute>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            demo_routes: true,
            gateway: GatewayConfig::default(),
            relay: Vec::new(),
        }
    }
}

/// A local channel route backed by an upstream server's channel of the
/// same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRoute {
    pub name: String,
    pub url: String,
    /// Token sent to the upstream before subscribing
    #[serde(default)]
    pub token: Option<String>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Ok(Self::default());
        };
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config = Self::from_toml(&text, &shown)?;
        info!(path = %shown, "Loaded configuration");
        Ok(config)
    }

    /// Apply `QS_HTTP_PORT` / `QS_ADMIN_PORT` overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (key, port) in [
            ("QS_HTTP_PORT", &mut self.gateway.http.port),
            ("QS_ADMIN_PORT", &mut self.gateway.admin.port),
        ] {
            if let Some(value) = lookup(key) {
                match value.parse() {
                    Ok(p) => *port = p,
                    Err(_) => warn!(key, value = %value, "ignoring invalid port override"),
                }
            }
        }
    }

    /// Check the gateway config and the relay list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut seen = std::collections::HashSet::new();
        for relay in &self.relay {
            if relay.name.is_empty() || relay.name.len() > self.gateway.limits.max_name_length {
                return Err(ConfigError::Invalid(format!(
                    "relay name {:?} is empty or too long",
                    relay.name
                )));
            }
            if !relay.url.starts_with("ws://") && !relay.url.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "relay {} needs a ws:// or wss:// url",
                    relay.name
                )));
            }
            if !seen.insert(relay.name.as_str()) {
                return Err(ConfigError::Invalid(format!("relay {} listed twice", relay.name)));
            }
        }
        Ok(())
    }
}
