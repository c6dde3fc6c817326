//! Gateway configuration with validation.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP + WebSocket server
    pub http: HttpConfig,
    /// Admin server (health, metrics, stats)
    pub admin: AdminConfig,
    /// Rate limiter instances
    pub rate_limit: RateLimitConfig,
    /// Size and count limits
    pub limits: LimitsConfig,
    /// Observable table tuning
    pub observables: ObservablesConfig,
    /// Channel table tuning
    pub channels: ChannelsConfig,
    /// Per-connection outbound queue
    pub backpressure: BackpressureConfig,
    /// Function registry and runner
    pub functions: FunctionsConfig,
    /// CORS configuration
    pub cors: CorsConfig,
    /// Client IP resolution
    pub security: SecurityConfig,
}

impl GatewayConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.enabled && self.admin.enabled && self.http.port == self.admin.port {
            return Err(ConfigError::DuplicatePorts);
        }

        for (name, limiter) in [
            ("ws", &self.rate_limit.ws),
            ("http", &self.rate_limit.http),
            ("reconnect", &self.rate_limit.reconnect),
        ] {
            if limiter.max == 0 {
                return Err(ConfigError::InvalidRateLimit(format!(
                    "{name}.max cannot be 0"
                )));
            }
            if limiter.drain_interval.is_zero() {
                return Err(ConfigError::InvalidRateLimit(format!(
                    "{name}.drain_interval cannot be 0"
                )));
            }
        }

        if self.limits.max_payload_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_payload_size cannot be 0".into(),
            ));
        }
        if self.limits.max_chunk_size == 0 {
            return Err(ConfigError::InvalidLimit("max_chunk_size cannot be 0".into()));
        }
        if self.limits.max_name_length == 0 || self.limits.max_name_length > qs_wire::MAX_NAME_LENGTH {
            return Err(ConfigError::InvalidLimit(format!(
                "max_name_length must be within 1..={}",
                qs_wire::MAX_NAME_LENGTH
            )));
        }

        for (name, sweep) in [
            ("observables", &self.observables.sweep),
            ("channels", &self.channels.sweep),
        ] {
            if sweep.min_interval.is_zero() || sweep.min_interval > sweep.max_interval {
                return Err(ConfigError::InvalidTimeout(format!(
                    "{name} sweep interval bounds are inverted or zero"
                )));
            }
        }

        if self.backpressure.max_queued_frames == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_queued_frames cannot be 0".into(),
            ));
        }

        if self.functions.default_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "default function timeout cannot be 0".into(),
            ));
        }
        if self.functions.max_in_flight == 0 {
            return Err(ConfigError::InvalidLimit("max_in_flight cannot be 0".into()));
        }

        Ok(())
    }

    /// HTTP (and WebSocket) bind address
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }

    /// Admin bind address
    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(self.admin.host, self.admin.port)
    }
}

/// HTTP server configuration. WebSocket upgrades share this listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: IpAddr,
    /// Port (default: 9910)
    pub port: u16,
    pub enabled: bool,
    /// Path that accepts WebSocket upgrades
    pub websocket_path: String,
    /// Delay suggested to clients in the drain frame sent on shutdown
    #[serde(with = "humantime_serde")]
    pub drain_reconnect_after: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 9910,
            enabled: true,
            websocket_path: "/".to_string(),
            drain_reconnect_after: Duration::from_millis(1000),
        }
    }
}

/// Admin server configuration (localhost only by default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub host: IpAddr,
    /// Port (default: 9911)
    pub port: u16,
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9911,
            enabled: true,
        }
    }
}

/// One counter-and-drain limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Counter value at which requests are rejected
    pub max: u64,
    /// Subtracted from every source each drain
    pub drain_amount: u64,
    #[serde(with = "humantime_serde")]
    pub drain_interval: Duration,
    pub enabled: bool,
    /// Sources that are never limited
    pub whitelist: Vec<IpAddr>,
}

impl LimiterConfig {
    pub fn new(max: u64, drain_amount: u64, drain_interval: Duration) -> Self {
        Self {
            max,
            drain_amount,
            drain_interval,
            enabled: true,
            whitelist: Vec::new(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::new(1000, 500, Duration::from_secs(30))
    }
}

/// Rate limiter instances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Charged per WebSocket frame
    pub ws: LimiterConfig,
    /// Charged per HTTP request
    pub http: LimiterConfig,
    /// Charged per WebSocket upgrade
    pub reconnect: LimiterConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ws: LimiterConfig::new(2000, 500, Duration::from_secs(30)),
            http: LimiterConfig::new(1000, 500, Duration::from_secs(30)),
            reconnect: LimiterConfig::new(100, 50, Duration::from_secs(30)),
        }
    }
}

/// Request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global payload ceiling in bytes (default: 5MB)
    pub max_payload_size: usize,
    /// Max stream chunk in bytes (default: 1MB)
    pub max_chunk_size: usize,
    pub max_subscriptions_per_connection: usize,
    pub max_name_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 5 * 1024 * 1024,
            max_chunk_size: 1024 * 1024,
            max_subscriptions_per_connection: 1000,
            max_name_length: 255,
        }
    }
}

/// Bounds for the self-tuning idle sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
        }
    }
}

/// Observable table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservablesConfig {
    /// Default grace period before an unreferenced observable is closed
    #[serde(with = "humantime_serde")]
    pub close_after_idle: Duration,
    #[serde(flatten)]
    pub sweep: SweepConfig,
    pub diff_enabled: bool,
}

impl Default for ObservablesConfig {
    fn default() -> Self {
        Self {
            close_after_idle: Duration::from_secs(3),
            sweep: SweepConfig::default(),
            diff_enabled: true,
        }
    }
}

/// Channel table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    #[serde(with = "humantime_serde")]
    pub close_after_idle: Duration,
    #[serde(flatten)]
    pub sweep: SweepConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            close_after_idle: Duration::from_secs(3),
            sweep: SweepConfig::default(),
        }
    }
}

/// Outbound queue limits for slow consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_queued_frames: usize,
    /// Oldest queued frame may wait this long before the connection is closed
    #[serde(with = "humantime_serde")]
    pub max_staleness: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queued_frames: 50,
            max_staleness: Duration::from_secs(10),
        }
    }
}

/// Function registry and runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Installed routes unused for this long are dropped
    #[serde(with = "humantime_serde")]
    pub uninstall_after_idle: Duration,
    /// Concurrent function calls across the server
    pub max_in_flight: usize,
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            uninstall_after_idle: Duration::from_secs(5 * 60),
            max_in_flight: 1_000_000,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    /// Max age for preflight cache in seconds
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        let headers = [
            "Authorization",
            "Content-Type",
            "Content-Encoding",
            "Content-Length",
            "Accept-Encoding",
            "If-None-Match",
            "File-Id",
            "File-Name",
            "Function-Name",
            "File-Extension",
            "File-Size",
        ];
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: headers.iter().map(|h| h.to_string()).collect(),
            expose_headers: vec!["ETag".to_string()],
            max_age: 86400,
        }
    }
}

/// Client IP resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Proxies allowed to set X-Forwarded-For
    pub trusted_proxies: Vec<IpAddr>,
    /// Treat loopback peers as trusted proxies
    pub trust_localhost: bool,
    /// Number of proxies in chain (for X-Forwarded-For parsing)
    pub proxy_count: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: Vec::new(),
            trust_localhost: true,
            proxy_count: 1,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("http and admin servers share a port")]
    DuplicatePorts,
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
}

/// Duration (de)serialization as "250ms", "3s", "5m"
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
