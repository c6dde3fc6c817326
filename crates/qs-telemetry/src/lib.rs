//! # Quantum-Sync Telemetry
//!
//! Logging setup shared by the Quantum-Sync binaries.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qs_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     init_telemetry(TelemetryConfig::from_env()).expect("Failed to init telemetry");
//!     tracing::info!("ready");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QS_SERVICE_NAME` | `quantum-sync` | Service name in logs |
//! | `QS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `QS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `QS_JSON_LOGS` | `false` (`true` in containers) | JSON lines output |

mod config;
mod logging;
mod subscriber;

pub use config::TelemetryConfig;
pub use subscriber::{env_filter, init_subscriber};

use thiserror::Error;

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Initialize logging for the process.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    init_subscriber(&config)
}

/// Convenience macro for creating a span with component context.
///
/// ```rust
/// let _span = qs_telemetry::component_span!("sweep", component = "observables");
/// ```
#[macro_export]
macro_rules! component_span {
    ($name:expr, $($field:tt)*) => {
        $crate::__private::tracing::info_span!($name, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            console_output: false,
            log_level: "off".into(),
            ..TelemetryConfig::default()
        };
        let _ = init_telemetry(config.clone());
        assert!(matches!(
            init_telemetry(config),
            Err(TelemetryError::AlreadyInitialized(_))
        ));
    }
}
