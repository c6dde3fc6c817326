//! # Quantum-Sync Server
//!
//! ```text
//! sync-runtime --config sync.toml --log-level debug
//! sync-runtime --print-config > sync.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use qs_telemetry::{init_telemetry, TelemetryConfig};
use sync_runtime::{RuntimeConfig, SyncRuntime};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "sync-runtime", version, about = "Real-time data sync server")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `qs_gateway=debug`
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    http_port: Option<u16>,

    #[arg(long)]
    admin_port: Option<u16>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::load(cli.config.as_deref())?;
    config.apply_env();
    if let Some(port) = cli.http_port {
        config.gateway.http.port = port;
    }
    if let Some(port) = cli.admin_port {
        config.gateway.admin.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl+C")?,
            _ = term.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::from_env();
    if let Some(level) = &cli.log_level {
        telemetry = telemetry.with_log_level(level.as_str());
    }
    init_telemetry(telemetry).context("initializing logging")?;

    let config = load_config(&cli)?;
    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config).context("serializing configuration")?);
        return Ok(());
    }

    let runtime = Arc::new(SyncRuntime::new(config)?);
    let mut server = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run().await })
    };

    info!("Server is running. Press Ctrl+C to stop.");
    let outcome = tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            runtime.shutdown();
            None
        }
        // only reached when the server failed to start
        outcome = &mut server => Some(outcome),
    };
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => server.await,
    };

    match outcome {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server failed");
            Err(e.into())
        }
        Err(e) => Err(e).context("server task panicked"),
    }
}
