use std::time::Duration;

use clap::Parser;
use palaver_server::ServerConfig;
use palaver_telemetry::{init_telemetry, TelemetryConfig};

/// Room-based WebSocket message relay.
#[derive(Debug, Parser)]
#[command(name = "palaver", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Disable the SQLite log and metrics sinks.
    #[arg(long)]
    no_telemetry: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut telemetry_config = TelemetryConfig::default();
    if args.no_telemetry {
        telemetry_config.log_to_sqlite = false;
        telemetry_config.metrics_enabled = false;
    }
    let snapshot_interval = telemetry_config.metrics_snapshot_interval_secs;
    let telemetry = init_telemetry(telemetry_config);

    tracing::info!("starting palaver relay");

    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = palaver_server::start(config, telemetry.metrics()).await?;

    if let Some(metrics) = telemetry.metrics() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(snapshot_interval));
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                if let Err(err) = metrics.snapshot() {
                    tracing::warn!(%err, "metrics snapshot failed");
                }
            }
        });
    }

    tracing::info!(port = handle.port, "palaver ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
