//! GeoTrack - GPS telemetry gateway
//!
//! Ingests station telemetry over TCP, filters noise, classifies motion per
//! device and relays the latest state to a remote API.
//!
//! Module structure:
//! - `domain/` - Readings, samples, filtered state, geo math
//! - `services/` - Noise filter, motion classifiers, repository, tracker
//! - `io/` - Ingest, station clients, auth, relay, status server, event bus
//! - `infra/` - Config, metrics, logging, shutdown

use clap::Parser;
use geotrack::infra::{logging, Config, LogFormat, Metrics};
use geotrack::io::EventBus;
use geotrack::Gateway;
use std::sync::Arc;
use tracing::{error, info};

/// GeoTrack - GPS telemetry gateway
#[derive(Parser, Debug)]
#[command(name = "geotrack", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to GEOTRACK_CONFIG, then config/geotrack.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let path = Config::resolve_config_path(args.config.as_deref());

    let config = match Config::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            logging::init(LogFormat::Text);
            error!(path = %path, error = format!("{e:#}"), "config_load_failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    logging::init(config.log_format());
    info!(version = env!("CARGO_PKG_VERSION"), "geotrack starting");
    info!(
        config_file = %config.config_file(),
        mode = %config.server_mode().as_str(),
        listen = %format!("{}:{}", config.listen_ip(), config.listen_port()),
        stations = %config.stations().len(),
        window_secs = %config.window_secs(),
        motion_mode = %config.motion().mode.as_str(),
        relay = %config.external_app().is_some(),
        status_port = %config.status_port(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let events = EventBus::default();

    let gateway = match Gateway::start(&config, metrics, events).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = format!("{e:#}"), "gateway_start_failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal_listener_failed");
    }
    info!("shutdown_signal_received");

    gateway.shutdown().await;
    info!("geotrack shutdown complete");
    std::process::ExitCode::SUCCESS
}
