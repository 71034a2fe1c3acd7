//! Wires one configuration into running tasks
//!
//! `Gateway::start` binds every listener first, so a bind failure leaves no
//! task behind, then spawns ingestion (listener or peer clients), the relay,
//! the status server and the metrics reporter. `shutdown` signals all of
//! them, awaits every task and clears per-configuration state so a new
//! gateway can be started with a different config.

use crate::infra::config::{Config, ServerMode};
use crate::infra::metrics::Metrics;
use crate::infra::shutdown;
use crate::io::auth::{HttpAuthApi, TokenManager};
use crate::io::events::EventBus;
use crate::io::http_retry::build_client;
use crate::io::ingest::{IngestContext, IngestServer};
use crate::io::relay::{HttpTransport, Relay, RelayHandle};
use crate::io::station_client::StationClient;
use crate::io::status_server::StatusServer;
use crate::services::repository::Repository;
use crate::services::tracker::Tracker;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Gateway {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    repository: Arc<Repository>,
    tracker: Arc<Tracker>,
    tokens: Option<Arc<TokenManager>>,
    relay: Option<RelayHandle>,
    events: EventBus,
    ingest_addr: Option<SocketAddr>,
    status_addr: Option<SocketAddr>,
}

impl Gateway {
    pub async fn start(config: &Config, metrics: Arc<Metrics>, events: EventBus) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let repository = Arc::new(Repository::new());
        let tracker = Arc::new(Tracker::new(config, repository.clone(), metrics.clone(), events.clone()));
        let ctx = IngestContext::new(tracker.clone(), metrics.clone(), events.clone());

        let ingest = match config.server_mode() {
            ServerMode::Inbound => {
                let addr = SocketAddr::new(config.listen_ip(), config.listen_port());
                Some(IngestServer::bind(addr, ctx.clone()).await?)
            }
            ServerMode::Peer => None,
        };
        let ingest_addr = ingest.as_ref().map(IngestServer::local_addr).transpose()?;

        let status = if config.status_port() > 0 {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.status_port()));
            Some(StatusServer::bind(addr, metrics.clone(), repository.clone()).await?)
        } else {
            None
        };
        let status_addr = status.as_ref().map(StatusServer::local_addr).transpose()?;

        let (tokens, relay) = match config.external_app() {
            Some(app) => {
                let client = build_client(&app.http).context("failed to build HTTP client")?;
                let auth = Arc::new(HttpAuthApi::new(client.clone(), app, shutdown_rx.clone()));
                let tokens = Arc::new(TokenManager::new(auth, metrics.clone(), events.clone()));
                let transport = Arc::new(HttpTransport::new(client, app, shutdown_rx.clone()));
                let (relay, handle) = Relay::new(
                    repository.clone(),
                    tokens.clone(),
                    transport,
                    app.send_interval,
                    metrics.clone(),
                    events.clone(),
                );
                (Some(tokens), Some((relay, handle)))
            }
            None => (None, None),
        };

        let mut tasks = Vec::new();

        if let Some(server) = ingest {
            tasks.push(("ingest", tokio::spawn(server.run(shutdown_rx.clone()))));
        }
        if config.server_mode() == ServerMode::Peer {
            for station in config.stations() {
                let client = StationClient::new(station.clone(), ctx.clone());
                tasks.push(("station", tokio::spawn(client.run(shutdown_rx.clone()))));
            }
        }
        if let Some(server) = status {
            tasks.push(("status", tokio::spawn(server.run(shutdown_rx.clone()))));
        }
        let relay = match relay {
            Some((relay, handle)) => {
                tasks.push(("relay", tokio::spawn(relay.run(shutdown_rx.clone()))));
                Some(handle)
            }
            None => {
                info!("relay_disabled");
                None
            }
        };

        tasks.push((
            "metrics",
            tokio::spawn(report_metrics(
                metrics,
                repository.clone(),
                Duration::from_secs(config.metrics_interval_secs()),
                shutdown_rx,
            )),
        ));

        info!(
            mode = %config.server_mode().as_str(),
            ingest = ?ingest_addr,
            stations = %config.stations().len(),
            status = ?status_addr,
            relay = %relay.is_some(),
            "gateway_started"
        );

        Ok(Self { shutdown_tx, tasks, repository, tracker, tokens, relay, events, ingest_addr, status_addr })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Pause/resume control, when a remote API is configured
    pub fn relay(&self) -> Option<&RelayHandle> {
        self.relay.as_ref()
    }

    /// Bound ingest address in inbound mode
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest_addr
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Stop every task, wait for them, then drop per-configuration state
    pub async fn shutdown(self) {
        info!(tasks = %self.tasks.len(), "gateway_stopping");
        let _ = self.shutdown_tx.send(true);
        if let Some(relay) = &self.relay {
            relay.cancel();
        }

        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "gateway_task_join_failed");
            }
        }

        self.repository.clear();
        self.tracker.clear();
        if let Some(tokens) = &self.tokens {
            tokens.clear().await;
        }
        info!("gateway_stopped");
    }
}

async fn report_metrics(
    metrics: Arc<Metrics>,
    repository: Arc<Repository>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown::signalled(&mut shutdown) => return,
            _ = interval.tick() => {
                let (tracked, moving) = repository.counts();
                metrics.report(tracked, moving).log();
            }
        }
    }
}
