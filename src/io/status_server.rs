//! Status HTTP endpoint
//!
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /snapshot` - current aggregate payload as JSON
//! - `GET /health` - `ok`

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_RELAY_BOUNDS,
};
use crate::infra::shutdown;
use crate::io::relay::AggregatePayload;
use crate::services::repository::Repository;
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {}", avg * count);
    let _ = writeln!(output, "{name}_count {count}");
}

/// Render a summary in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary) -> String {
    let mut output = String::with_capacity(4096);
    let counters: [(&str, &str, u64); 11] = [
        ("geotrack_samples_total", "Readings taken off the wire", summary.samples_received),
        ("geotrack_parse_errors_total", "Lines that failed to parse", summary.parse_errors),
        ("geotrack_connections_opened_total", "Station connections opened", summary.connections_opened),
        ("geotrack_connections_closed_total", "Station connections closed", summary.connections_closed),
        ("geotrack_outliers_dropped_total", "Samples rejected as outliers", summary.outliers_dropped),
        ("geotrack_status_transitions_total", "Committed motion status changes", summary.status_transitions),
        ("geotrack_relay_sent_total", "Aggregate posts accepted", summary.relay_sent_ok),
        ("geotrack_relay_failed_total", "Aggregate posts that failed", summary.relay_send_failed),
        ("geotrack_auth_logins_total", "Successful logins", summary.auth_logins),
        ("geotrack_auth_refreshes_total", "Successful token refreshes", summary.auth_refreshes),
        ("geotrack_auth_failures_total", "Failed logins or refreshes", summary.auth_failures),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, val);
    }

    write_metric(
        &mut output,
        "geotrack_open_connections",
        "Station connections currently open",
        MetricType::Gauge,
        summary.open_connections(),
    );
    write_metric(
        &mut output,
        "geotrack_tracked_devices",
        "Devices in the repository",
        MetricType::Gauge,
        summary.tracked_devices as u64,
    );
    write_metric(
        &mut output,
        "geotrack_moving_devices",
        "Devices currently classified Moving",
        MetricType::Gauge,
        summary.moving_devices as u64,
    );

    write_histogram(
        &mut output,
        "geotrack_pipeline_latency_us",
        "Per-sample pipeline latency in microseconds",
        &summary.pipeline_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.pipeline_avg_us,
    );
    write_histogram(
        &mut output,
        "geotrack_relay_latency_ms",
        "Aggregate post round trip in milliseconds",
        &summary.relay_buckets,
        &METRICS_RELAY_BOUNDS,
        summary.relay_avg_ms,
    );

    output
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    repository: Arc<Repository>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let (tracked, moving) = repository.counts();
            let body = format_prometheus_metrics(&metrics.peek(tracked, moving));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/snapshot") => {
            let payload = AggregatePayload::from_snapshot(repository.snapshot());
            match serde_json::to_vec(&payload) {
                Ok(body) => Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .expect("static response should not fail")),
                Err(e) => {
                    error!(error = %e, "status_snapshot_encode_failed");
                    Ok(Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::new(Bytes::from("encode failed")))
                        .expect("static response should not fail"))
                }
            }
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

pub struct StatusServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
    repository: Arc<Repository>,
}

impl StatusServer {
    pub async fn bind(addr: SocketAddr, metrics: Arc<Metrics>, repository: Arc<Repository>) -> anyhow::Result<Self> {
        let listener =
            TcpListener::bind(addr).await.with_context(|| format!("failed to bind status server on {addr}"))?;
        Ok(Self { listener, metrics, repository })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self { listener, metrics, repository } = self;
        let local = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        info!(addr = %local, "status_server_started");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let io = TokioIo::new(stream);
                            let metrics = metrics.clone();
                            let repository = repository.clone();

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let metrics = metrics.clone();
                                    let repository = repository.clone();
                                    async move { handle_request(req, metrics, repository).await }
                                });

                                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                    error!(error = %e, "status_http_error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "status_accept_error");
                        }
                    }
                }
                _ = shutdown::signalled(&mut shutdown) => {
                    info!("status_server_shutdown");
                    return;
                }
            }
        }
    }
}
