//! Inbound TCP listener for station telemetry
//!
//! Stations connect and stream newline-delimited JSON arrays of readings.
//! Each connection runs on its own task; a malformed line is logged and
//! skipped without dropping the connection. On shutdown every open
//! connection is closed and awaited before `run` returns.

use crate::domain::types::{Sample, StationId};
use crate::infra::metrics::Metrics;
use crate::infra::shutdown;
use crate::io::events::{EventBus, SOURCE_INGEST};
use crate::io::wire;
use crate::services::tracker::SampleSink;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Log an unparseable line (cold path)
#[cold]
fn log_invalid_line(station: &StationId, e: &serde_json::Error) {
    warn!(station = %station, error = %e, "ingest_invalid_json");
}

/// Log a socket read error (cold path)
#[cold]
fn log_read_error(station: &StationId, e: &std::io::Error) {
    warn!(station = %station, error = %e, "ingest_read_error");
}

/// How a line-reading session ended
#[derive(Debug)]
pub enum ReadEnd {
    /// Peer closed the stream
    Closed,
    /// Socket fault
    Failed(std::io::Error),
    /// Shutdown was signalled
    Shutdown,
}

/// Everything a reader needs to hand samples to the pipeline.
/// Shared by the inbound listener and the peer-mode station clients.
#[derive(Clone)]
pub struct IngestContext {
    sink: Arc<dyn SampleSink>,
    metrics: Arc<Metrics>,
    events: EventBus,
}

impl IngestContext {
    pub fn new(sink: Arc<dyn SampleSink>, metrics: Arc<Metrics>, events: EventBus) -> Self {
        Self { sink, metrics, events }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Parse one line and dispatch every reading. Returns the number of samples handled.
    pub fn dispatch_line(&self, station: &StationId, line: &str) -> usize {
        let readings = match wire::parse_line(line) {
            Ok(readings) => readings,
            Err(e) => {
                log_invalid_line(station, &e);
                self.metrics.record_parse_error();
                self.events.log(SOURCE_INGEST, format!("Invalid JSON from {station}: {e}"));
                return 0;
            }
        };

        let count = readings.len();
        for reading in readings {
            let sample = Sample::from_reading(station, reading);
            self.metrics.record_sample();
            self.events.sample_received(&sample);
            self.sink.handle(sample);
        }
        count
    }

    /// Read lines until the peer closes, the socket fails or shutdown is signalled
    pub async fn pump_lines<R>(
        &self,
        reader: R,
        station: &StationId,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadEnd
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            // read_until is not cancel-safe; only shutdown cancels it
            let read = tokio::select! {
                _ = shutdown::signalled(shutdown) => return ReadEnd::Shutdown,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => return ReadEnd::Closed,
                Ok(_) => {
                    // Invalid UTF-8 becomes U+FFFD and fails as a bad line, not a socket error
                    let line = String::from_utf8_lossy(&buf);
                    self.dispatch_line(station, &line);
                }
                Err(e) => return ReadEnd::Failed(e),
            }
        }
    }
}

/// Bound listener, ready to accept
pub struct IngestServer {
    listener: TcpListener,
    ctx: IngestContext,
}

impl IngestServer {
    pub async fn bind(addr: SocketAddr, ctx: IngestContext) -> anyhow::Result<Self> {
        let listener =
            TcpListener::bind(addr).await.with_context(|| format!("failed to bind ingest listener on {addr}"))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Returns after shutdown once every connection task has finished.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self { listener, ctx } = self;
        let local = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        info!(addr = %local, "ingest_listener_started");
        ctx.events.log(SOURCE_INGEST, format!("Server listening on {local}"));

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => {
                    info!(open = %connections.len(), "ingest_listener_shutdown");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accept = listener.accept() => {
                    match accept {
                        Ok((socket, peer)) => {
                            let ctx = ctx.clone();
                            let shutdown = shutdown.clone();
                            connections.spawn(handle_connection(socket, peer, ctx, shutdown));
                        }
                        Err(e) => {
                            error!(error = %e, "ingest_accept_failed");
                            ctx.events.log(SOURCE_INGEST, format!("Accept loop error: {e}"));
                        }
                    }
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        ctx.events.log(SOURCE_INGEST, "Server stopped");
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: IngestContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = Uuid::now_v7();
    let station = StationId(peer.to_string());
    if let Err(e) = socket.set_nodelay(true) {
        debug!(station = %station, error = %e, "ingest_nodelay_failed");
    }

    ctx.metrics.record_connection_opened();
    info!(station = %station, conn = %conn_id, "ingest_connection_accepted");
    ctx.events.log(SOURCE_INGEST, format!("Client connected: {station}"));
    ctx.events.status(station.as_str(), "Connected");

    match ctx.pump_lines(socket, &station, &mut shutdown).await {
        ReadEnd::Closed => debug!(station = %station, conn = %conn_id, "ingest_peer_closed"),
        ReadEnd::Failed(e) => log_read_error(&station, &e),
        ReadEnd::Shutdown => debug!(station = %station, conn = %conn_id, "ingest_connection_cancelled"),
    }

    ctx.metrics.record_connection_closed();
    info!(station = %station, conn = %conn_id, "ingest_connection_closed");
    ctx.events.log(SOURCE_INGEST, format!("Client disconnected: {station}"));
    ctx.events.status(station.as_str(), "Disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Sample>>);

    impl SampleSink for Collect {
        fn handle(&self, sample: Sample) {
            self.0.lock().push(sample);
        }
    }

    fn create_context() -> (IngestContext, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        let ctx = IngestContext::new(sink.clone(), Arc::new(Metrics::new()), EventBus::new(64));
        (ctx, sink)
    }

    #[test]
    fn test_dispatch_line_substitutes_station_for_blank_id() {
        let (ctx, sink) = create_context();
        let station = StationId::from("10.0.0.9:5000");
        let line = r#"[{"id":"","datetime":"2024-05-01T08:00:00Z","lat":1,"lng":2,"sats":4},
                       {"id":"b7","datetime":"2024-05-01T08:00:00Z","lat":1,"lng":2,"sats":4}]"#;

        assert_eq!(ctx.dispatch_line(&station, line), 2);
        let samples = sink.0.lock();
        assert_eq!(samples[0].device_id, "10.0.0.9:5000");
        assert_eq!(samples[1].device_id, "b7");
        assert_eq!(samples[1].station_id, station);
        assert_eq!(ctx.metrics().samples_received(), 2);
    }

    #[test]
    fn test_dispatch_bad_line_counts_parse_error() {
        let (ctx, sink) = create_context();
        let mut rx = ctx.events().subscribe();

        assert_eq!(ctx.dispatch_line(&StationId::from("s"), "{oops"), 0);
        assert!(sink.0.lock().is_empty());
        assert_eq!(ctx.metrics().parse_errors(), 1);
        assert!(matches!(rx.try_recv(), Ok(crate::io::events::GeoEvent::Log { .. })));
    }

    #[test]
    fn test_whitespace_line_is_silent() {
        let (ctx, _) = create_context();
        let mut rx = ctx.events().subscribe();
        assert_eq!(ctx.dispatch_line(&StationId::from("s"), "   "), 0);
        assert_eq!(ctx.metrics().parse_errors(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pump_lines_survives_bad_json_until_eof() {
        let (ctx, sink) = create_context();
        let (_tx, mut shutdown) = watch::channel(false);
        let input: &[u8] = b"garbage\n[{\"id\":\"b1\",\"datetime\":\"2024-05-01T08:00:00Z\",\"lat\":1,\"lng\":2,\"sats\":4}]\n";

        let end = ctx.pump_lines(input, &StationId::from("s"), &mut shutdown).await;
        assert!(matches!(end, ReadEnd::Closed));
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(ctx.metrics().parse_errors(), 1);
    }

    #[tokio::test]
    async fn test_pump_lines_skips_invalid_utf8_line() {
        let (ctx, sink) = create_context();
        let (_tx, mut shutdown) = watch::channel(false);
        let input: &[u8] = b"[{\"id\":\"b\xff\"}]\n[{\"id\":\"b2\",\"datetime\":\"2024-05-01T08:00:00Z\",\"lat\":1,\"lng\":2,\"sats\":4}]\r\n";

        let end = ctx.pump_lines(input, &StationId::from("s"), &mut shutdown).await;
        assert!(matches!(end, ReadEnd::Closed));
        let samples = sink.0.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].device_id, "b2");
        assert_eq!(ctx.metrics().parse_errors(), 1);
    }

    #[tokio::test]
    async fn test_pump_lines_handles_final_line_without_newline() {
        let (ctx, sink) = create_context();
        let (_tx, mut shutdown) = watch::channel(false);
        let input: &[u8] = b"[{\"id\":\"b3\",\"datetime\":\"2024-05-01T08:00:00Z\",\"lat\":1,\"lng\":2,\"sats\":4}]";

        let end = ctx.pump_lines(input, &StationId::from("s"), &mut shutdown).await;
        assert!(matches!(end, ReadEnd::Closed));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_lines_stops_on_shutdown() {
        let (ctx, _) = create_context();
        let (tx, mut shutdown) = watch::channel(false);
        let (_client, server) = tokio::io::duplex(64);

        let task = tokio::spawn(async move { ctx.pump_lines(server, &StationId::from("s"), &mut shutdown).await });
        tx.send(true).unwrap();
        let end = task.await.unwrap();
        assert!(matches!(end, ReadEnd::Shutdown));
    }
}
