//! Peer-mode station client
//!
//! Connects out to a configured station and reads the same line protocol as
//! the inbound listener. On disconnect or connect failure it waits per the
//! station's `ReconnectPolicy` and tries again; a successful connection
//! resets the backoff. Shutdown interrupts connect, read and the wait.

use crate::infra::config::Station;
use crate::infra::shutdown;
use crate::io::events::SOURCE_STATION;
use crate::io::ingest::{IngestContext, ReadEnd};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(addr: &str, e: &std::io::Error) {
    error!(addr = %addr, error = %e, "station_connect_failed");
}

pub struct StationClient {
    station: Station,
    ctx: IngestContext,
}

impl StationClient {
    pub fn new(station: Station, ctx: IngestContext) -> Self {
        Self { station, ctx }
    }

    fn status(&self, status: &str) {
        self.ctx.events().status(self.station.id.as_str(), status);
    }

    fn log(&self, message: impl std::fmt::Display) {
        self.ctx.events().log(SOURCE_STATION, format!("{}: {message}", self.station.id));
    }

    fn stopped(&self, message: &str) {
        info!(station = %self.station.id, "station_client_stopped");
        self.status("Stopped");
        self.log(message);
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let addr = self.station.address();
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let policy = self.station.reconnect;
        let addr = self.station.address();
        let mut delay = policy.ensure_valid_delay(Duration::ZERO);

        loop {
            self.status("Connecting");
            self.log(format!("Connecting to {addr}"));
            info!(station = %self.station.id, addr = %addr, "station_connecting");

            let connected = tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => {
                    self.stopped("Worker stopped.");
                    return;
                }
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(station = %self.station.id, error = %e, "station_nodelay_failed");
                    }
                    info!(station = %self.station.id, addr = %addr, "station_connected");
                    self.status("Connected");
                    self.log("Connection established.");
                    self.ctx.metrics().record_connection_opened();
                    delay = policy.ensure_valid_delay(Duration::ZERO);

                    let end = self.ctx.pump_lines(stream, &self.station.id, &mut shutdown).await;
                    self.ctx.metrics().record_connection_closed();

                    match end {
                        ReadEnd::Closed => {
                            warn!(station = %self.station.id, "station_connection_closed");
                            self.status("Disconnected");
                            self.log("Connection closed by remote host.");
                        }
                        ReadEnd::Failed(e) => {
                            warn!(station = %self.station.id, error = %e, "station_read_error");
                            self.status("Disconnected");
                            self.log(format!("Connection error: {e}"));
                        }
                        ReadEnd::Shutdown => {
                            self.stopped("Worker stopped.");
                            return;
                        }
                    }
                }
                Err(e) => {
                    log_connect_failed(&addr, &e);
                    self.status("Disconnected");
                    self.log(format!("Connection error: {e}"));
                }
            }

            self.status("Reconnecting");
            self.log(format!("Reconnecting in {} seconds...", delay.as_secs()));
            info!(station = %self.station.id, delay_secs = %delay.as_secs(), "station_reconnect_scheduled");

            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => {
                    self.stopped("Reconnect cancelled.");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = policy.next_delay(delay);
        }
    }
}
