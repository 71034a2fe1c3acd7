//! Event bus for status, log and data events
//!
//! Any consumer (web UI, TUI, log file) subscribes to the bus; the core never
//! knows who is listening. Publishing never blocks: slow subscribers lag and
//! lose the oldest events, and publishing with no subscriber is a no-op.

use crate::domain::types::{FilteredState, Sample, StationId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default bus capacity per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Log sources
pub const SOURCE_INGEST: &str = "Ingest";
pub const SOURCE_STATION: &str = "Station";
pub const SOURCE_TRACKER: &str = "Tracker";
pub const SOURCE_EXTERNAL_APP: &str = "ExternalApp";

/// Messages published on the bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeoEvent {
    /// Human-readable log line
    Log { source: String, message: String, ts: DateTime<Utc> },
    /// Connection or session state change (`Connected`, `Authenticated`, ...)
    Status { source: String, status: String, ts: DateTime<Utc> },
    /// One reading taken off the wire
    SampleReceived { station_id: StationId, sample: SampleEvent },
    /// Repository snapshot as relayed to the remote API
    Snapshot { states: Vec<FilteredState>, ts: DateTime<Utc> },
}

/// Serializable view of a sample
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleEvent {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub sats: u32,
    pub timestamp: DateTime<Utc>,
}

impl From<&Sample> for SampleEvent {
    fn from(sample: &Sample) -> Self {
        Self {
            device_id: sample.device_id.clone(),
            lat: sample.lat,
            lng: sample.lng,
            sats: sample.sats,
            timestamp: sample.timestamp,
        }
    }
}

/// Publisher handle. Clone to share across producers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GeoEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GeoEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GeoEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn log(&self, source: &str, message: impl Into<String>) {
        self.publish(GeoEvent::Log { source: source.to_string(), message: message.into(), ts: Utc::now() });
    }

    pub fn status(&self, source: impl Into<String>, status: &str) {
        self.publish(GeoEvent::Status { source: source.into(), status: status.to_string(), ts: Utc::now() });
    }

    pub fn sample_received(&self, sample: &Sample) {
        self.publish(GeoEvent::SampleReceived {
            station_id: sample.station_id.clone(),
            sample: SampleEvent::from(sample),
        });
    }

    pub fn snapshot(&self, states: Vec<FilteredState>) {
        self.publish(GeoEvent::Snapshot { states, ts: Utc::now() });
    }
}
