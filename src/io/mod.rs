//! IO modules - external system interfaces
//!
//! - `wire` - station line protocol parsing
//! - `ingest` - inbound TCP listener for stations
//! - `station_client` - outbound peer-mode station connections
//! - `events` - broadcast bus for status, log and data events
//! - `http_retry` - retrying HTTP send shared by auth and relay
//! - `auth` - credential manager for the remote API
//! - `relay` - periodic telemetry relay with pause/resume
//! - `status_server` - HTTP `/metrics`, `/snapshot`, `/health`

pub mod auth;
pub mod events;
pub mod http_retry;
pub mod ingest;
pub mod relay;
pub mod station_client;
pub mod status_server;
pub mod wire;

pub use auth::{AuthApi, AuthError, HttpAuthApi, TokenManager};
pub use events::{EventBus, GeoEvent};
pub use ingest::{IngestContext, IngestServer};
pub use relay::{HttpTransport, Relay, RelayControl, RelayHandle, TelemetryTransport};
pub use station_client::StationClient;
pub use status_server::StatusServer;
