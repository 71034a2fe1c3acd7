//! Telemetry relay to the remote API
//!
//! Every `send_interval` the relay snapshots the repository, obtains a bearer
//! token and posts the aggregate payload. When a notification URL is
//! configured and the snapshot is non-empty it also posts a lightweight
//! position list; the two sends are independent. A relay is driven through
//! its `RelayHandle`: pause, resume and cancel.

use crate::domain::types::{FilteredState, MotionStatus};
use crate::infra::config::ExternalApp;
use crate::infra::metrics::Metrics;
use crate::infra::shutdown;
use crate::io::auth::{AuthError, TokenManager};
use crate::io::events::{EventBus, SOURCE_EXTERNAL_APP};
use crate::io::http_retry::{send_with_retry, RetryError, RetryPolicy};
use crate::services::repository::Repository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Used when the configured interval is zero
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub total_devices: usize,
    pub active_devices: usize,
}

/// Body of the aggregate POST
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePayload {
    pub timestamp: DateTime<Utc>,
    pub metrics: AggregateMetrics,
    pub buggies: Vec<FilteredState>,
}

impl AggregatePayload {
    pub fn from_snapshot(buggies: Vec<FilteredState>) -> Self {
        let active_devices = buggies.iter().filter(|s| s.status == MotionStatus::Moving).count();
        Self {
            timestamp: Utc::now(),
            metrics: AggregateMetrics { total_devices: buggies.len(), active_devices },
            buggies,
        }
    }
}

/// One entry of the notification POST
#[derive(Debug, Serialize)]
pub struct NotificationItem {
    pub key: String,
    pub name: String,
    pub lat: f64,
    pub long: f64,
    pub sats: u32,
}

pub fn notification_items(states: &[FilteredState]) -> Vec<NotificationItem> {
    states
        .iter()
        .map(|s| NotificationItem {
            key: s.device_id.clone(),
            name: s.device_id.clone(),
            lat: s.latitude,
            long: s.longitude,
            sats: s.sats,
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cancelled")]
    Cancelled,
    #[error("HTTP {status} {reason}: {body}")]
    Status { status: u16, reason: String, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(AuthError),
}

impl From<RetryError> for RelayError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Cancelled => RelayError::Cancelled,
            RetryError::Timeout => RelayError::Timeout,
            RetryError::Transport(e) => RelayError::Transport(e.to_string()),
        }
    }
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Cancelled => RelayError::Cancelled,
            other => RelayError::Auth(other),
        }
    }
}

/// Outbound side of the relay
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn send_aggregate(&self, token: &str, payload: &AggregatePayload) -> Result<(), RelayError>;
    async fn send_notification(&self, token: &str, items: &[NotificationItem]) -> Result<(), RelayError>;
    fn has_notification(&self) -> bool;
}

pub struct HttpTransport {
    client: reqwest::Client,
    aggregate_url: String,
    notification_url: Option<String>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, app: &ExternalApp, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            client,
            aggregate_url: app.aggregate_url(),
            notification_url: app.notification_url(),
            retry: RetryPolicy::from(&app.http),
            shutdown,
        }
    }

    async fn post_json<B>(&self, url: &str, token: &str, body: &B) -> Result<(), RelayError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let response = send_with_retry(self.retry, self.shutdown.clone(), || {
            self.client.post(url).bearer_auth(token).json(body).send()
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = status.canonical_reason().unwrap_or_default().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(RelayError::Status { status: status.as_u16(), reason, body })
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn send_aggregate(&self, token: &str, payload: &AggregatePayload) -> Result<(), RelayError> {
        self.post_json(&self.aggregate_url, token, payload).await
    }

    async fn send_notification(&self, token: &str, items: &[NotificationItem]) -> Result<(), RelayError> {
        match &self.notification_url {
            Some(url) => self.post_json(url, token, items).await,
            None => Ok(()),
        }
    }

    fn has_notification(&self) -> bool {
        self.notification_url.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayControl {
    Running,
    Paused,
    Cancelled,
}

/// Control side of a relay. Dropping every handle cancels the relay.
#[derive(Clone)]
pub struct RelayHandle {
    control: Arc<watch::Sender<RelayControl>>,
}

impl RelayHandle {
    /// Idempotent; a cancelled relay stays cancelled
    pub fn pause(&self) {
        self.transition(RelayControl::Running, RelayControl::Paused);
    }

    /// Idempotent; wakes a paused relay exactly once
    pub fn resume(&self) {
        self.transition(RelayControl::Paused, RelayControl::Running);
    }

    pub fn cancel(&self) {
        self.control.send_if_modified(|state| {
            let changed = *state != RelayControl::Cancelled;
            *state = RelayControl::Cancelled;
            changed
        });
    }

    pub fn state(&self) -> RelayControl {
        *self.control.borrow()
    }

    fn transition(&self, from: RelayControl, to: RelayControl) {
        self.control.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

/// Waits while paused. Returns false once the relay should stop.
async fn wait_until_running(control: &mut watch::Receiver<RelayControl>) -> bool {
    control
        .wait_for(|state| *state != RelayControl::Paused)
        .await
        .map(|state| *state == RelayControl::Running)
        .unwrap_or(false)
}

async fn cancelled(control: &mut watch::Receiver<RelayControl>) {
    let _ = control.wait_for(|state| *state == RelayControl::Cancelled).await;
}

pub struct Relay {
    repository: Arc<Repository>,
    tokens: Arc<TokenManager>,
    transport: Arc<dyn TelemetryTransport>,
    interval: Duration,
    metrics: Arc<Metrics>,
    events: EventBus,
    control: watch::Receiver<RelayControl>,
}

impl Relay {
    pub fn new(
        repository: Arc<Repository>,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn TelemetryTransport>,
        interval: Duration,
        metrics: Arc<Metrics>,
        events: EventBus,
    ) -> (Self, RelayHandle) {
        let (tx, control) = watch::channel(RelayControl::Running);
        let interval = if interval.is_zero() { DEFAULT_SEND_INTERVAL } else { interval };
        let relay = Self { repository, tokens, transport, interval, metrics, events, control };
        (relay, RelayHandle { control: Arc::new(tx) })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tick loop. Returns on shutdown or cancel; an in-flight tick is abandoned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut control = self.control.clone();
        info!(interval_secs = %self.interval.as_secs(), "relay_started");
        self.events.status(SOURCE_EXTERNAL_APP, "Relay started");

        loop {
            let running = tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => false,
                running = wait_until_running(&mut control) => running,
            };
            if !running {
                break;
            }

            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = cancelled(&mut control) => break,
                _ = self.tick() => {}
            }

            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => break,
                _ = cancelled(&mut control) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("relay_stopped");
        self.events.status(SOURCE_EXTERNAL_APP, "Relay stopped");
    }

    /// One send cycle. Returns whether the aggregate POST succeeded.
    pub async fn tick(&self) -> bool {
        let states = self.repository.snapshot();
        self.events.snapshot(states.clone());

        let token = match self.tokens.access_token().await {
            Ok(token) => token,
            Err(AuthError::Cancelled) => return false,
            Err(e) => {
                self.metrics.record_relay(false, 0);
                self.report_failure("Telemetry error", &RelayError::from(e));
                return false;
            }
        };

        let payload = AggregatePayload::from_snapshot(states);
        let start = Instant::now();
        let sent = match self.transport.send_aggregate(&token, &payload).await {
            Ok(()) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_relay(true, latency_ms);
                debug!(
                    devices = %payload.metrics.total_devices,
                    active = %payload.metrics.active_devices,
                    latency_ms = %latency_ms,
                    "relay_sent"
                );
                self.events.status(SOURCE_EXTERNAL_APP, "Telemetry sent");
                self.events.log(SOURCE_EXTERNAL_APP, "Telemetry sent successfully.");
                true
            }
            Err(RelayError::Cancelled) => return false,
            Err(e) => {
                self.metrics.record_relay(false, start.elapsed().as_millis() as u64);
                self.report_failure("Telemetry failed", &e);
                false
            }
        };

        if self.transport.has_notification() && !payload.buggies.is_empty() {
            let items = notification_items(&payload.buggies);
            match self.transport.send_notification(&token, &items).await {
                Ok(()) => debug!(devices = %items.len(), "relay_notification_sent"),
                Err(RelayError::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "relay_notification_failed");
                    self.events.log(SOURCE_EXTERNAL_APP, format!("Notification failed: {e}"));
                }
            }
        }

        sent
    }

    fn report_failure(&self, status: &str, e: &RelayError) {
        warn!(error = %e, "relay_send_failed");
        self.events.status(SOURCE_EXTERNAL_APP, status);
        self.events.log(SOURCE_EXTERNAL_APP, format!("{status}: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Classification, Sample, StationId, TokenData};
    use crate::io::auth::AuthApi;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct StaticAuth {
        fail: bool,
    }

    #[async_trait]
    impl AuthApi for StaticAuth {
        async fn login(&self) -> Result<TokenData, AuthError> {
            if self.fail {
                return Err(AuthError::Rejected { status: 401, body: String::new() });
            }
            Ok(TokenData { access_token: "tok".to_string(), expire_in_seconds: 3600, refresh_token: None })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenData, AuthError> {
            Err(AuthError::NoRefreshToken)
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        aggregates: Mutex<Vec<(String, usize, usize)>>,
        notifications: AtomicU32,
        notify: bool,
        fail_aggregate: AtomicBool,
    }

    #[async_trait]
    impl TelemetryTransport for FakeTransport {
        async fn send_aggregate(&self, token: &str, payload: &AggregatePayload) -> Result<(), RelayError> {
            if self.fail_aggregate.load(Ordering::SeqCst) {
                return Err(RelayError::Status { status: 502, reason: "Bad Gateway".to_string(), body: String::new() });
            }
            self.aggregates.lock().push((
                token.to_string(),
                payload.metrics.total_devices,
                payload.metrics.active_devices,
            ));
            Ok(())
        }

        async fn send_notification(&self, _token: &str, _items: &[NotificationItem]) -> Result<(), RelayError> {
            self.notifications.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn has_notification(&self) -> bool {
            self.notify
        }
    }

    fn sample(device: &str) -> Sample {
        Sample {
            station_id: StationId::from("st-1"),
            device_id: device.to_string(),
            lat: 10.0,
            lng: 106.0,
            sats: 7,
            timestamp: Utc::now(),
        }
    }

    fn create_relay(
        transport: Arc<FakeTransport>,
        auth_fails: bool,
    ) -> (Relay, RelayHandle, Arc<Repository>, Arc<Metrics>) {
        let repository = Arc::new(Repository::new());
        let metrics = Arc::new(Metrics::new());
        let events = EventBus::new(256);
        let auth = Arc::new(StaticAuth { fail: auth_fails });
        let tokens = Arc::new(TokenManager::new(auth, metrics.clone(), events.clone()));
        let (relay, handle) =
            Relay::new(repository.clone(), tokens, transport, Duration::from_secs(5), metrics.clone(), events);
        (relay, handle, repository, metrics)
    }

    #[test]
    fn test_aggregate_payload_shape() {
        let moving = Classification { status: MotionStatus::Moving, idle_duration_seconds: 0 };
        let states = vec![
            FilteredState::from_sample(&sample("b1")).with_classification(moving),
            FilteredState::from_sample(&sample("b2")),
        ];
        let json = serde_json::to_value(AggregatePayload::from_snapshot(states)).unwrap();
        assert_eq!(json["metrics"]["totalDevices"], 2);
        assert_eq!(json["metrics"]["activeDevices"], 1);
        assert_eq!(json["buggies"][0]["deviceId"], "b1");
        assert_eq!(json["buggies"][0]["status"], "Moving");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_notification_items_shape() {
        let items = notification_items(&[FilteredState::from_sample(&sample("b1"))]);
        let json = serde_json::to_value(&items).unwrap();
        assert_eq!(json[0]["key"], "b1");
        assert_eq!(json[0]["name"], "b1");
        assert_eq!(json[0]["long"], 106.0);
        assert_eq!(json[0]["sats"], 7);
    }

    #[tokio::test]
    async fn test_tick_sends_aggregate_and_notification() {
        let transport = Arc::new(FakeTransport { notify: true, ..FakeTransport::default() });
        let (relay, _handle, repository, metrics) = create_relay(transport.clone(), false);

        // Empty snapshot: aggregate only
        assert!(relay.tick().await);
        assert_eq!(transport.notifications.load(Ordering::SeqCst), 0);

        repository.update(&sample("b1"), Classification::default());
        assert!(relay.tick().await);
        assert_eq!(transport.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.aggregates.lock(), vec![("tok".to_string(), 0, 0), ("tok".to_string(), 1, 0)]);
        assert_eq!(metrics.peek(0, 0).relay_sent_ok, 2);
    }

    #[tokio::test]
    async fn test_notification_independent_of_aggregate_failure() {
        let transport = Arc::new(FakeTransport { notify: true, ..FakeTransport::default() });
        transport.fail_aggregate.store(true, Ordering::SeqCst);
        let (relay, _handle, repository, metrics) = create_relay(transport.clone(), false);
        repository.update(&sample("b1"), Classification::default());

        assert!(!relay.tick().await);
        assert_eq!(transport.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.peek(0, 0).relay_send_failed, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_skips_send() {
        let transport = Arc::new(FakeTransport::default());
        let (relay, _handle, _, metrics) = create_relay(transport.clone(), true);

        assert!(!relay.tick().await);
        assert!(transport.aggregates.lock().is_empty());
        assert_eq!(metrics.peek(0, 0).relay_send_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sends_every_interval_until_cancelled() {
        let transport = Arc::new(FakeTransport::default());
        let (relay, handle, _, _) = create_relay(transport.clone(), false);
        let (_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(relay.run(shutdown));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.aggregates.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.aggregates.lock().len(), 3);

        handle.cancel();
        task.await.unwrap();
        assert_eq!(handle.state(), RelayControl::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_pause_single_resume_keeps_running() {
        let transport = Arc::new(FakeTransport::default());
        let (relay, handle, _, _) = create_relay(transport.clone(), false);
        let (_tx, shutdown) = watch::channel(false);

        handle.pause();
        handle.pause();
        assert_eq!(handle.state(), RelayControl::Paused);
        let task = tokio::spawn(relay.run(shutdown));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(transport.aggregates.lock().is_empty());

        handle.resume();
        assert_eq!(handle.state(), RelayControl::Running);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.aggregates.lock().len(), 1);

        // Resume again is a no-op
        handle.resume();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.aggregates.lock().len(), 2);

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_paused_stops_loop() {
        let transport = Arc::new(FakeTransport::default());
        let (relay, handle, _, _) = create_relay(transport.clone(), false);
        let (_tx, shutdown) = watch::channel(false);

        handle.pause();
        let task = tokio::spawn(relay.run(shutdown));
        tokio::time::sleep(Duration::from_secs(1)).await;

        handle.cancel();
        handle.resume();
        task.await.unwrap();
        assert_eq!(handle.state(), RelayControl::Cancelled);
        assert!(transport.aggregates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let transport = Arc::new(FakeTransport::default());
        let (relay, _handle, _, _) = create_relay(transport, false);
        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(relay.run(shutdown));

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let (relay, ..) = {
            let repository = Arc::new(Repository::new());
            let metrics = Arc::new(Metrics::new());
            let events = EventBus::default();
            let auth = Arc::new(StaticAuth { fail: false });
            let tokens = Arc::new(TokenManager::new(auth, metrics.clone(), events.clone()));
            Relay::new(repository, tokens, Arc::new(FakeTransport::default()), Duration::ZERO, metrics, events)
        };
        assert_eq!(relay.interval(), DEFAULT_SEND_INTERVAL);
    }
}
