//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not be used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Relay round-trip bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800 ms
const RELAY_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];

#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn read_buckets(buckets: &[AtomicU64; NUM_BUCKETS], reset: bool) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| {
        if reset {
            buckets[i].swap(0, Ordering::Relaxed)
        } else {
            buckets[i].load(Ordering::Relaxed)
        }
    })
}

#[inline]
fn read_counter(counter: &AtomicU64, reset: bool) -> u64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], bounds: &[u64; 10], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports twice the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Readings parsed off the wire (monotonic)
    samples_received: AtomicU64,
    /// Readings since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Lines that failed to parse (monotonic)
    parse_errors: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    /// Candidates skipped by the noise filter or rejected by the classifier
    outliers_dropped: AtomicU64,
    /// Committed motion status changes (monotonic)
    status_transitions: AtomicU64,
    relay_sent_ok: AtomicU64,
    relay_send_failed: AtomicU64,
    auth_logins: AtomicU64,
    auth_refreshes: AtomicU64,
    auth_failures: AtomicU64,
    /// Per-sample pipeline latency (reset on report)
    pipeline_sum_us: AtomicU64,
    pipeline_max_us: AtomicU64,
    pipeline_buckets: [AtomicU64; NUM_BUCKETS],
    /// Relay POST round trip including retries (reset on report)
    relay_sum_ms: AtomicU64,
    relay_max_ms: AtomicU64,
    relay_buckets: [AtomicU64; NUM_BUCKETS],
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            outliers_dropped: AtomicU64::new(0),
            status_transitions: AtomicU64::new(0),
            relay_sent_ok: AtomicU64::new(0),
            relay_send_failed: AtomicU64::new(0),
            auth_logins: AtomicU64::new(0),
            auth_refreshes: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            pipeline_sum_us: AtomicU64::new(0),
            pipeline_max_us: AtomicU64::new(0),
            pipeline_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            relay_sum_ms: AtomicU64::new(0),
            relay_max_ms: AtomicU64::new(0),
            relay_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a reading taken off the wire
    #[inline]
    pub fn record_sample(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
    }

    /// Record window → select → classify → store latency for one sample
    #[inline]
    pub fn record_pipeline_latency(&self, latency_us: u64) {
        self.pipeline_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.pipeline_buckets[bucket_index(&BUCKET_BOUNDS, latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.pipeline_max_us, latency_us);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outliers(&self, count: u64) {
        self.outliers_dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_status_transition(&self) {
        self.status_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome and round trip of one relay POST
    #[inline]
    pub fn record_relay(&self, ok: bool, latency_ms: u64) {
        if ok {
            self.relay_sent_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.relay_send_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.relay_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.relay_buckets[bucket_index(&RELAY_BOUNDS, latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.relay_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_auth_login(&self) {
        self.auth_logins.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_refresh(&self) {
        self.auth_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn samples_received(&self) -> u64 {
        self.samples_received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn outliers_dropped(&self) -> u64 {
        self.outliers_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn auth_logins(&self) -> u64 {
        self.auth_logins.load(Ordering::Relaxed)
    }

    /// Calculate the summary, then reset periodic counters
    ///
    /// Used by the periodic reporter. Monotonic totals are never reset.
    pub fn report(&self, tracked_devices: usize, moving_devices: usize) -> MetricsSummary {
        self.summarize(tracked_devices, moving_devices, true)
    }

    /// Same as `report` but leaves every counter untouched, for scrapes
    pub fn peek(&self, tracked_devices: usize, moving_devices: usize) -> MetricsSummary {
        self.summarize(tracked_devices, moving_devices, false)
    }

    fn summarize(&self, tracked_devices: usize, moving_devices: usize, reset: bool) -> MetricsSummary {
        let samples_count = read_counter(&self.samples_since_report, reset);
        let pipeline_sum = read_counter(&self.pipeline_sum_us, reset);
        let pipeline_max = read_counter(&self.pipeline_max_us, reset);
        let pipeline_buckets = read_buckets(&self.pipeline_buckets, reset);

        let relay_sum = read_counter(&self.relay_sum_ms, reset);
        let relay_max = read_counter(&self.relay_max_ms, reset);
        let relay_buckets = read_buckets(&self.relay_buckets, reset);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let samples_per_sec = if elapsed.as_secs_f64() > 0.0 {
            samples_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let pipeline_count: u64 = pipeline_buckets.iter().sum();
        let pipeline_avg = if pipeline_count > 0 { pipeline_sum / pipeline_count } else { 0 };
        let relay_count: u64 = relay_buckets.iter().sum();
        let relay_avg = if relay_count > 0 { relay_sum / relay_count } else { 0 };

        MetricsSummary {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_per_sec,
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            outliers_dropped: self.outliers_dropped.load(Ordering::Relaxed),
            status_transitions: self.status_transitions.load(Ordering::Relaxed),
            relay_sent_ok: self.relay_sent_ok.load(Ordering::Relaxed),
            relay_send_failed: self.relay_send_failed.load(Ordering::Relaxed),
            auth_logins: self.auth_logins.load(Ordering::Relaxed),
            auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            pipeline_buckets,
            pipeline_avg_us: pipeline_avg,
            pipeline_max_us: pipeline_max,
            pipeline_p99_us: percentile_from_buckets(&pipeline_buckets, &BUCKET_BOUNDS, 0.99),
            relay_buckets,
            relay_avg_ms: relay_avg,
            relay_max_ms: relay_max,
            relay_p99_ms: percentile_from_buckets(&relay_buckets, &RELAY_BOUNDS, 0.99),
            tracked_devices,
            moving_devices,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the status server)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_RELAY_BOUNDS: [u64; 10] = RELAY_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_received: u64,
    pub samples_per_sec: f64,
    pub parse_errors: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub outliers_dropped: u64,
    pub status_transitions: u64,
    pub relay_sent_ok: u64,
    pub relay_send_failed: u64,
    pub auth_logins: u64,
    pub auth_refreshes: u64,
    pub auth_failures: u64,
    /// Pipeline latency histogram (µs)
    pub pipeline_buckets: [u64; NUM_BUCKETS],
    pub pipeline_avg_us: u64,
    pub pipeline_max_us: u64,
    pub pipeline_p99_us: u64,
    /// Relay round trip histogram (ms)
    pub relay_buckets: [u64; NUM_BUCKETS],
    pub relay_avg_ms: u64,
    pub relay_max_ms: u64,
    pub relay_p99_ms: u64,
    pub tracked_devices: usize,
    pub moving_devices: usize,
}

impl MetricsSummary {
    /// Connections currently open
    pub fn open_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }

    pub fn log(&self) {
        info!(
            samples_total = %self.samples_received,
            samples_per_sec = format!("{:.1}", self.samples_per_sec),
            parse_errors = %self.parse_errors,
            open_connections = %self.open_connections(),
            outliers = %self.outliers_dropped,
            transitions = %self.status_transitions,
            pipeline_avg_us = %self.pipeline_avg_us,
            pipeline_p99_us = %self.pipeline_p99_us,
            relay_ok = %self.relay_sent_ok,
            relay_failed = %self.relay_send_failed,
            relay_p99_ms = %self.relay_p99_ms,
            auth_logins = %self.auth_logins,
            auth_failures = %self.auth_failures,
            tracked_devices = %self.tracked_devices,
            moving_devices = %self.moving_devices,
            "metrics_summary"
        );
    }
}
