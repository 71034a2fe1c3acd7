//! Per-device tracking pipeline
//!
//! For every sample: insert into the device window, select the best sample,
//! classify motion, then store the result in the repository. Each device has
//! its own lock so one device's pipeline never waits on another's.

use crate::domain::types::{DeviceKey, FilteredState, Sample};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::events::{EventBus, SOURCE_TRACKER};
use crate::services::motion::{ClassifierState, MotionClassifier, MotionEvent};
use crate::services::noise_filter::{NoiseFilter, SampleWindow};
use crate::services::repository::Repository;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Something that consumes samples parsed off the wire
pub trait SampleSink: Send + Sync {
    fn handle(&self, sample: Sample);
}

struct DeviceState {
    window: SampleWindow,
    /// Last state written to the repository
    last: Option<FilteredState>,
    classifier: ClassifierState,
}

pub struct Tracker {
    devices: RwLock<FxHashMap<DeviceKey, Arc<Mutex<DeviceState>>>>,
    window: chrono::Duration,
    filter: NoiseFilter,
    classifier: MotionClassifier,
    repository: Arc<Repository>,
    metrics: Arc<Metrics>,
    events: EventBus,
}

impl Tracker {
    pub fn new(config: &Config, repository: Arc<Repository>, metrics: Arc<Metrics>, events: EventBus) -> Self {
        Self {
            devices: RwLock::new(FxHashMap::default()),
            window: config.window(),
            filter: NoiseFilter::new(config.max_reasonable_speed_mps()),
            classifier: MotionClassifier::new(config.motion()),
            repository,
            metrics,
            events,
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    /// Number of devices with pipeline state
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Drop every device's window and classifier state
    pub fn clear(&self) {
        self.devices.write().clear();
    }

    fn device(&self, key: &DeviceKey) -> Arc<Mutex<DeviceState>> {
        if let Some(device) = self.devices.read().get(key) {
            return device.clone();
        }
        self.devices
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(DeviceState {
                    window: SampleWindow::new(self.window),
                    last: None,
                    classifier: self.classifier.new_state(),
                }))
            })
            .clone()
    }

    /// Run one sample through the pipeline. Returns the state stored in the
    /// repository, or `None` when the classifier rejected the selection.
    pub fn process(&self, sample: Sample) -> Option<FilteredState> {
        let start = Instant::now();
        let device_id = sample.device_id.clone();
        let device = self.device(&sample.device_key());
        let mut device = device.lock();
        let DeviceState { window, last, classifier } = &mut *device;

        window.push(sample);
        let selection = self.filter.select_best(window, last.as_ref())?;

        if selection.outliers_skipped > 0 {
            self.metrics.record_outliers(selection.outliers_skipped as u64);
            warn!(
                device = %device_id,
                skipped = %selection.outliers_skipped,
                fell_back = %selection.fell_back,
                "outlier_samples_skipped"
            );
            self.events.log(
                SOURCE_TRACKER,
                format!("Skipped {} outlier sample(s) for {device_id}", selection.outliers_skipped),
            );
        }

        let chosen = selection.sample.clone();
        let verdict = self.classifier.classify(classifier, &chosen, window);

        match verdict.event {
            Some(MotionEvent::OutlierRejected { distance_m, elapsed_secs, speed_mps }) => {
                self.metrics.record_outliers(1);
                warn!(
                    device = %device_id,
                    distance_m = format!("{distance_m:.1}"),
                    elapsed_secs = format!("{elapsed_secs:.1}"),
                    speed_mps = format!("{speed_mps:.2}"),
                    "motion_outlier_dropped"
                );
                self.events.log(
                    SOURCE_TRACKER,
                    format!(
                        "Dropped outlier for {device_id}: {distance_m:.1}m jump over {elapsed_secs:.1}s (speed {speed_mps:.2} m/s)"
                    ),
                );
                return None;
            }
            Some(MotionEvent::Transition { from, to }) => {
                self.metrics.record_status_transition();
                info!(device = %device_id, from = %from, to = %to, "motion_status_changed");
                self.events.log(SOURCE_TRACKER, format!("Device {device_id} status {from} -> {to}"));
            }
            None => {}
        }

        let state = self.repository.update(&chosen, verdict.classification);
        *last = Some(state.clone());

        debug!(
            device = %device_id,
            window = %window.len(),
            status = %state.status,
            idle_secs = %state.idle_duration_seconds,
            "sample_processed"
        );
        self.metrics.record_pipeline_latency(start.elapsed().as_micros() as u64);
        Some(state)
    }
}

impl SampleSink for Tracker {
    fn handle(&self, sample: Sample) {
        self.process(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{MotionStatus, StationId};
    use crate::io::events::GeoEvent;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn sample(device: &str, lat: f64, offset_secs: i64) -> Sample {
        Sample {
            station_id: StationId::from("st-1"),
            device_id: device.to_string(),
            lat,
            lng: 106.0,
            sats: 8,
            timestamp: base_time() + Duration::seconds(offset_secs),
        }
    }

    fn create_tracker() -> (Tracker, EventBus) {
        let events = EventBus::new(64);
        let tracker = Tracker::new(
            &Config::default(),
            Arc::new(Repository::new()),
            Arc::new(Metrics::new()),
            events.clone(),
        );
        (tracker, events)
    }

    #[test]
    fn test_first_sample_is_stored_as_unknown() {
        let (tracker, _) = create_tracker();
        let state = tracker.process(sample("b1", 10.0, 0)).unwrap();
        assert_eq!(state.status, MotionStatus::Unknown);
        assert_eq!(tracker.repository().len(), 1);
        assert_eq!(tracker.device_count(), 1);
    }

    #[test]
    fn test_stationary_then_far_outlier_is_ignored() {
        let (tracker, events) = create_tracker();
        let mut rx = events.subscribe();

        for t in [0, 3, 6, 9] {
            tracker.process(sample("b1", 10.0 + t as f64 * 1e-6, t));
        }
        assert_eq!(tracker.repository().get("b1").unwrap().status, MotionStatus::Stationary);

        // ~555 km away 10s later
        tracker.process(sample("b1", 15.0, 19));

        let state = tracker.repository().get("b1").unwrap();
        assert_eq!(state.status, MotionStatus::Stationary);
        assert!(state.latitude < 10.1);
        assert!(tracker.metrics.outliers_dropped() >= 1);

        let mut warned = false;
        while let Ok(event) = rx.try_recv() {
            if let GeoEvent::Log { message, .. } = event {
                warned |= message.contains("outlier");
            }
        }
        assert!(warned);
    }

    #[test]
    fn test_devices_are_independent_and_case_insensitive() {
        let (tracker, _) = create_tracker();
        tracker.process(sample("Buggy-1", 10.0, 0));
        tracker.process(sample("buggy-1", 10.0, 1));
        tracker.process(sample("buggy-2", 20.0, 0));

        assert_eq!(tracker.device_count(), 2);
        assert_eq!(tracker.repository().len(), 2);
    }

    #[test]
    fn test_moving_device_is_classified_moving() {
        let (tracker, _) = create_tracker();
        let mut last = None;
        for t in 0..6 {
            last = tracker.process(sample("b1", 10.0 + t as f64 * 2e-5, t));
        }
        assert_eq!(last.unwrap().status, MotionStatus::Moving);
    }

    #[test]
    fn test_clear_resets_pipeline_state() {
        let (tracker, _) = create_tracker();
        tracker.process(sample("b1", 10.0, 0));
        tracker.clear();
        tracker.repository().clear();
        assert_eq!(tracker.device_count(), 0);
        assert!(tracker.repository().is_empty());
    }

    #[test]
    fn test_concurrent_devices() {
        use std::thread;

        let (tracker, _) = create_tracker();
        let tracker = Arc::new(tracker);
        let mut handles = vec![];

        for d in 0..8 {
            let tracker = tracker.clone();
            handles.push(thread::spawn(move || {
                for t in 0..50 {
                    tracker.handle(sample(&format!("dev-{d}"), 10.0 + t as f64 * 1e-6, t));
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.repository().len(), 8);
    }
}
