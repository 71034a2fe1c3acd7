//! Cumulative-distance motion classifier
//!
//! Sums the path length across the noise-filter window: at or above the
//! movement threshold the device is moving, otherwise idle. Idle duration is
//! counted from the newest timestamp at which movement was last seen, and is
//! zero for a device never seen moving.

use crate::domain::geo::path_length_m;
use crate::domain::types::{Classification, MotionStatus, Sample};
use crate::services::noise_filter::{seconds_between, SampleWindow};
use chrono::{DateTime, Utc};

pub const DEFAULT_MOVEMENT_THRESHOLD_M: f64 = 10.0;

/// Per-device state
#[derive(Debug, Clone, Default)]
pub struct CumulativeState {
    last_movement_at: Option<DateTime<Utc>>,
    last_status: MotionStatus,
}

impl CumulativeState {
    pub fn last_movement_at(&self) -> Option<DateTime<Utc>> {
        self.last_movement_at
    }

    pub fn last_status(&self) -> MotionStatus {
        self.last_status
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CumulativeClassifier {
    movement_threshold_m: f64,
}

impl Default for CumulativeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MOVEMENT_THRESHOLD_M)
    }
}

impl CumulativeClassifier {
    pub fn new(movement_threshold_m: f64) -> Self {
        Self { movement_threshold_m }
    }

    /// Classify the current window. With fewer than two samples the previous
    /// verdict (initially `Unknown`) is returned unchanged.
    pub fn classify(&self, state: &mut CumulativeState, window: &SampleWindow) -> (Classification, f64) {
        let ordered: Vec<Sample> = window.chronological().into_iter().cloned().collect();

        let Some(newest) = ordered.last() else {
            return (Classification { status: state.last_status, idle_duration_seconds: 0 }, 0.0);
        };

        if ordered.len() < 2 {
            let idle = idle_seconds(state.last_movement_at, newest.timestamp, state.last_status);
            return (Classification { status: state.last_status, idle_duration_seconds: idle }, 0.0);
        }

        let distance = path_length_m(&ordered);

        let status = if distance >= self.movement_threshold_m {
            state.last_movement_at = Some(newest.timestamp);
            MotionStatus::Moving
        } else {
            MotionStatus::Idle
        };
        state.last_status = status;

        let idle = idle_seconds(state.last_movement_at, newest.timestamp, status);
        (Classification { status, idle_duration_seconds: idle }, distance)
    }
}

/// Zero unless idle after a recorded movement
fn idle_seconds(last_movement_at: Option<DateTime<Utc>>, newest: DateTime<Utc>, status: MotionStatus) -> i64 {
    match (status, last_movement_at) {
        (MotionStatus::Idle, Some(since)) => seconds_between(since, newest).max(0.0).round() as i64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::StationId;
    use chrono::{Duration, TimeZone};

    fn sample(lat: f64, offset_secs: i64) -> Sample {
        Sample {
            station_id: StationId::from("st"),
            device_id: "b".to_string(),
            lat,
            lng: 106.0,
            sats: 8,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
        }
    }

    fn window() -> SampleWindow {
        SampleWindow::new(Duration::seconds(10))
    }

    #[test]
    fn test_single_sample_is_unknown() {
        let classifier = CumulativeClassifier::default();
        let mut state = CumulativeState::default();
        let mut w = window();
        w.push(sample(10.0, 0));
        let (verdict, _) = classifier.classify(&mut state, &w);
        assert_eq!(verdict.status, MotionStatus::Unknown);
        assert_eq!(verdict.idle_duration_seconds, 0);
    }

    #[test]
    fn test_moving_when_path_exceeds_threshold() {
        let classifier = CumulativeClassifier::default();
        let mut state = CumulativeState::default();
        let mut w = window();
        // Each step ~5.5 m, total ~11 m
        w.push(sample(10.0, 0));
        w.push(sample(10.00005, 1));
        w.push(sample(10.0001, 2));
        let (verdict, distance) = classifier.classify(&mut state, &w);
        assert!(distance >= 10.0);
        assert_eq!(verdict.status, MotionStatus::Moving);
        assert_eq!(state.last_movement_at(), Some(w.newest_timestamp().unwrap()));
    }

    #[test]
    fn test_idle_duration_counts_from_last_movement() {
        let classifier = CumulativeClassifier::default();
        let mut state = CumulativeState::default();
        let mut w = window();
        w.push(sample(10.0, 0));
        w.push(sample(10.0001, 2));
        classifier.classify(&mut state, &w);

        // Park at the new spot; the moving pair ages out of the 10s window
        for t in [14, 16, 18] {
            w.push(sample(10.0001, t));
        }
        let (verdict, _) = classifier.classify(&mut state, &w);
        assert_eq!(verdict.status, MotionStatus::Idle);
        assert_eq!(verdict.idle_duration_seconds, 16);
    }

    #[test]
    fn test_idle_is_zero_when_never_moved() {
        let classifier = CumulativeClassifier::default();
        let mut state = CumulativeState::default();
        let mut w = window();
        w.push(sample(10.0, 0));
        w.push(sample(10.0, 4));
        let (verdict, _) = classifier.classify(&mut state, &w);
        assert_eq!(verdict.status, MotionStatus::Idle);
        assert_eq!(verdict.idle_duration_seconds, 0);
        assert_eq!(state.last_movement_at(), None);

        w.push(sample(10.0, 9));
        let (verdict, _) = classifier.classify(&mut state, &w);
        assert_eq!(verdict.idle_duration_seconds, 0);
    }
}
