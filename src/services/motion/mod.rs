//! Motion classification
//!
//! Two classifiers are available and selected per process by [`MotionMode`]:
//! - `hysteresis` - debounced Stationary/Moving/Idle with confirm counters
//! - `cumulative` - path length over the noise-filter window, Moving/Idle only

pub mod cumulative;
pub mod hysteresis;

use crate::domain::types::{Classification, MotionStatus, Sample};
use crate::services::noise_filter::{seconds_between, SampleWindow};
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use cumulative::{CumulativeClassifier, CumulativeState};
pub use hysteresis::{HysteresisClassifier, HysteresisConfig, HysteresisState, Observation, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionMode {
    #[default]
    Hysteresis,
    Cumulative,
}

impl MotionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionMode::Hysteresis => "hysteresis",
            MotionMode::Cumulative => "cumulative",
        }
    }
}

/// Resolved classifier settings
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub mode: MotionMode,
    pub hysteresis: HysteresisConfig,
    pub movement_threshold_m: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            mode: MotionMode::default(),
            hysteresis: HysteresisConfig::default(),
            movement_threshold_m: cumulative::DEFAULT_MOVEMENT_THRESHOLD_M,
        }
    }
}

/// Per-device classifier state, matching the active mode
#[derive(Debug, Clone)]
pub enum ClassifierState {
    Hysteresis {
        state: HysteresisState,
        last_moving_at: Option<DateTime<Utc>>,
    },
    Cumulative(CumulativeState),
}

/// Notable things a classification step can report
#[derive(Debug, Clone, PartialEq)]
pub enum MotionEvent {
    OutlierRejected { distance_m: f64, elapsed_secs: f64, speed_mps: f64 },
    Transition { from: MotionStatus, to: MotionStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub classification: Classification,
    pub event: Option<MotionEvent>,
}

#[derive(Debug, Clone)]
pub struct MotionClassifier {
    mode: MotionMode,
    hysteresis: HysteresisClassifier,
    cumulative: CumulativeClassifier,
}

impl MotionClassifier {
    pub fn new(settings: &MotionSettings) -> Self {
        Self {
            mode: settings.mode,
            hysteresis: HysteresisClassifier::new(settings.hysteresis.clone()),
            cumulative: CumulativeClassifier::new(settings.movement_threshold_m),
        }
    }

    pub fn mode(&self) -> MotionMode {
        self.mode
    }

    pub fn new_state(&self) -> ClassifierState {
        match self.mode {
            MotionMode::Hysteresis => ClassifierState::Hysteresis {
                state: HysteresisState::default(),
                last_moving_at: None,
            },
            MotionMode::Cumulative => ClassifierState::Cumulative(CumulativeState::default()),
        }
    }

    /// Classify the accepted sample. `window` is the device's noise-filter
    /// window after the sample was inserted.
    pub fn classify(&self, state: &mut ClassifierState, accepted: &Sample, window: &SampleWindow) -> Verdict {
        match state {
            ClassifierState::Hysteresis { state, last_moving_at } => {
                let position = Position {
                    lat: accepted.lat,
                    lng: accepted.lng,
                    timestamp: accepted.timestamp,
                };
                let (status, observation) = self.hysteresis.observe(state, position);

                let event = match observation {
                    Observation::OutlierRejected { distance_m, elapsed_secs, speed_mps } => {
                        Some(MotionEvent::OutlierRejected { distance_m, elapsed_secs, speed_mps })
                    }
                    Observation::Evaluated { transition: Some((from, to)), .. } => {
                        Some(MotionEvent::Transition { from, to })
                    }
                    _ => None,
                };

                let idle_duration_seconds = if status == MotionStatus::Moving {
                    *last_moving_at = Some(accepted.timestamp);
                    0
                } else {
                    last_moving_at
                        .map(|at| seconds_between(at, accepted.timestamp).max(0.0).round() as i64)
                        .unwrap_or(0)
                };

                Verdict { classification: Classification { status, idle_duration_seconds }, event }
            }
            ClassifierState::Cumulative(state) => {
                let before = state.last_status();
                let (classification, _distance) = self.cumulative.classify(state, window);
                let event = (classification.status != before)
                    .then_some(MotionEvent::Transition { from: before, to: classification.status });
                Verdict { classification, event }
            }
        }
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

    fn feed(classifier: &MotionClassifier, state: &mut ClassifierState, samples: &[Sample]) -> Vec<Verdict> {
        let mut window = SampleWindow::new(Duration::seconds(10));
        samples
            .iter()
            .map(|s| {
                window.push(s.clone());
                classifier.classify(state, s, &window)
            })
            .collect()
    }

    #[test]
    fn test_mode_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: MotionMode,
        }
        let w: Wrapper = toml::from_str(r#"mode = "cumulative""#).unwrap();
        assert_eq!(w.mode, MotionMode::Cumulative);
        assert_eq!(MotionMode::default(), MotionMode::Hysteresis);
    }

    #[test]
    fn test_hysteresis_reports_transition_and_idle_time() {
        let classifier = MotionClassifier::new(&MotionSettings::default());
        let mut state = classifier.new_state();

        let moving: Vec<Sample> = (0..5).map(|i| sample(10.0 + i as f64 * 2e-5, i)).collect();
        let verdicts = feed(&classifier, &mut state, &moving);
        assert_eq!(verdicts.last().unwrap().classification.status, MotionStatus::Moving);
        assert!(verdicts.iter().any(|v| matches!(
            v.event,
            Some(MotionEvent::Transition { from: MotionStatus::Unknown, to: MotionStatus::Moving })
        )));

        // Status stays Moving until the parked pattern is confirmed at t=29;
        // the last Moving observation was t=26
        let parked: Vec<Sample> = (0..6).map(|i| sample(10.00008, 20 + i * 3)).collect();
        let verdicts = feed(&classifier, &mut state, &parked);
        let last = verdicts.last().unwrap().classification;
        assert_eq!(last.status, MotionStatus::Stationary);
        assert_eq!(last.idle_duration_seconds, 9);
    }

    #[test]
    fn test_never_moved_device_reports_zero_idle_in_both_modes() {
        let parked: Vec<Sample> = (0..5).map(|i| sample(10.0, i * 3)).collect();
        for mode in [MotionMode::Hysteresis, MotionMode::Cumulative] {
            let classifier = MotionClassifier::new(&MotionSettings { mode, ..MotionSettings::default() });
            let mut state = classifier.new_state();
            let verdicts = feed(&classifier, &mut state, &parked);
            let last = verdicts.last().unwrap().classification;
            assert_ne!(last.status, MotionStatus::Moving, "{}", mode.as_str());
            assert_eq!(last.idle_duration_seconds, 0, "{}", mode.as_str());
        }
    }

    #[test]
    fn test_hysteresis_outlier_is_reported() {
        let classifier = MotionClassifier::new(&MotionSettings::default());
        let mut state = classifier.new_state();
        let mut samples: Vec<Sample> = (0..4).map(|i| sample(10.0, i * 3)).collect();
        // ~555 km in 1s
        samples.push(sample(15.0, 10));
        let verdicts = feed(&classifier, &mut state, &samples);
        let last = verdicts.last().unwrap();
        assert_eq!(last.classification.status, MotionStatus::Stationary);
        assert!(matches!(last.event, Some(MotionEvent::OutlierRejected { .. })));
    }

    #[test]
    fn test_hysteresis_reselected_sample_is_observed_once() {
        let classifier = MotionClassifier::new(&MotionSettings::default());
        let mut state = classifier.new_state();
        let first = sample(10.0, 0);
        feed(&classifier, &mut state, &[first.clone(), first.clone(), first]);
        let ClassifierState::Hysteresis { state, .. } = &state else {
            panic!("expected hysteresis state");
        };
        assert_eq!(state.history_len(), 1);
    }

    #[test]
    fn test_cumulative_mode_reports_transitions() {
        let settings = MotionSettings { mode: MotionMode::Cumulative, ..MotionSettings::default() };
        let classifier = MotionClassifier::new(&settings);
        let mut state = classifier.new_state();
        assert!(matches!(state, ClassifierState::Cumulative(_)));

        let verdicts = feed(&classifier, &mut state, &[sample(10.0, 0), sample(10.0001, 1)]);
        assert_eq!(verdicts[0].classification.status, MotionStatus::Unknown);
        assert_eq!(verdicts[0].event, None);
        assert_eq!(
            verdicts[1].event,
            Some(MotionEvent::Transition { from: MotionStatus::Unknown, to: MotionStatus::Moving })
        );
    }
}
