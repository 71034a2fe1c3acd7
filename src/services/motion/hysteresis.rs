//! Hysteresis motion classifier
//!
//! Keeps its own short position history per device and only commits a status
//! change after `confirm_count` consecutive observations agree on it.

use crate::domain::geo::haversine_m;
use crate::domain::types::MotionStatus;
use crate::services::noise_filter::seconds_between;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Tunables for the hysteresis classifier
#[derive(Debug, Clone, PartialEq)]
pub struct HysteresisConfig {
    pub window_secs: f64,
    pub max_distance_stationary_m: f64,
    pub speed_threshold_moving_mps: f64,
    pub speed_threshold_stationary_mps: f64,
    pub confirm_count: u32,
    /// Compared against the implied speed in m/s, not a distance
    pub outlier_jump: f64,
    pub min_points: usize,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            window_secs: 10.0,
            max_distance_stationary_m: 10.0,
            speed_threshold_moving_mps: 1.0,
            speed_threshold_stationary_mps: 0.5,
            confirm_count: 2,
            outlier_jump: 200.0,
            min_points: 3,
        }
    }
}

/// A position accepted into the history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    fn distance_to(&self, other: &Position) -> f64 {
        haversine_m(self.lat, self.lng, other.lat, other.lng)
    }
}

/// Per-device classifier state
#[derive(Debug, Clone, Default)]
pub struct HysteresisState {
    current: MotionStatus,
    /// Indexed by `counter_slot`; at most one entry is non-zero
    confirm_counters: [u32; 3],
    history: VecDeque<Position>,
}

impl HysteresisState {
    pub fn current_status(&self) -> MotionStatus {
        self.current
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn confirm_counter(&self, status: MotionStatus) -> u32 {
        counter_slot(status).map(|i| self.confirm_counters[i]).unwrap_or(0)
    }

    fn reset_counters(&mut self) {
        self.confirm_counters = [0; 3];
    }

    fn bump_counter(&mut self, candidate: MotionStatus) -> u32 {
        let Some(slot) = counter_slot(candidate) else {
            return 0;
        };
        for (i, counter) in self.confirm_counters.iter_mut().enumerate() {
            if i == slot {
                *counter += 1;
            } else {
                *counter = 0;
            }
        }
        self.confirm_counters[slot]
    }
}

fn counter_slot(status: MotionStatus) -> Option<usize> {
    match status {
        MotionStatus::Stationary => Some(0),
        MotionStatus::Moving => Some(1),
        MotionStatus::Idle => Some(2),
        MotionStatus::Unknown => None,
    }
}

/// Window metrics used to pick a candidate status
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub max_pair_distance_m: f64,
    pub span_secs: f64,
    pub average_speed_mps: f64,
}

/// What happened to one observed position
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Same position as the newest history entry; the selector can pick one
    /// sample again while it stays the best in its window
    Repeated,
    /// Implied speed from the previous position exceeded `outlier_jump`
    OutlierRejected { distance_m: f64, elapsed_secs: f64, speed_mps: f64 },
    /// Fewer than `min_points` positions in the history
    InsufficientData { points: usize },
    /// Candidate computed; `transition` is set when the status was committed
    Evaluated {
        candidate: MotionStatus,
        metrics: WindowMetrics,
        transition: Option<(MotionStatus, MotionStatus)>,
    },
}

#[derive(Debug, Clone)]
pub struct HysteresisClassifier {
    config: HysteresisConfig,
}

impl HysteresisClassifier {
    pub fn new(config: HysteresisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HysteresisConfig {
        &self.config
    }

    /// Feed one accepted position. Returns the (possibly unchanged) status and
    /// what the classifier did with the position.
    pub fn observe(&self, state: &mut HysteresisState, position: Position) -> (MotionStatus, Observation) {
        if let Some(last) = state.history.back() {
            if *last == position {
                return (state.current, Observation::Repeated);
            }
            let elapsed = seconds_between(last.timestamp, position.timestamp);
            if elapsed > 0.0 {
                let distance = last.distance_to(&position);
                let speed = distance / elapsed;
                if speed > self.config.outlier_jump {
                    let observation = Observation::OutlierRejected {
                        distance_m: distance,
                        elapsed_secs: elapsed,
                        speed_mps: speed,
                    };
                    return (state.current, observation);
                }
            }
        }

        state.history.push_back(position);
        self.trim(state);

        if state.history.len() < self.config.min_points {
            let points = state.history.len();
            return (state.current, Observation::InsufficientData { points });
        }

        let metrics = compute_metrics(&state.history);
        let candidate = self.decide(&metrics);

        let mut transition = None;
        if candidate == state.current {
            state.reset_counters();
        } else if state.bump_counter(candidate) >= self.config.confirm_count {
            transition = Some((state.current, candidate));
            state.current = candidate;
            state.reset_counters();
        }

        (state.current, Observation::Evaluated { candidate, metrics, transition })
    }

    fn trim(&self, state: &mut HysteresisState) {
        let Some(newest) = state.history.back().map(|p| p.timestamp) else {
            return;
        };
        let span = Duration::milliseconds((self.config.window_secs * 1000.0) as i64);
        let threshold = newest - span;
        while state.history.front().is_some_and(|p| p.timestamp < threshold) {
            state.history.pop_front();
        }
    }

    fn decide(&self, metrics: &WindowMetrics) -> MotionStatus {
        if metrics.max_pair_distance_m <= self.config.max_distance_stationary_m
            && metrics.average_speed_mps <= self.config.speed_threshold_stationary_mps
        {
            return MotionStatus::Stationary;
        }
        if metrics.average_speed_mps >= self.config.speed_threshold_moving_mps {
            return MotionStatus::Moving;
        }
        MotionStatus::Idle
    }
}

fn compute_metrics(history: &VecDeque<Position>) -> WindowMetrics {
    let points: Vec<&Position> = history.iter().collect();

    let total_distance: f64 = points.windows(2).map(|w| w[0].distance_to(w[1])).sum();

    let mut max_pair = 0.0_f64;
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            max_pair = max_pair.max(a.distance_to(b));
        }
    }

    let span_secs = match (points.first(), points.last()) {
        (Some(first), Some(last)) => seconds_between(first.timestamp, last.timestamp).max(1.0),
        _ => 1.0,
    };

    WindowMetrics {
        max_pair_distance_m: max_pair,
        span_secs,
        average_speed_mps: total_distance / span_secs,
    }
}
