//! Per-device sample window and best-sample selection
//!
//! Each device keeps the samples of the last `window` seconds, measured from
//! the newest sample's own timestamp rather than the wall clock so replayed
//! or simulated streams behave the same as live ones.
//!
//! Selection prefers more satellites, then recency, and skips candidates that
//! would imply an unreasonable speed from the last accepted position.

use crate::domain::geo::GeoPoint;
use crate::domain::types::{FilteredState, Sample};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Default outlier speed (m/s), roughly 180 km/h
pub const DEFAULT_MAX_REASONABLE_SPEED_MPS: f64 = 50.0;

/// Time-bounded window of samples for one device
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<Sample>,
    span: Duration,
}

impl SampleWindow {
    pub fn new(span: Duration) -> Self {
        Self { samples: VecDeque::new(), span }
    }

    /// Insert a sample and drop everything older than `newest - span`
    pub fn push(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        self.trim();
    }

    fn trim(&mut self) {
        let Some(newest) = self.newest_timestamp() else {
            return;
        };
        let threshold = newest - self.span;
        self.samples.retain(|s| s.timestamp >= threshold);
    }

    /// Newest timestamp among members (arrival order is not trusted)
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.timestamp).max()
    }

    /// Members in timestamp order, oldest first
    pub fn chronological(&self) -> Vec<&Sample> {
        let mut ordered: Vec<&Sample> = self.samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);
        ordered
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Result of a selection pass
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'a> {
    pub sample: &'a Sample,
    /// Candidates skipped because they implied an unreasonable speed
    pub outliers_skipped: usize,
    /// Every candidate was an outlier and the top-ranked one was taken anyway
    pub fell_back: bool,
}

/// Best-sample selector with a configurable outlier speed
#[derive(Debug, Clone, Copy)]
pub struct NoiseFilter {
    max_reasonable_speed_mps: f64,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REASONABLE_SPEED_MPS)
    }
}

impl NoiseFilter {
    pub fn new(max_reasonable_speed_mps: f64) -> Self {
        Self { max_reasonable_speed_mps }
    }

    /// A candidate is an outlier only when time moved forward since the last
    /// accepted state and the implied speed exceeds the limit. Clock skew and
    /// out-of-order delivery (elapsed <= 0) are tolerated.
    pub fn is_outlier(&self, candidate: &Sample, last: &FilteredState) -> bool {
        let elapsed = seconds_between(last.timestamp, candidate.timestamp);
        if elapsed <= 0.0 {
            return false;
        }
        let speed = last.distance_to(candidate) / elapsed;
        speed > self.max_reasonable_speed_mps
    }

    /// Pick the most trustworthy sample in the window.
    ///
    /// Returns `None` only for an empty window.
    pub fn select_best<'a>(
        &self,
        window: &'a SampleWindow,
        last: Option<&FilteredState>,
    ) -> Option<Selection<'a>> {
        let mut ranked: Vec<&Sample> = window.iter().collect();
        ranked.sort_by(|a, b| rank(a, b));

        let top = *ranked.first()?;

        let Some(last) = last else {
            return Some(Selection { sample: top, outliers_skipped: 0, fell_back: false });
        };

        for (skipped, candidate) in ranked.iter().enumerate() {
            if !self.is_outlier(candidate, last) {
                return Some(Selection {
                    sample: *candidate,
                    outliers_skipped: skipped,
                    fell_back: false,
                });
            }
        }

        Some(Selection { sample: top, outliers_skipped: ranked.len(), fell_back: true })
    }
}

/// Satellites descending, then timestamp descending
fn rank(a: &Sample, b: &Sample) -> Ordering {
    b.sats.cmp(&a.sats).then_with(|| b.timestamp.cmp(&a.timestamp))
}

/// Signed seconds from `from` to `to` with millisecond resolution
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
