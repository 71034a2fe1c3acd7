//! Aggregation repository: latest filtered state per device
//!
//! Written by every ingestion task, read by the relay. Writes hold the lock
//! only for a single map insert, so devices never wait on each other's
//! pipeline work.

use crate::domain::types::{Classification, DeviceKey, FilteredState, MotionStatus, Sample};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct Repository {
    states: RwLock<FxHashMap<DeviceKey, FilteredState>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the device's entry with a fully built state
    pub fn update(&self, sample: &Sample, classification: Classification) -> FilteredState {
        let state = FilteredState::from_sample(sample).with_classification(classification);
        self.states.write().insert(sample.device_key(), state.clone());
        state
    }

    /// Copy of every entry, sorted by device id for stable output
    pub fn snapshot(&self) -> Vec<FilteredState> {
        let mut states: Vec<FilteredState> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn get(&self, device_id: &str) -> Option<FilteredState> {
        self.states.read().get(&DeviceKey::new(device_id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// (tracked, moving) device counts
    pub fn counts(&self) -> (usize, usize) {
        let states = self.states.read();
        let moving = states.values().filter(|s| s.status == MotionStatus::Moving).count();
        (states.len(), moving)
    }

    pub fn clear(&self) {
        self.states.write().clear();
    }
}
