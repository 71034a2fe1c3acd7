//! Services - per-device tracking pipeline
//!
//! - `noise_filter` - sample window and best-sample selection
//! - `motion` - hysteresis and cumulative-distance classifiers
//! - `repository` - latest filtered state per device
//! - `tracker` - window, select, classify, store

pub mod motion;
pub mod noise_filter;
pub mod repository;
pub mod tracker;

pub use repository::Repository;
pub use tracker::{SampleSink, Tracker};
