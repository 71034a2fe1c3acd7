//! Infrastructure - configuration, metrics, logging and shutdown
//!
//! - `config` - TOML loading, validated once into a resolved `Config`
//! - `metrics` - Lock-free counters and periodic summary
//! - `logging` - tracing subscriber setup
//! - `shutdown` - process-wide cancellation signal

pub mod config;
pub mod logging;
pub mod metrics;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, ServerMode};
pub use metrics::{Metrics, MetricsSummary};
