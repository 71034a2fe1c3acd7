//! Domain models - core types and geo math
//!
//! - `types` - readings, samples, filtered state and motion status
//! - `geo` - Haversine great-circle distance
//! - `reconnect` - delay policy for outbound station connections

pub mod geo;
pub mod reconnect;
pub mod types;

pub use geo::{haversine_m, GeoPoint};
pub use reconnect::ReconnectPolicy;
pub use types::{
    Classification, DeviceKey, Envelope, FilteredState, MotionStatus, Reading, Sample, StationId, TokenData,
};
