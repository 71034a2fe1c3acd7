//! Shared types for the GeoTrack gateway

use crate::domain::geo::GeoPoint;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Newtype wrapper for station identities (one per TCP peer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl StationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Case-insensitive device key used by every per-device map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(device_id: &str) -> Self {
        Self(device_id.trim().to_lowercase())
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One element of an ingested JSON array, as sent by a station.
/// Field names are accepted in camelCase, short (`id`, `datetime`) and
/// PascalCase forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(default, alias = "id", alias = "Id", alias = "ID", alias = "DeviceId")]
    pub device_id: String,
    #[serde(
        alias = "datetime",
        alias = "Datetime",
        alias = "DateTime",
        alias = "Timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "Lat")]
    pub lat: f64,
    #[serde(alias = "Lng")]
    pub lng: f64,
    #[serde(default, alias = "Sats", deserialize_with = "deserialize_sats")]
    pub sats: u32,
    // Legacy simulator fields, accepted and ignored by the pipeline
    #[serde(default, alias = "SpeedKph")]
    pub speed_kph: Option<f64>,
    #[serde(default, alias = "HeadingDeg")]
    pub heading_deg: Option<f64>,
    #[serde(default, alias = "BatteryPct")]
    pub battery_pct: Option<f64>,
    #[serde(default, alias = "Status")]
    pub status: Option<String>,
}

/// Parse an ISO-8601 timestamp. Strings without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an ISO-8601 string or epoch milliseconds")
        }

        fn visit_str<E>(self, value: &str) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            parse_timestamp(value)
                .ok_or_else(|| E::custom(format!("invalid timestamp: {value}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            let ms = i64::try_from(value).map_err(|_| E::custom("epoch ms out of range"))?;
            self.visit_i64(ms)
        }

        fn visit_i64<E>(self, value: i64) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            DateTime::from_timestamp_millis(value)
                .ok_or_else(|| E::custom(format!("epoch ms out of range: {value}")))
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

fn deserialize_sats<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct SatsVisitor;

    impl<'de> Visitor<'de> for SatsVisitor {
        type Value = u32;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a satellite count")
        }

        fn visit_u64<E>(self, value: u64) -> Result<u32, E>
        where
            E: de::Error,
        {
            Ok(u32::try_from(value).unwrap_or(u32::MAX))
        }

        fn visit_i64<E>(self, value: i64) -> Result<u32, E>
        where
            E: de::Error,
        {
            Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
        }

        fn visit_f64<E>(self, value: f64) -> Result<u32, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value > 0.0 {
                Ok(value.trunc().min(u32::MAX as f64) as u32)
            } else {
                Ok(0)
            }
        }

        fn visit_unit<E>(self) -> Result<u32, E>
        where
            E: de::Error,
        {
            Ok(0)
        }
    }

    deserializer.deserialize_any(SatsVisitor)
}

/// A reading attributed to the station that delivered it.
/// Immutable once built; moved into the device's window.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub station_id: StationId,
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub sats: u32,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Build a sample, substituting the station identity for a blank device id
    pub fn from_reading(station_id: &StationId, reading: Reading) -> Self {
        let device_id = if reading.device_id.trim().is_empty() {
            station_id.0.clone()
        } else {
            reading.device_id
        };

        Self {
            station_id: station_id.clone(),
            device_id,
            lat: reading.lat,
            lng: reading.lng,
            sats: reading.sats,
            timestamp: reading.timestamp,
        }
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(&self.device_id)
    }
}

impl GeoPoint for Sample {
    fn lat(&self) -> f64 {
        self.lat
    }

    fn lng(&self) -> f64 {
        self.lng
    }
}

/// Debounced motion state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MotionStatus {
    #[default]
    Unknown,
    Stationary,
    Moving,
    Idle,
}

impl MotionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionStatus::Unknown => "Unknown",
            MotionStatus::Stationary => "Stationary",
            MotionStatus::Moving => "Moving",
            MotionStatus::Idle => "Idle",
        }
    }
}

impl std::fmt::Display for MotionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest accepted, classified position of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredState {
    pub station_id: StationId,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub sats: u32,
    pub status: MotionStatus,
    pub idle_duration_seconds: i64,
    pub timestamp: DateTime<Utc>,
}

impl FilteredState {
    /// Copy position fields from the chosen sample. Status fields are left at
    /// their defaults for the classifier to fill in.
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            station_id: sample.station_id.clone(),
            device_id: sample.device_id.clone(),
            latitude: sample.lat,
            longitude: sample.lng,
            sats: sample.sats,
            status: MotionStatus::Unknown,
            idle_duration_seconds: 0,
            timestamp: sample.timestamp,
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.status = classification.status;
        self.idle_duration_seconds = classification.idle_duration_seconds;
        self
    }
}

impl GeoPoint for FilteredState {
    fn lat(&self) -> f64 {
        self.latitude
    }

    fn lng(&self) -> f64 {
        self.longitude
    }
}

/// Classifier verdict for one accepted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub status: MotionStatus,
    pub idle_duration_seconds: i64,
}

/// Success/failure wrapper around remote API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub is_successful: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Token payload of a login or refresh response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, alias = "expiresIn")]
    pub expire_in_seconds: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub client_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}
