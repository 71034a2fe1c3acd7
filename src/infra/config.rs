//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. GEOTRACK_CONFIG environment variable
//! 3. Default: config/geotrack.toml
//!
//! The file is parsed into optional sections, then resolved and validated
//! once. Consumers only ever see the resolved [`Config`].

use crate::domain::reconnect::ReconnectPolicy;
use crate::domain::types::StationId;
use crate::services::motion::{HysteresisConfig, MotionMode, MotionSettings};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/geotrack.toml";
pub const CONFIG_ENV_VAR: &str = "GEOTRACK_CONFIG";

const MIN_SEND_INTERVAL_SECS: i64 = 5;
const DEFAULT_RETRY_DELAY_SECS: i64 = 2;
const DEFAULT_HTTP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("server.listen_ip is not a valid IP address: {0}")]
    InvalidListenIp(String),
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("external_app.base_url is invalid: {0}")]
    InvalidBaseUrl(String),
    #[error("external_app.socket_url is invalid: {0}")]
    InvalidSocketUrl(String),
    #[error("external_app.client_id and external_app.secret are required")]
    MissingCredentials,
    #[error("station {station}: {reason}")]
    InvalidStation { station: String, reason: &'static str },
    #[error("server.mode = \"peer\" requires at least one [[stations]] entry")]
    NoStations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Stations connect to us
    #[default]
    Inbound,
    /// We connect out to every configured station
    Peer,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Inbound => "inbound",
            ServerMode::Peer => "peer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_ip: String,
    pub listen_port: u16,
    pub mode: ServerMode,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { listen_ip: "0.0.0.0".to_string(), listen_port: 5099, mode: ServerMode::Inbound }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationSection {
    /// Defaults to `host:port`
    #[serde(default)]
    pub station_id: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Overrides the global [reconnect] section for this station
    #[serde(default)]
    pub reconnect: Option<ReconnectPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub window_secs: f64,
    pub max_reasonable_speed_mps: f64,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self { window_secs: 10.0, max_reasonable_speed_mps: 50.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionSection {
    pub mode: MotionMode,
    pub window_secs: f64,
    pub max_distance_stationary_m: f64,
    pub speed_threshold_moving_mps: f64,
    pub speed_threshold_stationary_mps: f64,
    pub confirm_count: u32,
    #[serde(alias = "outlier_jump_meters")]
    pub outlier_jump: f64,
    pub min_points: usize,
    pub movement_threshold_m: f64,
}

impl Default for MotionSection {
    fn default() -> Self {
        let h = HysteresisConfig::default();
        Self {
            mode: MotionMode::default(),
            window_secs: h.window_secs,
            max_distance_stationary_m: h.max_distance_stationary_m,
            speed_threshold_moving_mps: h.speed_threshold_moving_mps,
            speed_threshold_stationary_mps: h.speed_threshold_stationary_mps,
            confirm_count: h.confirm_count,
            outlier_jump: h.outlier_jump,
            min_points: h.min_points,
            movement_threshold_m: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsSection {
    pub login_path: String,
    pub refresh_path: String,
    pub aggregate_path: String,
}

impl Default for EndpointsSection {
    fn default() -> Self {
        Self {
            login_path: "api/auth-plugin/auth/login-by-key".to_string(),
            refresh_path: "auth/refresh".to_string(),
            aggregate_path: "api/golf/check-location/telemetry".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: i64,
    pub retry_count: i64,
    pub retry_delay_secs: i64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self { timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS, retry_count: 3, retry_delay_secs: DEFAULT_RETRY_DELAY_SECS }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAppSection {
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, alias = "client_secret")]
    pub secret: String,
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: i64,
    #[serde(default)]
    pub socket_url: Option<String>,
    #[serde(default)]
    pub endpoints: EndpointsSection,
    #[serde(default)]
    pub http: HttpSection,
}

fn default_send_interval_secs() -> i64 {
    MIN_SEND_INTERVAL_SECS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub interval_secs: u64,
    /// Status HTTP port (0 to disable)
    pub status_port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: 30, status_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stations: Vec<StationSection>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub motion: MotionSection,
    #[serde(default)]
    pub external_app: Option<ExternalAppSection>,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// A station we connect out to in peer mode
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: StationId,
    pub host: String,
    pub port: u16,
    pub reconnect: ReconnectPolicy,
}

impl Station {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolved HTTP behaviour for the remote API
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS as u64),
            retry_count: 3,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS as u64),
        }
    }
}

/// Remote API the relay reports to
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalApp {
    pub base_url: String,
    pub client_id: String,
    pub secret: String,
    pub send_interval: Duration,
    pub socket_url: Option<String>,
    pub login_path: String,
    pub refresh_path: String,
    pub aggregate_path: String,
    pub http: HttpSettings,
}

impl ExternalApp {
    pub fn login_url(&self) -> String {
        join_url(&self.base_url, &self.login_path)
    }

    pub fn refresh_url(&self) -> String {
        join_url(&self.base_url, &self.refresh_path)
    }

    pub fn aggregate_url(&self) -> String {
        join_url(&self.base_url, &self.aggregate_path)
    }

    pub fn notification_url(&self) -> Option<String> {
        self.socket_url
            .as_deref()
            .map(|socket| join_url(socket, "notification/update-buggy-location"))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    listen_ip: IpAddr,
    listen_port: u16,
    server_mode: ServerMode,
    stations: Vec<Station>,
    window_secs: f64,
    max_reasonable_speed_mps: f64,
    motion: MotionSettings,
    external_app: Option<ExternalApp>,
    metrics_interval_secs: u64,
    status_port: u16,
    log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(TomlConfig::default(), "default")
            .unwrap_or_else(|e| unreachable!("built-in defaults are valid: {e}"))
    }
}

impl Config {
    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return path;
            }
        }
        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse and validate TOML text; `source` is only used for messages
    pub fn parse(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| format!("Failed to parse config file {source}"))?;
        Self::resolve(toml_config, source).with_context(|| format!("Invalid config file {source}"))
    }

    fn resolve(raw: TomlConfig, source: &str) -> Result<Self, ConfigError> {
        let listen_ip: IpAddr = raw
            .server
            .listen_ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListenIp(raw.server.listen_ip.clone()))?;

        require_positive("filter.window_secs", raw.filter.window_secs)?;
        require_positive("filter.max_reasonable_speed_mps", raw.filter.max_reasonable_speed_mps)?;

        let motion = resolve_motion(&raw.motion)?;

        let mut stations = Vec::with_capacity(raw.stations.len());
        for section in &raw.stations {
            stations.push(resolve_station(section, &raw.reconnect, raw.server.mode)?);
        }
        if raw.server.mode == ServerMode::Peer && stations.is_empty() {
            return Err(ConfigError::NoStations);
        }

        let external_app = raw.external_app.as_ref().map(resolve_external_app).transpose()?;

        Ok(Self {
            config_file: source.to_string(),
            listen_ip,
            listen_port: raw.server.listen_port,
            server_mode: raw.server.mode,
            stations,
            window_secs: raw.filter.window_secs,
            max_reasonable_speed_mps: raw.filter.max_reasonable_speed_mps,
            motion,
            external_app,
            metrics_interval_secs: raw.metrics.interval_secs.max(1),
            status_port: raw.metrics.status_port,
            log_format: raw.logging.format,
        })
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn listen_ip(&self) -> IpAddr {
        self.listen_ip
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn server_mode(&self) -> ServerMode {
        self.server_mode
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.window_secs * 1000.0) as i64)
    }

    pub fn max_reasonable_speed_mps(&self) -> f64 {
        self.max_reasonable_speed_mps
    }

    pub fn motion(&self) -> &MotionSettings {
        &self.motion
    }

    pub fn external_app(&self) -> Option<&ExternalApp> {
        self.external_app.as_ref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Override listen address (tests bind to an ephemeral port)
    pub fn with_listen(mut self, ip: IpAddr, port: u16) -> Self {
        self.listen_ip = ip;
        self.listen_port = port;
        self
    }

    pub fn with_external_app(mut self, external_app: Option<ExternalApp>) -> Self {
        self.external_app = external_app;
        self
    }

    pub fn with_motion(mut self, motion: MotionSettings) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_peer_stations(mut self, stations: Vec<Station>) -> Self {
        self.server_mode = ServerMode::Peer;
        self.stations = stations;
        self
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

fn resolve_motion(section: &MotionSection) -> Result<MotionSettings, ConfigError> {
    require_positive("motion.window_secs", section.window_secs)?;
    require_positive("motion.max_distance_stationary_m", section.max_distance_stationary_m)?;
    require_positive("motion.speed_threshold_moving_mps", section.speed_threshold_moving_mps)?;
    require_positive("motion.speed_threshold_stationary_mps", section.speed_threshold_stationary_mps)?;
    require_positive("motion.outlier_jump", section.outlier_jump)?;
    require_positive("motion.movement_threshold_m", section.movement_threshold_m)?;
    if section.confirm_count == 0 {
        return Err(ConfigError::Zero { field: "motion.confirm_count" });
    }
    if section.min_points == 0 {
        return Err(ConfigError::Zero { field: "motion.min_points" });
    }

    Ok(MotionSettings {
        mode: section.mode,
        hysteresis: HysteresisConfig {
            window_secs: section.window_secs,
            max_distance_stationary_m: section.max_distance_stationary_m,
            speed_threshold_moving_mps: section.speed_threshold_moving_mps,
            speed_threshold_stationary_mps: section.speed_threshold_stationary_mps,
            confirm_count: section.confirm_count,
            outlier_jump: section.outlier_jump,
            min_points: section.min_points,
        },
        movement_threshold_m: section.movement_threshold_m,
    })
}

fn resolve_station(
    section: &StationSection,
    global: &ReconnectPolicy,
    mode: ServerMode,
) -> Result<Station, ConfigError> {
    let host = section.host.trim().to_string();
    let label = section.station_id.clone().unwrap_or_else(|| format!("{host}:{}", section.port));

    if host.is_empty() {
        return Err(ConfigError::InvalidStation { station: label, reason: "host is empty" });
    }
    if mode == ServerMode::Peer && section.port == 0 {
        return Err(ConfigError::InvalidStation { station: label, reason: "port must be non-zero in peer mode" });
    }

    Ok(Station {
        id: StationId(label),
        host,
        port: section.port,
        reconnect: section.reconnect.unwrap_or(*global),
    })
}

fn resolve_external_app(section: &ExternalAppSection) -> Result<ExternalApp, ConfigError> {
    let base_url = section.base_url.trim().to_string();
    if !is_http_url(&base_url) {
        return Err(ConfigError::InvalidBaseUrl(section.base_url.clone()));
    }

    let socket_url = match section.socket_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(url) if is_http_url(url) => Some(url.to_string()),
        Some(url) => return Err(ConfigError::InvalidSocketUrl(url.to_string())),
    };

    if section.client_id.trim().is_empty() || section.secret.is_empty() {
        return Err(ConfigError::MissingCredentials);
    }

    let send_interval_secs = if section.send_interval_secs <= 0 {
        MIN_SEND_INTERVAL_SECS
    } else {
        section.send_interval_secs
    };
    let timeout_secs =
        if section.http.timeout_secs <= 0 { DEFAULT_HTTP_TIMEOUT_SECS } else { section.http.timeout_secs };
    let retry_delay_secs = if section.http.retry_delay_secs <= 0 {
        DEFAULT_RETRY_DELAY_SECS
    } else {
        section.http.retry_delay_secs
    };
    let retry_count = u32::try_from(section.http.retry_count.max(0)).unwrap_or(u32::MAX);

    Ok(ExternalApp {
        base_url,
        client_id: section.client_id.trim().to_string(),
        secret: section.secret.clone(),
        send_interval: Duration::from_secs(send_interval_secs as u64),
        socket_url,
        login_path: section.endpoints.login_path.clone(),
        refresh_path: section.endpoints.refresh_path.clone(),
        aggregate_path: section.endpoints.aggregate_path.clone(),
        http: HttpSettings {
            timeout: Duration::from_secs(timeout_secs as u64),
            retry_count,
            retry_delay: Duration::from_secs(retry_delay_secs as u64),
        },
    })
}

fn is_http_url(value: &str) -> bool {
    match reqwest::Url::parse(value) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"
[external_app]
base_url = "https://api.example.test/"
client_id = "gate-7"
secret = "s3cret"
"#;

    fn parse(content: &str) -> anyhow::Result<Config> {
        Config::parse(content, "test")
    }

    fn config_error(content: &str) -> ConfigError {
        let err = parse(content).unwrap_err();
        err.downcast_ref::<ConfigError>().cloned().expect("validation error")
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_port(), 5099);
        assert_eq!(config.server_mode(), ServerMode::Inbound);
        assert_eq!(config.window_secs(), 10.0);
        assert_eq!(config.max_reasonable_speed_mps(), 50.0);
        assert_eq!(config.motion().mode, MotionMode::Hysteresis);
        assert_eq!(config.motion().hysteresis.confirm_count, 2);
        assert!(config.external_app().is_none());
        assert_eq!(config.status_port(), 0);
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = parse("").unwrap();
        assert_eq!(config.listen_ip().to_string(), "0.0.0.0");
        assert_eq!(config.log_format(), LogFormat::Text);
    }

    #[test]
    fn test_resolve_config_path_prefers_cli() {
        assert_eq!(Config::resolve_config_path(Some("custom.toml")), "custom.toml");
    }

    #[test]
    fn test_external_app_defaults_and_urls() {
        let config = parse(APP).unwrap();
        let app = config.external_app().unwrap();
        assert_eq!(app.send_interval, Duration::from_secs(5));
        assert_eq!(app.http, HttpSettings::default());
        assert_eq!(app.login_url(), "https://api.example.test/api/auth-plugin/auth/login-by-key");
        assert_eq!(app.aggregate_url(), "https://api.example.test/api/golf/check-location/telemetry");
        assert_eq!(app.notification_url(), None);
    }

    #[test]
    fn test_non_positive_values_are_floored() {
        let content = format!(
            "{APP}send_interval_secs = -1\nsocket_url = \"http://push.example.test\"\n\
             [external_app.http]\ntimeout_secs = 0\nretry_count = -4\nretry_delay_secs = 0\n"
        );
        let config = parse(&content).unwrap();
        let app = config.external_app().unwrap();
        assert_eq!(app.send_interval, Duration::from_secs(5));
        assert_eq!(app.http.timeout, Duration::from_secs(10));
        assert_eq!(app.http.retry_count, 0);
        assert_eq!(app.http.retry_delay, Duration::from_secs(2));
        assert_eq!(
            app.notification_url().as_deref(),
            Some("http://push.example.test/notification/update-buggy-location")
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let err = config_error("[external_app]\nbase_url = \"ftp//nope\"\nclient_id = \"a\"\nsecret = \"b\"\n");
        assert!(matches!(err, ConfigError::InvalidBaseUrl(_)));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = config_error("[external_app]\nbase_url = \"http://localhost:8080\"\n");
        assert_eq!(err, ConfigError::MissingCredentials);
    }

    #[test]
    fn test_non_positive_window_rejected() {
        let err = config_error("[filter]\nwindow_secs = 0\n");
        assert!(matches!(err, ConfigError::NonPositive { field: "filter.window_secs", .. }));
    }

    #[test]
    fn test_zero_confirm_count_rejected() {
        let err = config_error("[motion]\nconfirm_count = 0\n");
        assert_eq!(err, ConfigError::Zero { field: "motion.confirm_count" });
    }

    #[test]
    fn test_peer_mode_requires_stations_with_ports() {
        assert_eq!(config_error("[server]\nmode = \"peer\"\n"), ConfigError::NoStations);

        let err = config_error("[server]\nmode = \"peer\"\n[[stations]]\nhost = \"10.0.0.2\"\n");
        assert!(matches!(err, ConfigError::InvalidStation { .. }));
    }

    #[test]
    fn test_station_reconnect_override() {
        let config = parse(
            r#"
[server]
mode = "peer"

[reconnect]
initial_delay_secs = 3
max_delay_secs = 30

[[stations]]
station_id = "north"
host = "10.0.0.2"
port = 7000

[[stations]]
host = "10.0.0.3"
port = 7001
reconnect = { initial_delay_secs = 1, use_exponential_backoff = false }
"#,
        )
        .unwrap();

        let stations = config.stations();
        assert_eq!(stations[0].id.as_str(), "north");
        assert_eq!(stations[0].reconnect.initial_delay_secs, 3);
        assert_eq!(stations[1].id.as_str(), "10.0.0.3:7001");
        assert!(!stations[1].reconnect.use_exponential_backoff);
        assert_eq!(stations[1].reconnect.max_delay_secs, 60);
    }

    #[test]
    fn test_motion_section_maps_to_settings() {
        let config = parse("[motion]\nmode = \"cumulative\"\nmin_points = 5\noutlier_jump_meters = 120\n").unwrap();
        let motion = config.motion();
        assert_eq!(motion.mode, MotionMode::Cumulative);
        assert_eq!(motion.hysteresis.min_points, 5);
        assert_eq!(motion.hysteresis.outlier_jump, 120.0);
    }
}
