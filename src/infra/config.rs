//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// How a track's direction is derived from centre movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    /// Last confident reading wins
    SingleShot,
    /// Per-frame votes, majority reported at retirement
    MajorityVote,
}

impl DirectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectionPolicy::SingleShot => "single_shot",
            DirectionPolicy::MajorityVote => "majority_vote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeolocationMode {
    Disabled,
    Fixed,
    Http,
}

impl GeolocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeolocationMode::Disabled => "disabled",
            GeolocationMode::Fixed => "fixed",
            GeolocationMode::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "traffic".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// "stdin", a JSONL file path, or mqtt://host:port/topic
    #[serde(default = "default_source_uri")]
    pub uri: String,
    /// Minimum detection confidence accepted
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Frame channel capacity between source and pipeline
    #[serde(default = "default_frame_queue_size")]
    pub queue_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: default_source_uri(),
            confidence_threshold: default_confidence_threshold(),
            queue_size: default_frame_queue_size(),
        }
    }
}

fn default_source_uri() -> String {
    "stdin".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_frame_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { username: None, password: None, client_id: default_mqtt_client_id() }
    }
}

fn default_mqtt_client_id() -> String {
    "traffic-analyser".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum centre movement (pixels) counted as LEFT/RIGHT
    #[serde(default = "default_direction_threshold")]
    pub direction_threshold: f64,
    /// Consecutive missed frames tolerated before retirement
    #[serde(default = "default_grace_frames")]
    pub grace_frames: u32,
    #[serde(default = "default_direction_policy")]
    pub direction_policy: DirectionPolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            direction_threshold: default_direction_threshold(),
            grace_frames: default_grace_frames(),
            direction_policy: default_direction_policy(),
        }
    }
}

fn default_direction_threshold() -> f64 {
    5.0
}

fn default_grace_frames() -> u32 {
    10
}

fn default_direction_policy() -> DirectionPolicy {
    DirectionPolicy::SingleShot
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClassesConfig {
    /// Overrides the COCO label table when non-empty
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_enabled")]
    pub enabled: bool,
    #[serde(default = "default_delivery_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_delivery_queue_size")]
    pub queue_size: usize,
    /// Time allowed for the queue to drain at shutdown
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_delivery_enabled(),
            endpoint: default_delivery_endpoint(),
            timeout_ms: default_delivery_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queue_size: default_delivery_queue_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_delivery_enabled() -> bool {
    true
}

fn default_delivery_endpoint() -> String {
    "http://localhost:5000/api/data".to_string()
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_delivery_queue_size() -> usize {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationConfig {
    #[serde(default = "default_geolocation_mode")]
    pub mode: GeolocationMode,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
    /// How long an HTTP lookup result is reused
    #[serde(default = "default_geolocation_cache_secs")]
    pub cache_secs: u64,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            mode: default_geolocation_mode(),
            latitude: None,
            longitude: None,
            url: None,
            cache_secs: default_geolocation_cache_secs(),
        }
    }
}

fn default_geolocation_mode() -> GeolocationMode {
    GeolocationMode::Disabled
}

fn default_geolocation_cache_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for the local event log (JSONL); empty disables it
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "events.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub classes: ClassesConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub geolocation: GeolocationConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    source_uri: String,
    confidence_threshold: f32,
    frame_queue_size: usize,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_client_id: String,
    direction_threshold: f64,
    grace_frames: u32,
    direction_policy: DirectionPolicy,
    class_names: Vec<String>,
    delivery_enabled: bool,
    delivery_endpoint: String,
    delivery_timeout_ms: u64,
    delivery_max_retries: u32,
    delivery_backoff_ms: u64,
    delivery_max_backoff_ms: u64,
    delivery_queue_size: usize,
    delivery_drain_timeout_ms: u64,
    geolocation_mode: GeolocationMode,
    geolocation_latitude: Option<f64>,
    geolocation_longitude: Option<f64>,
    geolocation_url: Option<String>,
    geolocation_cache_secs: u64,
    egress_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, path.display().to_string())
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, origin: String) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("Failed to parse TOML")?;
        let config = Self::from_toml(toml_config, origin);
        config.validate()?;
        Ok(config)
    }

    fn from_toml(toml_config: TomlConfig, origin: String) -> Self {
        let egress_file = Some(toml_config.egress.file).filter(|f| !f.trim().is_empty());

        Self {
            site_id: toml_config.site.id,
            source_uri: toml_config.source.uri,
            confidence_threshold: toml_config.source.confidence_threshold,
            frame_queue_size: toml_config.source.queue_size,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_client_id: toml_config.mqtt.client_id,
            direction_threshold: toml_config.tracking.direction_threshold,
            grace_frames: toml_config.tracking.grace_frames,
            direction_policy: toml_config.tracking.direction_policy,
            class_names: toml_config.classes.names,
            delivery_enabled: toml_config.delivery.enabled,
            delivery_endpoint: toml_config.delivery.endpoint,
            delivery_timeout_ms: toml_config.delivery.timeout_ms,
            delivery_max_retries: toml_config.delivery.max_retries,
            delivery_backoff_ms: toml_config.delivery.backoff_ms,
            delivery_max_backoff_ms: toml_config.delivery.max_backoff_ms,
            delivery_queue_size: toml_config.delivery.queue_size,
            delivery_drain_timeout_ms: toml_config.delivery.drain_timeout_ms,
            geolocation_mode: toml_config.geolocation.mode,
            geolocation_latitude: toml_config.geolocation.latitude,
            geolocation_longitude: toml_config.geolocation.longitude,
            geolocation_url: toml_config.geolocation.url,
            geolocation_cache_secs: toml_config.geolocation.cache_secs,
            egress_file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: origin,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.direction_threshold.is_finite() || self.direction_threshold < 0.0 {
            bail!("tracking.direction_threshold must be a non-negative number");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!("source.confidence_threshold must be within [0, 1]");
        }
        if self.frame_queue_size == 0 || self.delivery_queue_size == 0 {
            bail!("queue sizes must be greater than zero");
        }
        match self.geolocation_mode {
            GeolocationMode::Fixed => {
                if self.geolocation_latitude.is_none() || self.geolocation_longitude.is_none() {
                    bail!("geolocation.mode = \"fixed\" requires latitude and longitude");
                }
            }
            GeolocationMode::Http => {
                if self.geolocation_url.is_none() {
                    bail!("geolocation.mode = \"http\" requires url");
                }
            }
            GeolocationMode::Disabled => {}
        }
        Ok(())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Override the frame source (e.g. from the command line)
    pub fn with_source(mut self, uri: &str) -> Self {
        self.source_uri = uri.to_string();
        self
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn frame_queue_size(&self) -> usize {
        self.frame_queue_size
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn direction_threshold(&self) -> f64 {
        self.direction_threshold
    }

    pub fn grace_frames(&self) -> u32 {
        self.grace_frames
    }

    pub fn direction_policy(&self) -> DirectionPolicy {
        self.direction_policy
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn delivery_enabled(&self) -> bool {
        self.delivery_enabled
    }

    pub fn delivery_endpoint(&self) -> &str {
        &self.delivery_endpoint
    }

    pub fn delivery_timeout_ms(&self) -> u64 {
        self.delivery_timeout_ms
    }

    pub fn delivery_max_retries(&self) -> u32 {
        self.delivery_max_retries
    }

    pub fn delivery_backoff_ms(&self) -> u64 {
        self.delivery_backoff_ms
    }

    pub fn delivery_max_backoff_ms(&self) -> u64 {
        self.delivery_max_backoff_ms
    }

    pub fn delivery_queue_size(&self) -> usize {
        self.delivery_queue_size
    }

    pub fn delivery_drain_timeout_ms(&self) -> u64 {
        self.delivery_drain_timeout_ms
    }

    pub fn geolocation_mode(&self) -> GeolocationMode {
        self.geolocation_mode
    }

    pub fn geolocation_latitude(&self) -> Option<f64> {
        self.geolocation_latitude
    }

    pub fn geolocation_longitude(&self) -> Option<f64> {
        self.geolocation_longitude
    }

    pub fn geolocation_url(&self) -> Option<&str> {
        self.geolocation_url.as_deref()
    }

    pub fn geolocation_cache_secs(&self) -> u64 {
        self.geolocation_cache_secs
    }

    pub fn egress_file(&self) -> Option<&str> {
        self.egress_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set tracking parameters
    #[cfg(test)]
    pub fn with_tracking(mut self, threshold: f64, grace_frames: u32, policy: DirectionPolicy) -> Self {
        self.direction_threshold = threshold;
        self.grace_frames = grace_frames;
        self.direction_policy = policy;
        self
    }

    /// Builder method for tests to disable the event log
    #[cfg(test)]
    pub fn without_egress(mut self) -> Self {
        self.egress_file = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "traffic");
        assert_eq!(config.source_uri(), "stdin");
        assert_eq!(config.confidence_threshold(), 0.5);
        assert_eq!(config.direction_threshold(), 5.0);
        assert_eq!(config.grace_frames(), 10);
        assert_eq!(config.direction_policy(), DirectionPolicy::SingleShot);
        assert_eq!(config.delivery_endpoint(), "http://localhost:5000/api/data");
        assert_eq!(config.geolocation_mode(), GeolocationMode::Disabled);
        assert_eq!(config.egress_file(), Some("events.jsonl"));
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
[tracking]
grace_frames = 3
direction_policy = "majority_vote"
"#,
            "inline".to_string(),
        )
        .unwrap();
        assert_eq!(config.grace_frames(), 3);
        assert_eq!(config.direction_policy(), DirectionPolicy::MajorityVote);
        assert_eq!(config.direction_threshold(), 5.0);
        assert_eq!(config.delivery_max_retries(), 3);
    }

    #[test]
    fn test_empty_egress_file_disables_log() {
        let config =
            Config::from_toml_str("[egress]\nfile = \"\"\n", "inline".to_string()).unwrap();
        assert_eq!(config.egress_file(), None);
    }

    #[test]
    fn test_rejects_negative_direction_threshold() {
        let result =
            Config::from_toml_str("[tracking]\ndirection_threshold = -1.0\n", "inline".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let result =
            Config::from_toml_str("[source]\nconfidence_threshold = 1.5\n", "inline".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_fixed_geolocation_without_coordinates() {
        let result = Config::from_toml_str(
            "[geolocation]\nmode = \"fixed\"\nlatitude = 53.3\n",
            "inline".to_string(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let result = Config::from_toml_str(
            "[tracking]\ndirection_policy = \"average\"\n",
            "inline".to_string(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_with_source_override() {
        let config = Config::default().with_source("mqtt://broker:1883/detections");
        assert_eq!(config.source_uri(), "mqtt://broker:1883/detections");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "traffic-analyser".to_string(),
            "--config".to_string(),
            "config/street.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/street.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["traffic-analyser".to_string(), "--config=config/junction.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/junction.toml");
    }
}
