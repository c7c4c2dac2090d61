//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::PinId;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Http,
    Mqtt,
    File,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Log => "log",
            SinkKind::Http => "http",
            SinkKind::Mqtt => "mqtt",
            SinkKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "desk-1")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "backbeacon".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinsConfig {
    #[serde(default = "default_trigger_pin")]
    pub trigger: u32,
    #[serde(default = "default_echo_pin")]
    pub echo: u32,
    #[serde(default = "default_buzzer_pins")]
    pub buzzers: Vec<u32>,
    /// sysfs GPIO root
    #[serde(default = "default_gpio_root")]
    pub gpio_root: String,
}

impl Default for PinsConfig {
    fn default() -> Self {
        Self {
            trigger: default_trigger_pin(),
            echo: default_echo_pin(),
            buzzers: default_buzzer_pins(),
            gpio_root: default_gpio_root(),
        }
    }
}

fn default_trigger_pin() -> u32 {
    17
}

fn default_echo_pin() -> u32 {
    27
}

fn default_buzzer_pins() -> Vec<u32> {
    vec![22]
}

fn default_gpio_root() -> String {
    "/sys/class/gpio".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Bound on each echo edge wait
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
    #[serde(default = "default_trigger_pulse_us")]
    pub trigger_pulse_us: u64,
    /// Idle time with trigger low before each pulse (0 to skip)
    #[serde(default)]
    pub settle_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            echo_timeout_ms: default_echo_timeout_ms(),
            trigger_pulse_us: default_trigger_pulse_us(),
            settle_ms: 0,
        }
    }
}

fn default_echo_timeout_ms() -> u64 {
    30
}

fn default_trigger_pulse_us() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostureConfig {
    #[serde(default = "default_slouch_threshold_cm")]
    pub slouch_threshold_cm: f64,
    #[serde(default = "default_alert_duration_ms")]
    pub alert_duration_ms: u64,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            slouch_threshold_cm: default_slouch_threshold_cm(),
            alert_duration_ms: default_alert_duration_ms(),
        }
    }
}

fn default_slouch_threshold_cm() -> f64 {
    5.0
}

fn default_alert_duration_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { poll_interval_ms: default_poll_interval_ms() }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_serial_device")]
    pub device: String,
    #[serde(default = "default_serial_baud")]
    pub baud: u32,
    #[serde(default = "default_seated_token")]
    pub seated_token: String,
    #[serde(default = "default_empty_token")]
    pub empty_token: String,
    #[serde(default = "default_vibrate_token")]
    pub vibrate_token: String,
    #[serde(default = "default_stop_token")]
    pub stop_token: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud: default_serial_baud(),
            seated_token: default_seated_token(),
            empty_token: default_empty_token(),
            vibrate_token: default_vibrate_token(),
            stop_token: default_stop_token(),
        }
    }
}

fn default_serial_device() -> String {
    "/dev/ttyS0".to_string()
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_seated_token() -> String {
    "SEATED".to_string()
}

fn default_empty_token() -> String {
    "EMPTY".to_string()
}

fn default_vibrate_token() -> String {
    "SLOUCH_ALERT".to_string()
}

fn default_stop_token() -> String {
    "VIB_OFF".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default = "default_http_method")]
    pub http_method: HttpMethod,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_mqtt_topic")]
    pub mqtt_topic: String,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    /// File path for event egress (JSONL format)
    #[serde(default = "default_sink_file")]
    pub file: String,
    #[serde(default = "default_sink_queue_size")]
    pub queue_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            http_url: None,
            http_method: default_http_method(),
            timeout_ms: default_sink_timeout_ms(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_topic: default_mqtt_topic(),
            mqtt_username: None,
            mqtt_password: None,
            file: default_sink_file(),
            queue_size: default_sink_queue_size(),
        }
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Log
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_sink_timeout_ms() -> u64 {
    2000
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "backbeacon/state".to_string()
}

fn default_sink_file() -> String {
    "events.jsonl".to_string()
}

fn default_sink_queue_size() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub pins: PinsConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub posture: PostureConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    trigger_pin: PinId,
    echo_pin: PinId,
    buzzer_pins: Vec<PinId>,
    gpio_root: String,
    echo_timeout_ms: u64,
    trigger_pulse_us: u64,
    settle_ms: u64,
    slouch_threshold_cm: f64,
    alert_duration_ms: u64,
    poll_interval_ms: u64,
    serial_device: String,
    serial_baud: u32,
    seated_token: String,
    empty_token: String,
    vibrate_token: String,
    stop_token: String,
    sink_kind: SinkKind,
    sink_http_url: Option<String>,
    sink_http_method: HttpMethod,
    sink_timeout_ms: u64,
    sink_mqtt_host: String,
    sink_mqtt_port: u16,
    sink_mqtt_topic: String,
    sink_mqtt_username: Option<String>,
    sink_mqtt_password: Option<String>,
    sink_file: String,
    sink_queue_size: usize,
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
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            trigger_pin: PinId(toml_config.pins.trigger),
            echo_pin: PinId(toml_config.pins.echo),
            buzzer_pins: toml_config.pins.buzzers.into_iter().map(PinId).collect(),
            gpio_root: toml_config.pins.gpio_root,
            echo_timeout_ms: toml_config.sensor.echo_timeout_ms,
            trigger_pulse_us: toml_config.sensor.trigger_pulse_us,
            settle_ms: toml_config.sensor.settle_ms,
            slouch_threshold_cm: toml_config.posture.slouch_threshold_cm,
            alert_duration_ms: toml_config.posture.alert_duration_ms,
            poll_interval_ms: toml_config.control.poll_interval_ms,
            serial_device: toml_config.serial.device,
            serial_baud: toml_config.serial.baud,
            seated_token: toml_config.serial.seated_token,
            empty_token: toml_config.serial.empty_token,
            vibrate_token: toml_config.serial.vibrate_token,
            stop_token: toml_config.serial.stop_token,
            sink_kind: toml_config.sink.kind,
            sink_http_url: toml_config.sink.http_url,
            sink_http_method: toml_config.sink.http_method,
            sink_timeout_ms: toml_config.sink.timeout_ms,
            sink_mqtt_host: toml_config.sink.mqtt_host,
            sink_mqtt_port: toml_config.sink.mqtt_port,
            sink_mqtt_topic: toml_config.sink.mqtt_topic,
            sink_mqtt_username: toml_config.sink.mqtt_username,
            sink_mqtt_password: toml_config.sink.mqtt_password,
            sink_file: toml_config.sink.file,
            sink_queue_size: toml_config.sink.queue_size,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path: explicit `--config`, then `CONFIG_FILE`, then the dev config
    pub fn resolve_config_path(cli: Option<String>) -> String {
        if let Some(path) = cli {
            return path;
        }

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

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Reject settings the control loop cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.slouch_threshold_cm.is_finite() || self.slouch_threshold_cm < 0.0 {
            bail!("posture.slouch_threshold_cm must be a finite value >= 0");
        }
        if self.alert_duration_ms == 0 {
            bail!("posture.alert_duration_ms must be > 0");
        }
        if self.poll_interval_ms == 0 {
            bail!("control.poll_interval_ms must be > 0");
        }
        if self.echo_timeout_ms == 0 {
            bail!("sensor.echo_timeout_ms must be > 0");
        }
        if self.buzzer_pins.is_empty() {
            bail!("pins.buzzers must name at least one pin");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics.interval_secs must be > 0");
        }
        if self.sink_queue_size == 0 {
            bail!("sink.queue_size must be > 0");
        }
        if self.sink_kind == SinkKind::Http && self.sink_http_url.is_none() {
            bail!("sink.http_url is required when sink.kind = \"http\"");
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn trigger_pin(&self) -> PinId {
        self.trigger_pin
    }

    pub fn echo_pin(&self) -> PinId {
        self.echo_pin
    }

    pub fn buzzer_pins(&self) -> &[PinId] {
        &self.buzzer_pins
    }

    pub fn gpio_root(&self) -> &str {
        &self.gpio_root
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn trigger_pulse(&self) -> Duration {
        Duration::from_micros(self.trigger_pulse_us)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn slouch_threshold_cm(&self) -> f64 {
        self.slouch_threshold_cm
    }

    pub fn alert_duration(&self) -> Duration {
        Duration::from_millis(self.alert_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn seated_token(&self) -> &str {
        &self.seated_token
    }

    pub fn empty_token(&self) -> &str {
        &self.empty_token
    }

    pub fn vibrate_token(&self) -> &str {
        &self.vibrate_token
    }

    pub fn stop_token(&self) -> &str {
        &self.stop_token
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.sink_kind
    }

    pub fn sink_http_url(&self) -> Option<&str> {
        self.sink_http_url.as_deref()
    }

    pub fn sink_http_method(&self) -> HttpMethod {
        self.sink_http_method
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn sink_mqtt_host(&self) -> &str {
        &self.sink_mqtt_host
    }

    pub fn sink_mqtt_port(&self) -> u16 {
        self.sink_mqtt_port
    }

    pub fn sink_mqtt_topic(&self) -> &str {
        &self.sink_mqtt_topic
    }

    pub fn sink_mqtt_username(&self) -> Option<&str> {
        self.sink_mqtt_username.as_deref()
    }

    pub fn sink_mqtt_password(&self) -> Option<&str> {
        self.sink_mqtt_password.as_deref()
    }

    pub fn sink_file(&self) -> &str {
        &self.sink_file
    }

    pub fn sink_queue_size(&self) -> usize {
        self.sink_queue_size
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

    /// Builder method for tests to set the slouch threshold
    pub fn with_slouch_threshold_cm(mut self, cm: f64) -> Self {
        self.slouch_threshold_cm = cm;
        self
    }

    /// Builder method for tests to set the alert duration
    pub fn with_alert_duration_ms(mut self, ms: u64) -> Self {
        self.alert_duration_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "backbeacon");
        assert_eq!(config.trigger_pin(), PinId(17));
        assert_eq!(config.echo_pin(), PinId(27));
        assert_eq!(config.buzzer_pins(), &[PinId(22)]);
        assert_eq!(config.echo_timeout(), Duration::from_millis(30));
        assert_eq!(config.trigger_pulse(), Duration::from_micros(10));
        assert_eq!(config.slouch_threshold_cm(), 5.0);
        assert_eq!(config.alert_duration(), Duration::from_secs(3));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.vibrate_token(), "SLOUCH_ALERT");
        assert_eq!(config.stop_token(), "VIB_OFF");
        assert_eq!(config.sink_kind(), SinkKind::Log);
        assert_eq!(config.prometheus_port(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_config_path_default() {
        // CONFIG_FILE may be set in the environment running the tests
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let path = Config::resolve_config_path(Some("config/desk.toml".to_string()));
        assert_eq!(path, "config/desk.toml");
    }

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let config = Config::default().with_slouch_threshold_cm(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_alert_duration() {
        let config = Config::default().with_alert_duration_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_metrics_interval() {
        let mut toml_config = TomlConfig::default();
        toml_config.metrics.interval_secs = 0;
        let config = Config::from_toml(toml_config, "test".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_http_url() {
        let mut toml_config = TomlConfig::default();
        toml_config.sink.kind = SinkKind::Http;
        let config = Config::from_toml(toml_config, "test".to_string());
        assert!(config.validate().is_err());
    }
}
