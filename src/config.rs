//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{NodeError, Result};

/// Default port for the HTTP push endpoint
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default port for the MQTT broker
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub manipulator: ManipulatorConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub gripper: GripperConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where frames come from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CameraSourceKind {
    /// `libcamera-vid` child process producing MJPEG
    Libcamera,
    /// A single JPEG file served repeatedly (bench testing)
    Still,
}

/// Camera configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_camera_source")]
    pub source: CameraSourceKind,

    #[serde(default = "default_camera_command")]
    pub command: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    #[serde(default)]
    pub still_path: String,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Delivery path of the capture producer
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Always push batches over HTTP
    Network,
    /// Always write to the spool directory
    Spool,
    /// Push while the network is up, spool while it is down
    Auto,
}

/// JSON body form of pushed observations
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    /// Array of `{ time_stamp, image }`
    Basic,
    /// Single `{ time_stamp, homed, positions, gripper, image }` object
    Extended,
}

/// Capture producer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default)]
    pub enabled_at_start: bool,

    #[serde(default = "default_target_fps")]
    pub target_fps: f64,

    #[serde(default = "default_capture_report_interval_s")]
    pub report_interval_s: u64,

    #[serde(default = "default_delivery")]
    pub delivery: DeliveryMode,

    #[serde(default = "default_envelope")]
    pub envelope: Envelope,

    #[serde(default = "default_scratch_capacity")]
    pub scratch_capacity: usize,
}

/// Authorization header scheme
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Bearer => "Bearer",
        }
    }
}

/// HTTP push configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    #[serde(default = "default_push_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: AuthScheme,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_camera_path")]
    pub camera_path: String,

    #[serde(default = "default_gripper_path")]
    pub gripper_path: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Spool directory configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SpoolConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_spool_dir")]
    pub dir: String,

    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

/// Where robot state comes from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySourceKind {
    /// Request/reply over the serial command bus bridge
    Bus,
    /// Gripper angle only, read from the local servo
    Local,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_source")]
    pub source: TelemetrySourceKind,

    #[serde(default = "default_bus_port")]
    pub port: String,

    #[serde(default = "default_bus_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_joint_count")]
    pub joint_count: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

/// Gripper servo configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ManipulatorConfig {
    #[serde(default = "default_pwm_path")]
    pub pwm_path: String,

    #[serde(default = "default_period_ns")]
    pub period_ns: u64,

    #[serde(default = "default_min_pulse_us")]
    pub min_pulse_us: u64,

    #[serde(default = "default_max_pulse_us")]
    pub max_pulse_us: u64,

    #[serde(default)]
    pub initial_angle: f32,
}

/// MQTT command channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_enabled")]
    pub enabled: bool,

    #[serde(default = "default_mqtt_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Payload layout of each stream part
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamPayload {
    /// JPEG bytes as captured
    Raw,
    /// 24-byte binary header followed by the JPEG
    ChunkHeader,
    /// JPEG with a synthetic EXIF segment spliced in
    Exif,
}

/// Streaming responder configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_stream_bind")]
    pub bind: String,

    #[serde(default = "default_stream_payload")]
    pub payload: StreamPayload,

    #[serde(default = "default_target_fps")]
    pub target_fps: f64,

    #[serde(default = "default_stream_report_interval_s")]
    pub report_interval_s: u64,
}

/// Gripper state producer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GripperConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_gripper_fps")]
    pub target_fps: f64,

    #[serde(default = "default_gripper_report_interval_s")]
    pub report_interval_s: u64,
}

/// Status indicator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default)]
    pub led_path: String,

    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_dir: String,
}

// Default value functions
fn default_camera_source() -> CameraSourceKind { CameraSourceKind::Libcamera }
fn default_camera_command() -> String { "libcamera-vid".to_string() }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_camera_fps() -> u32 { 30 }
fn default_acquire_timeout_ms() -> u64 { 1000 }
fn default_max_frame_bytes() -> usize { 1024 * 1024 }

fn default_target_fps() -> f64 { 30.0 }
fn default_capture_report_interval_s() -> u64 { 1 }
fn default_delivery() -> DeliveryMode { DeliveryMode::Network }
fn default_envelope() -> Envelope { Envelope::Basic }
fn default_scratch_capacity() -> usize { 128 * 1024 }

fn default_push_endpoint() -> String { "localhost:8080".to_string() }
fn default_auth_scheme() -> AuthScheme { AuthScheme::Basic }
fn default_camera_path() -> String { "/camera".to_string() }
fn default_gripper_path() -> String { "/gripper".to_string() }
fn default_batch_size() -> usize { 1 }

fn default_spool_dir() -> String { "/sdcard".to_string() }
fn default_max_file_bytes() -> u64 { 128 * 1024 }
fn default_idle_ms() -> u64 { 500 }

fn default_telemetry_source() -> TelemetrySourceKind { TelemetrySourceKind::Local }
fn default_bus_port() -> String { "/dev/ttyACM0".to_string() }
fn default_bus_baud_rate() -> u32 { 115200 }
fn default_joint_count() -> usize { 6 }
fn default_max_attempts() -> u32 { 20 }
fn default_attempt_timeout_ms() -> u64 { 50 }

fn default_pwm_path() -> String { "/sys/class/pwm/pwmchip0/pwm0".to_string() }
fn default_period_ns() -> u64 { 20_000_000 }
fn default_min_pulse_us() -> u64 { 500 }
fn default_max_pulse_us() -> u64 { 2400 }

fn default_mqtt_enabled() -> bool { true }
fn default_mqtt_endpoint() -> String { "localhost:1883".to_string() }
fn default_client_id() -> String { "armcam-node".to_string() }
fn default_buffer_size() -> usize { 2560 }
fn default_connect_attempts() -> u32 { 10 }
fn default_backoff_initial_ms() -> u64 { 100 }
fn default_backoff_max_ms() -> u64 { 5000 }

fn default_stream_bind() -> String { "0.0.0.0:80".to_string() }
fn default_stream_payload() -> StreamPayload { StreamPayload::ChunkHeader }
fn default_stream_report_interval_s() -> u64 { 2 }

fn default_gripper_fps() -> f64 { 10.0 }
fn default_gripper_report_interval_s() -> u64 { 5 }

fn default_pulse_ms() -> u64 { 500 }

fn default_log_level() -> String { "info".to_string() }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_camera_source(),
            command: default_camera_command(),
            width: default_width(),
            height: default_height(),
            fps: default_camera_fps(),
            still_path: String::new(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled_at_start: false,
            target_fps: default_target_fps(),
            report_interval_s: default_capture_report_interval_s(),
            delivery: default_delivery(),
            envelope: default_envelope(),
            scratch_capacity: default_scratch_capacity(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: default_push_endpoint(),
            auth_scheme: default_auth_scheme(),
            token: String::new(),
            camera_path: default_camera_path(),
            gripper_path: default_gripper_path(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_spool_dir(),
            max_file_bytes: default_max_file_bytes(),
            idle_ms: default_idle_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: default_telemetry_source(),
            port: default_bus_port(),
            baud_rate: default_bus_baud_rate(),
            joint_count: default_joint_count(),
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl Default for ManipulatorConfig {
    fn default() -> Self {
        Self {
            pwm_path: default_pwm_path(),
            period_ns: default_period_ns(),
            min_pulse_us: default_min_pulse_us(),
            max_pulse_us: default_max_pulse_us(),
            initial_angle: 0.0,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_enabled(),
            endpoint: default_mqtt_endpoint(),
            client_id: default_client_id(),
            buffer_size: default_buffer_size(),
            connect_attempts: default_connect_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_stream_bind(),
            payload: default_stream_payload(),
            target_fps: default_target_fps(),
            report_interval_s: default_stream_report_interval_s(),
        }
    }
}

impl Default for GripperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_fps: default_gripper_fps(),
            report_interval_s: default_gripper_report_interval_s(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            led_path: String::new(),
            pulse_ms: default_pulse_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

/// A network endpoint parsed from a `"host:port"` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `"host:port"` or `"host"`, falling back to `default_port`
    ///
    /// The split happens on the last `:` so the host part may itself
    /// contain colons.
    ///
    /// # Errors
    ///
    /// Returns error if the port part is present but not a valid `u16`
    ///
    /// # Examples
    ///
    /// ```
    /// use armcam_node::config::Endpoint;
    ///
    /// let ep = Endpoint::parse("broker.local", 1883)?;
    /// assert_eq!(ep.port, 1883);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn parse(text: &str, default_port: u16) -> Result<Self> {
        match text.rfind(':') {
            Some(pos) => {
                let port = text[pos + 1..].parse::<u16>().map_err(|_| {
                    config_error(format!("invalid port in endpoint '{}'", text))
                })?;
                Ok(Self {
                    host: text[..pos].to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: text.to_string(),
                port: default_port,
            }),
        }
    }

    /// Base URL for HTTP requests against this endpoint
    pub fn http_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn config_error(msg: impl std::fmt::Display) -> NodeError {
    NodeError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use armcam_node::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Push endpoint with the HTTP default port applied
    pub fn push_endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.push.endpoint, DEFAULT_HTTP_PORT)
    }

    /// Broker endpoint with the MQTT default port applied
    pub fn mqtt_endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.mqtt.endpoint, DEFAULT_MQTT_PORT)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        for (name, fps) in [
            ("capture.target_fps", self.capture.target_fps),
            ("stream.target_fps", self.stream.target_fps),
            ("gripper.target_fps", self.gripper.target_fps),
        ] {
            if !(fps > 0.0 && fps <= 120.0) {
                return Err(config_error(format!("{} must be in (0, 120]", name)));
            }
        }

        if self.camera.fps == 0 || self.camera.width == 0 || self.camera.height == 0 {
            return Err(config_error("camera fps, width and height must be greater than 0"));
        }

        if self.camera.source == CameraSourceKind::Still && self.camera.still_path.is_empty() {
            return Err(config_error("camera.still_path cannot be empty for the still source"));
        }

        if self.camera.acquire_timeout_ms == 0 || self.camera.acquire_timeout_ms > 60000 {
            return Err(config_error("acquire_timeout_ms must be between 1 and 60000"));
        }

        if self.camera.max_frame_bytes == 0 {
            return Err(config_error("max_frame_bytes must be greater than 0"));
        }

        // Report windows
        if !(1..=5).contains(&self.capture.report_interval_s) {
            return Err(config_error("capture.report_interval_s must be between 1 and 5"));
        }

        if !(1..=5).contains(&self.stream.report_interval_s) {
            return Err(config_error("stream.report_interval_s must be between 1 and 5"));
        }

        if !(1..=60).contains(&self.gripper.report_interval_s) {
            return Err(config_error("gripper.report_interval_s must be between 1 and 60"));
        }

        if self.capture.scratch_capacity == 0 {
            return Err(config_error("scratch_capacity must be greater than 0"));
        }

        if self.push.batch_size == 0 {
            return Err(config_error("batch_size must be greater than 0"));
        }

        if self.capture.envelope == Envelope::Extended && self.push.batch_size != 1 {
            return Err(config_error("the extended envelope is a single-object body; batch_size must be 1"));
        }

        let spool_needed = self.spool.enabled || self.capture.delivery != DeliveryMode::Network;
        if spool_needed && self.spool.dir.is_empty() {
            return Err(config_error("spool dir cannot be empty when spooling is used"));
        }

        if self.spool.idle_ms == 0 || self.spool.idle_ms > 60000 {
            return Err(config_error("spool idle_ms must be between 1 and 60000"));
        }

        if self.spool.max_file_bytes == 0 {
            return Err(config_error("spool max_file_bytes must be greater than 0"));
        }

        // Telemetry bus
        if self.telemetry.max_attempts == 0 {
            return Err(config_error("telemetry max_attempts must be greater than 0"));
        }

        if self.telemetry.attempt_timeout_ms == 0 || self.telemetry.attempt_timeout_ms > 10000 {
            return Err(config_error("attempt_timeout_ms must be between 1 and 10000"));
        }

        if self.telemetry.source == TelemetrySourceKind::Bus && self.telemetry.port.is_empty() {
            return Err(config_error("telemetry port cannot be empty for the bus source"));
        }

        // Servo
        if self.manipulator.min_pulse_us >= self.manipulator.max_pulse_us {
            return Err(config_error("min_pulse_us must be less than max_pulse_us"));
        }

        if self.manipulator.max_pulse_us * 1000 > self.manipulator.period_ns {
            return Err(config_error("max_pulse_us must fit within period_ns"));
        }

        if !(0.0..=180.0).contains(&self.manipulator.initial_angle) {
            return Err(config_error("initial_angle must be between 0 and 180"));
        }

        // MQTT
        if self.mqtt.buffer_size == 0 {
            return Err(config_error("mqtt buffer_size must be greater than 0"));
        }

        if self.mqtt.connect_attempts == 0 {
            return Err(config_error("mqtt connect_attempts must be greater than 0"));
        }

        if self.mqtt.backoff_initial_ms == 0 || self.mqtt.backoff_initial_ms > self.mqtt.backoff_max_ms {
            return Err(config_error("backoff_initial_ms must be between 1 and backoff_max_ms"));
        }

        if self.status.pulse_ms > 10000 {
            return Err(config_error("status pulse_ms must be at most 10000"));
        }

        self.push_endpoint()?;
        self.mqtt_endpoint()?;

        Ok(())
    }
}
