//! # Configuration Module
//!
//! Loads the TOML configuration once at startup.  Every field has a default,
//! so an empty file (or no file at all) yields the 8-channel MSM setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::eeg_client::EegClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{
    FrameLayout, BATTERY_OFFSET, BYTES_PER_SAMPLE, CONTROL_CHARACTERISTIC, DEFAULT_DEVICE_NAME,
    EEG_CHANNEL_NAMES, FRAME_LEN, HEADER_LEN, NOTIFY_CHARACTERISTIC, SAMPLES_PER_FRAME,
    SCALE_DIVISOR, TRIGGER_LEN,
};
use crate::recorder::RecorderSettings;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Scanning, connection and reconnection
#[derive(Debug, Deserialize, Clone)]
pub struct BluetoothConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_notify_characteristic")]
    pub notify_characteristic: String,

    #[serde(default = "default_control_characteristic")]
    pub control_characteristic: String,
}

/// Channel montage, in frame order
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_names")]
    pub channel_names: Vec<String>,
}

/// Device frame layout
#[derive(Debug, Deserialize, Clone)]
pub struct FrameConfig {
    #[serde(default = "default_frame_len")]
    pub frame_len: usize,

    #[serde(default = "default_header_len")]
    pub header_len: usize,

    #[serde(default = "default_samples_per_frame")]
    pub samples_per_frame: usize,

    #[serde(default = "default_bytes_per_sample")]
    pub bytes_per_sample: usize,

    #[serde(default = "default_trigger_len")]
    pub trigger_len: usize,

    #[serde(default = "default_battery_offset")]
    pub battery_offset: usize,
}

/// Battery telemetry
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_battery_interval")]
    pub battery_interval: u64,

    #[serde(default = "default_telemetry_queue_capacity")]
    pub queue_capacity: usize,
}

/// Live display subscriber
#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_display_queue_capacity")]
    pub display_queue_capacity: usize,
}

/// CSV recording
#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_scale_divisor")]
    pub scale_divisor: f64,
}

// Default value functions
fn default_device_name() -> String { DEFAULT_DEVICE_NAME.to_string() }
fn default_max_retries() -> u32 { 3 }
fn default_retry_interval_ms() -> u64 { 1000 }
fn default_scan_duration_ms() -> u64 { 2000 }
fn default_reconnect_backoff_ms() -> u64 { 1000 }
fn default_connect_timeout_ms() -> u64 { 10000 }
fn default_notify_characteristic() -> String { NOTIFY_CHARACTERISTIC.to_string() }
fn default_control_characteristic() -> String { CONTROL_CHARACTERISTIC.to_string() }

fn default_channel_names() -> Vec<String> {
    EEG_CHANNEL_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_frame_len() -> usize { FRAME_LEN }
fn default_header_len() -> usize { HEADER_LEN }
fn default_samples_per_frame() -> usize { SAMPLES_PER_FRAME }
fn default_bytes_per_sample() -> usize { BYTES_PER_SAMPLE }
fn default_trigger_len() -> usize { TRIGGER_LEN }
fn default_battery_offset() -> usize { BATTERY_OFFSET }

fn default_battery_interval() -> u64 { 50 }
fn default_telemetry_queue_capacity() -> usize { 16 }

fn default_display_queue_capacity() -> usize { 256 }

fn default_output_dir() -> PathBuf { PathBuf::from("offlinedata") }
fn default_scale_divisor() -> f64 { SCALE_DIVISOR }

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            scan_duration_ms: default_scan_duration_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            notify_characteristic: default_notify_characteristic(),
            control_characteristic: default_control_characteristic(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { channel_names: default_channel_names() }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frame_len: default_frame_len(),
            header_len: default_header_len(),
            samples_per_frame: default_samples_per_frame(),
            bytes_per_sample: default_bytes_per_sample(),
            trigger_len: default_trigger_len(),
            battery_offset: default_battery_offset(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            battery_interval: default_battery_interval(),
            queue_capacity: default_telemetry_queue_capacity(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { display_queue_capacity: default_display_queue_capacity() }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            scale_divisor: default_scale_divisor(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ClientError {
    ClientError::Config(msg.into())
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| invalid(format!("{field} {value:?} is not a UUID: {e}")))
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, does not parse, or fails
    /// [`Config::validate`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use msm_rs::config::Config;
    ///
    /// let config = Config::load("msm.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The frame layout described by `[frame]`, with the channel count taken
    /// from `[channels]`.
    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            frame_len: self.frame.frame_len,
            header_len: self.frame.header_len,
            channel_count: self.channels.channel_names.len(),
            samples_per_frame: self.frame.samples_per_frame,
            bytes_per_sample: self.frame.bytes_per_sample,
            trigger_len: self.frame.trigger_len,
            battery_offset: self.frame.battery_offset,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bt = &self.bluetooth;
        if bt.device_name.is_empty() {
            return Err(invalid("device_name cannot be empty"));
        }
        if bt.max_retries == 0 {
            return Err(invalid("max_retries must be greater than 0"));
        }
        if bt.scan_duration_ms == 0 || bt.scan_duration_ms > 60000 {
            return Err(invalid("scan_duration_ms must be between 1 and 60000"));
        }
        if bt.retry_interval_ms > 60000 || bt.reconnect_backoff_ms > 60000 {
            return Err(invalid(
                "retry_interval_ms and reconnect_backoff_ms must be at most 60000",
            ));
        }
        if bt.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be greater than 0"));
        }
        parse_uuid("notify_characteristic", &bt.notify_characteristic)?;
        parse_uuid("control_characteristic", &bt.control_characteristic)?;

        if self.channels.channel_names.is_empty() {
            return Err(invalid("channel_names cannot be empty"));
        }
        self.layout().validate()?;

        if self.telemetry.battery_interval == 0 {
            return Err(invalid("battery_interval must be greater than 0"));
        }
        if self.telemetry.queue_capacity == 0 {
            return Err(invalid("telemetry queue_capacity must be greater than 0"));
        }
        if self.stream.display_queue_capacity == 0 {
            return Err(invalid("display_queue_capacity must be greater than 0"));
        }

        if self.recording.output_dir.as_os_str().is_empty() {
            return Err(invalid("recording output_dir cannot be empty"));
        }
        if !(self.recording.scale_divisor.is_finite() && self.recording.scale_divisor > 0.0) {
            return Err(invalid("scale_divisor must be a positive number"));
        }

        Ok(())
    }

    /// Connection-manager settings derived from this configuration.
    pub fn client_config(&self) -> Result<EegClientConfig> {
        let bt = &self.bluetooth;
        Ok(EegClientConfig {
            device_name: bt.device_name.clone(),
            max_retries: bt.max_retries,
            retry_interval: Duration::from_millis(bt.retry_interval_ms),
            scan_duration: Duration::from_millis(bt.scan_duration_ms),
            reconnect_backoff: Duration::from_millis(bt.reconnect_backoff_ms),
            connect_timeout: Duration::from_millis(bt.connect_timeout_ms),
            notify_characteristic: parse_uuid("notify_characteristic", &bt.notify_characteristic)?,
            control_characteristic: parse_uuid(
                "control_characteristic",
                &bt.control_characteristic,
            )?,
            layout: self.layout(),
            battery_interval: self.telemetry.battery_interval,
            telemetry_capacity: self.telemetry.queue_capacity,
            send_init_sequence: true,
        })
    }

    /// Recorder settings derived from this configuration.
    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            output_dir: self.recording.output_dir.clone(),
            channel_names: self.channels.channel_names.clone(),
            scale_divisor: self.recording.scale_divisor,
            device_name: self.bluetooth.device_name.clone(),
        }
    }
}
