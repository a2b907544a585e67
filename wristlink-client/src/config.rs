//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WRISTLINK_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use wristlink_core::DispatcherConfig;
use wristlink_protocol::{TransportMode, DEFAULT_EMULATOR_PORT};

/// Default serial line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which device to talk to.
    pub device: DeviceConfig,
    /// Connect and reconnect behavior.
    pub connection: ConnectionConfig,
    /// Per-connection protocol features.
    pub features: FeaturesConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WRISTLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.device.apply_env_overrides();
        self.connection.apply_env_overrides();
        self.features.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()
    }
}

/// How the device address is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// A socket address means the emulator, anything else a serial device.
    #[default]
    Auto,
    Serial,
    Emulator,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `host:port` of an emulator, or a serial device path such as `/dev/rfcomm0`.
    pub address: String,
    pub transport: TransportKind,
    /// Line speed for serial devices. RFCOMM ignores it.
    pub baud_rate: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_EMULATOR_PORT),
            transport: TransportKind::Auto,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl DeviceConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("WRISTLINK_ADDRESS") {
            self.address = address;
        }

        if let Ok(transport) = std::env::var("WRISTLINK_TRANSPORT") {
            self.transport = match transport.to_lowercase().as_str() {
                "serial" => TransportKind::Serial,
                "emulator" | "tcp" => TransportKind::Emulator,
                _ => TransportKind::Auto,
            };
        }

        if let Ok(rate) = std::env::var("WRISTLINK_BAUD_RATE") {
            if let Ok(n) = rate.parse() {
                self.baud_rate = n;
            }
        }
    }

    /// The address parsed as a socket address, if it is one.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.parse().ok()
    }

    /// Resolves the framing used on the wire.
    pub fn transport_mode(&self) -> TransportMode {
        match self.transport {
            TransportKind::Serial => TransportMode::Serial,
            TransportKind::Emulator => TransportMode::Emulator,
            TransportKind::Auto if self.socket_addr().is_some() => TransportMode::Emulator,
            TransportKind::Auto => TransportMode::Serial,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "device address is empty".to_string(),
            ));
        }
        if self.transport == TransportKind::Emulator && self.socket_addr().is_none() {
            return Err(ConfigError::Validation(format!(
                "emulator transport needs a host:port address, got '{}'",
                self.address
            )));
        }
        Ok(())
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read buffer size for transport reads.
    pub read_buffer_size: usize,
    /// Reconnect attempts before the device is declared disconnected.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect; doubled on every further attempt.
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// How long an install waits for the device to answer an upload request.
    pub token_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reconnect_attempts: 10,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 64_000,
            token_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("WRISTLINK_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }

        if let Ok(size) = std::env::var("WRISTLINK_READ_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }

        if let Ok(attempts) = std::env::var("WRISTLINK_RECONNECT_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.reconnect_attempts = n;
            }
        }

        if let Ok(timeout) = std::env::var("WRISTLINK_TOKEN_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.token_timeout_secs = secs;
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }

    /// Read buffer size clamped to the supported range.
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
            .clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.reconnect_attempts,
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }
}

/// Bounded exponential reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Protocol feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub sync_time_on_connect: bool,
    pub enable_app_logs: bool,
    pub report_datalog_sessions: bool,
    pub ack_unhandled_app_messages: bool,
    /// IANA zone name sent with the modern time message.
    pub timezone: Option<String>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            sync_time_on_connect: true,
            enable_app_logs: false,
            report_datalog_sessions: true,
            ack_unhandled_app_messages: false,
            timezone: None,
        }
    }
}

impl FeaturesConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_flag("WRISTLINK_SYNC_TIME") {
            self.sync_time_on_connect = v;
        }
        if let Some(v) = env_flag("WRISTLINK_APP_LOGS") {
            self.enable_app_logs = v;
        }
        if let Some(v) = env_flag("WRISTLINK_REPORT_DATALOG") {
            self.report_datalog_sessions = v;
        }
        if let Some(v) = env_flag("WRISTLINK_ACK_UNHANDLED") {
            self.ack_unhandled_app_messages = v;
        }
        if let Ok(tz) = std::env::var("WRISTLINK_TIMEZONE") {
            self.timezone = Some(tz);
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            sync_time_on_connect: self.sync_time_on_connect,
            enable_app_logs: self.enable_app_logs,
            report_datalog_sessions: self.report_datalog_sessions,
            ack_unhandled_app_messages: self.ack_unhandled_app_messages,
            timezone: self.timezone.clone(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
