use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub pin: PinConfig,
    pub provider: ProviderConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    /// Number of decimal digits in an issued PIN.
    pub length: usize,
    pub expiry_minutes: u32,
    /// Failed validations tolerated per session inside `attempt_window_secs`.
    pub max_failed_attempts: u32,
    pub attempt_window_secs: u64,
    pub sweep_interval_secs: u64,
    /// Draws attempted before giving up on finding a code unique among live PINs.
    pub max_generation_attempts: u32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            length: 6,
            expiry_minutes: 10,
            max_failed_attempts: 5,
            attempt_window_secs: 60,
            sweep_interval_secs: 60,
            max_generation_attempts: 8,
        }
    }
}

impl PinConfig {
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.expiry_minutes))
    }

    pub fn attempt_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.attempt_window_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `native` (preferred) or `relay` (fallback).
    pub name: String,
    /// Deadline applied to every provider call.
    pub call_timeout_ms: u64,
    pub native: NativeConfig,
    pub relay: RelayConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "native".to_string(),
            call_timeout_ms: 10_000,
            native: NativeConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Quic,
    WebRtc,
    Tcp,
}

impl TransportProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            TransportProtocol::Quic => "quic",
            TransportProtocol::WebRtc => "webrtc",
            TransportProtocol::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    PrimaryMonitor,
    AllMonitors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    pub target_frame_rate: u32,
    pub transport: TransportProtocol,
    pub hardware_acceleration: bool,
    pub capture_mode: CaptureMode,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            target_frame_rate: 60,
            transport: TransportProtocol::Quic,
            hardware_acceleration: true,
            capture_mode: CaptureMode::PrimaryMonitor,
        }
    }
}

impl NativeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_frame_rate == 0 || self.target_frame_rate > 120 {
            return Err(ConfigError::ValidationError(
                "provider.native.target_frame_rate must be between 1 and 120".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_url: String,
    pub api_key: String,
    pub connection_timeout_ms: u64,
    pub enable_logging: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost:5000".to_string(),
            api_key: String::new(),
            connection_timeout_ms: 30_000,
            enable_logging: true,
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("enable_logging", &self.enable_logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit file; no file sink when unset.
    pub file: Option<PathBuf>,
    pub emit_timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            file: None,
            emit_timeout_ms: 2_000,
        }
    }
}

impl AuditConfig {
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl BrokerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `ZRC_*` and `RUST_LOG` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("ZRC_PROVIDER") {
            self.provider.name = name;
        }
        if let Some(length) = lookup("ZRC_PIN_LENGTH").and_then(|v| v.parse().ok()) {
            self.pin.length = length;
        }
        if let Some(minutes) = lookup("ZRC_PIN_EXPIRY_MINUTES").and_then(|v| v.parse().ok()) {
            self.pin.expiry_minutes = minutes;
        }
        if let Some(url) = lookup("ZRC_RELAY_URL") {
            self.provider.relay.api_url = url;
        }
        if let Some(key) = lookup("ZRC_RELAY_API_KEY") {
            self.provider.relay.api_key = key;
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=12).contains(&self.pin.length) {
            return Err(ConfigError::ValidationError(
                "pin.length must be between 4 and 12".to_string(),
            ));
        }
        if self.pin.expiry_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "pin.expiry_minutes must be at least 1".to_string(),
            ));
        }
        if self.pin.max_failed_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "pin.max_failed_attempts must be at least 1".to_string(),
            ));
        }
        if self.pin.max_generation_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "pin.max_generation_attempts must be at least 1".to_string(),
            ));
        }
        if self.pin.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "pin.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.provider.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "provider.call_timeout_ms must be at least 1".to_string(),
            ));
        }
        self.provider.native.validate()?;
        Ok(())
    }
}
