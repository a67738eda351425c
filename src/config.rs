//! Bridge configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::WatchdogConfig;
use crate::sensors::session::SessionConfig;
use crate::sensors::types::{Capability, ScanTarget};
use crate::sensors::WheelCalibration;
use crate::streaming::{Encoding, RegistryConfig, ServerConfig};

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Configuration format version
    pub version: String,
    /// Consumer listen socket
    pub listen: ListenSettings,
    /// Sensor targets and link timings
    pub sensors: SensorSettings,
    /// Stall watchdog
    pub watchdog: WatchdogSettings,
    /// Consumer broadcast
    pub broadcast: BroadcastSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen: ListenSettings::default(),
            sensors: SensorSettings::default(),
            watchdog: WatchdogSettings::default(),
            broadcast: BroadcastSettings::default(),
        }
    }
}

/// Where consumers connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl ListenSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How to find one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTarget {
    /// Case-insensitive substring of the advertised name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_filter: Option<String>,
    /// Pinned device address; wins over the name filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl SensorTarget {
    pub fn by_name(filter: &str) -> Self {
        Self {
            name_filter: Some(filter.to_string()),
            device_id: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.name_filter.as_deref().map_or(true, str::is_empty)
            && self.device_id.as_deref().map_or(true, str::is_empty)
    }

    pub fn scan_target(&self) -> ScanTarget {
        ScanTarget {
            name_filter: self.name_filter.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// Sensor-related settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Wheel circumference in meters
    pub wheel_circumference_m: f64,
    /// Length of one scan attempt in seconds
    pub scan_timeout_secs: u64,
    /// Pause between unsuccessful scans in seconds
    pub rescan_interval_secs: u64,
    /// Pause after a failed connect in seconds
    pub retry_delay_secs: u64,
    /// Pause after a dropped link in seconds
    pub reconnect_delay_secs: u64,
    /// Link liveness check interval while streaming in milliseconds
    pub liveness_interval_ms: u64,
    /// Power source (Cycling Power or FTMS trainer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<SensorTarget>,
    /// Dedicated speed/cadence sensor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadence_speed: Option<SensorTarget>,
    /// Heart rate strap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<SensorTarget>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            wheel_circumference_m: 2.105,
            scan_timeout_secs: 10,
            rescan_interval_secs: 5,
            retry_delay_secs: 2,
            reconnect_delay_secs: 5,
            liveness_interval_ms: 1000,
            power: Some(SensorTarget::by_name("KICKR")),
            cadence_speed: None,
            heart_rate: Some(SensorTarget::by_name("TICKR")),
        }
    }
}

impl SensorSettings {
    pub fn target(&self, capability: Capability) -> Option<&SensorTarget> {
        match capability {
            Capability::Power => self.power.as_ref(),
            Capability::CadenceSpeed => self.cadence_speed.as_ref(),
            Capability::HeartRate => self.heart_rate.as_ref(),
        }
    }

    pub fn target_mut(&mut self, capability: Capability) -> &mut Option<SensorTarget> {
        match capability {
            Capability::Power => &mut self.power,
            Capability::CadenceSpeed => &mut self.cadence_speed,
            Capability::HeartRate => &mut self.heart_rate,
        }
    }

    /// Session settings for a configured capability.
    pub fn session_config(&self, capability: Capability) -> Option<SessionConfig> {
        let target = self.target(capability)?;

        Some(SessionConfig {
            capability,
            target: target.scan_target(),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            rescan_interval: Duration::from_secs(self.rescan_interval_secs),
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            calibration: WheelCalibration {
                circumference_m: self.wheel_circumference_m,
            },
        })
    }
}

/// Stall watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Silence before power/cadence/speed are zeroed
    pub cycling_timeout_ms: u64,
    /// Silence before heart rate is reported stale
    pub heart_rate_stale_ms: u64,
    /// Check period
    pub check_interval_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            cycling_timeout_ms: 1200,
            heart_rate_stale_ms: 5000,
            check_interval_ms: 250,
        }
    }
}

impl WatchdogSettings {
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            cycling_timeout: Duration::from_millis(self.cycling_timeout_ms),
            heart_rate_stale_after: Duration::from_millis(self.heart_rate_stale_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
        }
    }
}

/// Consumer broadcast settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Broadcast period in milliseconds
    pub tick_ms: u64,
    /// Encoding for consumers that do not request one
    pub encoding: Encoding,
    /// Frames buffered per consumer
    pub queue_capacity: usize,
    /// Consecutive dropped frames before a consumer is removed
    pub max_consecutive_drops: u32,
    /// Per-message write timeout in milliseconds
    pub send_timeout_ms: u64,
    /// Time allowed for tasks to finish on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            encoding: Encoding::Binary,
            queue_capacity: 8,
            max_consecutive_drops: 40,
            send_timeout_ms: 250,
            shutdown_grace_ms: 2000,
        }
    }
}

impl BroadcastSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            queue_capacity: self.queue_capacity,
            max_consecutive_drops: self.max_consecutive_drops,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            default_encoding: self.encoding,
            tick: self.tick(),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            ..ServerConfig::default()
        }
    }
}

impl BridgeConfig {
    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.host.trim().is_empty() {
            return Err(ConfigError::Invalid("listen.host must not be empty".into()));
        }
        if self.listen.port == 0 {
            return Err(ConfigError::Invalid("listen.port must not be 0".into()));
        }

        let circumference = self.sensors.wheel_circumference_m;
        if !circumference.is_finite() || circumference <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sensors.wheel_circumference_m must be positive, got {}",
                circumference
            )));
        }

        let configured: Vec<(Capability, &SensorTarget)> = Capability::ALL
            .iter()
            .filter_map(|c| self.sensors.target(*c).map(|t| (*c, t)))
            .collect();
        if configured.is_empty() {
            return Err(ConfigError::Invalid("no sensors configured".into()));
        }
        if let Some((capability, _)) = configured.iter().find(|(_, t)| t.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "{} sensor needs a name_filter or device_id",
                capability
            )));
        }

        let intervals = [
            ("sensors.scan_timeout_secs", self.sensors.scan_timeout_secs),
            ("sensors.liveness_interval_ms", self.sensors.liveness_interval_ms),
            ("watchdog.cycling_timeout_ms", self.watchdog.cycling_timeout_ms),
            ("watchdog.heart_rate_stale_ms", self.watchdog.heart_rate_stale_ms),
            ("watchdog.check_interval_ms", self.watchdog.check_interval_ms),
            ("broadcast.tick_ms", self.broadcast.tick_ms),
            ("broadcast.send_timeout_ms", self.broadcast.send_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }

        if self.broadcast.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.queue_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Get the configuration directory.
pub fn get_config_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ridebridge", "RideBridge")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Load configuration from `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(BridgeConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    let config: BridgeConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save configuration to `path`.
pub fn save_config(config: &BridgeConfig, path: &Path) -> Result<(), ConfigError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
    }

    let content = to_toml(config)?;

    std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(())
}

/// Render configuration as TOML.
pub fn to_toml(config: &BridgeConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError(e.to_string()))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
