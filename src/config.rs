//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `agent.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//!     this is NOT the device state file. interval, alert threshold and the
//!     connection string live in pisensor.conf (see store.rs) because the
//!     cloud can change them at runtime.
//!
//! structure:
//!     - LoggingConfig: log level and whether sampled values are logged at info.
//!     - SensorsConfig: which driver, where the cpu thermal zone is.
//!     - SimulationConfig: base values for the simulated driver.
//!     - TransportConfig: timeouts, token lifetime, polling, retry pacing.
//!     - ApiConfig: local status / command api.
//!     - UpdateConfig: commands run by the updateDevice method.
//!     - DisplayConfig: LED feedback on config changes.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::hal::DEFAULT_CPU_TEMP_PATH;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AgentSettings {
    pub logging: LoggingConfig,
    pub sensors: SensorsConfig,
    pub simulation: SimulationConfig,
    pub transport: TransportConfig,
    pub api: ApiConfig,
    pub update: UpdateConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SensorDriver {
    Simulated,
    SenseHat,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorsConfig {
    pub driver: SensorDriver,
    pub cpu_temp_path: PathBuf,
    pub i2c_bus: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    pub humidity_temp: f64,
    pub pressure_temp: f64,
    pub cpu_temp: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub jitter: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    /// a tracked send is given up after this long without a confirmation
    pub message_timeout_ms: u64,
    pub sas_ttl_seconds: u64,
    pub keep_alive_seconds: u64,
    /// http only: cloud-to-device polling period
    pub poll_interval_seconds: u64,
    /// pause between reconnect attempts after a connection error
    pub retry_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpdateConfig {
    pub commands: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub feedback: bool,
}

impl AgentSettings {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read settings file: {}", e))?;

        let settings: AgentSettings = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings: {}", e))?;

        Ok(settings)
    }

    /// Load with default fallback. An explicit path is tried first.
    ///
    /// Runs before logging is initialized, so problems are returned as
    /// messages for the caller to log once the subscriber exists.
    pub fn load_or_default(explicit: Option<&Path>) -> (Self, Vec<String>) {
        let mut notes = Vec::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            paths.push(p.to_path_buf());
        }
        paths.push(PathBuf::from("config").join("agent.toml"));
        paths.push(PathBuf::from("agent.toml"));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(settings) => {
                        notes.push(format!("settings loaded from {}", path.display()));
                        return (settings, notes);
                    }
                    Err(e) => {
                        notes.push(format!("failed to load {}: {}", path.display(), e));
                    }
                }
            } else if Some(path.as_path()) == explicit {
                notes.push(format!("settings file {} does not exist", path.display()));
            }
        }

        notes.push("no settings file found - using defaults".to_string());
        (Self::default(), notes)
    }

    /// Print configuration summary
    pub fn log_summary(&self) {
        let api = if self.api.enabled { self.api.bind.as_str() } else { "disabled" };
        tracing::info!(
            driver = ?self.sensors.driver,
            log_level = %self.logging.level,
            api = %api,
            message_timeout_ms = self.transport.message_timeout_ms,
            "agent settings"
        );
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            driver: SensorDriver::Simulated,
            cpu_temp_path: PathBuf::from(DEFAULT_CPU_TEMP_PATH),
            i2c_bus: 1,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            humidity_temp: 31.5,
            pressure_temp: 30.8,
            cpu_temp: 52.0,
            pressure: 1013.2,
            humidity: 38.0,
            jitter: 0.4,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: 10_000,
            sas_ttl_seconds: 3600,
            keep_alive_seconds: 60,
            poll_interval_seconds: 9,
            retry_interval_seconds: 5,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let cmd = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            commands: vec![
                cmd(&["sudo", "apt-get", "update"]),
                cmd(&["sudo", "apt-get", "-y", "upgrade"]),
            ],
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { feedback: true }
    }
}
