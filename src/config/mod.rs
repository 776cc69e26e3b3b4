//! # Configuration Management Module
//!
//! Bridge settings live in one TOML file split into sections, one per concern:
//!
//! - [`SerialConfig`] - port, line speed and open behaviour
//! - [`ReconnectConfig`] - exponential backoff between failed open attempts
//! - [`TelemetryConfig`] - device-to-cloud polling cadence
//! - [`DownlinkConfig`] - cloud-to-device push delivery
//! - [`MethodsConfig`] - synchronous method calls
//! - [`LoggingConfig`] - log level and optional log file
//!
//! Every field has a default, so a partial file (or just `[serial] port = ...`) is
//! enough.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use xarm_bridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial Port: {}", config.serial.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baud_rate = 9600
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_delay_ms = 30000
//!
//! [methods]
//! timeout_ms = 10000
//! validate = true
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::serial::BackoffPolicy;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub downlink: DownlinkConfig,
    #[serde(default)]
    pub methods: MethodsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout handed to the serial driver (ms).
    pub read_timeout_ms: u64,
    /// Pause after opening before stale input is purged (ms). Boards reset on DTR.
    pub settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 2000,
            settle_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 30000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    /// Time allowed to complete a line once input is pending (ms).
    pub read_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            read_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    pub interval_ms: u64,
    /// Prepended to every pushed line so the controller knows it came from the cloud.
    pub prefix: String,
    pub drain_timeout_ms: u64,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            prefix: "cloud:".to_string(),
            drain_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodsConfig {
    pub timeout_ms: u64,
    /// How often pending input is checked while waiting for a reply (ms).
    pub poll_interval_ms: u64,
    /// Reject requests outside the command vocabulary before they reach the device.
    pub validate: bool,
}

impl Default for MethodsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10000,
            poll_interval_ms: 100,
            validate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        ms(self.read_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        ms(self.settle_ms)
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(ms(self.base_delay_ms), ms(self.max_delay_ms))
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        ms(self.interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        ms(self.read_timeout_ms)
    }
}

impl DownlinkConfig {
    pub fn interval(&self) -> Duration {
        ms(self.interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        ms(self.drain_timeout_ms)
    }
}

impl MethodsConfig {
    pub fn timeout(&self) -> Duration {
        ms(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from a file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would stall or spin the bridge loops.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            bail!("serial.port must not be empty");
        }
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be greater than zero");
        }
        let non_zero = [
            ("serial.read_timeout_ms", self.serial.read_timeout_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms),
            ("telemetry.interval_ms", self.telemetry.interval_ms),
            ("telemetry.read_timeout_ms", self.telemetry.read_timeout_ms),
            ("downlink.interval_ms", self.downlink.interval_ms),
            ("downlink.drain_timeout_ms", self.downlink.drain_timeout_ms),
            ("methods.timeout_ms", self.methods.timeout_ms),
            ("methods.poll_interval_ms", self.methods.poll_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            bail!(
                "reconnect.max_delay_ms ({}) is smaller than reconnect.base_delay_ms ({})",
                self.reconnect.max_delay_ms,
                self.reconnect.base_delay_ms
            );
        }
        if self.methods.poll_interval_ms > self.methods.timeout_ms {
            bail!(
                "methods.poll_interval_ms ({}) exceeds methods.timeout_ms ({})",
                self.methods.poll_interval_ms,
                self.methods.timeout_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.reconnect.policy(), BackoffPolicy::default());
        assert_eq!(config.telemetry.interval(), Duration::from_secs(1));
        assert_eq!(config.downlink.prefix, "cloud:");
        assert_eq!(config.methods.timeout(), Duration::from_secs(10));
        assert_eq!(config.methods.poll_interval(), Duration::from_millis(100));
        assert!(config.methods.validate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyUSB3"

            [methods]
            validate = false
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(!config.methods.validate);
        assert_eq!(config.methods.timeout_ms, 10000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.reconnect.max_delay_ms = 1000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_delay_ms"), "{err}");

        let mut config = Config::default();
        config.telemetry.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.port = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.methods.poll_interval_ms = 20000;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[tokio::test]
    async fn test_load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[serial\nport = ").unwrap();
        let err = Config::load(path.to_str().unwrap()).await.unwrap_err().to_string();
        assert!(err.contains("broken.toml"), "{err}");
    }
}
