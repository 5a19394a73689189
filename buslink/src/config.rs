//! Configuration management for buslink.
//!
//! This module handles loading and validating configuration from a TOML
//! file. The file path comes from the `BUSLINK_CONFIG` environment
//! variable, falling back to /etc/buslink/buslink.toml; a missing file
//! yields the built-in defaults so the daemon can run against a stock
//! RS-485 HAT without any configuration at all.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/buslink/buslink.toml";

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "BUSLINK_CONFIG";

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Serial port configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Direction-control hardware configuration
    #[serde(default)]
    pub direction: DirectionConfig,

    /// Reconnect behavior
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Remote-device liveness configuration
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Parity setting for the serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial port configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Serial device path
    pub device: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Data bits per character (5-8)
    pub data_bits: u8,

    /// Stop bits (1 or 2)
    pub stop_bits: u8,

    /// Parity
    pub parity: Parity,

    /// Line delimiter for the wire framing (a single byte)
    pub delimiter: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyAMA0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            delimiter: "\n".to_string(),
        }
    }
}

impl SerialConfig {
    /// The configured line delimiter as a single byte.
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [b] => Ok(*b),
            _ => Err(Error::Config(format!(
                "delimiter must be a single byte, got {:?}",
                self.delimiter
            ))),
        }
    }
}

/// Direction-control hardware configuration.
///
/// Two wirings are supported: a single legacy line tying driver-enable and
/// receiver-enable together (`legacy_pin`), or independent `de_pin` and
/// `re_pin` lines. With neither configured the link runs without hardware
/// direction control (e.g. transceivers with automatic direction).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DirectionConfig {
    /// GPIO character device for the control lines
    pub chip: String,

    /// Single combined DE//RE line offset
    pub legacy_pin: Option<u32>,

    /// Driver-enable line offset
    pub de_pin: Option<u32>,

    /// Receiver-enable line offset
    pub re_pin: Option<u32>,

    /// Receiver-enable polarity; most transceivers have an active-low /RE
    pub re_active_low: bool,

    /// Transmit-to-receive turnaround delay in milliseconds
    pub turnaround_ms: u64,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            legacy_pin: None,
            de_pin: None,
            re_pin: None,
            re_active_low: true,
            turnaround_ms: 5,
        }
    }
}

impl DirectionConfig {
    /// Transmit-to-receive turnaround delay.
    pub fn turnaround(&self) -> Duration {
        Duration::from_millis(self.turnaround_ms)
    }
}

/// Reconnect behavior for the serial link.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Automatically reopen the port after loss
    pub enabled: bool,

    /// Fixed interval between reconnect attempts in milliseconds
    pub interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Interval between reconnect attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Remote-device liveness configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Remote is considered gone after this much heartbeat silence,
    /// in milliseconds
    pub heartbeat_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl RemoteConfig {
    /// Heartbeat staleness threshold.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Honors `BUSLINK_CONFIG`; a missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if !Path::new(&path).exists() {
            info!(path = %path, "No configuration file, using defaults.");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from(Path::new(&path))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.serial.delimiter_byte()?;
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be non-zero".into()));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(Error::Config(format!(
                "data_bits must be 5-8, got {}",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(Error::Config(format!(
                "stop_bits must be 1 or 2, got {}",
                self.serial.stop_bits
            )));
        }
        if self.direction.legacy_pin.is_some()
            && (self.direction.de_pin.is_some() || self.direction.re_pin.is_some())
        {
            return Err(Error::Config(
                "legacy_pin is exclusive with de_pin/re_pin".into(),
            ));
        }
        if self.direction.de_pin.is_some() != self.direction.re_pin.is_some() {
            return Err(Error::Config(
                "de_pin and re_pin must be configured together".into(),
            ));
        }
        Ok(())
    }
}
