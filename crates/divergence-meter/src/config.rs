//! Configuration types for the meter
//!
//! This module provides the device profile the central looks for, the
//! reconnection policy and the auto-off settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MeterError, Result};

/// Size of every command frame written to the meter
pub const COMMAND_FRAME_LEN: usize = 18;

/// Filler byte used to pad command frames
pub const PADDING_BYTE: u8 = b'*';

/// Advertised local name of the meter
pub const DEVICE_NAME: &str = "Divergence";

/// Advertised service (16-bit `ffe0`)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Writable command characteristic
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Default delay before rescanning after another consumer stopped the scan
pub const DEFAULT_RESCAN_DELAY_MS: u64 = 3000;

/// Default auto-off duration in seconds
pub const DEFAULT_AUTO_OFF_SECS: u32 = 30 * 60;

/// Default auto-off retry delay in seconds
pub const DEFAULT_AUTO_OFF_RETRY_SECS: u32 = 60;

/// Main configuration for a meter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Peripheral to look for
    #[serde(default)]
    pub device: DeviceProfile,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Auto-off settings
    #[serde(default)]
    pub auto_off: AutoOffConfig,
}

impl MeterConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MeterConfig =
            serde_json::from_str(json).map_err(|e| MeterError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the configuration for values the meter cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.device.name.is_empty() {
            return Err(MeterError::InvalidConfig(
                "device name must not be empty".to_string(),
            ));
        }
        if self.auto_off.enabled && self.auto_off.duration_secs == 0 {
            return Err(MeterError::InvalidConfig(
                "auto-off duration must be positive".to_string(),
            ));
        }
        if self.auto_off.retry_delay_secs == 0 {
            return Err(MeterError::InvalidConfig(
                "auto-off retry delay must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity of the peripheral the central connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Advertised local name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// The single advertised service
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    /// The writable command characteristic
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,
}

fn default_device_name() -> String {
    DEVICE_NAME.to_string()
}

fn default_service_uuid() -> Uuid {
    SERVICE_UUID
}

fn default_characteristic_uuid() -> Uuid {
    CHARACTERISTIC_UUID
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: DEVICE_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before restarting a scan that another consumer stopped
    #[serde(with = "humantime_serde", default = "default_rescan_delay")]
    pub rescan_delay: Duration,
}

fn default_rescan_delay() -> Duration {
    Duration::from_millis(DEFAULT_RESCAN_DELAY_MS)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            rescan_delay: default_rescan_delay(),
        }
    }
}

/// Auto-off behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoOffConfig {
    /// Turn the meter off after `duration_secs` of being on
    #[serde(default)]
    pub enabled: bool,

    /// Countdown length in seconds
    #[serde(default = "default_auto_off_secs")]
    pub duration_secs: u32,

    /// Seconds to wait before retrying when the meter could not be reached
    #[serde(default = "default_auto_off_retry_secs")]
    pub retry_delay_secs: u32,
}

fn default_auto_off_secs() -> u32 {
    DEFAULT_AUTO_OFF_SECS
}

fn default_auto_off_retry_secs() -> u32 {
    DEFAULT_AUTO_OFF_RETRY_SECS
}

impl Default for AutoOffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_secs: DEFAULT_AUTO_OFF_SECS,
            retry_delay_secs: DEFAULT_AUTO_OFF_RETRY_SECS,
        }
    }
}

/// Builder for MeterConfig
#[derive(Debug, Default)]
pub struct MeterConfigBuilder {
    config: MeterConfig,
}

impl MeterConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised name to look for
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.device.name = name.into();
        self
    }

    /// Set the rescan delay
    pub fn rescan_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.rescan_delay = delay;
        self
    }

    /// Enable auto-off after the given number of seconds
    pub fn auto_off(mut self, duration_secs: u32) -> Self {
        self.config.auto_off.enabled = true;
        self.config.auto_off.duration_secs = duration_secs;
        self
    }

    /// Set the auto-off retry delay
    pub fn auto_off_retry(mut self, retry_delay_secs: u32) -> Self {
        self.config.auto_off.retry_delay_secs = retry_delay_secs;
        self
    }

    /// Build the configuration
    pub fn build(self) -> MeterConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
