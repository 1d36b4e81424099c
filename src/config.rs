//! Configuration loading for the EKI driver

use crate::{EkiError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/default_config.yaml";
pub const DEFAULT_EKI_PORT: u16 = 54610;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub host: String,
    pub port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MotionConfig {
    pub joint_count: Option<usize>,
    pub external_axes: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub decimal_places: Option<u32>,
    pub safe_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtocolConfig {
    pub read_timeout_ms: Option<u64>,
    pub command_interval_ms: Option<u64>,
    pub program_state_timeout_ms: Option<u64>,
    pub bootstrap_timeout_secs: Option<u64>,
}

impl DriverConfig {
    /// Build a config for `host` with every optional field at its default
    pub fn for_host(host: &str) -> Self {
        Self {
            device: DeviceConfig {
                host: host.to_string(),
                port: None,
                connect_timeout_secs: None,
            },
            motion: MotionConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| EkiError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.host.trim().is_empty() {
            return Err(EkiError::Config("device.host is required".to_string()));
        }
        if self.motion.joint_count() == 0 {
            return Err(EkiError::Config("motion.joint_count must be at least 1".to_string()));
        }
        if self.protocol.read_timeout().is_zero() {
            return Err(EkiError::Config("protocol.read_timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// `host:port` dial address
    pub fn address(&self) -> String {
        format!("{}:{}", self.device.host, self.device.port())
    }
}

impl DeviceConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_EKI_PORT)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(5))
    }
}

impl MotionConfig {
    /// Number of controlled joints (N)
    pub fn joint_count(&self) -> usize {
        self.joint_count.unwrap_or(6)
    }

    /// Number of external axes carried after the joints on the wire
    pub fn external_axes(&self) -> usize {
        self.external_axes.unwrap_or(6)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(30))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(200))
    }

    pub fn decimal_places(&self) -> u32 {
        self.decimal_places.unwrap_or(4)
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode.unwrap_or(false)
    }
}

impl ProtocolConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(200))
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms.unwrap_or(200))
    }

    pub fn program_state_timeout(&self) -> Duration {
        Duration::from_millis(self.program_state_timeout_ms.unwrap_or(2000))
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs.unwrap_or(10))
    }
}
