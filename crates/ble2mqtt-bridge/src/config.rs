//! Bridge configuration.
//!
//! The configuration is a flat JSON document:
//!
//! ```json
//! {
//!   "mqtt_host": "localhost",
//!   "mqtt_port": 1883,
//!   "mqtt_user": null,
//!   "mqtt_password": null,
//!   "mqtt_tls": false,
//!   "mqtt_client_id": "ble2mqtt",
//!   "reconnection_interval": 10,
//!   "devices": [
//!     {"address": "AA:BB:CC:DD:EE:FF", "type": "mikettle", "token": "015ccba8800abdc12eb8ed82"}
//!   ]
//! }
//! ```
//!
//! Every field is optional; device entries may carry extra type-specific
//! keys which are handed to the device constructor untouched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use ble2mqtt_core::{DEVICE_TYPES, DeviceConfig, dev_id};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ble2mqtt.json";

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker host name.
    pub mqtt_host: String,
    /// Broker port.
    pub mqtt_port: u16,
    /// Broker user name.
    pub mqtt_user: Option<String>,
    /// Broker password.
    pub mqtt_password: Option<String>,
    /// Connect to the broker over TLS.
    pub mqtt_tls: bool,
    /// MQTT client id.
    pub mqtt_client_id: String,
    /// Seconds to wait before reconnecting to a lost broker.
    pub reconnection_interval: u64,
    /// Devices to bridge.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            mqtt_tls: false,
            mqtt_client_id: "ble2mqtt".to_string(),
            reconnection_interval: 10,
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Load configuration, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using default configuration", e);
                Self::default()
            }
        }
    }

    /// Broker reconnect interval.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnection_interval)
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Broker host is not empty and port is not zero
    /// - Reconnection interval is not zero
    /// - Device addresses are not empty and device types are known
    /// - No duplicate device addresses
    ///
    /// # Example
    ///
    /// ```
    /// use ble2mqtt_bridge::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.mqtt_host.trim().is_empty() {
            errors.push(ValidationError::new("mqtt_host", "broker host cannot be empty"));
        }
        if self.mqtt_port == 0 {
            errors.push(ValidationError::new("mqtt_port", "port cannot be 0"));
        }
        if self.reconnection_interval == 0 {
            errors.push(ValidationError::new(
                "reconnection_interval",
                "reconnection interval must be at least 1 second",
            ));
        }

        let mut seen_addresses = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);

            if device.address.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    "address cannot be empty",
                ));
            } else if !seen_addresses.insert(dev_id(&device.address)) {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    format!("duplicate device address '{}'", device.address),
                ));
            }

            if !DEVICE_TYPES.contains(&device.kind.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.type", prefix),
                    format!(
                        "unknown device type '{}' (expected one of: {})",
                        device.kind,
                        DEVICE_TYPES.join(", ")
                    ),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `mqtt_port` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
