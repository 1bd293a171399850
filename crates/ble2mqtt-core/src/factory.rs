//! Device construction from configuration.
//!
//! Each configured device names a type tag; the factory maps the tag to a
//! constructor and hands it the type-specific settings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::BleClient;
use crate::error::{Error, Result};
use crate::kettle::{KETTLE_TYPE, KettleOptions, XiaomiKettle};
use crate::traits::BridgeDevice;

/// One entry of the `devices` configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// BLE MAC address.
    pub address: String,
    /// Registered device type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific settings.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceConfig {
    /// Create a config without type-specific settings.
    pub fn new(address: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: kind.into(),
            extra: Map::new(),
        }
    }
}

/// Device type tags that [`build_device`] accepts.
pub const DEVICE_TYPES: &[&str] = &[KETTLE_TYPE];

/// Build a device from its configuration entry.
///
/// No Bluetooth activity happens here; the returned device connects when
/// its supervisor first calls [`BridgeDevice::connect`].
pub fn build_device(config: &DeviceConfig) -> Result<Arc<dyn BridgeDevice>> {
    match config.kind.as_str() {
        KETTLE_TYPE => {
            let options: KettleOptions = settings(config)?;
            let client = Arc::new(BleClient::new(config.address.as_str()));
            Ok(Arc::new(XiaomiKettle::new(client, options)?))
        }
        other => Err(Error::UnknownDeviceType(other.to_string())),
    }
}

fn settings<T: serde::de::DeserializeOwned>(config: &DeviceConfig) -> Result<T> {
    serde_json::from_value(Value::Object(config.extra.clone())).map_err(|e| {
        Error::invalid_config(format!(
            "{} settings for {}: {}",
            config.kind, config.address, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_deserialize() {
        let json = r#"{
            "address": "AA:BB:CC:DD:EE:FF",
            "type": "mikettle",
            "product_id": 131,
            "token": "015ccba8800abdc12eb8ed82"
        }"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.kind, "mikettle");
        assert_eq!(config.extra["product_id"], 131);
        assert_eq!(config.extra.len(), 2);
    }

    #[test]
    fn test_build_kettle() {
        let device = build_device(&DeviceConfig::new("AA:BB:CC:DD:EE:FF", "mikettle")).unwrap();
        assert_eq!(device.mac(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.unique_id(), "0xaabbccddeeff");
        assert_eq!(device.info().model, "MiKettle");
    }

    #[test]
    fn test_build_unknown_type() {
        let result = build_device(&DeviceConfig::new("AA:BB:CC:DD:EE:FF", "toaster"));
        assert!(matches!(result, Err(Error::UnknownDeviceType(t)) if t == "toaster"));
    }

    #[test]
    fn test_build_kettle_rejects_bad_settings() {
        let mut config = DeviceConfig::new("AA:BB:CC:DD:EE:FF", "mikettle");
        config
            .extra
            .insert("product_id".to_string(), Value::String("abc".to_string()));
        assert!(matches!(build_device(&config), Err(Error::InvalidConfig(_))));

        let mut config = DeviceConfig::new("AA:BB:CC:DD:EE:FF", "mikettle");
        config
            .extra
            .insert("token".to_string(), Value::String("short".to_string()));
        assert!(matches!(build_device(&config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_device_types() {
        assert_eq!(DEVICE_TYPES, &["mikettle"]);
    }
}
