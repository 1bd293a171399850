//! Error types for ble2mqtt-core.
//!
//! This module defines the errors that can occur while talking to a BLE
//! peripheral or running a device protocol.
//!
//! # Recovery
//!
//! Callers never retry inside a device: any error returned from
//! [`BridgeDevice::connect`](crate::BridgeDevice::connect) or
//! [`BridgeDevice::init`](crate::BridgeDevice::init) ends the current
//! connection cycle and the device supervisor starts a new one later.
//!
//! | Error Type | Typical cause |
//! |------------|---------------|
//! | [`Error::Bluetooth`] | Adapter or link failure reported by the BLE stack |
//! | [`Error::DeviceNotFound`] | Peripheral not advertising / out of range |
//! | [`Error::Timeout`] | Handshake or GATT operation did not complete in time |
//! | [`Error::Parse`] | Malformed notification payload |
//! | [`Error::InvalidMac`], [`Error::InvalidConfig`] | Bad configuration, fix and restart |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when communicating with bridged devices.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Peripheral with the given address was not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device")]
    NotConnected,

    /// Required GATT characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Failed to decode data received from the device.
    #[error(transparent)]
    Parse(#[from] ble2mqtt_types::ParseError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// A MAC address could not be parsed.
    #[error("Invalid MAC address: '{0}'")]
    InvalidMac(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured device type has no registered constructor.
    #[error("Unknown device type: '{0}'")]
    UnknownDeviceType(String),

    /// Publishing device state through the bridge failed.
    #[error("Publish failed: {0}")]
    Publish(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a publish error.
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }
}

/// Result type alias using ble2mqtt-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
