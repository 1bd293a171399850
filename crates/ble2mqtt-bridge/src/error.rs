//! Error types for the MQTT side of the bridge.

use thiserror::Error;

/// Broker connection errors.
///
/// The connection loop decides what to do next based on the variant:
/// only [`MqttError::ConnectionLost`] leads to a reconnect.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MqttError {
    /// The broker rejected the connection (bad credentials, banned client).
    #[error("Broker refused the connection: {0}")]
    AccessRefused(String),

    /// The network connection to the broker failed or dropped.
    #[error("Connection to broker lost: {0}")]
    ConnectionLost(String),

    /// The session was closed locally while in use.
    #[error("Broker connection closed")]
    CloseForced,

    /// An operation needed a broker session and there is none.
    #[error("Not connected to broker")]
    NotConnected,

    /// The client rejected a request.
    #[error("MQTT client error: {0}")]
    Client(String),
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(err: rumqttc::ClientError) -> Self {
        MqttError::Client(err.to_string())
    }
}

/// Bridge errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Broker failure that ended the connection loop.
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    /// Device failure.
    #[error(transparent)]
    Device(#[from] ble2mqtt_core::Error),

    /// A message arrived under the bridge root that no device subscribed to.
    #[error("No device owns topic '{0}'")]
    UnroutableTopic(String),

    /// A device with the same MAC address is already registered.
    #[error("Device {0} is already registered")]
    DuplicateDevice(String),

    /// `start` was called twice, or `register` after `start`.
    #[error("Bridge already started")]
    AlreadyStarted,

    /// `stopped` was called before `start`.
    #[error("Bridge not started")]
    NotStarted,

    /// A bridge task panicked or was aborted.
    #[error("Bridge task failed: {0}")]
    Task(String),
}

/// Result type alias using the bridge error.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnroutableTopic("ble2mqtt/0xaabb/temperature/set".to_string());
        assert_eq!(
            err.to_string(),
            "No device owns topic 'ble2mqtt/0xaabb/temperature/set'"
        );

        let err: BridgeError = MqttError::AccessRefused("bad user name or password".into()).into();
        assert!(matches!(err, BridgeError::Mqtt(MqttError::AccessRefused(_))));
        assert!(err.to_string().contains("refused"));

        let err: BridgeError = ble2mqtt_core::Error::NotConnected.into();
        assert_eq!(err.to_string(), "Not connected to device");
    }
}
