//! Trait abstractions for bridged devices.
//!
//! [`BridgeDevice`] is what the bridge supervisor drives for every
//! configured peripheral, and [`StatePublisher`] is how a device pushes
//! state back out without knowing anything about MQTT.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use ble2mqtt_types::{DeviceInfo, Entities};

use crate::error::Result;
use crate::scan::normalize_address;

/// Derive the device id used in topics from a MAC address.
///
/// ```
/// assert_eq!(ble2mqtt_core::dev_id("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
/// ```
pub fn dev_id(mac: &str) -> String {
    normalize_address(mac)
}

/// Payload of an inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Payload that parsed as JSON.
    Json(Value),
    /// Anything else, passed through as text.
    Text(String),
}

impl CommandPayload {
    /// Parse a raw MQTT payload, falling back to text when it is not JSON.
    pub fn parse(raw: &[u8]) -> Self {
        match serde_json::from_slice(raw) {
            Ok(value) => CommandPayload::Json(value),
            Err(_) => CommandPayload::Text(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

/// Sink for device state updates.
///
/// Topics are relative to the bridge root; the implementation decides how
/// they are prefixed and delivered.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
}

/// A peripheral that can be bridged to MQTT.
///
/// Devices are created once and live for the whole process; only their
/// link is recreated on each connection cycle. All methods take `&self`
/// so a device can be shared between its supervisor and the dispatch
/// loop as `Arc<dyn BridgeDevice>`.
#[async_trait]
pub trait BridgeDevice: Send + Sync {
    // --- Identity ---

    /// BLE MAC address as configured.
    fn mac(&self) -> &str;

    /// MAC without separators, lower-cased.
    fn dev_id(&self) -> String {
        dev_id(self.mac())
    }

    /// Unique id used in state topics and discovery.
    fn unique_id(&self) -> String {
        format!("0x{}", self.dev_id())
    }

    /// Descriptive device information.
    fn info(&self) -> DeviceInfo;

    /// Entities exposed by this device, grouped by domain.
    fn entities(&self) -> &Entities;

    /// Command topics, relative to the bridge root.
    fn subscribed_topics(&self) -> &[String];

    // --- Lifecycle ---

    /// Establish the BLE link.
    async fn connect(&self) -> Result<()>;

    /// Run the post-connect handshake and subscriptions.
    async fn init(&self) -> Result<()>;

    /// Whether the BLE link is up.
    async fn is_connected(&self) -> bool;

    /// Long-running publishing loop. Returns when the link drops.
    async fn handle(&self, publisher: Arc<dyn StatePublisher>) -> Result<()>;

    /// Handle an inbound command on one of [`subscribed_topics`](Self::subscribed_topics).
    async fn process_topic(
        &self,
        topic: &str,
        payload: CommandPayload,
        publisher: Arc<dyn StatePublisher>,
    ) -> Result<()>;

    /// Signal that fires once when the current link is lost.
    fn disconnected(&self) -> CancellationToken;

    /// Tear down the BLE link.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dev_id() {
        assert_eq!(dev_id("AA:BB:CC:DD:EE:FF"), "aabbccddeeff");
        assert_eq!(dev_id("aa:bb:cc:dd:ee:ff"), "aabbccddeeff");
    }

    #[test]
    fn test_command_payload_json() {
        assert_eq!(
            CommandPayload::parse(br#"{"state": "ON"}"#),
            CommandPayload::Json(json!({"state": "ON"}))
        );
        assert_eq!(CommandPayload::parse(b"42"), CommandPayload::Json(json!(42)));
    }

    #[test]
    fn test_command_payload_text_fallback() {
        assert_eq!(
            CommandPayload::parse(b"ON"),
            CommandPayload::Text("ON".to_string())
        );
        assert_eq!(CommandPayload::parse(b""), CommandPayload::Text(String::new()));
    }
}
