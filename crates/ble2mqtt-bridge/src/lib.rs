//! Bridge Bluetooth Low Energy devices to an MQTT broker.
//!
//! This crate provides a service that:
//! - Keeps one broker session open and reconnects when it drops
//! - Connects every configured BLE device and reconnects it when it goes
//!   out of range
//! - Announces each device's entities through Home Assistant MQTT discovery
//! - Publishes device state and routes commands back to the device
//!
//! # Topics
//!
//! - `ble2mqtt/bridge/state` - `online` / `offline` (retained, also the last will)
//! - `ble2mqtt/<unique_id>/<entity>` - entity state
//! - `ble2mqtt/<unique_id>/<entity>/set` - entity commands
//! - `homeassistant/<component>/<dev_id>/<entity>/config` - discovery (retained)
//!
//! # Configuration
//!
//! The bridge reads a JSON file, `/etc/ble2mqtt.json` by default:
//!
//! ```json
//! {
//!   "mqtt_host": "localhost",
//!   "mqtt_port": 1883,
//!   "devices": [
//!     {"address": "AA:BB:CC:DD:EE:FF", "type": "mikettle"}
//!   ]
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod mqtt;
pub mod router;
pub mod supervisor;

pub use bridge::{Bridge, BridgePublisher, BridgeSettings};
pub use config::{Config, ConfigError};
pub use error::{BridgeError, MqttError, Result};
pub use mock::{BrokerEvent, MockBroker};
pub use mqtt::{Broker, InboundMessage, Message, MqttSettings, RumqttBroker, Session};
pub use router::{Route, Router};
pub use supervisor::{DeviceSupervisor, SupervisorState, SupervisorTimings};
