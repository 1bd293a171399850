//! BLE side of the BLE to MQTT bridge.
//!
//! This crate talks to Bluetooth Low Energy peripherals and implements the
//! device protocols. It knows nothing about MQTT: devices push state through
//! a [`StatePublisher`] and receive commands as [`CommandPayload`]s.
//!
//! # Features
//!
//! - **Transport**: [`GattClient`] abstraction with a `btleplug` backed
//!   [`BleClient`]
//! - **Device protocol**: the [`BridgeDevice`] trait the bridge supervises
//! - **Xiaomi kettle**: authentication handshake and status decoding
//! - **Factory**: builds devices from configuration entries by type tag
//! - **Mocks**: [`MockGatt`], [`MockDevice`] and [`RecordingPublisher`]
//!
//! # Supported Devices
//!
//! | Type tag | Device | Entities |
//! |----------|--------|----------|
//! | `mikettle` | Xiaomi MiKettle | temperature sensor |
//!
//! # Quick Start
//!
//! ```no_run
//! use ble2mqtt_core::{BridgeDevice, DeviceConfig, build_device};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = build_device(&DeviceConfig::new("AA:BB:CC:DD:EE:FF", "mikettle"))?;
//!     device.connect().await?;
//!     device.init().await?;
//!     println!("{} running firmware {:?}", device.unique_id(), device.info().sw_version);
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod cipher;
pub mod device;
pub mod error;
pub mod factory;
pub mod gatt;
pub mod kettle;
pub mod mock;
pub mod scan;
pub mod traits;

pub use ble2mqtt_types::types;
pub use ble2mqtt_types::uuids;

pub use device::{BleClient, ConnectionConfig};
pub use error::{Error, Result};
pub use factory::{DEVICE_TYPES, DeviceConfig, build_device};
pub use gatt::{GattClient, NotificationHandler};
pub use kettle::{KettleOptions, KettlePhase, XiaomiKettle};
pub use mock::{MockDevice, MockGatt, RecordingPublisher};
pub use traits::{BridgeDevice, CommandPayload, StatePublisher, dev_id};

/// Shared handle to a bridged device.
pub type SharedDevice = std::sync::Arc<dyn BridgeDevice>;
