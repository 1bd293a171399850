//! GATT client abstraction.
//!
//! Device protocols talk to their peripheral only through [`GattClient`],
//! which is implemented by [`BleClient`](crate::device::BleClient) for real
//! hardware and by [`MockGatt`](crate::mock::MockGatt) in tests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Callback invoked with the payload of every notification on a
/// subscribed characteristic.
///
/// Handlers run to completion without awaiting, so they must only do
/// non-blocking work such as replacing a state slot or `try_send`.
pub type NotificationHandler = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Operations a device protocol needs from a BLE link.
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Address of the peripheral this client talks to.
    fn address(&self) -> &str;

    /// Establish the link. A new disconnect signal is armed on success.
    async fn connect(&self) -> Result<()>;

    /// Tear the link down. Fires the disconnect signal.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently up.
    async fn is_connected(&self) -> bool;

    /// Read a characteristic value.
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value, waiting for the write response.
    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications on a characteristic and route them to `handler`.
    async fn subscribe(&self, uuid: Uuid, handler: NotificationHandler) -> Result<()>;

    /// Disable notifications on a characteristic and drop its handler.
    async fn unsubscribe(&self, uuid: Uuid) -> Result<()>;

    /// Last known signal strength in dBm.
    async fn rssi(&self) -> Option<i16>;

    /// Signal that fires once when the current link is lost.
    ///
    /// Returns an already-cancelled token when there is no link.
    fn disconnected(&self) -> CancellationToken;
}
