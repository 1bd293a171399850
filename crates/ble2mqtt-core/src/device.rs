//! BLE link to a single peripheral.
//!
//! [`BleClient`] implements [`GattClient`] on top of `btleplug`. A client is
//! created once per configured device and reused across reconnect cycles:
//! each successful [`connect`](GattClient::connect) builds a fresh [`Link`]
//! with its own characteristic cache, notification tasks and disconnect
//! signal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gatt::{GattClient, NotificationHandler};
use crate::scan::{find_peripheral, get_adapter};

/// Default timeout for scanning for the peripheral.
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE characteristic read operations.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE characteristic write operations.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for BLE connection timeouts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ble2mqtt_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .read_timeout(Duration::from_secs(15));
/// assert_eq!(config.read_timeout, Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time spent scanning before each connection attempt gives up.
    pub scan_timeout: Duration,
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
    /// Timeout for BLE write operations.
    pub write_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Set the scan timeout.
    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

/// One established connection.
struct Link {
    /// Kept alive for as long as the peripheral connection is in use.
    #[allow(dead_code)]
    adapter: Adapter,
    peripheral: Peripheral,
    /// Characteristics discovered on connect, keyed by UUID.
    characteristics: HashMap<Uuid, Characteristic>,
    service_count: usize,
    /// Notification forwarding tasks, one per subscribed characteristic.
    notification_handles: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Task watching adapter events for this peripheral's disconnect.
    watcher: JoinHandle<()>,
    disconnected: CancellationToken,
}

impl Link {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), self.service_count))
    }

    /// Stop background tasks and fire the disconnect signal.
    fn abort_tasks(&self, handles: &mut HashMap<Uuid, JoinHandle<()>>) {
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        self.watcher.abort();
        self.disconnected.cancel();
    }
}

/// `btleplug` backed [`GattClient`].
pub struct BleClient {
    address: String,
    config: ConnectionConfig,
    link: RwLock<Option<Link>>,
    /// Peripheral of a connect attempt that has not produced a link yet.
    pending: StdMutex<Option<Peripheral>>,
    /// Disconnect signal of the current link, readable without awaiting.
    signal: StdMutex<CancellationToken>,
}

impl std::fmt::Debug for BleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleClient")
            .field("address", &self.address)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

impl BleClient {
    /// Create a client for the peripheral with the given MAC address.
    ///
    /// No Bluetooth activity happens until [`GattClient::connect`].
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_config(address, ConnectionConfig::default())
    }

    /// Create a client with custom timeouts.
    pub fn with_config(address: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            address: address.into(),
            config,
            link: RwLock::new(None),
            pending: StdMutex::new(None),
            signal: StdMutex::new(cancelled_token()),
        }
    }

    /// Clone the peripheral and characteristic out of the link so the lock
    /// is not held across the GATT operation.
    async fn target(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let guard = self.link.read().await;
        let link = guard.as_ref().ok_or(Error::NotConnected)?;
        Ok((link.peripheral.clone(), link.characteristic(uuid)?))
    }

    fn set_signal(&self, token: CancellationToken) {
        match self.signal.lock() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Connect `peripheral`, discover its services and arm the disconnect
    /// watcher.
    async fn establish(&self, adapter: Adapter, peripheral: &Peripheral) -> Result<Link> {
        info!("Connecting to device...");
        timeout(self.config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", self.config.connection_timeout))??;

        info!("Discovering services...");
        timeout(self.config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))??;

        let services = peripheral.services();
        let mut characteristics = HashMap::new();
        for service in &services {
            debug!("  Service: {}", service.uuid);
            for char in &service.characteristics {
                debug!("    Characteristic: {}", char.uuid);
                characteristics.insert(char.uuid, char.clone());
            }
        }

        let disconnected = CancellationToken::new();
        let watcher = watch_disconnect(
            &adapter,
            peripheral,
            self.address.clone(),
            disconnected.clone(),
        )
        .await?;

        Ok(Link {
            adapter,
            peripheral: peripheral.clone(),
            characteristics,
            service_count: services.len(),
            notification_handles: Mutex::new(HashMap::new()),
            watcher,
            disconnected,
        })
    }

    fn take_pending(&self) -> Option<Peripheral> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Release the current link, or the peripheral of an interrupted
    /// connect attempt if there is no link.
    async fn teardown(&self) -> Option<Peripheral> {
        let pending = self.take_pending();
        let Some(link) = self.link.write().await.take() else {
            return pending;
        };
        {
            let mut handles = link.notification_handles.lock().await;
            link.abort_tasks(&mut handles);
        }
        Some(link.peripheral)
    }
}

/// Return `result`, running `release` first when it is an error.
///
/// Used once the peripheral may be connected at the BLE level, so a failed
/// or half-finished connect never leaves it attached.
async fn release_on_error<T, F>(result: Result<T>, release: F) -> Result<T>
where
    F: Future<Output = Result<()>>,
{
    if result.is_err()
        && let Err(e) = release.await
    {
        debug!(error = %e, "Failed to release half-open link");
    }
    result
}

/// Spawn a task that fires `token` when the adapter reports that the
/// peripheral went away.
async fn watch_disconnect(
    adapter: &Adapter,
    peripheral: &Peripheral,
    address: String,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut events = adapter.events().await?;
    let id = peripheral.id();

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                        info!(device = %address, "Peripheral disconnected");
                        token.cancel();
                        break;
                    }
                    Some(_) => {}
                    None => {
                        warn!(device = %address, "Adapter event stream ended");
                        token.cancel();
                        break;
                    }
                },
            }
        }
    }))
}

#[async_trait]
impl GattClient for BleClient {
    fn address(&self) -> &str {
        &self.address
    }

    #[tracing::instrument(level = "info", skip(self), fields(device = %self.address))]
    async fn connect(&self) -> Result<()> {
        if let Some(stale) = self.teardown().await {
            debug!("Dropping previous link before reconnecting");
            let _ = stale.disconnect().await;
        }

        let adapter = get_adapter().await?;
        let peripheral = find_peripheral(&adapter, &self.address, self.config.scan_timeout).await?;

        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(peripheral.clone());
        let established = self.establish(adapter, &peripheral).await;
        let established = release_on_error(established, async {
            warn!("Connect failed after the link came up, disconnecting");
            peripheral.disconnect().await.map_err(Error::from)
        })
        .await;
        self.take_pending();
        let link = established?;

        self.set_signal(link.disconnected.clone());
        *self.link.write().await = Some(link);

        info!("Connected!");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self), fields(device = %self.address))]
    async fn disconnect(&self) -> Result<()> {
        let Some(peripheral) = self.teardown().await else {
            return Ok(());
        };
        info!("Disconnecting from device...");
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let guard = self.link.read().await;
        match guard.as_ref() {
            Some(link) if !link.disconnected.is_cancelled() => {
                link.peripheral.is_connected().await.unwrap_or(false)
            }
            _ => false,
        }
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.target(uuid).await?;
        let data = timeout(self.config.read_timeout, peripheral.read(&characteristic))
            .await
            .map_err(|_| {
                Error::timeout(format!("read characteristic {}", uuid), self.config.read_timeout)
            })??;
        Ok(data)
    }

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = self.target(uuid).await?;
        timeout(
            self.config.write_timeout,
            peripheral.write(&characteristic, data, WriteType::WithResponse),
        )
        .await
        .map_err(|_| {
            Error::timeout(format!("write characteristic {}", uuid), self.config.write_timeout)
        })??;
        Ok(())
    }

    async fn subscribe(&self, uuid: Uuid, handler: NotificationHandler) -> Result<()> {
        let guard = self.link.read().await;
        let link = guard.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link.characteristic(uuid)?;

        link.peripheral.subscribe(&characteristic).await?;

        let mut stream = link.peripheral.notifications().await?;
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid {
                    handler(&notification.value);
                }
            }
        });

        if let Some(previous) = link.notification_handles.lock().await.insert(uuid, handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        let guard = self.link.read().await;
        let link = guard.as_ref().ok_or(Error::NotConnected)?;

        if let Some(handle) = link.notification_handles.lock().await.remove(&uuid) {
            handle.abort();
        }

        let characteristic = link.characteristic(uuid)?;
        link.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        let guard = self.link.read().await;
        let link = guard.as_ref()?;
        link.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi)
    }

    fn disconnected(&self) -> CancellationToken {
        match self.signal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for BleClient {
    fn drop(&mut self) {
        let Some(mut link) = self.link.get_mut().take() else {
            return;
        };

        warn!(
            device = %self.address,
            "BleClient dropped while connected - performing best-effort cleanup"
        );

        let mut handles = std::mem::take(link.notification_handles.get_mut());
        link.abort_tasks(&mut handles);

        let peripheral = link.peripheral;
        let address = self.address.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(
                        device = %address,
                        error = %e,
                        "Best-effort disconnect failed (device may already be disconnected)"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.discovery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::default()
            .scan_timeout(Duration::from_secs(30))
            .write_timeout(Duration::from_secs(2));
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_client_without_link() {
        let client = BleClient::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(client.address(), "AA:BB:CC:DD:EE:FF");
        assert!(!client.is_connected().await);
        assert!(client.disconnected().is_cancelled());
        assert!(client.rssi().await.is_none());
        assert!(matches!(
            client.read(crate::uuids::STATUS).await,
            Err(Error::NotConnected)
        ));
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_connect_releases_link() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let released = AtomicUsize::new(0);

        let discovery_failed: Result<()> =
            Err(Error::timeout("discover services", Duration::from_secs(10)));
        let result = release_on_error(discovery_failed, async {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let result = release_on_error(Ok(7), async {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_failure_keeps_connect_error() {
        let result: Result<()> =
            release_on_error(Err(Error::NotConnected), async { Err(Error::NotConnected) }).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
