//! Mock implementations for testing.
//!
//! This module provides stand-ins for the BLE link, a bridged device and
//! the state publisher so protocol and bridge logic can be tested without
//! Bluetooth hardware or an MQTT broker.
//!
//! - [`MockGatt`]: scripted [`GattClient`] that records writes and lets a
//!   test push notifications
//! - [`MockDevice`]: [`BridgeDevice`] with counters and failure injection
//! - [`RecordingPublisher`]: [`StatePublisher`] that keeps every message

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ble2mqtt_types::uuids::{AUTH, SOFTWARE_REVISION, VERSION};
use ble2mqtt_types::{DeviceInfo, Entities, Entity, EntityDomain};

use crate::error::{Error, Result};
use crate::gatt::{GattClient, NotificationHandler};
use crate::traits::{BridgeDevice, CommandPayload, StatePublisher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Scripted GATT link.
///
/// Reads return values configured with [`set_read`](Self::set_read);
/// notifications are delivered synchronously by [`notify`](Self::notify).
/// When an auth response is configured, every write to the auth
/// characteristic is answered with it on the auth subscription.
pub struct MockGatt {
    address: String,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    connect_count: AtomicU32,
    signal: Mutex<CancellationToken>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    reads: Mutex<Vec<Uuid>>,
    handlers: Mutex<HashMap<Uuid, NotificationHandler>>,
    auth_response: Mutex<Option<Vec<u8>>>,
    rssi: Mutex<Option<i16>>,
}

impl std::fmt::Debug for MockGatt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGatt")
            .field("address", &self.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockGatt {
    /// Create a link with no readable characteristics.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            signal: Mutex::new(cancelled_token()),
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            auth_response: Mutex::new(None),
            rssi: Mutex::new(None),
        }
    }

    /// Create a link that behaves like a kettle accepting any token.
    pub fn kettle(address: impl Into<String>) -> Self {
        let gatt = Self::new(address);
        gatt.set_read(VERSION, vec![0x31, 0x2E, 0x30]);
        gatt.set_read(SOFTWARE_REVISION, b"1.0.2_0067\0\0".to_vec());
        gatt.set_auth_response(Some(vec![0x5A, 0x3C, 0x0F, 0xA1]));
        gatt
    }

    /// Set the value returned when `uuid` is read.
    pub fn set_read(&self, uuid: Uuid, value: Vec<u8>) {
        lock(&self.values).insert(uuid, value);
    }

    /// Set the notification sent in answer to auth writes.
    pub fn set_auth_response(&self, response: Option<Vec<u8>>) {
        *lock(&self.auth_response) = response;
    }

    /// Set the reported signal strength.
    pub fn set_rssi(&self, rssi: Option<i16>) {
        *lock(&self.rssi) = rssi;
    }

    /// Make subsequent connects fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls so far.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Every characteristic read so far, in order.
    pub fn reads(&self) -> Vec<Uuid> {
        lock(&self.reads).clone()
    }

    /// Whether notifications on `uuid` are currently routed to a handler.
    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        lock(&self.handlers).contains_key(&uuid)
    }

    /// Deliver a notification. Returns `false` if nobody is subscribed.
    pub fn notify(&self, uuid: Uuid, data: &[u8]) -> bool {
        let handlers = lock(&self.handlers);
        match handlers.get(&uuid) {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.handlers).clear();
        lock(&self.signal).cancel();
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl GattClient for MockGatt {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::DeviceNotFound(self.address.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        *lock(&self.signal) = CancellationToken::new();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        lock(&self.reads).push(uuid);
        lock(&self.values)
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), 0))
    }

    async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        lock(&self.writes).push((uuid, data.to_vec()));

        if uuid == AUTH {
            let response = lock(&self.auth_response).clone();
            if let Some(response) = response {
                self.notify(AUTH, &response);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, uuid: Uuid, handler: NotificationHandler) -> Result<()> {
        self.ensure_connected()?;
        lock(&self.handlers).insert(uuid, handler);
        Ok(())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()> {
        lock(&self.handlers).remove(&uuid);
        self.ensure_connected()
    }

    async fn rssi(&self) -> Option<i16> {
        *lock(&self.rssi)
    }

    fn disconnected(&self) -> CancellationToken {
        lock(&self.signal).clone()
    }
}

/// Publisher that records every message.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, String)>>,
    should_fail: AtomicBool,
}

impl RecordingPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// `(topic, payload)` pairs published so far.
    pub fn messages(&self) -> Vec<(String, String)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl StatePublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(Error::publish("mock publish failure"));
        }
        lock(&self.messages).push((topic.to_string(), payload));
        Ok(())
    }
}

/// Clears the running flag when the handle future finishes or is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A mock bridged device.
///
/// `handle` runs until the link drops and tracks whether it is still
/// running, so tests can check that a supervisor stopped it.
///
/// # Example
///
/// ```
/// use ble2mqtt_core::{BridgeDevice, MockDevice};
///
/// #[tokio::main]
/// async fn main() {
///     let device = MockDevice::new("AA:BB:CC:DD:EE:FF");
///     device.connect().await.unwrap();
///     assert!(device.is_connected().await);
///     assert_eq!(device.unique_id(), "0xaabbccddeeff");
/// }
/// ```
pub struct MockDevice {
    mac: String,
    info: DeviceInfo,
    entities: Entities,
    topics: Vec<String>,
    connected: AtomicBool,
    signal: Mutex<CancellationToken>,
    fail_connect: AtomicBool,
    fail_init: AtomicBool,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    init_count: AtomicU32,
    handle_count: AtomicU32,
    handle_running: AtomicBool,
    processed: Mutex<Vec<(String, CommandPayload)>>,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("mac", &self.mac)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockDevice {
    /// Create a device with one `temperature` sensor and no command topics.
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            info: DeviceInfo {
                model: "Mock".to_string(),
                manufacturer: "Test".to_string(),
                sw_version: Some("1.0".to_string()),
            },
            entities: BTreeMap::from([(
                EntityDomain::Sensor,
                vec![Entity::new("temperature").device_class("temperature").unit("°C")],
            )]),
            topics: Vec::new(),
            connected: AtomicBool::new(false),
            signal: Mutex::new(cancelled_token()),
            fail_connect: AtomicBool::new(false),
            fail_init: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            init_count: AtomicU32::new(0),
            handle_count: AtomicU32::new(0),
            handle_running: AtomicBool::new(false),
            processed: Mutex::new(Vec::new()),
        }
    }

    /// Replace the entity map.
    #[must_use]
    pub fn with_entities(mut self, entities: Entities) -> Self {
        self.entities = entities;
        self
    }

    /// Set the command topics the device subscribes to.
    #[must_use]
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Make subsequent connects fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent inits fail.
    pub fn set_fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls so far.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls so far.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    /// Number of init calls so far.
    pub fn init_count(&self) -> u32 {
        self.init_count.load(Ordering::SeqCst)
    }

    /// Number of times `handle` was started.
    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::SeqCst)
    }

    /// Whether a `handle` call is currently in progress.
    pub fn is_handle_running(&self) -> bool {
        self.handle_running.load(Ordering::SeqCst)
    }

    /// Commands delivered through `process_topic`.
    pub fn processed(&self) -> Vec<(String, CommandPayload)> {
        lock(&self.processed).clone()
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.signal).cancel();
    }
}

#[async_trait]
impl BridgeDevice for MockDevice {
    fn mac(&self) -> &str {
        &self.mac
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn entities(&self) -> &Entities {
        &self.entities
    }

    fn subscribed_topics(&self) -> &[String] {
        &self.topics
    }

    async fn connect(&self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::DeviceNotFound(self.mac.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        *lock(&self.signal) = CancellationToken::new();
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::timeout("auth response", std::time::Duration::from_secs(10)));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn handle(&self, _publisher: Arc<dyn StatePublisher>) -> Result<()> {
        self.handle_count.fetch_add(1, Ordering::SeqCst);
        self.handle_running.store(true, Ordering::SeqCst);
        let _running = RunningGuard(&self.handle_running);

        let disconnected = self.disconnected();
        disconnected.cancelled().await;
        Ok(())
    }

    async fn process_topic(
        &self,
        topic: &str,
        payload: CommandPayload,
        _publisher: Arc<dyn StatePublisher>,
    ) -> Result<()> {
        lock(&self.processed).push((topic.to_string(), payload));
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        lock(&self.signal).clone()
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.drop_link();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gatt_requires_connection() {
        let gatt = MockGatt::new("AA:BB:CC:DD:EE:FF");
        assert!(gatt.disconnected().is_cancelled());
        assert!(matches!(gatt.read(VERSION).await, Err(Error::NotConnected)));

        gatt.connect().await.unwrap();
        assert!(!gatt.disconnected().is_cancelled());
        assert!(matches!(
            gatt.read(VERSION).await,
            Err(Error::CharacteristicNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_gatt_drop_link_fires_signal() {
        let gatt = MockGatt::kettle("AA:BB:CC:DD:EE:FF");
        gatt.connect().await.unwrap();
        let signal = gatt.disconnected();
        gatt.subscribe(AUTH, Box::new(|_| {})).await.unwrap();

        gatt.drop_link();
        assert!(signal.is_cancelled());
        assert!(!gatt.is_subscribed(AUTH));
        assert!(!gatt.is_connected().await);
    }

    #[tokio::test]
    async fn test_mock_device_handle_stops_on_disconnect() {
        let device = Arc::new(MockDevice::new("AA:BB:CC:DD:EE:FF"));
        device.connect().await.unwrap();

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.handle(Arc::new(RecordingPublisher::new())).await }
        });
        while !device.is_handle_running() {
            tokio::task::yield_now().await;
        }

        device.drop_link();
        task.await.unwrap().unwrap();
        assert!(!device.is_handle_running());
        assert_eq!(device.handle_count(), 1);
    }

    #[tokio::test]
    async fn test_recording_publisher_failure() {
        let publisher = RecordingPublisher::new();
        publisher.publish("a/state", "1".to_string()).await.unwrap();
        publisher.set_should_fail(true);
        assert!(publisher.publish("a/state", "2".to_string()).await.is_err());
        assert_eq!(publisher.messages(), vec![("a/state".to_string(), "1".to_string())]);
    }
}
