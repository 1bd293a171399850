//! Xiaomi MiKettle.
//!
//! The kettle does not expose its status until the client has completed an
//! authentication handshake on its auth characteristics:
//!
//! 1. write [`AUTH_MAGIC1`] to the auth-init characteristic
//! 2. subscribe to the auth characteristic
//! 3. write the session token, encrypted with [`mix_a`] of the MAC and
//!    product id, to the auth characteristic
//! 4. wait for one auth notification
//! 5. write [`AUTH_MAGIC2`] encrypted with the token
//! 6. read the version characteristic and unsubscribe from auth
//!
//! After that the kettle pushes a 13-byte status record on every change.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ble2mqtt_types::uuids::{
    AUTH, AUTH_INIT, AUTH_MAGIC1, AUTH_MAGIC2, SOFTWARE_REVISION, STATUS, VERSION,
};
use ble2mqtt_types::{DeviceInfo, Entities, Entity, EntityDomain, KettleState};

use crate::cipher::{Token, cipher, generate_token, mix_a, parse_token, reverse_mac};
use crate::error::{Error, Result};
use crate::gatt::GattClient;
use crate::traits::{BridgeDevice, CommandPayload, StatePublisher};

/// Device type tag used in configuration.
pub const KETTLE_TYPE: &str = "mikettle";

/// Product id of the most common kettle model.
pub const DEFAULT_PRODUCT_ID: u16 = 275;

/// How long to wait for the kettle to answer the token write.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time between two state publishes.
pub const SEND_INTERVAL: Duration = Duration::from_secs(30);

/// Tick of the publishing loop.
pub const ACTIVE_SLEEP_INTERVAL: Duration = Duration::from_secs(1);

const TEMPERATURE_ENTITY: &str = "temperature";
const MODEL: &str = "MiKettle";
const MANUFACTURER: &str = "Xiaomi";

/// Type-specific kettle settings from the device configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KettleOptions {
    /// Product id mixed into the handshake key.
    pub product_id: Option<u16>,
    /// Session token as 24 hex characters. A random one is used if absent.
    pub token: Option<String>,
}

/// Where a kettle is in its connection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KettlePhase {
    /// No link.
    Disconnected,
    /// Link being established.
    Connecting,
    /// Handshake in progress.
    Authenticating,
    /// Authenticated and subscribed to status.
    Ready,
    /// Publishing loop running.
    Serving,
}

impl fmt::Display for KettlePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KettlePhase::Disconnected => "disconnected",
            KettlePhase::Connecting => "connecting",
            KettlePhase::Authenticating => "authenticating",
            KettlePhase::Ready => "ready",
            KettlePhase::Serving => "serving",
        };
        f.write_str(name)
    }
}

/// Xiaomi MiKettle bridged over BLE.
pub struct XiaomiKettle {
    mac: String,
    reversed_mac: [u8; 6],
    client: Arc<dyn GattClient>,
    token: Token,
    product_id: u16,
    state: Arc<watch::Sender<Option<KettleState>>>,
    phase: Mutex<KettlePhase>,
    sw_version: Mutex<Option<String>>,
    entities: Entities,
    topics: Vec<String>,
}

impl fmt::Debug for XiaomiKettle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XiaomiKettle")
            .field("mac", &self.mac)
            .field("product_id", &self.product_id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl XiaomiKettle {
    /// Create a kettle talking through `client`.
    ///
    /// Fails if the client's address is not a MAC or the configured token
    /// is malformed.
    pub fn new(client: Arc<dyn GattClient>, options: KettleOptions) -> Result<Self> {
        let mac = client.address().to_string();
        let reversed_mac = reverse_mac(&mac)?;
        let token = match options.token.as_deref() {
            Some(token) => parse_token(token)?,
            None => generate_token(),
        };

        let entities = BTreeMap::from([(
            EntityDomain::Sensor,
            vec![
                Entity::new(TEMPERATURE_ENTITY)
                    .device_class("temperature")
                    .unit("\u{00b0}C"),
            ],
        )]);

        Ok(Self {
            mac,
            reversed_mac,
            client,
            token,
            product_id: options.product_id.unwrap_or(DEFAULT_PRODUCT_ID),
            state: Arc::new(watch::Sender::new(None)),
            phase: Mutex::new(KettlePhase::Disconnected),
            sw_version: Mutex::new(None),
            entities,
            topics: Vec::new(),
        })
    }

    /// Current phase of the connection cycle.
    pub fn phase(&self) -> KettlePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest decoded status, if any notification arrived this cycle.
    pub fn state(&self) -> Option<KettleState> {
        *self.state.borrow()
    }

    fn set_phase(&self, phase: KettlePhase) {
        let mut guard = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != phase {
            info!(device = %self.unique_id(), from = %*guard, to = %phase, "Kettle phase changed");
            *guard = phase;
        }
    }

    /// Steps 3-6 of the handshake; the auth subscription is already active.
    async fn authenticate(&self, responses: &mut mpsc::Receiver<Vec<u8>>) -> Result<()> {
        let key = mix_a(&self.reversed_mac, self.product_id);
        self.client.write(AUTH, &cipher(&key, &self.token)).await?;

        let response = timeout(AUTH_TIMEOUT, responses.recv())
            .await
            .map_err(|_| Error::timeout("auth response", AUTH_TIMEOUT))?
            .ok_or(Error::NotConnected)?;
        debug!(device = %self.unique_id(), response = %hex::encode(&response), "Auth response");

        self.client.write(AUTH, &cipher(&self.token, &AUTH_MAGIC2)).await?;
        self.client.read(VERSION).await?;
        Ok(())
    }

    async fn read_sw_version(&self) {
        match self.client.read(SOFTWARE_REVISION).await {
            Ok(raw) => {
                let version = String::from_utf8_lossy(&raw)
                    .trim_end_matches('\0')
                    .to_string();
                debug!(device = %self.unique_id(), version = %version, "Software version");
                if !version.is_empty() {
                    *self.sw_version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
                }
            }
            Err(e) => warn!(device = %self.unique_id(), error = %e, "Failed to read software version"),
        }
    }

    async fn subscribe_status(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let device = self.unique_id();
        self.client
            .subscribe(
                STATUS,
                Box::new(move |data: &[u8]| match KettleState::from_bytes(data) {
                    Ok(decoded) => {
                        debug!(device = %device, state = ?decoded, "Status notification");
                        state.send_replace(Some(decoded));
                    }
                    Err(e) => {
                        warn!(device = %device, error = %e, "Ignoring malformed status record");
                    }
                }),
            )
            .await
    }

    async fn publish_state(
        &self,
        state: &KettleState,
        publisher: &Arc<dyn StatePublisher>,
    ) -> Result<()> {
        let payload = json!({
            "temperature": state.temperature,
            "linkquality": self.client.rssi().await,
        });
        info!(device = %self.unique_id(), state = ?state, "Sending state");
        publisher
            .publish(&format!("{}/state", self.unique_id()), payload.to_string())
            .await
    }
}

#[async_trait]
impl BridgeDevice for XiaomiKettle {
    fn mac(&self) -> &str {
        &self.mac
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            model: MODEL.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            sw_version: self.sw_version.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    fn entities(&self) -> &Entities {
        &self.entities
    }

    fn subscribed_topics(&self) -> &[String] {
        &self.topics
    }

    async fn connect(&self) -> Result<()> {
        self.set_phase(KettlePhase::Connecting);
        self.state.send_replace(None);
        if let Err(e) = self.client.connect().await {
            self.set_phase(KettlePhase::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.set_phase(KettlePhase::Authenticating);
        self.client.write(AUTH_INIT, &AUTH_MAGIC1).await?;

        let (tx, mut rx) = mpsc::channel(1);
        self.client
            .subscribe(
                AUTH,
                Box::new(move |data: &[u8]| {
                    if tx.try_send(data.to_vec()).is_err() {
                        debug!("Dropping unexpected auth notification");
                    }
                }),
            )
            .await?;

        let outcome = self.authenticate(&mut rx).await;
        let unsubscribed = self.client.unsubscribe(AUTH).await;
        outcome?;
        unsubscribed?;

        self.read_sw_version().await;
        self.subscribe_status().await?;
        self.set_phase(KettlePhase::Ready);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.is_connected().await
    }

    async fn handle(&self, publisher: Arc<dyn StatePublisher>) -> Result<()> {
        self.set_phase(KettlePhase::Serving);
        let disconnected = self.client.disconnected();
        let mut last_sent: Option<Instant> = None;

        loop {
            let snapshot = *self.state.borrow();
            if let Some(state) = snapshot
                && last_sent.is_none_or(|at| at.elapsed() >= SEND_INTERVAL)
            {
                last_sent = Some(Instant::now());
                self.publish_state(&state, &publisher).await?;
            }

            tokio::select! {
                _ = disconnected.cancelled() => break,
                _ = sleep(ACTIVE_SLEEP_INTERVAL) => {}
            }
        }

        debug!(device = %self.unique_id(), "Publishing loop stopped");
        self.set_phase(KettlePhase::Disconnected);
        Ok(())
    }

    async fn process_topic(
        &self,
        topic: &str,
        payload: CommandPayload,
        _publisher: Arc<dyn StatePublisher>,
    ) -> Result<()> {
        debug!(device = %self.unique_id(), topic, payload = ?payload, "Kettle accepts no commands");
        Ok(())
    }

    fn disconnected(&self) -> CancellationToken {
        self.client.disconnected()
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_phase(KettlePhase::Disconnected);
        self.client.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGatt, RecordingPublisher};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";
    const TOKEN: &str = "015ccba8800abdc12eb8ed82";
    const STATUS_RECORD: [u8; 13] = [0x01, 0x01, 0, 0, 0x64, 0x2D, 0x00, 0x05, 0x00, 0, 0, 0, 0];

    fn kettle(gatt: &Arc<MockGatt>) -> XiaomiKettle {
        XiaomiKettle::new(
            gatt.clone(),
            KettleOptions {
                product_id: None,
                token: Some(TOKEN.to_string()),
            },
        )
        .unwrap()
    }

    async fn ready_kettle() -> (Arc<MockGatt>, Arc<XiaomiKettle>) {
        let gatt = Arc::new(MockGatt::kettle(MAC));
        let kettle = Arc::new(kettle(&gatt));
        kettle.connect().await.unwrap();
        kettle.init().await.unwrap();
        (gatt, kettle)
    }

    #[test]
    fn test_identity_and_entities() {
        let gatt = Arc::new(MockGatt::new(MAC));
        let kettle = kettle(&gatt);
        assert_eq!(kettle.dev_id(), "aabbccddeeff");
        assert_eq!(kettle.unique_id(), "0xaabbccddeeff");
        assert!(kettle.subscribed_topics().is_empty());

        let sensors = &kettle.entities()[&EntityDomain::Sensor];
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].name, "temperature");
        assert_eq!(sensors[0].device_class.as_deref(), Some("temperature"));
        assert_eq!(sensors[0].unit_of_measurement.as_deref(), Some("°C"));

        let info = kettle.info();
        assert_eq!(info.model, "MiKettle");
        assert_eq!(info.manufacturer, "Xiaomi");
        assert_eq!(info.sw_version, None);
    }

    #[test]
    fn test_new_rejects_bad_configuration() {
        let gatt = Arc::new(MockGatt::new("not-a-mac"));
        assert!(matches!(
            XiaomiKettle::new(gatt, KettleOptions::default()),
            Err(Error::InvalidMac(_))
        ));

        let gatt = Arc::new(MockGatt::new(MAC));
        let options = KettleOptions {
            product_id: None,
            token: Some("abcd".to_string()),
        };
        assert!(matches!(
            XiaomiKettle::new(gatt, options),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_writes_exact_sequence() {
        let (gatt, kettle) = ready_kettle().await;

        let token = parse_token(TOKEN).unwrap();
        let key = mix_a(&reverse_mac(MAC).unwrap(), DEFAULT_PRODUCT_ID);
        assert_eq!(
            gatt.writes(),
            vec![
                (AUTH_INIT, AUTH_MAGIC1.to_vec()),
                (AUTH, cipher(&key, &token)),
                (AUTH, cipher(&token, &AUTH_MAGIC2)),
            ]
        );
        assert_eq!(gatt.reads(), vec![VERSION, SOFTWARE_REVISION]);
        assert!(!gatt.is_subscribed(AUTH));
        assert!(gatt.is_subscribed(STATUS));
        assert_eq!(kettle.phase(), KettlePhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_uses_configured_product_id() {
        let gatt = Arc::new(MockGatt::kettle(MAC));
        let kettle = XiaomiKettle::new(
            gatt.clone(),
            KettleOptions {
                product_id: Some(131),
                token: Some(TOKEN.to_string()),
            },
        )
        .unwrap();
        kettle.connect().await.unwrap();
        kettle.init().await.unwrap();

        let token = parse_token(TOKEN).unwrap();
        let key = mix_a(&reverse_mac(MAC).unwrap(), 131);
        assert_eq!(gatt.writes()[1], (AUTH, cipher(&key, &token)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_auth_response_times_out() {
        let gatt = Arc::new(MockGatt::new(MAC));
        let kettle = kettle(&gatt);
        kettle.connect().await.unwrap();

        let started = Instant::now();
        let err = kettle.init().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() >= AUTH_TIMEOUT);
        assert!(!gatt.is_subscribed(AUTH));
        assert!(!gatt.is_subscribed(STATUS));
        // only the first two handshake writes went out
        assert_eq!(gatt.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sw_version_is_trimmed() {
        let (_gatt, kettle) = ready_kettle().await;
        assert_eq!(kettle.info().sw_version.as_deref(), Some("1.0.2_0067"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_notifications_replace_state() {
        let (gatt, kettle) = ready_kettle().await;
        assert!(kettle.state().is_none());

        assert!(gatt.notify(STATUS, &STATUS_RECORD));
        let state = kettle.state().unwrap();
        assert_eq!(state.temperature, 45);
        assert_eq!(state.target_temperature, 100);

        // malformed record keeps the previous state
        assert!(gatt.notify(STATUS, &STATUS_RECORD[..12]));
        assert_eq!(kettle.state().unwrap().temperature, 45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_state_never_publishes() {
        let (gatt, kettle) = ready_kettle().await;
        let publisher = Arc::new(RecordingPublisher::new());

        let task = tokio::spawn({
            let kettle = kettle.clone();
            let publisher: Arc<dyn StatePublisher> = publisher.clone();
            async move { kettle.handle(publisher).await }
        });

        sleep(Duration::from_secs(65)).await;
        assert!(publisher.messages().is_empty());

        gatt.drop_link();
        task.await.unwrap().unwrap();
        assert_eq!(kettle.phase(), KettlePhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_state_at_send_interval() {
        let (gatt, kettle) = ready_kettle().await;
        gatt.set_rssi(Some(-60));
        gatt.notify(STATUS, &STATUS_RECORD);
        let publisher = Arc::new(RecordingPublisher::new());

        let task = tokio::spawn({
            let kettle = kettle.clone();
            let publisher: Arc<dyn StatePublisher> = publisher.clone();
            async move { kettle.handle(publisher).await }
        });

        sleep(Duration::from_secs(45)).await;
        let messages = publisher.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "0xaabbccddeeff/state");
        let payload: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
        assert_eq!(payload, json!({"temperature": 45, "linkquality": -60}));

        gatt.drop_link();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_linkquality_is_null_without_rssi() {
        let (gatt, kettle) = ready_kettle().await;
        gatt.notify(STATUS, &STATUS_RECORD);
        let publisher = Arc::new(RecordingPublisher::new());

        let task = tokio::spawn({
            let kettle = kettle.clone();
            let publisher: Arc<dyn StatePublisher> = publisher.clone();
            async move { kettle.handle(publisher).await }
        });
        sleep(Duration::from_secs(2)).await;
        gatt.drop_link();
        task.await.unwrap().unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&publisher.messages()[0].1).unwrap();
        assert_eq!(payload["linkquality"], serde_json::Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_clears_state() {
        let (gatt, kettle) = ready_kettle().await;
        gatt.notify(STATUS, &STATUS_RECORD);
        assert!(kettle.state().is_some());

        kettle.disconnect().await.unwrap();
        kettle.connect().await.unwrap();
        assert!(kettle.state().is_none());
    }

    #[tokio::test]
    async fn test_process_topic_is_ignored() {
        let gatt = Arc::new(MockGatt::new(MAC));
        let kettle = kettle(&gatt);
        let publisher: Arc<dyn StatePublisher> = Arc::new(RecordingPublisher::new());
        kettle
            .process_topic("anything", CommandPayload::Text("ON".into()), publisher)
            .await
            .unwrap();
        assert!(gatt.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let gatt = Arc::new(MockGatt::new(MAC));
        gatt.set_fail_connect(true);
        let kettle = kettle(&gatt);
        assert!(kettle.connect().await.is_err());
        assert_eq!(kettle.phase(), KettlePhase::Disconnected);
    }
}
