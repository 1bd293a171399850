//! Broker abstraction and its `rumqttc` implementation.
//!
//! The bridge only needs a handful of broker operations, captured by the
//! [`Broker`] trait so the supervisors can be tested against
//! [`MockBroker`](crate::mock::MockBroker). All messages are sent with
//! QoS 1.
//!
//! A broker owns a single inbound message channel for its whole lifetime;
//! each [`Broker::connect`] starts a new session feeding that channel and
//! returns a [`Session`] that resolves with the reason the session ended.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, LastWill, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MqttError;

/// Capacity of the client request queue and the inbound message channel.
const CHANNEL_CAPACITY: usize = 100;

/// How long to wait for the event loop to flush a disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Absolute topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Whether the broker should retain the message.
    pub retain: bool,
}

impl Message {
    /// Create a non-retained message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Mark the message as retained.
    #[must_use]
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Payload as text, for logging.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Absolute topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// A live broker session.
#[derive(Debug)]
pub struct Session {
    closed: oneshot::Receiver<Result<(), MqttError>>,
}

impl Session {
    /// Create a session that ends when `closed` resolves.
    pub fn new(closed: oneshot::Receiver<Result<(), MqttError>>) -> Self {
        Self { closed }
    }

    /// Wait for the session to end.
    ///
    /// Returns `Ok(())` for a clean disconnect. A session whose driver went
    /// away without reporting a reason ends with [`MqttError::CloseForced`].
    pub async fn closed(self) -> Result<(), MqttError> {
        self.closed.await.unwrap_or(Err(MqttError::CloseForced))
    }
}

/// Operations the bridge needs from an MQTT broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a session with the given last will.
    async fn connect(&self, will: Message) -> Result<Session, MqttError>;

    /// Publish a message with QoS 1.
    async fn publish(&self, message: Message) -> Result<(), MqttError>;

    /// Subscribe to a topic with QoS 1.
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Unsubscribe from a topic.
    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Close the current session cleanly.
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Take the inbound message stream. Returns `None` after the first call.
    fn take_messages(&self) -> Option<mpsc::Receiver<InboundMessage>>;
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User name, if the broker requires authentication.
    pub username: Option<String>,
    /// Password sent with `username`.
    pub password: Option<String>,
    /// Connect over TLS with the platform's native roots.
    pub tls: bool,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
}

impl From<&Config> for MqttSettings {
    fn from(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_user.clone(),
            password: config.mqtt_password.clone(),
            tls: config.mqtt_tls,
            client_id: config.mqtt_client_id.clone(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

impl MqttSettings {
    fn options(&self, will: Message) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_last_will(LastWill::new(
            will.topic,
            will.payload,
            QoS::AtLeastOnce,
            will.retain,
        ));

        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }

        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// Map an event loop failure to the bridge's error policy.
pub fn map_connection_error(err: ConnectionError) -> MqttError {
    match err {
        ConnectionError::ConnectionRefused(code) => MqttError::AccessRefused(format!("{:?}", code)),
        other => MqttError::ConnectionLost(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// `rumqttc` backed [`Broker`].
pub struct RumqttBroker {
    settings: MqttSettings,
    client: Mutex<Option<AsyncClient>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl std::fmt::Debug for RumqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttBroker")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("client_id", &self.settings.client_id)
            .finish_non_exhaustive()
    }
}

impl RumqttBroker {
    /// Create a broker handle. Nothing is sent until [`Broker::connect`].
    pub fn new(settings: MqttSettings) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            settings,
            client: Mutex::new(None),
            poller: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    fn client(&self) -> Result<AsyncClient, MqttError> {
        lock(&self.client).clone().ok_or(MqttError::NotConnected)
    }
}

#[async_trait]
impl Broker for RumqttBroker {
    async fn connect(&self, will: Message) -> Result<Session, MqttError> {
        if let Some(stale) = lock(&self.poller).take() {
            stale.abort();
        }

        info!(
            "Connecting to MQTT broker {}:{}",
            self.settings.host, self.settings.port
        );
        let (client, mut eventloop) = AsyncClient::new(self.settings.options(will), CHANNEL_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("MQTT connected: {:?}", ack);
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        let inbound = self.inbound_tx.clone();
        let poller = tokio::spawn(async move {
            let reason = loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!("MQTT message on {}", publish.topic);
                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        if inbound.send(message).await.is_err() {
                            debug!("Inbound channel closed, dropping message");
                        }
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        break Err(map_connection_error(e));
                    }
                }
            };
            let _ = closed_tx.send(reason);
        });

        *lock(&self.client) = Some(client);
        *lock(&self.poller) = Some(poller);
        Ok(Session::new(closed_rx))
    }

    async fn publish(&self, message: Message) -> Result<(), MqttError> {
        debug!("Publishing {} = {}", message.topic, message.payload_str());
        self.client()?
            .publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        debug!("Subscribing to {}", topic);
        self.client()?.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        debug!("Unsubscribing from {}", topic);
        self.client()?.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let client = lock(&self.client).take();
        let poller = lock(&self.poller).take();

        if let Some(client) = client
            && let Err(e) = client.disconnect().await
        {
            debug!("Error disconnecting MQTT client: {}", e);
        }

        if let Some(mut poller) = poller
            && timeout(DISCONNECT_TIMEOUT, &mut poller).await.is_err()
        {
            warn!("MQTT event loop did not stop in time, aborting");
            poller.abort();
        }
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        lock(&self.inbound_rx).take()
    }
}
