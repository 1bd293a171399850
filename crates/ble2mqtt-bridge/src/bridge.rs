//! The bridge: broker connection, device supervisors and command dispatch.
//!
//! After [`Bridge::start`] two tasks run until shutdown:
//!
//! - the **connection loop** keeps a broker session open, announces the
//!   bridge on `<root>/bridge/state` and runs one
//!   [`DeviceSupervisor`] per registered device for as long as the session
//!   lasts;
//! - the **dispatch loop** hands inbound command messages to the device
//!   that subscribed to them.
//!
//! Whichever task ends first decides the outcome of [`Bridge::stopped`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ble2mqtt_core::{CommandPayload, SharedDevice, StatePublisher};

use crate::config::Config;
use crate::error::{BridgeError, MqttError, Result};
use crate::mqtt::{Broker, InboundMessage, Message, Session};
use crate::router::Router;
use crate::supervisor::{DeviceSupervisor, SupervisorTimings};

/// Default topic root.
pub const DEFAULT_ROOT: &str = "ble2mqtt";

/// Availability topic, relative to the root.
pub const BRIDGE_STATE_TOPIC: &str = "bridge/state";

/// Availability payload published when a session is up.
pub const ONLINE: &str = "online";
/// Availability payload of the will and of a closing session.
pub const OFFLINE: &str = "offline";

/// Bridge behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Topic root every bridge topic lives under.
    pub root: String,
    /// Pause before reconnecting to a lost broker.
    pub reconnect_interval: Duration,
    /// Device supervisor delays.
    pub timings: SupervisorTimings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            reconnect_interval: Duration::from_secs(10),
            timings: SupervisorTimings::default(),
        }
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval(),
            ..Self::default()
        }
    }
}

/// [`StatePublisher`] that sends device state to the broker under the
/// bridge root, QoS 1 and not retained.
pub struct BridgePublisher {
    broker: Arc<dyn Broker>,
    root: String,
}

impl BridgePublisher {
    /// Publish through `broker` with topics under `root`.
    pub fn new(broker: Arc<dyn Broker>, root: impl Into<String>) -> Self {
        Self {
            broker,
            root: root.into(),
        }
    }
}

#[async_trait]
impl StatePublisher for BridgePublisher {
    async fn publish(&self, topic: &str, payload: String) -> ble2mqtt_core::Result<()> {
        let message = Message::new(format!("{}/{}", self.root, topic), payload);
        self.broker
            .publish(message)
            .await
            .map_err(|e| ble2mqtt_core::Error::publish(e.to_string()))
    }
}

/// State shared by the bridge tasks.
struct Shared {
    settings: BridgeSettings,
    broker: Arc<dyn Broker>,
    devices: Arc<[SharedDevice]>,
    router: Router,
    publisher: Arc<dyn StatePublisher>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Sleep unless shut down first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    async fn connection_loop(self: Arc<Self>) -> Result<()> {
        let availability = self.router.absolute(BRIDGE_STATE_TOPIC);

        loop {
            let will = Message::new(availability.as_str(), OFFLINE).retained();
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = self.broker.connect(will) => result,
            };

            let outcome = match connected {
                Ok(session) => self.run_session(session, &availability).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    info!("Disconnected from broker");
                    return Ok(());
                }
                Err(MqttError::ConnectionLost(reason)) => {
                    error!(
                        "MQTT connection lost: {}. Reconnecting in {:?}",
                        reason, self.settings.reconnect_interval
                    );
                    if !self.pause(self.settings.reconnect_interval).await {
                        return Ok(());
                    }
                }
                Err(MqttError::AccessRefused(reason)) => {
                    error!("MQTT access refused: {}", reason);
                    return Err(MqttError::AccessRefused(reason).into());
                }
                Err(MqttError::CloseForced) => {
                    error!("MQTT connection close forced");
                    return Ok(());
                }
                Err(e) => {
                    error!("MQTT connection failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Serve one broker session and report why it ended.
    async fn run_session(
        &self,
        session: Session,
        availability: &str,
    ) -> std::result::Result<(), MqttError> {
        info!("Connected to broker");
        let session_token = self.shutdown.child_token();
        let mut supervisors = JoinSet::new();

        let outcome: std::result::Result<(), MqttError> = async {
            self.broker
                .publish(Message::new(availability, ONLINE).retained())
                .await?;

            for device in self.devices.iter() {
                let supervisor = DeviceSupervisor::new(
                    Arc::clone(device),
                    Arc::clone(&self.broker),
                    Arc::clone(&self.publisher),
                    self.router.clone(),
                    self.settings.timings.clone(),
                    session_token.clone(),
                );
                supervisors.spawn(supervisor.run());
            }

            info!("Waiting for network interruptions");
            tokio::select! {
                _ = self.shutdown.cancelled() => Ok(()),
                reason = session.closed() => reason,
            }
        }
        .await;

        session_token.cancel();
        while let Some(result) = supervisors.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("Device supervisor panicked: {}", e);
            }
        }

        if let Err(e) = self
            .broker
            .publish(Message::new(availability, OFFLINE).retained())
            .await
        {
            debug!("Could not publish offline state: {}", e);
        }

        outcome
    }

    async fn dispatch_loop(self: Arc<Self>, mut messages: mpsc::Receiver<InboundMessage>) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                message = messages.recv() => message,
            };
            let Some(message) = message else {
                debug!("Inbound message stream closed");
                return Ok(());
            };
            self.dispatch(&message).await?;
        }
    }

    async fn dispatch(&self, message: &InboundMessage) -> Result<()> {
        debug!(
            "Received {}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );

        let Some(route) = self.router.resolve(&message.topic)? else {
            debug!("Ignoring message outside {}: {}", self.router.root(), message.topic);
            return Ok(());
        };

        if !route.device.is_connected().await {
            warn!(
                "Got a message for offline device {}: {}",
                route.device.unique_id(),
                message.topic
            );
            return Ok(());
        }

        let payload = CommandPayload::parse(&message.payload);
        if let Err(e) = route
            .device
            .process_topic(route.topic, payload, Arc::clone(&self.publisher))
            .await
        {
            warn!(
                device = %route.device.unique_id(),
                topic = route.topic,
                error = %e,
                "Command failed"
            );
        }
        Ok(())
    }
}

/// BLE to MQTT bridge.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use ble2mqtt_bridge::{Bridge, BridgeSettings, MqttSettings, RumqttBroker};
/// use ble2mqtt_bridge::config::Config;
/// use ble2mqtt_core::{DeviceConfig, build_device};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let broker = Arc::new(RumqttBroker::new(MqttSettings::from(&config)));
/// let mut bridge = Bridge::new(BridgeSettings::from(&config), broker);
///
/// bridge.register(build_device(&DeviceConfig::new("AA:BB:CC:DD:EE:FF", "mikettle"))?)?;
/// bridge.start()?;
/// bridge.stopped().await?;
/// bridge.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Bridge {
    settings: BridgeSettings,
    broker: Arc<dyn Broker>,
    registry: Vec<SharedDevice>,
    shutdown: CancellationToken,
    tasks: Option<JoinSet<Result<()>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("settings", &self.settings)
            .field("devices", &self.registry.len())
            .field("started", &self.tasks.is_some())
            .finish()
    }
}

impl Bridge {
    /// Create a stopped bridge with no devices.
    pub fn new(settings: BridgeSettings, broker: Arc<dyn Broker>) -> Self {
        Self {
            settings,
            broker,
            registry: Vec::new(),
            shutdown: CancellationToken::new(),
            tasks: None,
        }
    }

    /// Registered devices, in registration order.
    pub fn devices(&self) -> &[SharedDevice] {
        &self.registry
    }

    /// Add a device. Fails after [`start`](Self::start) or when a device
    /// with the same MAC address is already registered.
    pub fn register(&mut self, device: SharedDevice) -> Result<()> {
        if self.tasks.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }
        let dev_id = device.dev_id();
        if self.registry.iter().any(|d| d.dev_id() == dev_id) {
            return Err(BridgeError::DuplicateDevice(device.mac().to_string()));
        }
        info!("Registered {} ({})", device.unique_id(), device.mac());
        self.registry.push(device);
        Ok(())
    }

    /// Spawn the connection and dispatch loops.
    pub fn start(&mut self) -> Result<()> {
        if self.tasks.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }
        let messages = self
            .broker
            .take_messages()
            .ok_or(BridgeError::AlreadyStarted)?;

        let devices: Arc<[SharedDevice]> = Arc::from(self.registry.clone());
        let shared = Arc::new(Shared {
            settings: self.settings.clone(),
            broker: Arc::clone(&self.broker),
            router: Router::new(self.settings.root.clone(), Arc::clone(&devices)),
            devices,
            publisher: Arc::new(BridgePublisher::new(
                Arc::clone(&self.broker),
                self.settings.root.clone(),
            )),
            shutdown: self.shutdown.clone(),
        });

        info!("Starting bridge with {} device(s)", shared.devices.len());
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&shared).connection_loop());
        tasks.spawn(shared.dispatch_loop(messages));
        self.tasks = Some(tasks);
        Ok(())
    }

    /// Wait until the first bridge task ends and return its outcome.
    ///
    /// Cancel safe. Once every task has ended this returns `Ok(())`
    /// immediately.
    pub async fn stopped(&mut self) -> Result<()> {
        let tasks = self.tasks.as_mut().ok_or(BridgeError::NotStarted)?;
        match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(BridgeError::Task(e.to_string())),
            None => Ok(()),
        }
    }

    /// Stop everything: cancel and await all tasks, then disconnect.
    pub async fn close(&mut self) {
        info!("Stopping bridge");
        self.shutdown.cancel();

        if let Some(mut tasks) = self.tasks.take() {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Bridge task ended with error: {}", e),
                    Err(e) => warn!("Bridge task failed: {}", e),
                }
            }
        }

        if let Err(e) = self.broker.disconnect().await {
            warn!("Error disconnecting from broker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble2mqtt_core::MockDevice;

    use crate::mock::MockBroker;

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            reconnection_interval: 30,
            ..Config::default()
        };
        let settings = BridgeSettings::from(&config);
        assert_eq!(settings.root, "ble2mqtt");
        assert_eq!(settings.reconnect_interval, Duration::from_secs(30));
        assert_eq!(settings.timings, SupervisorTimings::default());
    }

    #[tokio::test]
    async fn test_publisher_prefixes_root() {
        let broker = Arc::new(MockBroker::new());
        let _session = broker.connect_now().await;
        let publisher = BridgePublisher::new(broker.clone(), "ble2mqtt");

        publisher
            .publish("0xaabbccddeeff/state", r#"{"temperature":42}"#.to_string())
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "ble2mqtt/0xaabbccddeeff/state");
        assert!(!published[0].retain);
    }

    #[tokio::test]
    async fn test_publisher_maps_errors() {
        let broker = Arc::new(MockBroker::new());
        let publisher = BridgePublisher::new(broker, "ble2mqtt");
        let err = publisher.publish("x", "y".to_string()).await.unwrap_err();
        assert!(matches!(err, ble2mqtt_core::Error::Publish(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_mac() {
        let mut bridge = Bridge::new(BridgeSettings::default(), Arc::new(MockBroker::new()));
        bridge
            .register(Arc::new(MockDevice::new("AA:BB:CC:DD:EE:FF")))
            .unwrap();
        let err = bridge
            .register(Arc::new(MockDevice::new("aa:bb:cc:dd:ee:ff")))
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateDevice(_)));
        assert_eq!(bridge.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let mut bridge = Bridge::new(BridgeSettings::default(), Arc::new(MockBroker::new()));
        assert!(matches!(bridge.stopped().await, Err(BridgeError::NotStarted)));

        bridge.start().unwrap();
        assert!(matches!(bridge.start(), Err(BridgeError::AlreadyStarted)));
        assert!(matches!(
            bridge.register(Arc::new(MockDevice::new("AA:BB:CC:DD:EE:FF"))),
            Err(BridgeError::AlreadyStarted)
        ));
        bridge.close().await;
    }
}
