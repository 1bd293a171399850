//! Per-device lifecycle supervision.
//!
//! A [`DeviceSupervisor`] owns one device for the duration of a broker
//! session and keeps it connected:
//!
//! ```text
//!            connect failed: sleep connect_retry
//!           +----------+
//!           v          |
//!     +------------+   |     +-------------+     +---------+
//! --> | Connecting |---+---> | Configuring |---> | Serving |
//!     +------------+         +-------------+     +---------+
//!           ^                       |                 |
//!           |                       v                 v
//!     +---------+            +-------------+          |
//!     | Backoff | <--------- | TearingDown | <--------+
//!     +---------+            +-------------+
//! ```
//!
//! Once a connection attempt succeeds, teardown always runs: the handle
//! task is aborted and awaited, command topics are unsubscribed and the
//! link is closed. Shutdown is honoured at every await point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ble2mqtt_core::{SharedDevice, StatePublisher};

use crate::discovery;
use crate::error::Result;
use crate::mqtt::Broker;
use crate::router::Router;

/// Named states of a device supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Establishing the BLE link.
    Connecting,
    /// Publishing discovery, running the device handshake, subscribing.
    Configuring,
    /// Device publishing loop running.
    Serving,
    /// Stopping the publishing loop and releasing the link.
    TearingDown,
    /// Pausing before the next connection attempt.
    Backoff,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Connecting => "connecting",
            SupervisorState::Configuring => "configuring",
            SupervisorState::Serving => "serving",
            SupervisorState::TearingDown => "tearing down",
            SupervisorState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Delays used by the device supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorTimings {
    /// Pause after a failed connection attempt.
    pub connect_retry: Duration,
    /// Pause after a completed cycle before reconnecting.
    pub backoff: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_secs(10),
            backoff: Duration::from_secs(3),
        }
    }
}

/// Keeps one device connected for the lifetime of a broker session.
pub struct DeviceSupervisor {
    device: SharedDevice,
    broker: Arc<dyn Broker>,
    publisher: Arc<dyn StatePublisher>,
    router: Router,
    timings: SupervisorTimings,
    shutdown: CancellationToken,
}

impl DeviceSupervisor {
    pub fn new(
        device: SharedDevice,
        broker: Arc<dyn Broker>,
        publisher: Arc<dyn StatePublisher>,
        router: Router,
        timings: SupervisorTimings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            device,
            broker,
            publisher,
            router,
            timings,
            shutdown,
        }
    }

    fn enter(&self, state: SupervisorState) {
        info!(device = %self.device.unique_id(), state = %state, "Device supervisor");
    }

    /// Sleep unless shut down first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    /// Run until shutdown.
    pub async fn run(self) {
        loop {
            self.enter(SupervisorState::Connecting);
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                result = self.device.connect() => Some(result),
            };

            match connected {
                None => {
                    if let Err(e) = self.device.disconnect().await {
                        debug!(device = %self.device.unique_id(), error = %e, "Disconnect after aborted connect failed");
                    }
                    break;
                }
                Some(Err(e)) => {
                    warn!(device = %self.device.unique_id(), error = %e, "Connection failed");
                    if let Err(e) = self.device.disconnect().await {
                        debug!(device = %self.device.unique_id(), error = %e, "Disconnect after failed connect failed");
                    }
                    if !self.pause(self.timings.connect_retry).await {
                        break;
                    }
                    continue;
                }
                Some(Ok(())) => {}
            }

            self.serve().await;

            if self.shutdown.is_cancelled() {
                break;
            }
            self.enter(SupervisorState::Backoff);
            if !self.pause(self.timings.backoff).await {
                break;
            }
        }
        debug!(device = %self.device.unique_id(), "Device supervisor stopped");
    }

    /// Publish discovery, initialise the device and subscribe its topics.
    async fn configure(&self) -> Result<()> {
        for message in discovery::messages(self.router.root(), self.device.as_ref()) {
            debug!("Publish config {}: {}", message.topic, message.payload_str());
            self.broker.publish(message).await?;
        }

        self.device.init().await?;

        for topic in self.device.subscribed_topics() {
            self.broker.subscribe(&self.router.absolute(topic)).await?;
        }
        Ok(())
    }

    /// Configuring and Serving, followed by teardown.
    async fn serve(&self) {
        self.enter(SupervisorState::Configuring);
        let disconnected = self.device.disconnected();

        let configured = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = self.configure() => Some(result),
        };

        let mut handle = None;
        match configured {
            Some(Ok(())) => {
                self.enter(SupervisorState::Serving);
                let device = Arc::clone(&self.device);
                let publisher = Arc::clone(&self.publisher);
                let mut task = tokio::spawn(async move { device.handle(publisher).await });

                let finished = tokio::select! {
                    _ = self.shutdown.cancelled() => false,
                    _ = disconnected.cancelled() => {
                        info!(device = %self.device.unique_id(), "Disconnected");
                        false
                    }
                    result = &mut task => {
                        match result {
                            Ok(Ok(())) => debug!(device = %self.device.unique_id(), "Handle task finished"),
                            Ok(Err(e)) => warn!(device = %self.device.unique_id(), error = %e, "Handle task failed"),
                            Err(e) => warn!(device = %self.device.unique_id(), error = %e, "Handle task panicked"),
                        }
                        true
                    }
                };
                if !finished {
                    handle = Some(task);
                }
            }
            Some(Err(e)) => {
                warn!(device = %self.device.unique_id(), error = %e, "Device configuration failed");
            }
            None => {}
        }

        self.teardown(handle).await;
    }

    async fn teardown(&self, handle: Option<JoinHandle<ble2mqtt_core::Result<()>>>) {
        self.enter(SupervisorState::TearingDown);

        if let Some(task) = handle {
            task.abort();
            match task.await {
                Ok(Err(e)) => warn!(device = %self.device.unique_id(), error = %e, "Handle task failed"),
                Err(e) if e.is_panic() => {
                    warn!(device = %self.device.unique_id(), error = %e, "Handle task panicked");
                }
                _ => {}
            }
        }

        for topic in self.device.subscribed_topics() {
            if let Err(e) = self.broker.unsubscribe(&self.router.absolute(topic)).await {
                debug!(device = %self.device.unique_id(), topic, error = %e, "Unsubscribe failed");
            }
        }

        if self.device.is_connected().await
            && let Err(e) = self.device.disconnect().await
        {
            warn!(device = %self.device.unique_id(), error = %e, "Disconnect failed");
        }
    }
}
