//! In-memory broker for testing.
//!
//! [`MockBroker`] records every broker operation in order, lets a test
//! script connection failures, end the current session with any reason
//! and inject inbound messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::MqttError;
use crate::mqtt::{Broker, InboundMessage, Message, Session};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A recorded broker operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Session opened with this last will.
    Connect(Message),
    Publish(Message),
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Scripted [`Broker`].
pub struct MockBroker {
    connected: AtomicBool,
    connect_count: AtomicU32,
    connect_failures: Mutex<VecDeque<MqttError>>,
    session: Mutex<Option<oneshot::Sender<Result<(), MqttError>>>>,
    events: Mutex<Vec<BrokerEvent>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        Self {
            connected: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            session: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Make the next connect attempt fail with `error`. Failures queue up.
    pub fn fail_next_connect(&self, error: MqttError) {
        lock(&self.connect_failures).push_back(error);
    }

    /// Open a session without a will, for tests that drive supervisors
    /// directly.
    pub async fn connect_now(&self) -> Session {
        self.open_session()
    }

    fn open_session(&self) -> Session {
        let (tx, rx) = oneshot::channel();
        *lock(&self.session) = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Session::new(rx)
    }

    /// End the current session with `reason`. Returns `false` if there was
    /// no session.
    pub fn end_session(&self, reason: Result<(), MqttError>) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        match lock(&self.session).take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Deliver an inbound message as if the broker had routed it to us.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        // The receiver lives as long as the bridge; a closed channel just
        // means the test stopped it already.
        let _ = self.inbound_tx.send(message).await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of connect calls, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Every recorded operation, oldest first.
    pub fn events(&self) -> Vec<BrokerEvent> {
        lock(&self.events).clone()
    }

    /// Messages published so far.
    pub fn published(&self) -> Vec<Message> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payloads published on `topic`, as text.
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload_str().into_owned())
            .collect()
    }

    /// Topics currently subscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for event in lock(&self.events).iter() {
            match event {
                BrokerEvent::Subscribe(topic) if !topics.contains(topic) => {
                    topics.push(topic.clone());
                }
                BrokerEvent::Unsubscribe(topic) => topics.retain(|t| t != topic),
                _ => {}
            }
        }
        topics
    }

    fn record(&self, event: BrokerEvent) {
        lock(&self.events).push(event);
    }

    fn require_session(&self) -> Result<(), MqttError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self, will: Message) -> Result<Session, MqttError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.connect_failures).pop_front() {
            return Err(error);
        }
        self.record(BrokerEvent::Connect(will));
        Ok(self.open_session())
    }

    async fn publish(&self, message: Message) -> Result<(), MqttError> {
        self.require_session()?;
        self.record(BrokerEvent::Publish(message));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.require_session()?;
        self.record(BrokerEvent::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.require_session()?;
        self.record(BrokerEvent::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        if self.is_connected() {
            self.record(BrokerEvent::Disconnect);
        }
        self.end_session(Ok(()));
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        lock(&self.inbound_rx).take()
    }
}
