// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-memory bus for tests and local runs
//!
//! Records every publication in order, keeps the retained value per topic,
//! and lets callers inject inbound messages and connection changes.

use super::{BusEvent, BusMessage, LastWill, MessageBus, Qos, EVENT_CAPACITY};
use crate::error::BusError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One recorded publication
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl Publication {
    /// Payload parsed as JSON (`Null` if it is not JSON)
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct Record {
    published: Vec<Publication>,
    retained: HashMap<String, Vec<u8>>,
    subscriptions: HashSet<String>,
    will: Option<LastWill>,
}

/// [`MessageBus`] that never leaves the process
#[derive(Debug)]
pub struct MemoryBus {
    record: Mutex<Record>,
    connected: AtomicBool,
    stalled: AtomicBool,
    events: mpsc::Sender<BusEvent>,
}

impl MemoryBus {
    /// Create a bus and the receiver for its inbound events
    pub fn new() -> (Self, mpsc::Receiver<BusEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let bus = Self {
            record: Mutex::new(Record::default()),
            connected: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            events,
        };
        (bus, rx)
    }

    fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an inbound message if the topic is subscribed.
    /// Returns whether it was delivered.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.record().subscriptions.contains(topic) {
            return false;
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        self.events.send(BusEvent::Message(message)).await.is_ok()
    }

    /// Deliver a JSON command
    pub async fn inject_json(&self, topic: &str, payload: &Value) -> bool {
        self.inject(topic, payload.to_string()).await
    }

    /// Simulate losing the broker session
    pub async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.record().subscriptions.clear();
        let _ = self.events.send(BusEvent::Disconnected).await;
    }

    /// Simulate the session coming back
    pub async fn restore_connection(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(BusEvent::Connected).await;
    }

    /// Make publish and subscribe hang forever, like a client whose request
    /// queue never drains
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn wait_if_stalled(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    /// Every publication so far, oldest first
    pub fn published(&self) -> Vec<Publication> {
        self.record().published.clone()
    }

    /// JSON payloads published on `topic`, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.record()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .map(Publication::json)
            .collect()
    }

    /// Retained value of `topic`
    pub fn retained(&self, topic: &str) -> Option<Value> {
        self.record()
            .retained
            .get(topic)
            .and_then(|payload| serde_json::from_slice(payload).ok())
    }

    /// Registered last will
    pub fn last_will(&self) -> Option<LastWill> {
        self.record().will.clone()
    }

    /// Whether `topic` is subscribed
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.record().subscriptions.contains(topic)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self, will: LastWill) -> Result<(), BusError> {
        self.record().will = Some(will);
        self.restore_connection().await;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError> {
        self.wait_if_stalled().await;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let mut record = self.record();
        if retain {
            record.retained.insert(topic.to_string(), payload.clone());
        }
        record.published.push(Publication {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: Qos) -> Result<(), BusError> {
        self.wait_if_stalled().await;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.record().subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        self.record().subscriptions.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn will() -> LastWill {
        LastWill {
            topic: "wfms/lab1/status/gateway".to_string(),
            payload: br#"{"up":false}"#.to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
        }
    }

    #[tokio::test]
    async fn test_connect_emits_event() {
        let (bus, mut events) = MemoryBus::new();
        bus.connect(will()).await.unwrap();

        assert_eq!(events.recv().await, Some(BusEvent::Connected));
        assert_eq!(bus.last_will(), Some(will()));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let (bus, _events) = MemoryBus::new();
        let result = bus.publish("t", b"{}".to_vec(), Qos::AtMostOnce, false).await;
        assert!(matches!(result, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_retained_keeps_latest() {
        let (bus, _events) = MemoryBus::new();
        bus.connect(will()).await.unwrap();
        bus.publish("s", br#"{"v":1}"#.to_vec(), Qos::AtLeastOnce, true)
            .await
            .unwrap();
        bus.publish("s", br#"{"v":2}"#.to_vec(), Qos::AtLeastOnce, true)
            .await
            .unwrap();
        bus.publish("t", br#"{"v":3}"#.to_vec(), Qos::AtMostOnce, false)
            .await
            .unwrap();

        assert_eq!(bus.retained("s").unwrap()["v"], 2);
        assert_eq!(bus.retained("t"), None);
        assert_eq!(bus.published().len(), 3);
    }

    #[tokio::test]
    async fn test_inject_only_subscribed() {
        let (bus, mut events) = MemoryBus::new();
        bus.connect(will()).await.unwrap();
        events.recv().await;

        assert!(!bus.inject("cmd", "{}").await);
        bus.subscribe("cmd", Qos::AtLeastOnce).await.unwrap();
        assert!(bus.inject("cmd", "{}").await);

        match events.recv().await {
            Some(BusEvent::Message(message)) => assert_eq!(message.topic, "cmd"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publish_never_completes() {
        let (bus, _events) = MemoryBus::new();
        bus.connect(will()).await.unwrap();
        bus.set_stalled(true);

        let publish = bus.publish("t", b"{}".to_vec(), Qos::AtMostOnce, false);
        let result = tokio::time::timeout(std::time::Duration::from_secs(60), publish).await;
        assert!(result.is_err());
        assert!(bus.published().is_empty());

        bus.set_stalled(false);
        bus.publish("t", b"{}".to_vec(), Qos::AtMostOnce, false)
            .await
            .unwrap();
        assert_eq!(bus.published().len(), 1);
    }
}
