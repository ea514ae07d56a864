// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Message bus abstraction
//!
//! Outbound traffic goes through [`MessageBus`]; inbound traffic (commands
//! and connection changes) arrives as [`BusEvent`]s on the channel handed
//! out when the bus is created.

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use crate::error::BusError;
use async_trait::async_trait;

pub use memory::{MemoryBus, Publication};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;

/// Capacity of the inbound event channel
pub const EVENT_CAPACITY: usize = 256;

/// Delivery guarantee for a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Publication registered with the broker for an ungraceful disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Inbound bus event
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Session established (initially or after a reconnect); subscriptions
    /// must be renewed
    Connected,
    /// Session lost
    Disconnected,
    /// Inbound message
    Message(BusMessage),
}

/// Publish/subscribe client
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connect, registering `will` with the broker
    async fn connect(&self, will: LastWill) -> Result<(), BusError>;

    /// Publish a payload
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), BusError>;

    /// Disconnect cleanly; the will is not published
    async fn disconnect(&self) -> Result<(), BusError>;

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;
}
