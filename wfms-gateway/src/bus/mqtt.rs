// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT bus client
//!
//! Wraps an `rumqttc` client. The event loop runs on its own task; it keeps
//! reconnecting after errors and reports every session change as a
//! [`BusEvent`].

use super::{BusEvent, BusMessage, LastWill, MessageBus, Qos, EVENT_CAPACITY};
use crate::config::MqttConfig;
use crate::error::BusError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests buffered by the client; beyond this, publishes are refused
const CLIENT_CAPACITY: usize = 64;

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// MQTT implementation of [`MessageBus`]
pub struct MqttBus {
    config: MqttConfig,
    client: Mutex<Option<AsyncClient>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    events: mpsc::Sender<BusEvent>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MqttBus {
    /// Create a client and the receiver for its inbound events
    pub fn new(config: MqttConfig) -> (Self, mpsc::Receiver<BusEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let bus = Self {
            config,
            client: Mutex::new(None),
            poller: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            events,
        };
        (bus, rx)
    }

    fn options(&self, will: LastWill) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_last_will(rumqttc::LastWill::new(
            will.topic,
            will.payload,
            will.qos.into(),
            will.retain,
        ));
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    fn client(&self) -> Result<AsyncClient, BusError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(BusError::NotConnected)
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<BusEvent>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    retry: std::time::Duration,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    info!("mqtt_connected");
                    Some(BusEvent::Connected)
                } else {
                    warn!(code = ?ack.code, "mqtt connection refused");
                    None
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BusEvent::Message(BusMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            Ok(_) => None,
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                let was_connected = connected.swap(false, Ordering::SeqCst);
                warn!(error = %e, "mqtt connection error, retrying");
                if was_connected && events.send(BusEvent::Disconnected).await.is_err() {
                    break;
                }
                tokio::time::sleep(retry).await;
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("bus event receiver dropped, stopping mqtt poller");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn connect(&self, will: LastWill) -> Result<(), BusError> {
        let (client, eventloop) = AsyncClient::new(self.options(will), CLIENT_CAPACITY);
        self.closing.store(false, Ordering::SeqCst);

        let task = tokio::spawn(poll_loop(
            eventloop,
            self.events.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.closing),
            self.config.reconnect_interval,
        ));

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        if let Some(old) = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
        info!(host = %self.config.host, port = self.config.port, "mqtt client started");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError> {
        // The request queue only drains while the broker is reachable
        let client = self.client()?;
        client.try_publish(topic, qos.into(), retain, payload)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), BusError> {
        let client = self.client()?;
        client.try_subscribe(topic, qos.into())?;
        debug!(topic, "mqtt subscribed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.closing.store(true, Ordering::SeqCst);
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "mqtt disconnect request failed");
            }
        }

        let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut poller) = poller {
            // The poller exits on the error that follows the disconnect
            if tokio::time::timeout(std::time::Duration::from_secs(2), &mut poller)
                .await
                .is_err()
            {
                debug!("mqtt poller did not stop in time");
                poller.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
