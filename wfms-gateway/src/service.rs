// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway service
//!
//! Owns the transport reader loop and the bus event loop, and runs one task
//! per inbound command. Command path:
//!
//! ```text
//! bus -> decode -> validate -> rules -> encode -> register waiter
//!     -> transport write -> wait for ack -> state update -> publish state, ack
//! ```
//!
//! Telemetry path: transport line -> codec -> dispatch by frame kind ->
//! state cache and counters -> publish telemetry and retained state.

use crate::bus::{BusEvent, LastWill, MessageBus, Qos};
use crate::config::GatewayConfig;
use crate::error::{BusError, GatewayError, Result};
use crate::transport::Transport;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wfms::command::UNKNOWN_CID;
use wfms::protocol::ERR_EMPTY_LINE;
use wfms::rules::Admission;
use wfms::{
    encode_command, parse_line, translate_ack, unix_now, AckCorrelator, AckOutcome, BusAck,
    Command, CommandSource, CoordinatorInfo, CorrelationMap, DeviceState, FrameKind, Payload,
    RulesEngine, RuntimeState, StateCache, Topics,
};

/// Ack reason: the command could not be written to the transport
pub const REASON_WRITE_FAILED: &str = "uart_write_failed";
/// Ack reason: no ack within the timeout
pub const REASON_TIMEOUT: &str = "timeout";
/// Ack reason: the command could not be encoded
pub const REASON_ENCODE_FAILED: &str = "encode_failed";

/// Lifecycle of a [`GatewayService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Gateway status payload (`{base}/status/gateway`)
pub fn status_payload(up: bool) -> Value {
    json!({ "up": up, "ts": unix_now() })
}

struct Shared {
    config: GatewayConfig,
    topics: Topics,
    transport: Arc<dyn Transport>,
    bus: Arc<dyn MessageBus>,
    rules: Arc<RulesEngine>,
    runtime: Arc<RuntimeState>,
    state: StateCache,
    correlator: AckCorrelator,
    ids: CorrelationMap,
    /// In-flight command tasks, joined on stop
    commands: Mutex<Vec<JoinHandle<()>>>,
}

/// UART/MQTT gateway
pub struct GatewayService {
    shared: Arc<Shared>,
    lifecycle: Mutex<ServiceState>,
    bus_events: Mutex<Option<mpsc::Receiver<BusEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("site", &self.shared.config.site)
            .field("transport", &self.shared.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

impl GatewayService {
    /// Create a service. Fails on invalid configuration.
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<dyn MessageBus>,
        bus_events: mpsc::Receiver<BusEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);

        let shared = Shared {
            topics: Topics::new(&config.site),
            rules: Arc::new(RulesEngine::new(config.rules)),
            runtime: Arc::new(RuntimeState::new(config.log_capacity)),
            state: StateCache::new(),
            correlator: AckCorrelator::new(),
            ids: CorrelationMap::new(config.correlation_retention()),
            commands: Mutex::new(Vec::new()),
            transport,
            bus,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            lifecycle: Mutex::new(ServiceState::Stopped),
            bus_events: Mutex::new(Some(bus_events)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission rules, shared with the admin interface
    pub fn rules(&self) -> Arc<RulesEngine> {
        Arc::clone(&self.shared.rules)
    }

    /// Counters and log ring, shared with the admin interface
    pub fn runtime(&self) -> Arc<RuntimeState> {
        Arc::clone(&self.shared.runtime)
    }

    /// Bus topics
    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    /// Configuration the service was built with
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Last-known device state
    pub fn device_state(&self) -> DeviceState {
        self.shared.state.device()
    }

    /// Last-known controller info
    pub fn coordinator_info(&self) -> CoordinatorInfo {
        self.shared.state.info()
    }

    /// Number of commands waiting for an ack
    pub fn pending_acks(&self) -> usize {
        self.shared.correlator.pending()
    }

    fn transition(&self, from: ServiceState, to: ServiceState, action: &'static str) -> Result<()> {
        let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(GatewayError::InvalidState {
                action,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Bring up the transport and the bus, then start the loops.
    ///
    /// A stopped service cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        self.transition(ServiceState::Stopped, ServiceState::Starting, "start")?;

        let events = self
            .bus_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(events) = events else {
            self.set_state(ServiceState::Stopped);
            return Err(GatewayError::InvalidState {
                action: "restart",
                state: ServiceState::Stopped,
            });
        };

        if let Err(e) = self.bring_up().await {
            error!(error = %e, "gateway startup failed");
            self.shared.transport.stop().await;
            self.set_state(ServiceState::Stopped);
            return Err(e);
        }

        let shared = &self.shared;
        let reader = tokio::spawn(reader_loop(Arc::clone(shared), self.shutdown.subscribe()));
        let bus_loop = tokio::spawn(bus_loop(
            Arc::clone(shared),
            events,
            self.shutdown.subscribe(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([reader, bus_loop]);

        self.set_state(ServiceState::Running);
        info!(
            site = %shared.config.site,
            transport = shared.transport.name(),
            "gateway running"
        );
        shared.runtime.add_log("INFO", "Gateway started");
        Ok(())
    }

    async fn bring_up(&self) -> Result<()> {
        let shared = &self.shared;
        shared.transport.start().await?;
        shared
            .runtime
            .set_transport_connected(shared.transport.is_connected());

        let will = LastWill {
            topic: shared.topics.status.clone(),
            payload: status_payload(false).to_string().into_bytes(),
            qos: Qos::AtLeastOnce,
            retain: true,
        };
        shared.bus.connect(will).await?;
        Ok(())
    }

    /// Stop the loops, announce offline, tear down transport and bus.
    /// Pending ack waiters are abandoned and report `timeout`.
    pub async fn stop(&self) -> Result<()> {
        self.transition(ServiceState::Running, ServiceState::Stopping, "stop")?;
        let shared = &self.shared;

        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        join_or_abort(tasks, shared.config.stop_grace, "loop").await;

        // No new commands past this point
        let abandoned = shared.correlator.abandon_all();
        if abandoned > 0 {
            info!(abandoned, "abandoned pending ack waiters");
        }
        let commands: Vec<_> = shared
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        join_or_abort(commands, shared.config.stop_grace, "command").await;

        let offline = status_payload(false);
        if let Err(e) = shared
            .publish_json(&shared.topics.status, &offline, Qos::AtLeastOnce, true)
            .await
        {
            warn!(error = %e, "failed to publish offline status");
        }

        shared.transport.stop().await;
        let disconnected =
            tokio::time::timeout(shared.config.publish_timeout, shared.bus.disconnect())
                .await
                .unwrap_or(Err(BusError::Timeout));
        if let Err(e) = disconnected {
            warn!(error = %e, "bus disconnect failed");
        }
        shared.runtime.set_bus_connected(false);
        shared.runtime.set_transport_connected(false);
        shared.runtime.add_log("INFO", "Gateway stopped");

        self.set_state(ServiceState::Stopped);
        info!("gateway stopped");
        Ok(())
    }

    fn set_state(&self, state: ServiceState) {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Join `tasks` within one shared deadline; abort whatever is still running
async fn join_or_abort(tasks: Vec<JoinHandle<()>>, grace: Duration, kind: &'static str) {
    let deadline = Instant::now() + grace;
    for mut task in tasks {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            warn!(kind, grace = ?grace, "task did not stop in time, aborting");
            task.abort();
        }
    }
}

async fn reader_loop(shared: Arc<Shared>, shutdown: watch::Receiver<bool>) {
    debug!("transport reader started");
    while !*shutdown.borrow() {
        let line = shared.transport.read_line(shared.config.read_timeout).await;
        shared
            .runtime
            .set_transport_connected(shared.transport.is_connected());
        if let Some(line) = line {
            shared.handle_line(&line).await;
        }
    }
    debug!("transport reader stopped");
}

async fn bus_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<BusEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        match event {
            BusEvent::Connected => shared.on_bus_connected().await,
            BusEvent::Disconnected => {
                shared.runtime.set_bus_connected(false);
                shared.runtime.add_log("WARNING", "Bus disconnected");
                warn!("bus disconnected");
            }
            BusEvent::Message(message) => {
                let Some(source) = shared.topics.command_source(&message.topic) else {
                    debug!(topic = %message.topic, "ignoring message on unexpected topic");
                    continue;
                };
                let task = {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        shared.handle_command(source, &message.payload).await;
                    })
                };
                let mut commands = shared.commands.lock().unwrap_or_else(|e| e.into_inner());
                commands.retain(|task| !task.is_finished());
                commands.push(task);
            }
        }
    }
}

impl Shared {
    async fn on_bus_connected(&self) {
        self.runtime.set_bus_connected(true);
        for topic in self.topics.command_topics() {
            let subscribed = tokio::time::timeout(
                self.config.publish_timeout,
                self.bus.subscribe(topic, Qos::AtLeastOnce),
            )
            .await
            .unwrap_or(Err(BusError::Timeout));
            if let Err(e) = subscribed {
                warn!(topic, error = %e, "subscribe failed");
            }
        }
        if let Err(e) = self
            .publish_json(&self.topics.status, &status_payload(true), Qos::AtLeastOnce, true)
            .await
        {
            warn!(error = %e, "failed to publish online status");
        }
        self.runtime.add_log("INFO", "Bus connected");
        info!(topics = ?self.topics.command_topics(), "bus connected, subscribed");
    }

    async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: Qos,
        retain: bool,
    ) -> std::result::Result<(), BusError> {
        let payload = serde_json::to_vec(value)?;
        tokio::time::timeout(
            self.config.publish_timeout,
            self.bus.publish(topic, payload, qos, retain),
        )
        .await
        .unwrap_or(Err(BusError::Timeout))
    }

    async fn publish_state(&self, state: &DeviceState) {
        if let Err(e) = self
            .publish_json(&self.topics.state, state, Qos::AtLeastOnce, true)
            .await
        {
            warn!(error = %e, "failed to publish state");
        }
    }

    async fn publish_ack(&self, ack: &BusAck) {
        self.runtime.inc_ack(ack.ok);
        let payload = ack.to_json(unix_now());
        if let Err(e) = self
            .publish_json(&self.topics.ack, &payload, Qos::AtLeastOnce, false)
            .await
        {
            warn!(cid = %ack.correlation_id, error = %e, "failed to publish ack");
        }
    }

    async fn reject(&self, correlation_id: &str, reason: &str) {
        self.publish_ack(&BusAck::new(correlation_id, false, reason))
            .await;
    }

    // ------------------------------------------------------------------
    // Command path
    // ------------------------------------------------------------------

    async fn handle_command(&self, source: CommandSource, raw: &[u8]) {
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "dropping undecodable command");
                self.runtime
                    .add_log("WARNING", format!("Invalid command JSON: {}", e));
                return;
            }
        };
        self.runtime.inc_commands();

        let command = match Command::from_bus(source, &payload) {
            Ok(command) => command,
            Err(rejection) => {
                warn!(cid = %rejection.correlation_id, reason = rejection.reason, "command rejected");
                if rejection.correlation_id == UNKNOWN_CID {
                    self.runtime.add_log(
                        "WARNING",
                        format!("Rejected command without id: {}", rejection.reason),
                    );
                }
                self.reject(&rejection.correlation_id, rejection.reason).await;
                return;
            }
        };
        let cid = command.correlation_id.as_str();

        // Runtime clock; follows paused time in tests
        let now = Instant::now().into_std();
        if let Admission::Rejected(reason) = self.rules.check_and_mark_at(cid, &command.actor, now)
        {
            warn!(cid, actor = %command.actor, reason, "command refused by rules");
            self.runtime.add_log(
                "WARNING",
                format!("Command {} from {} refused: {}", cid, command.actor, reason),
            );
            self.reject(cid, reason).await;
            return;
        }

        let line = match encode_command(&command, &self.ids, now) {
            Ok((_, line)) => line,
            Err(e) => {
                error!(cid, error = %e, "command encoding failed");
                self.reject(cid, REASON_ENCODE_FAILED).await;
                return;
            }
        };

        let waiter = self.correlator.register(cid);
        info!(cid, op = %command.operation, actor = %command.actor, "TX {}", line);
        if let Err(e) = self.transport.write_line(&line).await {
            drop(waiter);
            warn!(cid, error = %e, "transport write failed");
            self.reject(cid, REASON_WRITE_FAILED).await;
            return;
        }

        match waiter.wait(self.config.ack_timeout).await {
            AckOutcome::Acked(ack) => {
                info!(cid, ok = ack.ok, reason = %ack.reason, "ack received");
                if ack.ok {
                    if let Some(state) = self.state.apply_ack(&command.operation, unix_now()) {
                        self.publish_state(&state).await;
                    }
                }
                self.publish_ack(&ack).await;
            }
            AckOutcome::TimedOut | AckOutcome::Abandoned => {
                warn!(cid, timeout = ?self.config.ack_timeout, "ack timeout");
                self.reject(cid, REASON_TIMEOUT).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Telemetry path
    // ------------------------------------------------------------------

    async fn handle_line(&self, line: &str) {
        let frame = parse_line(line);
        match frame.kind {
            FrameKind::Data => self.handle_data(&frame.payload).await,
            FrameKind::Info => self.handle_info(&frame.payload),
            FrameKind::Log => self.handle_log(&frame.payload),
            FrameKind::Ack => self.handle_ack(&frame.payload),
            FrameKind::Cmd => debug!(line, "ignoring echoed command"),
            FrameKind::Err => {
                if frame.is_fragment() {
                    warn!(
                        raw = frame.raw().unwrap_or_default(),
                        "transport fragment (partial frame)"
                    );
                } else if frame.error_reason() == Some(ERR_EMPTY_LINE) {
                    debug!("empty line");
                } else {
                    warn!(
                        error = frame.error_reason().unwrap_or_default(),
                        raw = frame.raw().unwrap_or_default(),
                        "unparseable line"
                    );
                }
            }
        }
    }

    async fn handle_data(&self, payload: &Payload) {
        let (sample, state) = self.state.apply_data(payload, unix_now());
        self.runtime.inc_telemetry();

        if let Err(e) = self
            .publish_json(&self.topics.telemetry, &sample, Qos::AtMostOnce, false)
            .await
        {
            debug!(error = %e, "failed to publish telemetry");
        }
        self.publish_state(&state).await;
    }

    fn handle_info(&self, payload: &Payload) {
        let info = self.state.apply_info(payload, unix_now());
        debug!(
            node = %info.node_id,
            pan = %info.pan_id,
            ch = info.channel,
            mode = %info.mode,
            uptime = info.uptime,
            "controller info"
        );
    }

    fn handle_log(&self, payload: &Payload) {
        let tag = payload.get("tag").and_then(Value::as_str).unwrap_or("???");
        let event = payload.get("event").and_then(Value::as_str).unwrap_or_default();
        info!(tag, event, "controller log");
        self.runtime.add_log(
            &format!("COORD_{}", tag),
            format!("{}: {}", event, Value::Object(payload.clone())),
        );
    }

    fn handle_ack(&self, payload: &Payload) {
        match translate_ack(payload, &self.ids) {
            Some(ack) => {
                let cid = ack.correlation_id.clone();
                if !self.correlator.resolve(&cid, ack) {
                    debug!(cid = %cid, "late or unsolicited ack");
                }
            }
            None => debug!(id = ?payload.get("id"), "ack for unknown controller id"),
        }
    }
}
