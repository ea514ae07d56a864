// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated controller
//!
//! Speaks the controller side of the wire protocol: periodic `DATA` and
//! `INFO` frames, and an `ACK` for every `CMD` after a short processing
//! delay. Acks can be dropped with a configurable probability to exercise
//! the timeout path.

use super::Transport;
use crate::config::SimulatedConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wfms::protocol::{parse_line, Frame, FrameKind, Payload};
use wfms::{Mode, ValvePath};

/// Mirror of the controller's state, in controller vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDevice {
    pub flow: u32,
    pub battery: u8,
    /// `true` when open
    pub valve_open: bool,
    pub mode: Mode,
    pub valve_path: ValvePath,
    pub valve_known: bool,
    pub valve_node_id: String,
    pub valve_eui64: String,
    pub close_th: i64,
    pub open_th: i64,
    pub node_id: String,
    pub eui64: String,
    pub pan_id: String,
    pub channel: u8,
    pub tx_power: i64,
    pub uart_gateway: bool,
    pub bind_index: u64,
}

impl SimulatedDevice {
    fn new(mode: Mode) -> Self {
        Self {
            flow: 0,
            battery: 100,
            valve_open: false,
            mode,
            valve_path: ValvePath::Auto,
            valve_known: true,
            valve_node_id: "0x1234".to_string(),
            valve_eui64: "AABBCCDDEEFF0011".to_string(),
            close_th: 80,
            open_th: 20,
            node_id: "0x0000".to_string(),
            eui64: "0011223344556677".to_string(),
            pan_id: "0xBEEF".to_string(),
            channel: 11,
            tx_power: 8,
            uart_gateway: true,
            bind_index: 0,
        }
    }

    fn valve_word(&self) -> &'static str {
        if self.valve_open {
            "open"
        } else {
            "closed"
        }
    }

    fn data_frame(&self) -> Frame {
        Frame::new(
            FrameKind::Data,
            object(json!({
                "flow": self.flow,
                "valve": self.valve_word(),
                "battery": self.battery,
                "mode": self.mode.as_str(),
                "tx_pending": false,
                "valve_path": self.valve_path.as_str(),
                "valve_node_id": self.valve_node_id,
                "valve_known": self.valve_known,
            })),
        )
    }

    fn info_frame(&self, uptime: u64) -> Frame {
        Frame::new(
            FrameKind::Info,
            object(json!({
                "node_id": self.node_id,
                "eui64": self.eui64,
                "pan_id": self.pan_id,
                "ch": self.channel,
                "tx_power": self.tx_power,
                "net_state": 2,
                "uart_gateway": self.uart_gateway,
                "mode": self.mode.as_str(),
                "valve_path": self.valve_path.as_str(),
                "valve_known": self.valve_known,
                "valve_eui64": self.valve_eui64,
                "valve_node_id": self.valve_node_id,
                "bind_index": self.bind_index,
                "uptime": uptime,
            })),
        )
    }

    /// Random walk for one telemetry tick
    fn tick(&mut self, rng: &mut impl Rng) {
        self.flow = if self.valve_open {
            rng.gen_range(100..=250)
        } else {
            rng.gen_range(0..=5)
        };
        if rng.gen_bool(0.05) {
            self.battery = self.battery.saturating_sub(1);
        }
    }

    /// Execute a command. Returns `(ok, msg, extra fields)`.
    fn execute(&mut self, op: &str, cmd: &Payload) -> (bool, &'static str, Payload) {
        let value = cmd.get("value").and_then(Value::as_str).unwrap_or_default();
        let mut extra = Payload::new();

        let (ok, msg) = match op {
            "valve_set" => {
                if self.mode == Mode::Auto {
                    (false, "rejected: AUTO mode")
                } else {
                    match value {
                        "open" => self.valve_open = true,
                        "closed" | "close" => self.valve_open = false,
                        _ => return (false, "invalid value", extra),
                    }
                    extra.insert("valve".to_string(), self.valve_word().into());
                    (true, "valve set")
                }
            }
            "mode_set" => match Mode::parse(value) {
                Some(mode) => {
                    self.mode = mode;
                    extra.insert("mode".to_string(), mode.as_str().into());
                    (true, "mode set")
                }
                None => (false, "invalid value"),
            },
            "info" => (true, "info"),
            "threshold_set" => {
                let close_th = cmd.get("close_th").and_then(Value::as_i64).unwrap_or(0);
                let open_th = cmd.get("open_th").and_then(Value::as_i64).unwrap_or(0);
                if open_th >= close_th {
                    (false, "open_th must be < close_th")
                } else {
                    self.close_th = close_th;
                    self.open_th = open_th;
                    (true, "threshold set")
                }
            }
            "valve_path_set" => match ValvePath::parse(value) {
                Some(path) => {
                    self.valve_path = path;
                    (true, "path set")
                }
                None => (false, "invalid value"),
            },
            "valve_target_set" => match cmd.get("node_id").and_then(Value::as_str) {
                Some(node_id) => {
                    self.valve_node_id = node_id.to_string();
                    (true, "target set")
                }
                None => (false, "invalid params"),
            },
            "valve_pair" => {
                let eui64 = cmd.get("eui64").and_then(Value::as_str);
                let node_id = cmd.get("node_id").and_then(Value::as_str);
                match (eui64, node_id) {
                    (Some(eui64), Some(node_id)) => {
                        self.valve_eui64 = eui64.to_string();
                        self.valve_node_id = node_id.to_string();
                        self.bind_index = cmd.get("bind_index").and_then(Value::as_u64).unwrap_or(0);
                        self.valve_known = true;
                        (true, "paired")
                    }
                    _ => (false, "invalid params"),
                }
            }
            "net_form" => {
                if let Some(pan_id) = cmd.get("pan_id").and_then(Value::as_str) {
                    self.pan_id = pan_id.to_string();
                }
                if let Some(ch) = cmd.get("ch").and_then(Value::as_u64) {
                    self.channel = u8::try_from(ch).unwrap_or(self.channel);
                }
                if let Some(tx_power) = cmd.get("tx_power").and_then(Value::as_i64) {
                    self.tx_power = tx_power;
                }
                (true, "net forming")
            }
            "uart_gateway_set" => {
                self.uart_gateway = cmd.get("enable").and_then(Value::as_u64).unwrap_or(0) != 0;
                (true, "uart gateway set")
            }
            _ => (false, "unknown op"),
        };
        (ok, msg, extra)
    }
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

struct Inner {
    config: SimulatedConfig,
    device: Mutex<SimulatedDevice>,
    started_at: Instant,
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    running: AtomicBool,
}

impl Inner {
    fn device(&self) -> std::sync::MutexGuard<'_, SimulatedDevice> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, frame: &Frame) {
        let _ = self.tx.send(frame.to_line());
    }

    fn emit_info(&self) {
        let uptime = self.started_at.elapsed().as_secs();
        let frame = self.device().info_frame(uptime);
        self.emit(&frame);
    }

    fn respond(&self, cmd: &Payload) {
        let id = cmd.get("id").cloned().unwrap_or(Value::from(0));
        let op = cmd.get("op").and_then(Value::as_str).unwrap_or_default();

        let (ok, msg, extra) = self.device().execute(op, cmd);
        if op == "info" {
            self.emit_info();
        }

        let mut ack = Payload::new();
        ack.insert("id".to_string(), id);
        ack.insert("ok".to_string(), ok.into());
        ack.insert("msg".to_string(), msg.into());
        ack.extend(extra);
        debug!(op, ok, msg, "simulated ack");
        self.emit(&Frame::new(FrameKind::Ack, ack));
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// In-process controller simulation
pub struct SimulatedTransport {
    inner: Arc<Inner>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("config", &self.inner.config)
            .field("running", &self.is_connected())
            .finish()
    }
}

impl SimulatedTransport {
    /// Create a simulator; call [`Transport::start`] to begin emitting
    pub fn new(config: SimulatedConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = SimulatedDevice::new(config.initial_mode);
        Self {
            inner: Arc::new(Inner {
                config,
                device: Mutex::new(device),
                started_at: Instant::now(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                running: AtomicBool::new(false),
            }),
            background: Mutex::new(None),
        }
    }

    /// Snapshot of the simulated controller
    pub fn device(&self) -> SimulatedDevice {
        self.inner.device().clone()
    }

    /// Queue a raw line as if the controller had sent it
    pub fn inject_line(&self, line: impl Into<String>) {
        let _ = self.inner.tx.send(line.into());
    }
}

async fn periodic(
    inner: Arc<Inner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    emit: fn(&Inner),
) {
    loop {
        emit(&inner);
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => break,
        }
    }
}

fn emit_data(inner: &Inner) {
    let frame = {
        let mut device = inner.device();
        device.tick(&mut rand::thread_rng());
        device.data_frame()
    };
    inner.emit(&frame);
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if background.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();
        if let Some(period) = self.inner.config.data_interval {
            tasks.push(tokio::spawn(periodic(
                Arc::clone(&self.inner),
                period,
                rx.clone(),
                emit_data,
            )));
        }
        if let Some(period) = self.inner.config.info_interval {
            tasks.push(tokio::spawn(periodic(
                Arc::clone(&self.inner),
                period,
                rx.clone(),
                Inner::emit_info,
            )));
        }
        *background = Some(Background { shutdown, tasks });

        self.inner.running.store(true, Ordering::SeqCst);
        info!(
            drop_ack_prob = self.inner.config.drop_ack_prob,
            mode = %self.inner.config.initial_mode,
            "simulated controller started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let background = self.background.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                let _ = task.await;
            }
        }
        info!("simulated controller stopped");
    }

    async fn read_line(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.inner.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let frame = parse_line(line);
        if frame.kind != FrameKind::Cmd {
            debug!(line = line.trim(), "simulated controller ignored non-command line");
            return Ok(());
        }

        let (delay, drop_ack) = {
            let mut rng = rand::thread_rng();
            let config = &self.inner.config;
            let delay = if config.max_delay > config.min_delay {
                rng.gen_range(config.min_delay..=config.max_delay)
            } else {
                config.min_delay
            };
            (delay, rng.gen_bool(config.drop_ack_prob))
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if drop_ack {
                warn!(id = ?frame.payload.get("id"), "simulated controller dropping ack");
                return;
            }
            inner.respond(&frame.payload);
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started(config: SimulatedConfig) -> SimulatedTransport {
        let transport = SimulatedTransport::new(config);
        transport.start().await.unwrap();
        transport
    }

    async fn next_frame(transport: &SimulatedTransport) -> Frame {
        let line = transport.read_line(Duration::from_secs(5)).await.unwrap();
        parse_line(&line)
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_data_and_info() {
        let transport = started(SimulatedConfig::default()).await;

        let mut kinds = Vec::new();
        for _ in 0..3 {
            kinds.push(next_frame(&transport).await.kind);
        }
        assert!(kinds.contains(&FrameKind::Data));
        assert!(kinds.contains(&FrameKind::Info));
        transport.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_bounds_follow_valve() {
        let transport = started(SimulatedConfig::quiet()).await;
        emit_data(&transport.inner);
        let frame = next_frame(&transport).await;
        let flow = frame.payload["flow"].as_u64().unwrap();
        assert!(flow <= 5);
        assert_eq!(frame.payload["valve"], "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_rejected_in_auto() {
        let transport = started(SimulatedConfig::quiet()).await;
        transport
            .write_line(r#"@CMD {"id":7,"op":"valve_set","value":"open"}"#)
            .await
            .unwrap();

        let ack = next_frame(&transport).await;
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.payload["id"], 7);
        assert_eq!(ack.payload["ok"], false);
        assert_eq!(ack.payload["msg"], "rejected: AUTO mode");
        assert!(!transport.device().valve_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_set_in_manual() {
        let transport = started(SimulatedConfig::quiet().with_mode(Mode::Manual)).await;
        transport
            .write_line(r#"@CMD {"id":8,"op":"valve_set","value":"open"}"#)
            .await
            .unwrap();

        let ack = next_frame(&transport).await;
        assert_eq!(ack.payload["ok"], true);
        assert_eq!(ack.payload["valve"], "open");
        assert!(transport.device().valve_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_and_unknown_op() {
        let transport = started(SimulatedConfig::quiet()).await;
        transport
            .write_line(r#"@CMD {"id":1,"op":"threshold_set","close_th":20,"open_th":80}"#)
            .await
            .unwrap();
        let ack = next_frame(&transport).await;
        assert_eq!(ack.payload["msg"], "open_th must be < close_th");

        transport
            .write_line(r#"@CMD {"id":2,"op":"reboot"}"#)
            .await
            .unwrap();
        let ack = next_frame(&transport).await;
        assert_eq!(ack.payload["ok"], false);
        assert_eq!(ack.payload["msg"], "unknown op");
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_command_emits_info_frame() {
        let transport = started(SimulatedConfig::quiet()).await;
        transport
            .write_line(r#"@CMD {"id":3,"op":"info"}"#)
            .await
            .unwrap();

        assert_eq!(next_frame(&transport).await.kind, FrameKind::Info);
        assert_eq!(next_frame(&transport).await.kind, FrameKind::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_all_acks() {
        let transport = started(SimulatedConfig::quiet().with_drop_ack_prob(1.0)).await;
        transport
            .write_line(r#"@CMD {"id":4,"op":"info"}"#)
            .await
            .unwrap();
        assert_eq!(transport.read_line(Duration::from_secs(2)).await, None);
    }

    #[tokio::test]
    async fn test_write_before_start_fails() {
        let transport = SimulatedTransport::new(SimulatedConfig::quiet());
        assert!(matches!(
            transport.write_line("@CMD {}").await,
            Err(TransportError::NotConnected)
        ));
    }
}
