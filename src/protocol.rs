//! Serial wire protocol for the field controller
//!
//! One frame per line, a tag followed by a JSON object:
//!
//! ```text
//! @DATA {"flow":150,"battery":85,"valve":"open","mode":"auto"}
//! @INFO {"node_id":"0x0000","pan_id":"0xBEEF","ch":11,"uptime":120}
//! @LOG  {"tag":"NET","event":"formed"}
//! @ACK  {"id":7,"ok":true,"msg":"valve set","valve":"open"}
//! @CMD  {"id":7,"op":"valve_set","value":"open"}
//! ```
//!
//! This module also owns the translation between the controller vocabulary
//! (`open`/`closed`, numeric ids) and the bus vocabulary (`ON`/`OFF`,
//! caller-chosen correlation ids).

use crate::command::{Command, Operation};
use crate::correlation::CorrelationMap;
use crate::error::CommandError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;

/// JSON object carried by a frame
pub type Payload = Map<String, Value>;

/// `ERR` reason: blank or whitespace-only line
pub const ERR_EMPTY_LINE: &str = "empty_line";
/// `ERR` reason: line does not start with a known tag
pub const ERR_UNKNOWN_PREFIX: &str = "unknown_prefix";
/// `ERR` reason: tag without a JSON body
pub const ERR_MISSING_PAYLOAD: &str = "missing_payload";
/// `ERR` reason: body is not valid JSON
pub const ERR_JSON_PARSE: &str = "json_parse_error";
/// `ERR` reason: body is valid JSON but not an object
pub const ERR_PAYLOAD_NOT_DICT: &str = "payload_not_dict";

/// Kind of a wire frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Telemetry sample
    Data,
    /// Command acknowledgment
    Ack,
    /// Controller heartbeat / network identity
    Info,
    /// Controller event log
    Log,
    /// Command (bridge to controller only)
    Cmd,
    /// Line that could not be parsed
    Err,
}

impl FrameKind {
    /// Kinds that appear on the wire with a tag
    pub const WIRE: [FrameKind; 5] = [
        FrameKind::Data,
        FrameKind::Ack,
        FrameKind::Info,
        FrameKind::Log,
        FrameKind::Cmd,
    ];

    /// Tag name without the leading `@`
    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Data => "DATA",
            FrameKind::Ack => "ACK",
            FrameKind::Info => "INFO",
            FrameKind::Log => "LOG",
            FrameKind::Cmd => "CMD",
            FrameKind::Err => "ERR",
        }
    }

    /// Match a tag name case-insensitively. `ERR` is never a wire tag.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::WIRE
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One parsed line of the serial protocol
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// JSON body; for `Err` frames `{error, raw}` plus an optional `detail`
    pub payload: Payload,
}

impl Frame {
    /// Create a frame
    pub fn new(kind: FrameKind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    /// Create an `ERR` frame for a rejected line
    pub fn error(reason: &str, raw: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("error".to_string(), Value::from(reason));
        payload.insert("raw".to_string(), Value::from(raw));
        Self::new(FrameKind::Err, payload)
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.payload
            .insert("detail".to_string(), Value::String(detail.into()));
        self
    }

    /// Serialize to a wire line (without the trailing newline)
    pub fn to_line(&self) -> String {
        format!("@{} {}", self.kind.name(), Value::Object(self.payload.clone()))
    }

    /// Reason of an `ERR` frame
    pub fn error_reason(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Err => self.payload.get("error").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Raw line of an `ERR` frame
    pub fn raw(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Err => self.payload.get("raw").and_then(Value::as_str),
            _ => None,
        }
    }

    /// An untagged line that is shaped like JSON.
    ///
    /// These are almost always the tail of a frame split by the transport,
    /// not line noise.
    pub fn is_fragment(&self) -> bool {
        self.error_reason() == Some(ERR_UNKNOWN_PREFIX)
            && self
                .raw()
                .map(|raw| raw.starts_with('{') || raw.ends_with('}'))
                .unwrap_or(false)
    }
}

/// Parse one line from the controller. Never fails: anything unusable
/// becomes an `ERR` frame carrying the reason and the raw text.
pub fn parse_line(line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() {
        return Frame::error(ERR_EMPTY_LINE, "");
    }

    let (tag, body) = match line.split_once(char::is_whitespace) {
        Some((tag, body)) => (tag, body.trim()),
        None => (line, ""),
    };

    let kind = match tag.strip_prefix('@').and_then(FrameKind::from_name) {
        Some(kind) => kind,
        None => return Frame::error(ERR_UNKNOWN_PREFIX, line),
    };

    if body.is_empty() {
        return Frame::error(ERR_MISSING_PAYLOAD, line);
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(payload)) => Frame::new(kind, payload),
        Ok(_) => Frame::error(ERR_PAYLOAD_NOT_DICT, line),
        Err(e) => Frame::error(ERR_JSON_PARSE, line).with_detail(e.to_string()),
    }
}

// ============================================================================
// Vocabulary
// ============================================================================

/// Valve position in bus vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValveState {
    /// Open (`open` on the wire)
    #[serde(rename = "ON")]
    On,
    /// Closed (`closed` on the wire)
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

impl ValveState {
    /// Bus representation
    pub fn as_bus_str(&self) -> &'static str {
        match self {
            ValveState::On => "ON",
            ValveState::Off => "OFF",
        }
    }

    /// Controller representation
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ValveState::On => "open",
            ValveState::Off => "closed",
        }
    }

    /// Parse bus vocabulary (`ON`/`OFF`)
    pub fn from_bus(value: &str) -> Option<Self> {
        match value {
            "ON" => Some(ValveState::On),
            "OFF" => Some(ValveState::Off),
            _ => None,
        }
    }

    /// Translate controller vocabulary. Anything but `open` reads as closed.
    pub fn from_wire(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("open") {
            ValveState::On
        } else {
            ValveState::Off
        }
    }
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_bus_str())
    }
}

/// Controller operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Controller drives the valve from flow thresholds
    #[default]
    Auto,
    /// Valve follows operator commands
    Manual,
}

impl Mode {
    /// Wire and bus representation (identical)
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
        }
    }

    /// Parse, case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Mode::Auto),
            "manual" => Some(Mode::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the controller reaches the valve node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValvePath {
    /// Controller picks
    #[default]
    Auto,
    /// Unicast to the configured node id
    Direct,
    /// Through the binding table
    Binding,
}

impl ValvePath {
    /// Wire and bus representation (identical)
    pub fn as_str(&self) -> &'static str {
        match self {
            ValvePath::Auto => "auto",
            ValvePath::Direct => "direct",
            ValvePath::Binding => "binding",
        }
    }

    /// Parse, case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(ValvePath::Auto),
            "direct" => Some(ValvePath::Direct),
            "binding" => Some(ValvePath::Binding),
            _ => None,
        }
    }
}

impl fmt::Display for ValvePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Encode a command as a `@CMD` line.
///
/// Binds (or reuses) the numeric controller id for the command's correlation
/// id and maps bus vocabulary to controller vocabulary. Returns the id
/// together with the line (no trailing newline).
pub fn encode_command(
    command: &Command,
    ids: &CorrelationMap,
    now: Instant,
) -> Result<(u32, String), CommandError> {
    let id = ids.bind(&command.correlation_id, now)?;

    let mut payload = Payload::new();
    payload.insert("id".to_string(), Value::from(id));
    payload.insert("op".to_string(), Value::from(command.operation.name()));
    write_params(&command.operation, &mut payload);

    Ok((id, Frame::new(FrameKind::Cmd, payload).to_line()))
}

fn write_params(operation: &Operation, payload: &mut Payload) {
    let mut put = |key: &str, value: Value| {
        payload.insert(key.to_string(), value);
    };
    match operation {
        Operation::Info => {}
        Operation::ModeSet { value } => put("value", value.as_str().into()),
        Operation::ThresholdSet { close_th, open_th } => {
            put("close_th", (*close_th).into());
            put("open_th", (*open_th).into());
        }
        Operation::ValveSet { value } => put("value", value.as_wire_str().into()),
        Operation::ValvePathSet { value } => put("value", value.as_str().into()),
        Operation::ValveTargetSet { node_id, dst_ep } => {
            put("node_id", node_id.as_str().into());
            put("dst_ep", (*dst_ep).into());
        }
        Operation::ValvePair {
            eui64,
            node_id,
            bind_index,
            dst_ep,
        } => {
            put("eui64", eui64.as_str().into());
            put("node_id", node_id.as_str().into());
            put("bind_index", (*bind_index).into());
            put("dst_ep", (*dst_ep).into());
        }
        Operation::NetForm {
            pan_id,
            ch,
            tx_power,
            force,
        } => {
            put("pan_id", pan_id.as_str().into());
            put("ch", (*ch).into());
            put("tx_power", (*tx_power).into());
            // The controller firmware parses flags as unsigned integers.
            put("force", u8::from(*force).into());
        }
        Operation::UartGatewaySet { enable } => put("enable", u8::from(*enable).into()),
    }
}

/// Acknowledgment in bus form
#[derive(Debug, Clone, PartialEq)]
pub struct BusAck {
    /// Caller-chosen correlation id
    pub correlation_id: String,
    /// Whether the controller accepted the command
    pub ok: bool,
    /// Controller message or rejection reason
    pub reason: String,
    /// Remaining controller fields (e.g. `valve`, `mode`)
    pub extra: Payload,
}

impl BusAck {
    /// Create a locally generated ack (rejection, timeout, write failure)
    pub fn new(correlation_id: impl Into<String>, ok: bool, reason: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok,
            reason: reason.into(),
            extra: Payload::new(),
        }
    }

    /// JSON published on the ack topic
    pub fn to_json(&self, timestamp: i64) -> Value {
        serde_json::json!({
            "correlationId": self.correlation_id,
            "ok": self.ok,
            "reason": self.reason,
            "timestamp": timestamp,
        })
    }
}

/// Translate a controller `ACK` payload to bus form.
///
/// Controller acks carry the numeric `id` bound by [`encode_command`]; acks
/// that already carry a `cid`/`correlationId` are passed through. Returns
/// `None` when the id was never bound (late ack after eviction, or an ack
/// for a command sent by another tool on the same line).
pub fn translate_ack(payload: &Payload, ids: &CorrelationMap) -> Option<BusAck> {
    let correlation_id = match payload
        .get("correlationId")
        .or_else(|| payload.get("cid"))
        .and_then(Value::as_str)
    {
        Some(cid) => cid.to_string(),
        None => {
            let id = payload.get("id").and_then(Value::as_u64)?;
            ids.correlation_id(u32::try_from(id).ok()?)?
        }
    };

    let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let reason = payload
        .get("msg")
        .or_else(|| payload.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let extra = payload
        .iter()
        .filter(|(key, _)| {
            !matches!(
                key.as_str(),
                "id" | "cid" | "correlationId" | "ok" | "msg" | "reason"
            )
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(BusAck {
        correlation_id,
        ok,
        reason,
        extra,
    })
}

/// Telemetry fields reported by a `DATA` frame, already in bus vocabulary.
/// Absent fields are `None` and leave the cached value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub flow: Option<f64>,
    pub battery: Option<u8>,
    pub valve: Option<ValveState>,
    pub mode: Option<Mode>,
    pub valve_path: Option<ValvePath>,
    pub valve_known: Option<bool>,
    pub valve_node_id: Option<String>,
    pub tx_pending: Option<bool>,
}

/// Translate a controller `DATA` payload
pub fn translate_telemetry(payload: &Payload) -> Telemetry {
    Telemetry {
        flow: payload.get("flow").and_then(Value::as_f64),
        battery: payload
            .get("battery")
            .and_then(Value::as_f64)
            .map(|b| b.clamp(0.0, 100.0).round() as u8),
        valve: payload
            .get("valve")
            .and_then(Value::as_str)
            .map(ValveState::from_wire),
        mode: payload.get("mode").and_then(Value::as_str).and_then(Mode::parse),
        valve_path: payload
            .get("valve_path")
            .and_then(Value::as_str)
            .and_then(ValvePath::parse),
        valve_known: payload.get("valve_known").and_then(Value::as_bool),
        valve_node_id: payload
            .get("valve_node_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        tx_pending: payload.get("tx_pending").and_then(Value::as_bool),
    }
}
