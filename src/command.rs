//! Command model and structural validation
//!
//! Bus commands arrive as JSON objects on one of three topics. Structural
//! validation happens here, before admission control; failures become a
//! [`Rejection`] that the gateway publishes as a negative ack.

use crate::protocol::{Mode, ValvePath, ValveState};
use serde_json::{Map, Value};
use std::fmt;

/// Correlation id used when a rejected payload does not carry one
pub const UNKNOWN_CID: &str = "unknown";

/// Actor used when a command does not name one
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Rejection reasons produced by structural validation
pub mod reason {
    pub const PAYLOAD_NOT_DICT: &str = "payload_not_dict";
    pub const MISSING_CID: &str = "missing_cid";
    pub const INVALID_VALUE: &str = "invalid_value";
    pub const UNKNOWN_OP: &str = "unknown_op";
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const THRESHOLD_ORDER: &str = "open_th must be < close_th";
    pub const INVALID_EUI64: &str = "invalid_eui64";
    pub const INVALID_CHANNEL: &str = "invalid_channel";
}

/// Lowest IEEE 802.15.4 2.4 GHz channel
pub const CHANNEL_MIN: u8 = 11;
/// Highest IEEE 802.15.4 2.4 GHz channel
pub const CHANNEL_MAX: u8 = 26;

/// Bus topic a command arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// `cmd/valve`: `value` is `ON`/`OFF`
    Valve,
    /// `cmd/mode`: `value` is `auto`/`manual`
    Mode,
    /// `cmd/op`: `op` names the operation, params inline
    Operation,
}

/// Controller operation with its parameters
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Request an `INFO` frame
    Info,
    /// Switch operating mode
    ModeSet { value: Mode },
    /// Auto-mode flow thresholds; `open_th < close_th`
    ThresholdSet { close_th: i64, open_th: i64 },
    /// Drive the valve (manual mode only)
    ValveSet { value: ValveState },
    /// Select how the controller reaches the valve node
    ValvePathSet { value: ValvePath },
    /// Direct-path target
    ValveTargetSet { node_id: String, dst_ep: u8 },
    /// Bind the valve node
    ValvePair {
        eui64: String,
        node_id: String,
        bind_index: u8,
        dst_ep: u8,
    },
    /// Form a network
    NetForm {
        pan_id: String,
        ch: u8,
        tx_power: i8,
        force: bool,
    },
    /// Enable or disable the controller's UART gateway role
    UartGatewaySet { enable: bool },
}

impl Operation {
    /// Wire name of the operation
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Info => "info",
            Operation::ModeSet { .. } => "mode_set",
            Operation::ThresholdSet { .. } => "threshold_set",
            Operation::ValveSet { .. } => "valve_set",
            Operation::ValvePathSet { .. } => "valve_path_set",
            Operation::ValveTargetSet { .. } => "valve_target_set",
            Operation::ValvePair { .. } => "valve_pair",
            Operation::NetForm { .. } => "net_form",
            Operation::UartGatewaySet { .. } => "uart_gateway_set",
        }
    }

    /// Build an operation from its wire name and a parameter object.
    ///
    /// On failure returns one of the [`reason`] constants.
    pub fn parse(op: &str, params: &Map<String, Value>) -> Result<Self, &'static str> {
        let operation = match op {
            "info" => Operation::Info,
            "mode_set" => Operation::ModeSet {
                value: str_param(params, "value")
                    .and_then(Mode::parse)
                    .ok_or(reason::INVALID_VALUE)?,
            },
            "threshold_set" => {
                let close_th = int_param(params, "close_th").ok_or(reason::INVALID_PARAMS)?;
                let open_th = int_param(params, "open_th").ok_or(reason::INVALID_PARAMS)?;
                if open_th >= close_th {
                    return Err(reason::THRESHOLD_ORDER);
                }
                Operation::ThresholdSet { close_th, open_th }
            }
            "valve_set" => Operation::ValveSet {
                value: parse_valve_value(params).ok_or(reason::INVALID_VALUE)?,
            },
            "valve_path_set" => Operation::ValvePathSet {
                value: str_param(params, "value")
                    .and_then(ValvePath::parse)
                    .ok_or(reason::INVALID_VALUE)?,
            },
            "valve_target_set" => Operation::ValveTargetSet {
                node_id: node_id_param(params)?,
                dst_ep: small_param(params, "dst_ep", 1)?,
            },
            "valve_pair" => {
                let eui64 = str_param(params, "eui64").ok_or(reason::INVALID_PARAMS)?;
                if eui64.len() != 16 || !eui64.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(reason::INVALID_EUI64);
                }
                Operation::ValvePair {
                    eui64: eui64.to_ascii_uppercase(),
                    node_id: node_id_param(params)?,
                    bind_index: small_param(params, "bind_index", 0)?,
                    dst_ep: small_param(params, "dst_ep", 1)?,
                }
            }
            "net_form" => {
                let ch = int_param(params, "ch").ok_or(reason::INVALID_PARAMS)?;
                if !(i64::from(CHANNEL_MIN)..=i64::from(CHANNEL_MAX)).contains(&ch) {
                    return Err(reason::INVALID_CHANNEL);
                }
                let tx_power = match params.get("tx_power") {
                    None => 8,
                    Some(value) => value
                        .as_i64()
                        .and_then(|p| i8::try_from(p).ok())
                        .ok_or(reason::INVALID_PARAMS)?,
                };
                Operation::NetForm {
                    pan_id: str_param(params, "pan_id")
                        .ok_or(reason::INVALID_PARAMS)?
                        .to_string(),
                    ch: ch as u8,
                    tx_power,
                    force: flag_param(params, "force")?.unwrap_or(false),
                }
            }
            "uart_gateway_set" => Operation::UartGatewaySet {
                enable: flag_param(params, "enable")?.ok_or(reason::INVALID_PARAMS)?,
            },
            _ => return Err(reason::UNKNOWN_OP),
        };
        Ok(operation)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A structurally valid command ready for admission control
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Caller-chosen correlation id
    pub correlation_id: String,
    /// Who issued the command
    pub actor: String,
    /// Caller timestamp (unix seconds), informational only
    pub timestamp: Option<i64>,
    /// What to do
    pub operation: Operation,
}

/// Structural rejection of a bus command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Correlation id to ack, or [`UNKNOWN_CID`]
    pub correlation_id: String,
    /// One of the [`reason`] constants
    pub reason: &'static str,
}

impl Command {
    /// Create a command
    pub fn new(
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            actor: actor.into(),
            timestamp: None,
            operation,
        }
    }

    /// Validate a decoded bus payload.
    ///
    /// Accepts `correlationId`/`cid`, `actor`/`by` and `timestamp`/`ts`.
    pub fn from_bus(source: CommandSource, payload: &Value) -> Result<Self, Rejection> {
        let object = payload.as_object().ok_or(Rejection {
            correlation_id: UNKNOWN_CID.to_string(),
            reason: reason::PAYLOAD_NOT_DICT,
        })?;

        let correlation_id = match ["correlationId", "cid"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
        {
            Some(cid) if !cid.trim().is_empty() => cid.to_string(),
            _ => {
                return Err(Rejection {
                    correlation_id: UNKNOWN_CID.to_string(),
                    reason: reason::MISSING_CID,
                })
            }
        };
        let reject = |reason| Rejection {
            correlation_id: correlation_id.clone(),
            reason,
        };

        let operation = match source {
            CommandSource::Valve => Operation::ValveSet {
                value: parse_valve_value(object).ok_or_else(|| reject(reason::INVALID_VALUE))?,
            },
            CommandSource::Mode => Operation::ModeSet {
                value: str_param(object, "value")
                    .and_then(Mode::parse)
                    .ok_or_else(|| reject(reason::INVALID_VALUE))?,
            },
            CommandSource::Operation => {
                let op = str_param(object, "op").ok_or_else(|| reject(reason::UNKNOWN_OP))?;
                Operation::parse(op, object).map_err(reject)?
            }
        };

        let actor = ["actor", "by"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .filter(|actor| !actor.trim().is_empty())
            .unwrap_or(ANONYMOUS_ACTOR)
            .to_string();

        let timestamp = ["timestamp", "ts"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_i64));

        Ok(Self {
            correlation_id,
            actor,
            timestamp,
            operation,
        })
    }
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn int_param(params: &Map<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

/// Valve commands take bus vocabulary; the wire words are tolerated.
fn parse_valve_value(params: &Map<String, Value>) -> Option<ValveState> {
    match str_param(params, "value")? {
        "ON" | "open" => Some(ValveState::On),
        "OFF" | "closed" => Some(ValveState::Off),
        _ => None,
    }
}

fn node_id_param(params: &Map<String, Value>) -> Result<String, &'static str> {
    match params.get("node_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|id| *id <= u64::from(u16::MAX))
            .map(|id| format!("0x{:04X}", id))
            .ok_or(reason::INVALID_PARAMS),
        _ => Err(reason::INVALID_PARAMS),
    }
}

fn small_param(params: &Map<String, Value>, key: &str, default: u8) -> Result<u8, &'static str> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or(reason::INVALID_PARAMS),
    }
}

/// Flags accept JSON booleans or 0/1.
fn flag_param(params: &Map<String, Value>, key: &str) -> Result<Option<bool>, &'static str> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(value) => match value.as_u64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(reason::INVALID_PARAMS),
        },
    }
}
