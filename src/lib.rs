//! # WFMS - Water Flow Monitoring System
//!
//! Core of the UART/MQTT bridge between a valve/flow field controller and
//! operator dashboards. This crate has no I/O: it holds the pieces the
//! gateway service wires together.
//!
//! ## Key Features
//!
//! - **Wire codec**: `@TAG {json}` lines, never panics on bad input
//! - **Correlation**: string correlation ids mapped to controller ids, with eviction
//! - **Admission control**: lock, per-actor/global cooldowns, duplicate suppression
//! - **State cache**: retained device state and controller info
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use wfms::{parse_line, encode_command, Command, CorrelationMap, FrameKind, Operation, ValveState};
//!
//! let ids = CorrelationMap::new(Duration::from_secs(60));
//! let cmd = Command::new("c-1", "alice", Operation::ValveSet { value: ValveState::On });
//!
//! let (id, line) = encode_command(&cmd, &ids, Instant::now()).unwrap();
//! let frame = parse_line(&line);
//! assert_eq!(frame.kind, FrameKind::Cmd);
//! assert_eq!(frame.payload["value"], "open");
//! assert_eq!(ids.correlation_id(id).as_deref(), Some("c-1"));
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frame types, line codec, vocabulary translation
//! - [`command`]: Bus commands and structural validation
//! - [`correlation`]: Correlation id <-> controller id map
//! - [`correlator`]: Ack waiters
//! - [`rules`]: Admission control
//! - [`state`]: Device state and controller info cache
//! - [`runtime`]: Counters, connectivity flags, operator log ring
//! - [`topics`]: Bus topic names

// Modules
pub mod command;
pub mod correlation;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod rules;
pub mod runtime;
pub mod state;
pub mod topics;

// Re-exports for convenient access
pub use command::{Command, CommandSource, Operation, Rejection};
pub use correlation::CorrelationMap;
pub use correlator::{AckCorrelator, AckOutcome, AckWaiter};
pub use error::{CommandError, Result, RulesError, WfmsError};
pub use protocol::{
    encode_command, parse_line, translate_ack, translate_telemetry, BusAck, Frame, FrameKind,
    Mode, Payload, Telemetry, ValvePath, ValveState,
};
pub use rules::{Admission, RulesConfig, RulesEngine, RulesStats, RulesUpdate, RulesView};
pub use runtime::{Counters, Health, LogEntry, RuntimeState};
pub use state::{unix_now, CoordinatorInfo, DeviceState, StateCache, TelemetrySample};
pub use topics::Topics;
