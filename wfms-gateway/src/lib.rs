// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # WFMS Gateway - UART/MQTT bridge service
//!
//! Bridges a valve/flow field controller, reachable over a newline-delimited
//! serial link, to an MQTT broker used by operator dashboards.
//!
//! ## Features
//!
//! - **Transports**: real serial port with background reconnect, or a
//!   simulated controller for running without hardware
//! - **Bus**: MQTT client with last will and resubscription on reconnect,
//!   or an in-memory bus for tests
//! - **Command path**: validation, admission rules, correlation and ack
//!   timeouts, with exactly one ack published per accepted command
//! - **Telemetry path**: telemetry samples and a retained full state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wfms_gateway::{GatewayConfig, GatewayService, MemoryBus, SimulatedConfig, SimulatedTransport};
//!
//! # async fn run() -> wfms_gateway::Result<()> {
//! let transport = Arc::new(SimulatedTransport::new(SimulatedConfig::default()));
//! let (bus, events) = MemoryBus::new();
//!
//! let service = GatewayService::new(GatewayConfig::for_site("lab1"), transport, Arc::new(bus), events)?;
//! service.start().await?;
//! // ...
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  controller ──UART──▶ Transport ──▶ reader loop ──▶ state cache ──▶ MessageBus ──▶ dashboards
//!                           ▲                                              │
//!                           └──── command task ◀── rules ◀── bus loop ◀────┘
//! ```

pub mod bus;
pub mod config;
mod error;
mod service;
pub mod transport;

// Public API
pub use bus::{BusEvent, BusMessage, LastWill, MemoryBus, MessageBus, Publication, Qos};
pub use config::{AdminConfig, GatewayConfig, MqttConfig, SerialConfig, SimulatedConfig};
pub use error::{BusError, GatewayError, Result, TransportError};
pub use service::{
    status_payload, GatewayService, ServiceState, REASON_ENCODE_FAILED, REASON_TIMEOUT,
    REASON_WRITE_FAILED,
};
pub use transport::{SimulatedDevice, SimulatedTransport, Transport};

#[cfg(feature = "mqtt")]
pub use bus::MqttBus;
#[cfg(feature = "serial")]
pub use transport::SerialTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
