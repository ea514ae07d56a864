// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for WFMS Gateway

use crate::service::ServiceState;
use thiserror::Error;

/// Main error type for Gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rules configuration rejected
    #[error("Invalid rules: {0}")]
    Rules(#[from] wfms::RulesError),

    /// Lifecycle call made in the wrong state
    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: ServiceState,
    },

    /// Transport could not be brought up
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bus could not be brought up
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Serial (or simulated) link errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Device could not be opened
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// No open device
    #[error("Transport not connected")]
    NotConnected,

    /// Transport already started
    #[error("Transport already started")]
    AlreadyStarted,

    /// I/O failure on an open device
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message bus errors
#[derive(Error, Debug)]
pub enum BusError {
    /// Client rejected the request (queue closed or full)
    #[error("Bus client error: {0}")]
    Client(String),

    /// Not connected to the broker
    #[error("Bus not connected")]
    NotConnected,

    /// Request did not complete in time
    #[error("Bus request timed out")]
    Timeout,

    /// Payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for BusError {
    fn from(err: rumqttc::ClientError) -> Self {
        BusError::Client(err.to_string())
    }
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
