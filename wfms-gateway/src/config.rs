// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for WFMS Gateway

use crate::error::{GatewayError, Result};
use std::net::IpAddr;
use std::time::Duration;
use wfms::{Mode, RulesConfig};

/// Gateway-level configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Site identifier; topics live under `wfms/{site}`
    pub site: String,

    /// How long a command waits for its ack
    pub ack_timeout: Duration,

    /// Reader poll timeout; bounds shutdown latency
    pub read_timeout: Duration,

    /// Upper bound on a single bus publish or subscribe
    pub publish_timeout: Duration,

    /// How long `stop` waits for a loop or command task before aborting it
    pub stop_grace: Duration,

    /// Capacity of the operator log ring
    pub log_capacity: usize,

    /// Initial admission rules
    pub rules: RulesConfig,

    /// Serial link
    pub serial: SerialConfig,

    /// Bus connection
    pub mqtt: MqttConfig,

    /// Admin interface
    pub admin: AdminConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            site: "lab1".to_string(),
            ack_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
            log_capacity: 100,
            rules: RulesConfig::default(),
            serial: SerialConfig::default(),
            mqtt: MqttConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration for a site
    pub fn for_site(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Default::default()
        }
    }

    /// Retention of the correlation id map: an entry must outlive both the
    /// dedupe window and the ack wait
    pub fn correlation_retention(&self) -> Duration {
        self.rules.dedupe_ttl.max(self.ack_timeout)
    }

    /// Reject values that would make the service misbehave
    pub fn validate(&self) -> Result<()> {
        if self.site.is_empty() || self.site.contains(['/', '+', '#']) {
            return Err(GatewayError::InvalidConfig(format!(
                "site must be a single topic level, got {:?}",
                self.site
            )));
        }
        if self.ack_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "ack_timeout must be positive".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "read_timeout must be positive".to_string(),
            ));
        }
        if self.publish_timeout.is_zero() || self.stop_grace.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "publish_timeout and stop_grace must be positive".to_string(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(GatewayError::InvalidConfig(
                "log_capacity must be positive".to_string(),
            ));
        }
        self.rules.validate()?;
        self.serial.validate()?;
        self.mqtt.validate()?;
        self.admin.validate()?;
        Ok(())
    }
}

/// Serial port settings
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path
    pub port: String,

    /// Baud rate
    pub baud: u32,

    /// Delay between reopen attempts while disconnected
    pub reconnect_interval: Duration,

    /// Bytes per write when pacing (0 = write whole lines)
    pub tx_chunk_size: usize,

    /// Pause between paced chunks
    pub tx_chunk_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            reconnect_interval: Duration::from_secs(3),
            tx_chunk_size: 8,
            tx_chunk_delay: Duration::from_millis(10),
        }
    }
}

impl SerialConfig {
    /// Create a configuration for a device path
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Whether writes are split into paced chunks
    pub fn pacing_enabled(&self) -> bool {
        self.tx_chunk_size > 0 && !self.tx_chunk_delay.is_zero()
    }

    fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "serial port must not be empty".to_string(),
            ));
        }
        if self.baud == 0 {
            return Err(GatewayError::InvalidConfig(
                "baud rate must be positive".to_string(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "reconnect_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Delay before polling again after a connection error
    pub reconnect_interval: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "wfms-gateway".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

impl MqttConfig {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "mqtt host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(GatewayError::InvalidConfig(
                "mqtt port must be in 1..=65535".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(GatewayError::InvalidConfig(
                "mqtt password given without a username".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admin interface settings
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Bind host; loopback only
    pub host: String,
    pub port: u16,
    /// Bearer token required on POST routes when set
    pub api_token: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_token: None,
        }
    }
}

impl AdminConfig {
    /// `host:port` bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        let loopback = self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !loopback {
            return Err(GatewayError::InvalidConfig(format!(
                "admin host must be a loopback address, got {}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(GatewayError::InvalidConfig(
                "admin port must be in 1..=65535".to_string(),
            ));
        }
        if matches!(&self.api_token, Some(token) if token.trim().is_empty()) {
            return Err(GatewayError::InvalidConfig(
                "api token must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Simulated controller settings
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// `DATA` period (`None` disables the generator)
    pub data_interval: Option<Duration>,

    /// `INFO` period (`None` disables the heartbeat)
    pub info_interval: Option<Duration>,

    /// Probability of silently dropping an ack
    pub drop_ack_prob: f64,

    /// Processing delay range applied before each ack
    pub min_delay: Duration,
    pub max_delay: Duration,

    /// Controller mode at start
    pub initial_mode: Mode,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            data_interval: Some(Duration::from_secs(1)),
            info_interval: Some(Duration::from_secs(10)),
            drop_ack_prob: 0.0,
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            initial_mode: Mode::Auto,
        }
    }
}

impl SimulatedConfig {
    /// A controller that only speaks when spoken to
    pub fn quiet() -> Self {
        Self {
            data_interval: None,
            info_interval: None,
            ..Default::default()
        }
    }

    /// Set the ack drop probability
    pub fn with_drop_ack_prob(mut self, prob: f64) -> Self {
        self.drop_ack_prob = prob;
        self
    }

    /// Set the initial controller mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.initial_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.drop_ack_prob) {
            return Err(GatewayError::InvalidConfig(format!(
                "drop_ack_prob must be within [0, 1], got {}",
                self.drop_ack_prob
            )));
        }
        if self.min_delay > self.max_delay {
            return Err(GatewayError::InvalidConfig(
                "min_delay must not exceed max_delay".to_string(),
            ));
        }
        if matches!(self.data_interval, Some(d) if d.is_zero())
            || matches!(self.info_interval, Some(d) if d.is_zero())
        {
            return Err(GatewayError::InvalidConfig(
                "simulation intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
