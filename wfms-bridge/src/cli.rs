// WFMS Bridge - command line
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Command line and environment configuration.

use clap::Parser;
use std::time::Duration;
use wfms::RulesConfig;
use wfms_gateway::{
    AdminConfig, GatewayConfig, GatewayError, MqttConfig, SerialConfig, SimulatedConfig,
};

/// WFMS UART/MQTT bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Site identifier; topics live under wfms/<site>
    #[arg(long, env = "SITE", default_value = "lab1")]
    pub site: String,

    /// Serial device of the field controller
    #[arg(long, env = "UART_PORT", default_value = "/dev/ttyUSB0")]
    pub uart_port: String,

    #[arg(long, env = "UART_BAUD", default_value_t = 115_200)]
    pub uart_baud: u32,

    /// Bytes per paced write (0 disables pacing)
    #[arg(long, env = "UART_TX_CHUNK", default_value_t = 8)]
    pub uart_tx_chunk: usize,

    /// Delay between paced chunks, in milliseconds
    #[arg(long, env = "UART_TX_DELAY_MS", default_value_t = 10)]
    pub uart_tx_delay_ms: u64,

    /// Seconds between serial reconnect attempts
    #[arg(long, env = "UART_RECONNECT_SECS", default_value_t = 3)]
    pub uart_reconnect_secs: u64,

    #[arg(long, env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub mqtt_host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "wfms-gateway")]
    pub mqtt_client_id: String,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// Seconds to wait for a controller ack
    #[arg(long, env = "ACK_TIMEOUT_SECS", default_value_t = 3.0)]
    pub ack_timeout_secs: f64,

    /// Reject every command
    #[arg(long, env = "RULE_LOCK")]
    pub rule_lock: bool,

    #[arg(long, env = "RULE_COOLDOWN_USER_SECS", default_value_t = 3)]
    pub rule_cooldown_user_secs: u64,

    #[arg(long, env = "RULE_COOLDOWN_GLOBAL_SECS", default_value_t = 1)]
    pub rule_cooldown_global_secs: u64,

    #[arg(long, env = "RULE_DEDUPE_TTL_SECS", default_value_t = 60)]
    pub rule_dedupe_ttl_secs: u64,

    /// Admin interface host (loopback only)
    #[arg(long, env = "API_HOST", default_value = "127.0.0.1")]
    pub api_host: String,

    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Bearer token required on admin POST routes
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Run against a simulated controller instead of the serial port
    #[arg(long, env = "SIMULATE")]
    pub simulate: bool,

    /// Probability that the simulated controller drops an ack
    #[arg(long, env = "SIM_DROP_ACK_PROB", default_value_t = 0.0)]
    pub drop_ack_prob: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Gateway configuration, validated
    pub fn gateway_config(&self) -> Result<GatewayConfig, GatewayError> {
        let ack_timeout = Duration::try_from_secs_f64(self.ack_timeout_secs).map_err(|_| {
            GatewayError::InvalidConfig(format!(
                "ack timeout must be a positive number of seconds, got {}",
                self.ack_timeout_secs
            ))
        })?;

        let config = GatewayConfig {
            site: self.site.clone(),
            ack_timeout,
            rules: RulesConfig::default()
                .with_lock(self.rule_lock)
                .with_cooldown_per_actor(Duration::from_secs(self.rule_cooldown_user_secs))
                .with_cooldown_global(Duration::from_secs(self.rule_cooldown_global_secs))
                .with_dedupe_ttl(Duration::from_secs(self.rule_dedupe_ttl_secs)),
            serial: SerialConfig {
                baud: self.uart_baud,
                reconnect_interval: Duration::from_secs(self.uart_reconnect_secs),
                tx_chunk_size: self.uart_tx_chunk,
                tx_chunk_delay: Duration::from_millis(self.uart_tx_delay_ms),
                ..SerialConfig::with_port(&self.uart_port)
            },
            mqtt: MqttConfig {
                host: self.mqtt_host.clone(),
                port: self.mqtt_port,
                client_id: self.mqtt_client_id.clone(),
                username: self.mqtt_username.clone(),
                password: self.mqtt_password.clone(),
                ..MqttConfig::default()
            },
            admin: AdminConfig {
                host: self.api_host.clone(),
                port: self.api_port,
                api_token: self.api_token.clone(),
            },
            ..GatewayConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Simulated controller configuration, validated
    pub fn simulated_config(&self) -> Result<SimulatedConfig, GatewayError> {
        let config = SimulatedConfig::default().with_drop_ack_prob(self.drop_ack_prob);
        config.validate()?;
        Ok(config)
    }
}
