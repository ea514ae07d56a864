// WFMS Bridge - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the bridge.
//!
//! Values are mirrored from the gateway's runtime snapshot on every scrape,
//! so the gateway itself never touches the registry.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_gauge, register_int_gauge_vec, Encoder, Gauge, IntGauge,
    IntGaugeVec, TextEncoder,
};
use wfms::Health;

lazy_static! {
    // ============================================================
    // Traffic
    // ============================================================

    /// `DATA` frames handled since start.
    pub static ref TELEMETRY_FRAMES_TOTAL: IntGauge = register_int_gauge!(
        "wfms_telemetry_frames_total",
        "Telemetry frames received from the controller"
    ).unwrap();

    /// Bus commands received since start.
    pub static ref COMMANDS_TOTAL: IntGauge = register_int_gauge!(
        "wfms_commands_total",
        "Commands received on the bus"
    ).unwrap();

    /// Acks published, labeled `ok` / `fail`.
    pub static ref ACKS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "wfms_acks_total",
        "Acks published on the bus",
        &["result"]
    ).unwrap();

    // ============================================================
    // Connectivity
    // ============================================================

    pub static ref TRANSPORT_CONNECTED: IntGauge = register_int_gauge!(
        "wfms_transport_connected",
        "Controller link state (1=connected)"
    ).unwrap();

    pub static ref BUS_CONNECTED: IntGauge = register_int_gauge!(
        "wfms_bus_connected",
        "Broker session state (1=connected)"
    ).unwrap();

    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "wfms_uptime_seconds",
        "Seconds since the gateway started"
    ).unwrap();
}

/// Mirror a runtime snapshot into the registry.
pub fn refresh(health: &Health) {
    let counters = &health.counters;
    TELEMETRY_FRAMES_TOTAL.set(counters.telemetry as i64);
    COMMANDS_TOTAL.set(counters.commands as i64);
    ACKS_TOTAL.with_label_values(&["ok"]).set(counters.ack_ok as i64);
    ACKS_TOTAL
        .with_label_values(&["fail"])
        .set(counters.ack_fail as i64);

    TRANSPORT_CONNECTED.set(i64::from(health.transport_connected));
    BUS_CONNECTED.set(i64::from(health.bus_connected));
    UPTIME_SECONDS.set(health.uptime_seconds);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
