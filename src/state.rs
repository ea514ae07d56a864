//! State cache
//!
//! Last-known device state rebuilt from `DATA` and `INFO` frames, plus the
//! controller identity reported by heartbeats. Both live behind one mutex;
//! the published views are plain serializable snapshots.

use crate::command::Operation;
use crate::protocol::{translate_telemetry, Mode, Payload, ValvePath, ValveState};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Retained device state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub flow: f64,
    pub battery: u8,
    pub valve: ValveState,
    pub mode: Mode,
    pub valve_path: ValvePath,
    pub valve_known: bool,
    pub valve_node_id: String,
    pub tx_pending: bool,
    /// Unix seconds; never decreases
    pub updated_at: i64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            flow: 0.0,
            battery: 100,
            valve: ValveState::Off,
            mode: Mode::Auto,
            valve_path: ValvePath::Auto,
            valve_known: false,
            valve_node_id: String::new(),
            tx_pending: false,
            updated_at: 0,
        }
    }
}

impl DeviceState {
    fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
    }

    /// Non-retained sample published for each `DATA` frame
    pub fn sample(&self) -> TelemetrySample {
        TelemetrySample {
            flow: self.flow,
            battery: self.battery,
            valve: self.valve,
            mode: self.mode,
            ts: self.updated_at,
        }
    }
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub flow: f64,
    pub battery: u8,
    pub valve: ValveState,
    pub mode: Mode,
    pub ts: i64,
}

/// Controller identity and pairing info from `INFO` heartbeats
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorInfo {
    pub node_id: String,
    pub eui64: String,
    pub pan_id: String,
    pub channel: u8,
    pub tx_power: i64,
    pub net_state: i64,
    pub uart_gateway: bool,
    pub mode: Mode,
    pub valve_path: ValvePath,
    pub valve_known: bool,
    pub valve_eui64: String,
    pub valve_node_id: String,
    pub bind_index: u64,
    pub uptime: u64,
    pub updated_at: i64,
}

impl CoordinatorInfo {
    /// Merge the fields present in an `INFO` payload
    pub fn update_from_info(&mut self, info: &Payload, now: i64) {
        let text = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);

        if let Some(v) = text("node_id") {
            self.node_id = v;
        }
        if let Some(v) = text("eui64") {
            self.eui64 = v;
        }
        if let Some(v) = text("pan_id") {
            self.pan_id = v;
        }
        if let Some(v) = info.get("ch").and_then(Value::as_u64) {
            self.channel = u8::try_from(v).unwrap_or(self.channel);
        }
        if let Some(v) = info.get("tx_power").and_then(Value::as_i64) {
            self.tx_power = v;
        }
        if let Some(v) = info.get("net_state").and_then(Value::as_i64) {
            self.net_state = v;
        }
        if let Some(v) = info.get("uart_gateway").and_then(as_flag) {
            self.uart_gateway = v;
        }
        if let Some(v) = info.get("mode").and_then(Value::as_str).and_then(Mode::parse) {
            self.mode = v;
        }
        if let Some(v) = info
            .get("valve_path")
            .and_then(Value::as_str)
            .and_then(ValvePath::parse)
        {
            self.valve_path = v;
        }
        if let Some(v) = info.get("valve_known").and_then(as_flag) {
            self.valve_known = v;
        }
        if let Some(v) = text("valve_eui64") {
            self.valve_eui64 = v;
        }
        if let Some(v) = text("valve_node_id") {
            self.valve_node_id = v;
        }
        if let Some(v) = info.get("bind_index").and_then(Value::as_u64) {
            self.bind_index = v;
        }
        if let Some(v) = info.get("uptime").and_then(Value::as_u64) {
            self.uptime = v;
        }
        self.updated_at = self.updated_at.max(now);
    }
}

/// The firmware reports flags as either booleans or 0/1.
fn as_flag(value: &Value) -> Option<bool> {
    value.as_bool().or_else(|| value.as_u64().map(|v| v != 0))
}

#[derive(Debug, Default)]
struct Cache {
    device: DeviceState,
    info: CoordinatorInfo,
}

/// Shared state cache
#[derive(Debug, Default)]
pub struct StateCache {
    inner: Mutex<Cache>,
}

impl StateCache {
    /// Create a cache with default state
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the device state
    pub fn device(&self) -> DeviceState {
        self.lock().device.clone()
    }

    /// Snapshot of the controller info
    pub fn info(&self) -> CoordinatorInfo {
        self.lock().info.clone()
    }

    /// Apply a `DATA` payload. Returns the sample and the new state.
    pub fn apply_data(&self, payload: &Payload, now: i64) -> (TelemetrySample, DeviceState) {
        let telemetry = translate_telemetry(payload);
        let mut cache = self.lock();
        let device = &mut cache.device;

        if let Some(flow) = telemetry.flow {
            device.flow = flow;
        }
        if let Some(battery) = telemetry.battery {
            device.battery = battery;
        }
        if let Some(valve) = telemetry.valve {
            device.valve = valve;
        }
        if let Some(mode) = telemetry.mode {
            device.mode = mode;
        }
        if let Some(path) = telemetry.valve_path {
            device.valve_path = path;
        }
        if let Some(known) = telemetry.valve_known {
            device.valve_known = known;
        }
        if let Some(node_id) = telemetry.valve_node_id {
            device.valve_node_id = node_id;
        }
        if let Some(pending) = telemetry.tx_pending {
            device.tx_pending = pending;
        }
        device.touch(now);

        let snapshot = device.clone();
        if let Some(mode) = telemetry.mode {
            cache.info.mode = mode;
        }
        (snapshot.sample(), snapshot)
    }

    /// Apply an `INFO` payload. Mode, path and pairing flags are mirrored
    /// into the device state.
    pub fn apply_info(&self, payload: &Payload, now: i64) -> CoordinatorInfo {
        let mut cache = self.lock();
        cache.info.update_from_info(payload, now);

        let mode = payload.get("mode").and_then(Value::as_str).and_then(Mode::parse);
        let path = payload
            .get("valve_path")
            .and_then(Value::as_str)
            .and_then(ValvePath::parse);
        let known = payload.get("valve_known").and_then(as_flag);

        let device = &mut cache.device;
        if let Some(mode) = mode {
            device.mode = mode;
        }
        if let Some(path) = path {
            device.valve_path = path;
        }
        if let Some(known) = known {
            device.valve_known = known;
        }
        cache.info.clone()
    }

    /// Apply a successfully acknowledged operation. Returns the new state
    /// when the operation changed it.
    pub fn apply_ack(&self, operation: &Operation, now: i64) -> Option<DeviceState> {
        let mut cache = self.lock();
        match operation {
            Operation::ValveSet { value } => cache.device.valve = *value,
            Operation::ModeSet { value } => {
                cache.device.mode = *value;
                cache.info.mode = *value;
            }
            Operation::ValvePathSet { value } => {
                cache.device.valve_path = *value;
                cache.info.valve_path = *value;
            }
            _ => return None,
        }
        cache.device.touch(now);
        Some(cache.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_view() {
        let view = serde_json::to_value(DeviceState::default()).unwrap();
        assert_eq!(view["valve"], "OFF");
        assert_eq!(view["mode"], "auto");
        assert_eq!(view["valvePath"], "auto");
        assert_eq!(view["battery"], 100);
        assert_eq!(view["updatedAt"], 0);
    }

    #[test]
    fn test_apply_data_partial() {
        let cache = StateCache::new();
        cache.apply_data(&obj(json!({"flow": 150, "valve": "open", "battery": 85})), 100);
        let (sample, state) = cache.apply_data(&obj(json!({"flow": 120})), 101);

        assert_eq!(state.flow, 120.0);
        assert_eq!(state.valve, ValveState::On);
        assert_eq!(state.battery, 85);
        assert_eq!(sample.ts, 101);

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["valve"], "ON");
        assert!(json.get("valvePath").is_none());
    }

    #[test]
    fn test_updated_at_monotonic() {
        let cache = StateCache::new();
        cache.apply_data(&obj(json!({"flow": 1})), 200);
        let (_, state) = cache.apply_data(&obj(json!({"flow": 2})), 150);
        assert_eq!(state.updated_at, 200);
    }

    #[test]
    fn test_info_syncs_device_state() {
        let cache = StateCache::new();
        let info = cache.apply_info(
            &obj(json!({
                "node_id": "0x0000",
                "pan_id": "0xBEEF",
                "ch": 11,
                "mode": "manual",
                "valve_path": "direct",
                "valve_known": 1,
                "uart_gateway": true,
                "uptime": 120
            })),
            10,
        );
        assert_eq!(info.pan_id, "0xBEEF");
        assert_eq!(info.channel, 11);
        assert!(info.uart_gateway);

        let device = cache.device();
        assert_eq!(device.mode, Mode::Manual);
        assert_eq!(device.valve_path, ValvePath::Direct);
        assert!(device.valve_known);

        let view = serde_json::to_value(&info).unwrap();
        assert_eq!(view["panId"], "0xBEEF");
        assert_eq!(view["uptime"], 120);
    }

    #[test]
    fn test_data_syncs_info_mode() {
        let cache = StateCache::new();
        cache.apply_data(&obj(json!({"mode": "manual"})), 1);
        assert_eq!(cache.info().mode, Mode::Manual);
    }

    #[test]
    fn test_apply_ack() {
        let cache = StateCache::new();
        let state = cache
            .apply_ack(&Operation::ValveSet { value: ValveState::On }, 50)
            .unwrap();
        assert_eq!(state.valve, ValveState::On);
        assert_eq!(state.updated_at, 50);

        assert!(cache.apply_ack(&Operation::Info, 60).is_none());
        assert_eq!(cache.device().updated_at, 50);
    }
}
