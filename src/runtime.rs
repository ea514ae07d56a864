//! Runtime state shared with the admin interface
//!
//! Counters, connectivity flags and a bounded ring of operator-facing log
//! lines. This ring is not the tracing output: the gateway writes to it
//! explicitly for events an operator should see from the admin interface.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Default ring capacity
pub const DEFAULT_LOG_CAPACITY: usize = 100;
/// Default number of entries returned by [`RuntimeState::get_logs`]
pub const DEFAULT_LOG_LIMIT: usize = 50;
/// Largest accepted `limit`
pub const MAX_LOG_LIMIT: usize = 200;

/// One operator-facing log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Unix seconds
    pub ts: i64,
    /// Upper-case level (`INFO`, `WARNING`, `ERROR`, `COORD_<tag>`)
    pub level: String,
    pub message: String,
}

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    /// `DATA` frames handled
    pub telemetry: u64,
    /// Bus commands received
    pub commands: u64,
    /// Positive acks published
    pub ack_ok: u64,
    /// Negative acks published (rejections, timeouts, write failures)
    pub ack_fail: u64,
}

/// Health snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub up: bool,
    pub uptime_seconds: f64,
    pub bus_connected: bool,
    pub transport_connected: bool,
    pub counters: Counters,
}

#[derive(Debug)]
struct Inner {
    bus_connected: bool,
    transport_connected: bool,
    counters: Counters,
    logs: VecDeque<LogEntry>,
}

/// Thread-safe runtime state
#[derive(Debug)]
pub struct RuntimeState {
    started_at: Instant,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl RuntimeState {
    /// Create runtime state keeping at most `capacity` log lines
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            started_at: Instant::now(),
            capacity,
            inner: Mutex::new(Inner {
                bus_connected: false,
                transport_connected: false,
                counters: Counters::default(),
                logs: VecDeque::with_capacity(capacity),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.lock().bus_connected = connected;
    }

    pub fn set_transport_connected(&self, connected: bool) {
        self.lock().transport_connected = connected;
    }

    pub fn inc_telemetry(&self) {
        self.lock().counters.telemetry += 1;
    }

    pub fn inc_commands(&self) {
        self.lock().counters.commands += 1;
    }

    pub fn inc_ack(&self, ok: bool) {
        let mut inner = self.lock();
        if ok {
            inner.counters.ack_ok += 1;
        } else {
            inner.counters.ack_fail += 1;
        }
    }

    /// Current counters
    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Seconds since this state was created
    pub fn uptime_seconds(&self) -> f64 {
        (self.started_at.elapsed().as_secs_f64() * 10.0).round() / 10.0
    }

    /// Health snapshot. The gateway counts as up while the bus is connected.
    pub fn get_health(&self) -> Health {
        let inner = self.lock();
        Health {
            up: inner.bus_connected,
            uptime_seconds: self.uptime_seconds(),
            bus_connected: inner.bus_connected,
            transport_connected: inner.transport_connected,
            counters: inner.counters,
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn add_log(&self, level: &str, message: impl Into<String>) {
        let entry = LogEntry {
            ts: crate::state::unix_now(),
            level: level.to_ascii_uppercase(),
            message: message.into(),
        };
        let mut inner = self.lock();
        if inner.logs.len() == self.capacity {
            inner.logs.pop_front();
        }
        inner.logs.push_back(entry);
    }

    /// Newest-first log lines, optionally filtered by level.
    /// `limit` is clamped to `1..=MAX_LOG_LIMIT`.
    pub fn get_logs(&self, limit: usize, level: Option<&str>) -> Vec<LogEntry> {
        let limit = limit.clamp(1, MAX_LOG_LIMIT);
        let level = level
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_ascii_uppercase);

        self.lock()
            .logs
            .iter()
            .rev()
            .filter(|entry| level.as_deref().map_or(true, |l| entry.level == l))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let runtime = RuntimeState::default();
        runtime.inc_telemetry();
        runtime.inc_commands();
        runtime.inc_commands();
        runtime.inc_ack(true);
        runtime.inc_ack(false);

        let counters = runtime.counters();
        assert_eq!(counters.telemetry, 1);
        assert_eq!(counters.commands, 2);
        assert_eq!(counters.ack_ok, 1);
        assert_eq!(counters.ack_fail, 1);
    }

    #[test]
    fn test_health_view() {
        let runtime = RuntimeState::default();
        runtime.set_bus_connected(true);

        let health = runtime.get_health();
        assert!(health.up);
        assert!(!health.transport_connected);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["busConnected"], true);
        assert_eq!(json["counters"]["ackOk"], 0);
        assert!(json.get("uptimeSeconds").is_some());
    }

    #[test]
    fn test_ring_is_bounded() {
        let runtime = RuntimeState::new(3);
        for i in 0..5 {
            runtime.add_log("INFO", format!("line {}", i));
        }
        let logs = runtime.get_logs(10, None);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "line 4");
        assert_eq!(logs[2].message, "line 2");
    }

    #[test]
    fn test_logs_level_filter() {
        let runtime = RuntimeState::default();
        runtime.add_log("INFO", "started");
        runtime.add_log("warning", "bus lost");
        runtime.add_log("COORD_NET", "formed");

        let warnings = runtime.get_logs(50, Some("Warning"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, "WARNING");

        assert_eq!(runtime.get_logs(50, Some("")).len(), 3);
        assert_eq!(runtime.get_logs(50, Some("coord_net"))[0].message, "formed");
    }

    #[test]
    fn test_logs_limit_clamped() {
        let runtime = RuntimeState::default();
        runtime.add_log("INFO", "a");
        runtime.add_log("INFO", "b");
        assert_eq!(runtime.get_logs(0, None).len(), 1);
        assert_eq!(runtime.get_logs(1, None)[0].message, "b");
    }
}
