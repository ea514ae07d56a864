// WFMS Bridge - tracing setup
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tracing subscriber with a level that can be changed at runtime.

use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle to the installed filter
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Canonical level name, accepting `WARNING` and any case
pub fn normalize_level(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Current log level, optionally wired to the live subscriber
pub struct LogLevel {
    current: Mutex<&'static str>,
    handle: Option<FilterHandle>,
}

impl LogLevel {
    /// A level that is tracked but not applied anywhere
    pub fn detached(level: &'static str) -> Self {
        Self {
            current: Mutex::new(level),
            handle: None,
        }
    }

    pub fn current(&self) -> &'static str {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch level. Returns the canonical name.
    pub fn set(&self, level: &str) -> Result<&'static str, String> {
        let level = normalize_level(level).ok_or_else(|| format!("unknown log level {:?}", level))?;
        if let Some(handle) = &self.handle {
            handle
                .reload(EnvFilter::new(level))
                .map_err(|e| e.to_string())?;
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = level;
        Ok(level)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` at startup.
pub fn init(level: &str) -> Result<LogLevel, String> {
    let level = normalize_level(level).ok_or_else(|| format!("unknown log level {:?}", level))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| e.to_string())?;

    Ok(LogLevel {
        current: Mutex::new(level),
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("DEBUG"), Some("debug"));
        assert_eq!(normalize_level(" Warning "), Some("warn"));
        assert_eq!(normalize_level("verbose"), None);
    }

    #[test]
    fn test_detached_set() {
        let level = LogLevel::detached("info");
        assert_eq!(level.set("ERROR"), Ok("error"));
        assert_eq!(level.current(), "error");
        assert!(level.set("loud").is_err());
        assert_eq!(level.current(), "error");
    }
}
