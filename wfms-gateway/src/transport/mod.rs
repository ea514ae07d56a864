// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Line transport to the field controller
//!
//! Two implementations, picked at startup: a real serial port with a
//! background reconnect task, and a simulated controller for running
//! without hardware.

#[cfg(feature = "serial")]
pub mod serial;
pub mod simulated;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use simulated::{SimulatedDevice, SimulatedTransport};

/// Longest line kept while waiting for a newline
pub const MAX_LINE_LEN: usize = 4096;

/// Newline-delimited, single-reader/single-writer link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the link up. Failing to open the device is not an error:
    /// the transport keeps retrying in the background.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the link down and stop background tasks
    async fn stop(&self);

    /// Next complete line (without terminator), or `None` after `timeout`
    async fn read_line(&self, timeout: Duration) -> Option<String>;

    /// Write one line; a trailing newline is appended when missing
    async fn write_line(&self, line: &str) -> Result<(), TransportError>;

    /// Whether the link is currently usable
    fn is_connected(&self) -> bool;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Pop the first complete, non-blank line from `buffer`.
///
/// Blank and CR-only lines are discarded. Bytes after the last newline stay
/// buffered for the next call.
pub(crate) fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.trim().is_empty() {
            return Some(line.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_line_partial() {
        let mut buffer = b"@DATA {\"flow\":".to_vec();
        assert_eq!(take_line(&mut buffer), None);

        buffer.extend_from_slice(b"150}\r\n@ACK");
        assert_eq!(take_line(&mut buffer).as_deref(), Some("@DATA {\"flow\":150}"));
        assert_eq!(buffer, b"@ACK");
    }

    #[test]
    fn test_take_line_skips_blank() {
        let mut buffer = b"\r\n\n  \r\n@LOG {}\n".to_vec();
        assert_eq!(take_line(&mut buffer).as_deref(), Some("@LOG {}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_line_invalid_utf8() {
        let mut buffer = vec![0xff, b'a', b'\n'];
        assert_eq!(take_line(&mut buffer).as_deref(), Some("\u{fffd}a"));
    }
}
