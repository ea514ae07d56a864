// WFMS Gateway - UART/MQTT bridge service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Serial port transport
//!
//! The port is split into independent read and write halves so the reader
//! loop never blocks command writes. A background task owns reconnection:
//! while disconnected it reopens the device every `reconnect_interval`.
//! Read and write failures only flip the connectivity flag; the surviving
//! half is released before the device is reopened, since the port is opened
//! exclusively.

use super::{take_line, Transport, MAX_LINE_LEN};
use crate::config::SerialConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Back-off while the port is closed, so the reader does not spin
const CLOSED_POLL: Duration = Duration::from_millis(100);

struct ReadState {
    port: Option<ReadHalf<SerialStream>>,
    buffer: Vec<u8>,
}

struct Inner {
    config: SerialConfig,
    reader: Mutex<ReadState>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: AtomicBool,
}

struct Background {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Serial transport with automatic reconnect
pub struct SerialTransport {
    inner: Arc<Inner>,
    background: std::sync::Mutex<Option<Background>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.inner.config.port)
            .field("baud", &self.inner.config.baud)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SerialTransport {
    /// Create a transport; nothing is opened until [`Transport::start`]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                reader: Mutex::new(ReadState {
                    port: None,
                    buffer: Vec::with_capacity(256),
                }),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            background: std::sync::Mutex::new(None),
        }
    }

    /// Device path
    pub fn port(&self) -> &str {
        &self.inner.config.port
    }
}

impl Inner {
    async fn open(&self) -> Result<(), TransportError> {
        self.close().await;
        let stream = tokio_serial::new(&self.config.port, self.config.baud)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                port: self.config.port.clone(),
                reason: e.to_string(),
            })?;
        let (read_half, write_half) = tokio::io::split(stream);

        {
            let mut reader = self.reader.lock().await;
            reader.port = Some(read_half);
            reader.buffer.clear();
        }
        *self.writer.lock().await = Some(write_half);

        self.connected.store(true, Ordering::SeqCst);
        info!(port = %self.config.port, baud = self.config.baud, "serial_port_opened");
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.lock().await.port = None;
        if let Some(mut port) = self.writer.lock().await.take() {
            let _ = port.shutdown().await;
        }
    }

    fn mark_disconnected(&self, cause: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(port = %self.config.port, cause, "serial_port_lost");
        }
    }

    async fn write_paced(
        &self,
        port: &mut WriteHalf<SerialStream>,
        data: &[u8],
    ) -> std::io::Result<()> {
        if self.config.pacing_enabled() {
            for chunk in data.chunks(self.config.tx_chunk_size) {
                port.write_all(chunk).await?;
                port.flush().await?;
                tokio::time::sleep(self.config.tx_chunk_delay).await;
            }
        } else {
            port.write_all(data).await?;
            port.flush().await?;
        }
        Ok(())
    }
}

async fn reconnect_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    debug!(port = %inner.config.port, "serial reconnect task started");
    loop {
        if !inner.connected.load(Ordering::SeqCst) {
            if let Err(e) = inner.open().await {
                debug!(error = %e, "serial reopen failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.reconnect_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(port = %inner.config.port, "serial reconnect task stopped");
}

#[async_trait]
impl Transport for SerialTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if background.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(reconnect_loop(Arc::clone(&self.inner), rx));
        *background = Some(Background { shutdown, task });
        Ok(())
    }

    async fn stop(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            let _ = background.task.await;
        }
        self.inner.close().await;
        info!(port = %self.inner.config.port, "serial_port_closed");
    }

    async fn read_line(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.reader.lock().await;
        if let Some(line) = take_line(&mut state.buffer) {
            return Some(line);
        }
        if state.port.is_none() {
            drop(state);
            tokio::time::sleep(timeout.min(CLOSED_POLL)).await;
            return None;
        }

        let ReadState { port, buffer } = &mut *state;
        let stream = port.as_mut()?;

        let mut chunk = [0u8; 256];
        loop {
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                // Partial bytes stay buffered for the next call
                Err(_) => return None,
                Ok(Ok(0)) => {
                    *port = None;
                    self.inner.mark_disconnected("eof");
                    return None;
                }
                Ok(Ok(n)) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Some(line) = take_line(buffer) {
                        return Some(line);
                    }
                    if buffer.len() > MAX_LINE_LEN {
                        warn!(bytes = buffer.len(), "serial line too long, discarding");
                        buffer.clear();
                    }
                }
                Ok(Err(e)) => {
                    *port = None;
                    self.inner.mark_disconnected(&e.to_string());
                    return None;
                }
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut data = line.as_bytes().to_vec();
        if !data.ends_with(b"\n") {
            data.push(b'\n');
        }

        let mut writer = self.inner.writer.lock().await;
        let port = writer.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = self.inner.write_paced(port, &data).await {
            *writer = None;
            self.inner.mark_disconnected(&e.to_string());
            return Err(e.into());
        }
        debug!(bytes = data.len(), "serial write");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_port() -> SerialConfig {
        SerialConfig {
            reconnect_interval: Duration::from_millis(50),
            ..SerialConfig::with_port("/dev/wfms-does-not-exist")
        }
    }

    #[tokio::test]
    async fn test_missing_device_is_not_fatal() {
        let transport = SerialTransport::new(missing_port());
        transport.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!transport.is_connected());
        assert_eq!(transport.read_line(Duration::from_millis(20)).await, None);
        assert!(matches!(
            transport.write_line("@CMD {}").await,
            Err(TransportError::NotConnected)
        ));

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let transport = SerialTransport::new(missing_port());
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyStarted)
        ));
        transport.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reopen_releases_stale_halves() {
        let transport = SerialTransport::new(missing_port());
        let (master, _slave) = SerialStream::pair().unwrap();
        let (read_half, write_half) = tokio::io::split(master);
        // A read failure left the write half behind
        transport.inner.reader.lock().await.port = None;
        *transport.inner.writer.lock().await = Some(write_half);
        drop(read_half);

        assert!(transport.inner.open().await.is_err());
        assert!(transport.inner.writer.lock().await.is_none());
        assert!(transport.inner.reader.lock().await.port.is_none());
        assert!(!transport.is_connected());
    }
}
