//! Byte-level serial transport.
//!
//! A [`Link`] owns the open/close lifecycle of one physical port and is the
//! single write path for its device. The trait exists as a seam: drivers
//! and listeners are written against it, production uses [`SerialLink`],
//! and tests substitute a scripted in-memory link.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};

/// Byte transport to one physical device.
///
/// All methods take `&self`; implementations serialize access internally.
/// In particular every write to a given link goes through one
/// mutual-exclusion path, so a command frame is never interleaved with
/// another write to the same device.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Open the transport. Fails with [`Error::Connection`] if the port is
    /// not attached to the system or cannot be opened.
    async fn open(&self) -> Result<()>;

    /// Whether the transport is currently open.
    async fn is_open(&self) -> bool;

    /// Write one complete frame. Fails with [`Error::Io`] on transport
    /// fault or when the link is closed.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Number of received bytes waiting to be read.
    async fn bytes_available(&self) -> Result<usize>;

    /// Read exactly `buf.len()` bytes into `buf`.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<()>;

    /// Throw away everything in the input buffer.
    async fn discard_input(&self) -> Result<()>;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

fn not_open() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "serial link is not open",
    ))
}

/// Production [`Link`] over a serial port.
pub struct SerialLink {
    port: String,
    baud_rate: u32,
    // The per-device write lock. One lock per link instance, not one
    // shared across devices: independent ports have nothing to serialize
    // against each other.
    stream: Mutex<Option<SerialStream>>,
}

impl SerialLink {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            stream: Mutex::new(None),
        }
    }

    /// The platform port name this link was built for.
    pub fn port(&self) -> &str {
        &self.port
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn open(&self) -> Result<()> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| Error::Connection(format!("enumerating serial ports: {e}")))?;
        if !ports.iter().any(|p| p.port_name == self.port) {
            return Err(Error::Connection(format!(
                "{} is not an attached serial port",
                self.port
            )));
        }

        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .map_err(|e| Error::Connection(format!("opening {}: {e}", self.port)))?;

        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(not_open)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn bytes_available(&self) -> Result<usize> {
        let guard = self.stream.lock().await;
        let stream = guard.as_ref().ok_or_else(not_open)?;
        Ok(stream.bytes_to_read()? as usize)
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(not_open)?;
        stream.read_exact(buf).await?;
        Ok(())
    }

    async fn discard_input(&self) -> Result<()> {
        let guard = self.stream.lock().await;
        let stream = guard.as_ref().ok_or_else(not_open)?;
        stream.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(())
    }

    async fn close(&self) {
        // Dropping the stream closes the port.
        self.stream.lock().await.take();
    }
}
