//! TCP transport for the EKI socket
//!
//! One lock guards both directions so a command line is never interleaved
//! with a partially read response. Reads carry a short deadline: an expired
//! deadline yields an empty buffer instead of an error, which lets the
//! monitor loop re-check its stop flag between reads.

use crate::codec::EkiCommand;
use crate::{EkiError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Size of the receive buffer handed to each socket read
pub const READ_BUFFER_SIZE: usize = 8192;

/// Anything that can stand in for the device socket
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Lock-free traffic counters
#[derive(Debug, Default)]
struct TrafficCounters {
    writes: AtomicU64,
    bytes_sent: AtomicU64,
    reads: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of the traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub writes: u64,
    pub bytes_sent: u64,
    pub reads: u64,
    pub bytes_received: u64,
}

pub struct Transport {
    stream: Mutex<Option<Box<dyn DeviceStream>>>,
    read_timeout: Duration,
    counters: TrafficCounters,
}

impl Transport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(None),
            read_timeout,
            counters: TrafficCounters::default(),
        }
    }

    /// Dial the device, closing any previous connection first
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if let Some(previous) = guard.take() {
            info!("Closing previous connection before reconnecting");
            Self::shutdown(previous).await?;
        }

        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                EkiError::Connection(format!("Timed out connecting to {} after {:?}", address, timeout))
            })?
            .map_err(|e| EkiError::Connection(format!("Failed to connect to {}: {}", address, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| EkiError::Connection(format!("Failed to configure socket: {}", e)))?;

        *guard = Some(Box::new(stream));
        info!("Connected to device at {}", address);
        Ok(())
    }

    /// Use an already established stream as the device connection
    pub async fn attach<S: DeviceStream + 'static>(&self, stream: S) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if let Some(previous) = guard.take() {
            Self::shutdown(previous).await?;
        }
        *guard = Some(Box::new(stream));
        Ok(())
    }

    /// Close the socket. Calling this without a connection is an error.
    pub async fn disconnect(&self) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| EkiError::Connection("Not connected".to_string()))?;
        Self::shutdown(stream).await?;
        info!("Disconnected from device");
        Ok(())
    }

    async fn shutdown(mut stream: Box<dyn DeviceStream>) -> Result<()> {
        stream
            .shutdown()
            .await
            .map_err(|e| EkiError::Connection(format!("Failed to close connection: {}", e)))
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Write raw bytes to the device
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| EkiError::Connection("Not connected".to_string()))?;

        debug!("Sending command: {}", String::from_utf8_lossy(bytes));
        stream.write_all(bytes).await?;
        stream.flush().await?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read whatever the device has sent. Returns an empty buffer when the
    /// read deadline expires with nothing to read.
    pub async fn receive(&self) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| EkiError::Connection("Not connected".to_string()))?;

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let read = match tokio::time::timeout(self.read_timeout, stream.read(&mut buffer)).await {
            Err(_) => return Ok(Vec::new()),
            Ok(read) => read?,
        };

        if read == 0 {
            return Err(EkiError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by device",
            )));
        }

        buffer.truncate(read);
        debug!("Received response: {}", String::from_utf8_lossy(&buffer));

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(read as u64, Ordering::Relaxed);
        Ok(buffer)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Writes command lines and waits the pacing interval after each one
#[derive(Clone)]
pub struct CommandSender {
    transport: Arc<Transport>,
    interval: Duration,
}

impl CommandSender {
    pub fn new(transport: Arc<Transport>, interval: Duration) -> Self {
        Self { transport, interval }
    }

    pub async fn send<S: AsRef<str>>(&self, command: EkiCommand, args: &[S]) -> Result<()> {
        self.send_line(&command.encode(args)).await
    }

    /// Write a line as-is, no terminator is appended
    pub async fn send_line(&self, line: &str) -> Result<()> {
        self.transport.send(line.as_bytes()).await?;
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        Ok(())
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}
