//! Raw SCPI socket transport (port 5025 on most LAN instruments).

use super::{ConnectionDescriptor, Transport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// TCP transport with an internal receive buffer.
///
/// Bytes pulled off the socket are kept in `rx` until a line is consumed, so
/// `bytes_available` and `read_line` agree on what is pending.
pub struct TcpTransport {
    descriptor: ConnectionDescriptor,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `connect_timeout`.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> AppResult<Self> {
        let descriptor = ConnectionDescriptor::Tcp {
            host: host.to_string(),
            port,
        };

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(DaqError::connection(&descriptor, e)),
            Err(_) => {
                return Err(DaqError::connection(
                    &descriptor,
                    format!("no answer within {connect_timeout:?}"),
                ))
            }
        };
        stream.set_nodelay(true)?;

        debug!(target = %descriptor, "TCP connection established");

        Ok(Self {
            descriptor,
            stream: Some(stream),
            rx: Vec::new(),
        })
    }

    fn stream(&mut self) -> AppResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Move everything the socket has ready into `rx` without waiting.
    fn pull_ready(&mut self) -> AppResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stream = self.stream()?;
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(DaqError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.rx.iter().position(|&b| b == b'\n')?;
        Some(self.rx.drain(..=end).collect())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stream = self.stream()?;
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(DaqError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "peer closed the connection",
                    )))
                }
                Ok(Ok(n)) => {
                    self.rx.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(line);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                // Timed out: hand back the partial line
                Err(_) => return Ok(std::mem::take(&mut self.rx)),
            }
        }
    }

    async fn read_available(&mut self) -> AppResult<Vec<u8>> {
        self.pull_ready()?;
        Ok(std::mem::take(&mut self.rx))
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        self.pull_ready()?;
        Ok(self.rx.len())
    }

    async fn clear_buffers(&mut self) -> AppResult<()> {
        self.pull_ready()?;
        self.rx.clear();
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.shutdown().await;
            debug!(target = %self.descriptor, "TCP connection closed");
        }
        self.rx.clear();
        Ok(())
    }
}
