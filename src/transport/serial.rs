//! RS-232 transport.
//!
//! Wraps the `serialport` crate. The driver is blocking, so every call runs on
//! Tokio's blocking pool with the port behind an `Arc<Mutex>`.

use super::{ConnectionDescriptor, Transport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial transport for RS-232 instruments (8N1, no flow control)
pub struct SerialTransport {
    descriptor: ConnectionDescriptor,

    /// The open port; `None` once closed
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open a port and flush whatever the instrument left in the buffers.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM21")
    /// * `baud_rate` - Communication speed (e.g., 9600)
    /// * `timeout` - Per-call driver timeout; reads poll in slices of this length
    #[cfg(feature = "instrument_serial")]
    pub async fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        let descriptor = ConnectionDescriptor::Serial {
            port: port_name.to_string(),
            baud_rate,
        };
        let name = port_name.to_string();

        let port = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&name, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(timeout)
                .open()?;
            port.clear(serialport::ClearBuffer::All)?;
            Ok::<_, serialport::Error>(port)
        })
        .await
        .map_err(|e| DaqError::TaskJoin(e.to_string()))?
        .map_err(|e| DaqError::connection(&descriptor, e))?;

        debug!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            descriptor,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    /// Serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        let _ = (port_name, baud_rate, timeout);
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    /// Run a blocking operation against the port on the blocking pool.
    #[cfg(feature = "instrument_serial")]
    async fn with_port<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> std::io::Result<T> + Send + 'static,
    {
        let port = self.port.as_ref().ok_or(DaqError::NotConnected)?.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            op(&mut **guard)
        })
        .await
        .map_err(|e| DaqError::TaskJoin(e.to_string()))?
        .map_err(DaqError::from)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let frame = bytes.to_vec();
            self.with_port(move |port| {
                port.write_all(&frame)?;
                port.flush()
            })
            .await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(DaqError::NotConnected)
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            self.with_port(move |port| {
                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                let start = std::time::Instant::now();

                while start.elapsed() < timeout {
                    match port.read(&mut byte) {
                        Ok(1) => {
                            line.push(byte[0]);
                            if byte[0] == b'\n' {
                                break;
                            }
                        }
                        Ok(_) => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "serial port returned EOF",
                            ))
                        }
                        // Driver timeout is shorter than ours
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(line)
            })
            .await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = timeout;
            Err(DaqError::NotConnected)
        }
    }

    async fn read_available(&mut self) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            self.with_port(|port| {
                let waiting = port.bytes_to_read()? as usize;
                let mut buf = vec![0u8; waiting];
                let mut filled = 0;
                while filled < waiting {
                    match port.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(e) => return Err(e),
                    }
                }
                buf.truncate(filled);
                Ok(buf)
            })
            .await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::NotConnected)
        }
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        #[cfg(feature = "instrument_serial")]
        {
            self.with_port(|port| Ok(port.bytes_to_read()? as usize))
                .await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::NotConnected)
        }
    }

    async fn clear_buffers(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            self.with_port(|port| Ok(port.clear(serialport::ClearBuffer::All)?))
                .await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::NotConnected)
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.descriptor, "Serial port closed");
            }
        }
        Ok(())
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> AppResult<Vec<String>> {
    #[cfg(feature = "instrument_serial")]
    {
        let ports = serialport::available_ports().map_err(std::io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}
