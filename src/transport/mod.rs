//! Byte-oriented duplex channels to instruments.
//!
//! Every instrument link (RS-232 port, raw TCP socket, in-memory simulator)
//! implements [`Transport`]. The trait is deliberately small: write a frame,
//! read a line with a timeout, look at what is waiting, throw stale bytes away.
//!
//! A read that times out is not an error. It returns whatever arrived, which
//! may be nothing. Errors are reserved for hard faults such as a USB adapter
//! being unplugged or the peer resetting the socket.

pub mod mock;
pub mod serial;
pub mod tcp;

use crate::config::TransportSettings;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use mock::{MockHandle, MockTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Where an instrument is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// RS-232 port (e.g. "/dev/ttyUSB0", "COM21") at a baud rate
    Serial {
        /// Port name
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// Raw SCPI socket
    Tcp {
        /// Host name or IP address
        host: String,
        /// TCP port (5025 on most instruments)
        port: u16,
    },
    /// Built-in bench simulator
    Simulated,
}

impl ConnectionDescriptor {
    /// Serial descriptor with the default 9600 baud.
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate: 9600,
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Simulated => write!(f, "sim"),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DaqError;

    /// Accepts `tcp://HOST:PORT`, `sim`, or `PORT[@BAUD]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DaqError::InvalidArgument(
                "connection descriptor is empty".to_string(),
            ));
        }
        if s.eq_ignore_ascii_case("sim") || s.eq_ignore_ascii_case("mock") {
            return Ok(Self::Simulated);
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                DaqError::InvalidArgument(format!("'{s}' is missing a TCP port"))
            })?;
            if host.is_empty() {
                return Err(DaqError::InvalidArgument(format!("'{s}' is missing a host")));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| DaqError::InvalidArgument(format!("invalid TCP port in '{s}'")))?;
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }
        match s.rsplit_once('@') {
            Some((port, baud)) => {
                let baud_rate = baud
                    .parse::<u32>()
                    .ok()
                    .filter(|b| *b > 0)
                    .ok_or_else(|| DaqError::InvalidArgument(format!("invalid baud rate in '{s}'")))?;
                Ok(Self::Serial {
                    port: port.to_string(),
                    baud_rate,
                })
            }
            None => Ok(Self::serial(s)),
        }
    }
}

/// Duplex byte channel to one physical instrument link.
#[async_trait]
pub trait Transport: Send {
    /// Descriptor this transport was opened from.
    fn descriptor(&self) -> &ConnectionDescriptor;

    /// Whether the link is still open.
    fn is_open(&self) -> bool;

    /// Write a complete frame.
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read up to and including the next `\n`.
    ///
    /// Returns the partial (possibly empty) input when `timeout` elapses first.
    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>>;

    /// Take everything currently buffered without waiting.
    async fn read_available(&mut self) -> AppResult<Vec<u8>>;

    /// Number of bytes waiting to be read.
    async fn bytes_available(&mut self) -> AppResult<usize>;

    /// Discard pending input and output.
    async fn clear_buffers(&mut self) -> AppResult<()>;

    /// Close the link. Closing twice is harmless.
    async fn close(&mut self) -> AppResult<()>;
}

/// Open the transport a descriptor names.
pub async fn open(
    descriptor: &ConnectionDescriptor,
    settings: &TransportSettings,
) -> AppResult<Box<dyn Transport>> {
    match descriptor {
        ConnectionDescriptor::Serial { port, baud_rate } => {
            let transport =
                SerialTransport::open(port, *baud_rate, settings.serial_timeout()).await?;
            Ok(Box::new(transport))
        }
        ConnectionDescriptor::Tcp { host, port } => {
            let transport = TcpTransport::connect(host, *port, settings.tcp_connect_timeout()).await?;
            Ok(Box::new(transport))
        }
        ConnectionDescriptor::Simulated => Ok(Box::new(MockTransport::simulated_bench())),
    }
}

/// List serial ports present on this machine.
pub fn available_ports() -> AppResult<Vec<String>> {
    serial::available_ports()
}
