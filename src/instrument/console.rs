//! Free-form SCPI console.
//!
//! Sends whatever the operator types. On a serial multidrop link an address
//! can be attached, which is sent as an `ADDR;COMMAND` prefix.

use crate::bus::BusManager;
use crate::codec;
use crate::error::AppResult;
use crate::transport::ConnectionDescriptor;
use std::time::Duration;
use tracing::{debug, info};

/// Raw command console over a bus.
#[derive(Debug)]
pub struct ScpiConsole {
    bus: BusManager,
    address: Option<u8>,
    serial: bool,
    read_timeout: Duration,
}

impl ScpiConsole {
    /// Console over `bus`, waiting up to `read_timeout` for query replies.
    pub fn new(bus: BusManager, descriptor: &ConnectionDescriptor, read_timeout: Duration) -> Self {
        bus.acquire_lease();
        Self {
            bus,
            address: None,
            serial: matches!(descriptor, ConnectionDescriptor::Serial { .. }),
            read_timeout,
        }
    }

    /// Prefix commands with a multidrop address (serial links only).
    pub fn with_address(mut self, address: Option<u8>) -> Self {
        self.address = address;
        self
    }

    /// Command as it goes on the wire.
    pub fn full_command(&self, command: &str) -> String {
        match self.address {
            Some(address) if self.serial => format!("{address};{command}"),
            _ => command.to_string(),
        }
    }

    /// Write a command without waiting for a reply.
    pub async fn send(&self, command: &str) -> AppResult<()> {
        let line = self.full_command(command);
        info!("SEND: {}", line);
        let mut transport = self.bus.lock().await?;
        transport.write(&codec::encode(&line)).await
    }

    /// Write a command and return the reply line.
    ///
    /// An empty string means nothing arrived within the read timeout.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        let line = self.full_command(command);
        info!("QUERY: {}", line);
        let mut transport = self.bus.lock().await?;
        transport.clear_buffers().await?;
        transport.write(&codec::encode(&line)).await?;
        let raw = transport.read_line(self.read_timeout).await?;
        let reply = codec::decode(&raw);
        if reply.is_empty() {
            debug!(command = %line, "Query timed out");
        } else {
            info!("RECV: {}", reply);
        }
        Ok(reply)
    }

    /// Release the console's bus lease.
    pub async fn close(self) -> AppResult<()> {
        self.bus.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTimings;
    use crate::transport::MockTransport;

    fn serial() -> ConnectionDescriptor {
        ConnectionDescriptor::serial("COM21")
    }

    #[tokio::test]
    async fn test_address_prefix_on_serial_only() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let bus = BusManager::new(Box::new(transport), BusTimings::default());

        let console = ScpiConsole::new(bus.clone(), &serial(), Duration::from_millis(5))
            .with_address(Some(6));
        console.send("OUTP:STAT 1").await.unwrap();

        let tcp = ConnectionDescriptor::Tcp {
            host: "127.0.0.1".into(),
            port: 5025,
        };
        let console = ScpiConsole::new(bus, &tcp, Duration::from_millis(5)).with_address(Some(6));
        console.send("*RST").await.unwrap();

        assert_eq!(handle.written_lines(), vec!["6;OUTP:STAT 1", "*RST"]);
    }

    #[tokio::test]
    async fn test_query_returns_reply_or_empty() {
        let transport =
            MockTransport::with_responder(|line| (line == "*IDN?").then(|| "TDK-LAMBDA,GEN".to_string()));
        let bus = BusManager::new(Box::new(transport), BusTimings::default());
        let console = ScpiConsole::new(bus, &serial(), Duration::from_millis(5));

        assert_eq!(console.query("*IDN?").await.unwrap(), "TDK-LAMBDA,GEN");
        assert_eq!(console.query("SYST:ERR?").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_close_releases_bus() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let bus = BusManager::new(Box::new(transport), BusTimings::default());
        let console = ScpiConsole::new(bus, &serial(), Duration::from_millis(5));

        console.close().await.unwrap();
        assert!(!handle.is_open());
    }
}
