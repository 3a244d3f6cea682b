//! TDK-Lambda power supply on a multidrop RS-232 bus.
//!
//! Every transaction selects the supply's address first:
//!
//! ```text
//! INSTrument:NSELect 6
//! VOLT:AMPL 12.500
//! ```
//!
//! The bus lock is held from the buffer flush until the reply has been read,
//! so select and command frames from different supplies never interleave.
//! A per-supply lock additionally keeps multi-step operations on one supply
//! in order.

use super::{CurrentMeter, VoltageSource};
use crate::bus::BusManager;
use crate::codec::{self, Reply};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Commands tried in order by [`TdkPowerSupply::test_communication`].
const PROBE_COMMANDS: [&str; 4] = ["*IDN?", ":VOLT?", ":CURR?", "OUTP?"];

/// Snapshot of a supply's settings and read-back values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupplyStatus {
    /// Multidrop address
    pub address: u8,
    /// Identity string
    pub identity: Option<String>,
    /// Voltage setpoint (V)
    pub voltage_setting: Option<f64>,
    /// Current limit setpoint (A)
    pub current_setting: Option<f64>,
    /// Measured output voltage (V)
    pub actual_voltage: Option<f64>,
    /// Measured output current (A)
    pub actual_current: Option<f64>,
    /// Output enabled
    pub output_enabled: Option<bool>,
}

/// Addressed proxy for one supply on a shared bus.
///
/// Created through [`BusManager::power_supply`], which registers a bus lease.
pub struct TdkPowerSupply {
    address: u8,
    bus: BusManager,
    op_lock: Mutex<()>,
    released: AtomicBool,
}

impl TdkPowerSupply {
    pub(crate) fn new(address: u8, bus: BusManager) -> Self {
        Self {
            address,
            bus,
            op_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    /// Multidrop address of this supply.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Bus this supply lives on.
    pub fn bus(&self) -> &BusManager {
        &self.bus
    }

    /// Send one command, optionally reading a reply.
    ///
    /// Returns `None` for commands without a reply, for replies starting with
    /// `ERROR`, and when the transport faulted (logged). A query that got no
    /// data at all returns `Some("")`.
    pub async fn send(&self, command: &str, expect_response: bool) -> Option<String> {
        match self.exchange(command, expect_response).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(address = self.address, command, "Command failed: {}", e);
                None
            }
        }
    }

    async fn exchange(&self, command: &str, expect_response: bool) -> AppResult<Option<String>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DaqError::NotConnected);
        }
        let timings = *self.bus.timings();

        let mut transport = self.bus.lock().await?;
        transport.clear_buffers().await?;

        let select = format!("INSTrument:NSELect {}", self.address);
        transport.write(&codec::encode(&select)).await?;
        sleep(timings.select_settle).await;

        transport.write(&codec::encode(command)).await?;
        debug!(address = self.address, command, "Command sent");

        if !expect_response {
            sleep(timings.write_settle).await;
            return Ok(None);
        }

        sleep(timings.response_wait).await;
        let raw = if transport.bytes_available().await? > 0 {
            transport.read_line(timings.read_timeout).await?
        } else {
            sleep(timings.response_retry).await;
            if transport.bytes_available().await? > 0 {
                transport.read_available().await?
            } else {
                Vec::new()
            }
        };

        match codec::classify(&raw) {
            Reply::Empty => {
                debug!(address = self.address, command, "No response data");
                Ok(Some(String::new()))
            }
            Reply::Error(text) => {
                warn!(address = self.address, command, reply = %text, "Instrument reported an error");
                Ok(None)
            }
            Reply::Text(text) => {
                debug!(address = self.address, command, reply = %text, "Response received");
                Ok(Some(text))
            }
        }
    }

    async fn write_setting(&self, command: String) -> bool {
        let _op = self.op_lock.lock().await;
        match self.exchange(&command, false).await {
            Ok(_) => true,
            Err(e) => {
                warn!(address = self.address, command = %command, "Setting not delivered: {}", e);
                false
            }
        }
    }

    async fn query_text(&self, command: &str) -> Option<String> {
        let _op = self.op_lock.lock().await;
        self.send(command, true).await.filter(|reply| !reply.is_empty())
    }

    async fn query_number(&self, command: &str, what: &str) -> Option<f64> {
        let _op = self.op_lock.lock().await;
        let reply = self.send(command, true).await?;
        if reply.is_empty() {
            warn!(address = self.address, "No {} reading returned", what);
            return None;
        }
        let value = codec::parse_number(&reply);
        if value.is_none() {
            warn!(address = self.address, reply = %reply, "Failed to parse {}", what);
        }
        value
    }

    /// Set the output voltage (V, three decimals on the wire).
    pub async fn set_voltage(&self, volts: f64) -> bool {
        info!(address = self.address, "Setting voltage {:.3} V", volts);
        self.write_setting(format!("VOLT:AMPL {}", codec::format_setpoint(volts)))
            .await
    }

    /// Set the current limit (A, three decimals on the wire).
    pub async fn set_current(&self, amps: f64) -> bool {
        info!(address = self.address, "Setting current {:.3} A", amps);
        self.write_setting(format!("CURR:AMPL {}", codec::format_setpoint(amps)))
            .await
    }

    /// Switch the output on or off.
    pub async fn set_output(&self, enabled: bool) -> bool {
        info!(
            address = self.address,
            "Switching output {}",
            if enabled { "on" } else { "off" }
        );
        self.write_setting(format!("OUTP:STAT {}", u8::from(enabled)))
            .await
    }

    /// Voltage setpoint.
    pub async fn get_voltage(&self) -> Option<f64> {
        self.query_number(":VOLT?", "voltage setting").await
    }

    /// Current limit setpoint.
    pub async fn get_current(&self) -> Option<f64> {
        self.query_number(":CURR?", "current setting").await
    }

    /// Measured output voltage.
    pub async fn get_actual_voltage(&self) -> Option<f64> {
        self.query_number("MEAS:VOLT?", "actual voltage").await
    }

    /// Measured output current.
    pub async fn get_actual_current(&self) -> Option<f64> {
        self.query_number("MEAS:CURR?", "actual current").await
    }

    /// Whether the output is enabled.
    pub async fn get_output_status(&self) -> Option<bool> {
        let reply = self.query_text("OUTP?").await?;
        match reply.as_str() {
            "1" | "ON" => Some(true),
            "0" | "OFF" => Some(false),
            other => match other.parse::<i64>() {
                Ok(n) => Some(n != 0),
                Err(_) => {
                    warn!(address = self.address, reply = %other, "Failed to parse output state");
                    None
                }
            },
        }
    }

    /// Identity string (`*IDN?`).
    pub async fn get_id(&self) -> Option<String> {
        self.query_text("*IDN?").await
    }

    /// Restore factory defaults (`*RST`).
    pub async fn reset(&self) -> bool {
        info!(address = self.address, "Resetting supply");
        self.write_setting("*RST".to_string()).await
    }

    /// Check that the supply answers at all.
    ///
    /// Succeeds on the first probe query with a non-empty reply.
    pub async fn test_communication(&self) -> bool {
        for command in PROBE_COMMANDS {
            if let Some(reply) = self.query_text(command).await {
                info!(address = self.address, command, reply = %reply, "Communication test passed");
                return true;
            }
        }
        warn!(address = self.address, "Communication test failed, no command answered");
        false
    }

    /// Read every setting and read-back value.
    pub async fn status(&self) -> SupplyStatus {
        let status = SupplyStatus {
            address: self.address,
            identity: self.get_id().await,
            voltage_setting: self.get_voltage().await,
            current_setting: self.get_current().await,
            actual_voltage: self.get_actual_voltage().await,
            actual_current: self.get_actual_current().await,
            output_enabled: self.get_output_status().await,
        };
        debug!(address = self.address, ?status, "Supply status");
        status
    }

    /// Give up this supply's bus lease. Calling it again does nothing.
    ///
    /// The shared transport closes when the last supply on the bus disconnects.
    pub async fn disconnect(&self) -> AppResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _op = self.op_lock.lock().await;
        info!(address = self.address, bus = self.bus.label(), "Disconnecting supply");
        self.bus.release().await
    }
}

#[async_trait]
impl VoltageSource for TdkPowerSupply {
    async fn set_voltage(&self, volts: f64) -> bool {
        TdkPowerSupply::set_voltage(self, volts).await
    }

    async fn read_voltage(&self) -> Option<f64> {
        self.get_actual_voltage().await
    }
}

#[async_trait]
impl CurrentMeter for TdkPowerSupply {
    async fn read_current(&self) -> Option<f64> {
        self.get_actual_current().await
    }
}

impl std::fmt::Debug for TdkPowerSupply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdkPowerSupply")
            .field("address", &self.address)
            .field("bus", &self.bus.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusManager, BusTimings};
    use crate::transport::{MockHandle, MockTransport};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fast_timings() -> BusTimings {
        BusTimings {
            select_settle: Duration::from_millis(1),
            response_wait: Duration::from_millis(1),
            response_retry: Duration::from_millis(1),
            write_settle: Duration::from_millis(1),
            read_timeout: Duration::from_millis(5),
        }
    }

    fn supply_with<F>(address: u8, responder: F) -> (TdkPowerSupply, MockHandle)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let transport = MockTransport::with_responder(responder);
        let handle = transport.handle();
        let bus = BusManager::new(Box::new(transport), fast_timings());
        (bus.power_supply(address), handle)
    }

    #[tokio::test]
    async fn test_select_precedes_every_command() {
        let (supply, handle) = supply_with(6, |_| None);

        assert!(supply.set_voltage(12.5).await);
        assert!(supply.set_current(0.25).await);
        assert!(supply.set_output(true).await);

        assert_eq!(
            handle.written_lines(),
            vec![
                "INSTrument:NSELect 6",
                "VOLT:AMPL 12.500",
                "INSTrument:NSELect 6",
                "CURR:AMPL 0.250",
                "INSTrument:NSELect 6",
                "OUTP:STAT 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_numeric_getters_parse_replies() {
        let (supply, _handle) = supply_with(7, |line| match line {
            "MEAS:VOLT?" => Some("12.498".to_string()),
            "MEAS:CURR?" => Some("0.101".to_string()),
            "OUTP?" => Some("1".to_string()),
            _ => None,
        });

        assert_eq!(supply.get_actual_voltage().await, Some(12.498));
        assert_eq!(supply.get_actual_current().await, Some(0.101));
        assert_eq!(supply.get_output_status().await, Some(true));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_reply_is_no_value() {
        let (supply, _handle) = supply_with(6, |_| None);

        assert_eq!(supply.send("MEAS:VOLT?", true).await.as_deref(), Some(""));
        assert_eq!(supply.get_actual_voltage().await, None);
        assert_eq!(supply.get_actual_current().await, None);
        assert!(logs_contain("No actual voltage reading returned"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_garbage_reply_is_logged_not_raised() {
        let (supply, _handle) = supply_with(6, |_| Some("12.4V?!x".to_string()));

        assert_eq!(supply.get_voltage().await, None);
        assert!(logs_contain("Failed to parse voltage setting"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_error_reply_yields_nothing() {
        let (supply, _handle) =
            supply_with(6, |_| Some("ERROR -113 undefined header".to_string()));

        assert_eq!(supply.send("BOGUS?", true).await, None);
        assert!(logs_contain("Instrument reported an error"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transport_fault_is_logged() {
        let (supply, handle) = supply_with(6, |_| None);
        handle.inject_fault();

        assert!(!supply.set_voltage(1.0).await);
        assert_eq!(supply.get_actual_voltage().await, None);
        assert!(logs_contain("Command failed"));
    }

    #[tokio::test]
    async fn test_communication_test_falls_through_queries() {
        let (supply, handle) = supply_with(6, |line| {
            (line == ":CURR?").then(|| "0.500".to_string())
        });

        assert!(supply.test_communication().await);
        let queries: Vec<String> = handle
            .written_lines()
            .into_iter()
            .filter(|l| !l.starts_with("INSTrument"))
            .collect();
        assert_eq!(queries, vec!["*IDN?", ":VOLT?", ":CURR?"]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (supply, handle) = supply_with(6, |_| None);

        supply.disconnect().await.unwrap();
        supply.disconnect().await.unwrap();
        assert!(!handle.is_open());
        assert_eq!(supply.bus().lease_count(), 0);
        assert!(!supply.set_voltage(1.0).await);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let transport = MockTransport::simulated_bench();
        let bus = BusManager::new(Box::new(transport), fast_timings());
        let supply = bus.power_supply(3);

        supply.set_voltage(5.0).await;
        supply.set_current(1.0).await;
        let status = supply.status().await;

        assert_eq!(status.address, 3);
        assert_eq!(status.voltage_setting, Some(5.0));
        assert_eq!(status.current_setting, Some(1.0));
        assert_eq!(status.output_enabled, Some(false));
    }
}
