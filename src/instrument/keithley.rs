//! Keithley 6485 / 6487 picoammeter driver.
//!
//! The picoammeter sits alone on its link, so there is no address selection.
//! Each transaction flushes the buffers, writes one command, waits the
//! command settle time and optionally reads one reply line.
//!
//! The 6487 adds a voltage source (and with it resistance measurement); those
//! operations fail with [`DaqError::Unsupported`] on a 6485.

use super::CurrentMeter;
use crate::bus::BusManager;
use crate::codec::{self, Reply};
use crate::config::{PicoammeterSettings, Settings};
use crate::error::{AppResult, DaqError};
use crate::transport::ConnectionDescriptor;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Current measurement ranges (A), 2 nA to 21 mA.
pub const MEASURE_RANGES: [f64; 8] = [2e-9, 2e-8, 2e-7, 2e-6, 2e-5, 2e-4, 2e-3, 2.1e-2];

/// 6487 voltage source ranges (V).
pub const VOLTAGE_SOURCE_RANGES: [u32; 3] = [10, 50, 500];

/// 6487 voltage source current clamps (A).
pub const CURRENT_CLAMPS: [f64; 4] = [2.5e-5, 2.5e-4, 2.5e-3, 2.5e-2];

/// Ranges at or above this limit the input to 60 V.
const LOW_VOLTAGE_RANGE_THRESHOLD: f64 = 2e-3;

/// Pause between commands of the preparation block.
const PREPARE_SPACING: Duration = Duration::from_millis(50);

/// Buffer capture runs at roughly 1 ms per point, plus a margin.
const BUFFER_TIME_PER_POINT: Duration = Duration::from_millis(1);
const BUFFER_TIME_MARGIN: Duration = Duration::from_secs(1);

const OHMS_SETTLE: Duration = Duration::from_millis(200);
const SOURCE_SETTLE: Duration = Duration::from_millis(300);

fn matches_table(value: f64, table: &[f64]) -> bool {
    table
        .iter()
        .any(|entry| ((value - entry) / entry).abs() < 1e-9)
}

/// Supported picoammeter models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicoammeterModel {
    /// Model 6485
    K6485,
    /// Model 6487 (with voltage source)
    K6487,
}

impl PicoammeterModel {
    /// Model number as it appears in `*IDN?`.
    pub fn model_number(&self) -> &'static str {
        match self {
            Self::K6485 => "6485",
            Self::K6487 => "6487",
        }
    }

    /// Largest reading buffer the model supports.
    pub fn max_buffer_points(&self) -> usize {
        match self {
            Self::K6485 => 2500,
            Self::K6487 => 3000,
        }
    }

    /// Whether the model has the built-in voltage source.
    pub fn has_voltage_source(&self) -> bool {
        matches!(self, Self::K6487)
    }
}

impl fmt::Display for PicoammeterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_number())
    }
}

impl FromStr for PicoammeterModel {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "6485" => Ok(Self::K6485),
            "6487" => Ok(Self::K6487),
            other => Err(DaqError::InvalidArgument(format!(
                "unknown picoammeter model '{other}' (expected 6485 or 6487)"
            ))),
        }
    }
}

/// Reading filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Median filter, rank 1-5
    Median,
    /// Moving average, 2-100 readings
    Average,
}

/// Current measurement range selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurrentRange {
    /// Auto-ranging
    Auto,
    /// One of [`MEASURE_RANGES`]
    Fixed(f64),
}

impl CurrentRange {
    /// A fixed range, which must be one of [`MEASURE_RANGES`].
    pub fn fixed(amps: f64) -> AppResult<Self> {
        if matches_table(amps, &MEASURE_RANGES) {
            Ok(Self::Fixed(amps))
        } else {
            Err(DaqError::InvalidArgument(format!(
                "invalid current range {amps:e} A, expected one of {MEASURE_RANGES:?}"
            )))
        }
    }
}

impl FromStr for CurrentRange {
    type Err = DaqError;

    /// `auto` or a range in amperes such as `2e-6`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let amps = s
            .parse::<f64>()
            .map_err(|_| DaqError::InvalidArgument(format!("invalid current range '{s}'")))?;
        Self::fixed(amps)
    }
}

/// Delays of the picoammeter protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeithleyTimings {
    /// Wait after each command before reading
    pub command_settle: Duration,
    /// Upper bound for one reply line
    pub read_timeout: Duration,
    /// Wait after opening the link
    pub init_delay: Duration,
    /// Wait after `*RST`
    pub reset_delay: Duration,
}

impl Default for KeithleyTimings {
    fn default() -> Self {
        Self::from(&PicoammeterSettings::default())
    }
}

impl From<&PicoammeterSettings> for KeithleyTimings {
    fn from(settings: &PicoammeterSettings) -> Self {
        Self {
            command_settle: Duration::from_millis(settings.command_settle_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            init_delay: Duration::from_millis(settings.init_delay_ms),
            reset_delay: Duration::from_millis(settings.reset_delay_ms),
        }
    }
}

/// Keithley picoammeter on its own link.
pub struct KeithleyPicoammeter {
    bus: BusManager,
    model: PicoammeterModel,
    timings: KeithleyTimings,
    op_lock: Mutex<()>,
    released: AtomicBool,
}

impl KeithleyPicoammeter {
    /// Driver over an open bus. Takes one bus lease.
    pub fn new(bus: BusManager, model: PicoammeterModel, timings: KeithleyTimings) -> Self {
        bus.acquire_lease();
        Self {
            bus,
            model,
            timings,
            op_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    /// Open the link, reset the instrument and verify its identity.
    pub async fn open(
        descriptor: &ConnectionDescriptor,
        model: PicoammeterModel,
        settings: &Settings,
    ) -> AppResult<Self> {
        let bus = BusManager::open(descriptor, settings).await?;
        let meter = Self::new(bus, model, KeithleyTimings::from(&settings.picoammeter));
        meter.connect().await?;
        Ok(meter)
    }

    /// Model this driver was created for.
    pub fn model(&self) -> PicoammeterModel {
        self.model
    }

    /// Reset and check that the instrument is the expected model.
    ///
    /// On a mismatch the link is released and
    /// [`DaqError::IdentityMismatch`] is returned.
    pub async fn connect(&self) -> AppResult<String> {
        sleep(self.timings.init_delay).await;
        let identity = {
            let _op = self.op_lock.lock().await;
            self.transact("*RST", false).await?;
            sleep(self.timings.reset_delay).await;
            self.transact("*IDN?", true).await?.unwrap_or_default()
        };

        if identity.contains(self.model.model_number()) {
            info!(model = %self.model, identity = %identity, "Picoammeter connected");
            Ok(identity)
        } else {
            warn!(model = %self.model, identity = %identity, "Picoammeter identity mismatch");
            self.disconnect().await?;
            Err(DaqError::IdentityMismatch {
                expected: self.model.model_number().to_string(),
                actual: identity,
            })
        }
    }

    /// Switch the source off (6487) and release the link. Idempotent.
    ///
    /// Only the first call releases the bus lease, even when calls race.
    pub async fn disconnect(&self) -> AppResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.model.has_voltage_source() {
            let _op = self.op_lock.lock().await;
            if let Err(e) = self.exchange("SOUR:VOLT:STAT OFF", false).await {
                warn!("Could not switch voltage source off: {}", e);
            }
        }
        info!(model = %self.model, "Picoammeter disconnected");
        self.bus.release().await
    }

    /// One transaction; the caller holds `op_lock` for multi-command sequences.
    async fn transact(&self, command: &str, expect_response: bool) -> AppResult<Option<String>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DaqError::NotConnected);
        }
        self.exchange(command, expect_response).await
    }

    async fn exchange(&self, command: &str, expect_response: bool) -> AppResult<Option<String>> {
        let mut transport = self.bus.lock().await?;
        transport.clear_buffers().await?;
        transport.write(&codec::encode(command)).await?;
        debug!(command, "Picoammeter command sent");
        sleep(self.timings.command_settle).await;

        if !expect_response {
            return Ok(None);
        }

        let raw = transport.read_line(self.timings.read_timeout).await?;
        match codec::classify(&raw) {
            Reply::Empty => Ok(Some(String::new())),
            Reply::Error(text) => {
                warn!(command, reply = %text, "Picoammeter reported an error");
                Ok(None)
            }
            Reply::Text(text) => Ok(Some(text)),
        }
    }

    async fn command(&self, command: &str) -> AppResult<()> {
        self.transact(command, false).await.map(|_| ())
    }

    /// Send a free-form command under the driver lock.
    pub async fn send_command(&self, command: &str) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        self.command(command).await
    }

    /// Query with logging instead of errors.
    async fn query(&self, command: &str) -> Option<String> {
        match self.transact(command, true).await {
            Ok(Some(reply)) if !reply.is_empty() => Some(reply),
            Ok(_) => {
                warn!(command, "No reply from picoammeter");
                None
            }
            Err(e) => {
                warn!(command, "Picoammeter query failed: {}", e);
                None
            }
        }
    }

    fn require_voltage_source(&self, operation: &str) -> AppResult<()> {
        if self.model.has_voltage_source() {
            Ok(())
        } else {
            Err(DaqError::Unsupported {
                model: self.model.model_number().to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Identity string (`*IDN?`).
    pub async fn identity(&self) -> Option<String> {
        let _op = self.op_lock.lock().await;
        self.query("*IDN?").await
    }

    /// Restore factory defaults.
    pub async fn reset(&self) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        self.command("*RST").await?;
        sleep(self.timings.reset_delay).await;
        Ok(())
    }

    /// Run the built-in self test; passes when it reports `0`.
    pub async fn self_test(&self) -> bool {
        let _op = self.op_lock.lock().await;
        match self.query("*TST?").await {
            Some(code) if code == "0" => {
                info!("Self test passed");
                true
            }
            code => {
                warn!(code = ?code, "Self test failed");
                false
            }
        }
    }

    /// Oldest entry of the error queue (`SYST:ERR?`).
    pub async fn error_status(&self) -> Option<String> {
        let _op = self.op_lock.lock().await;
        self.query("SYST:ERR?").await
    }

    /// Select a fixed measurement range.
    pub async fn set_current_range(&self, amps: f64) -> AppResult<()> {
        if !matches_table(amps, &MEASURE_RANGES) {
            return Err(DaqError::InvalidArgument(format!(
                "invalid current range {amps:e} A, expected one of {MEASURE_RANGES:?}"
            )));
        }
        if amps >= LOW_VOLTAGE_RANGE_THRESHOLD {
            warn!("Input must stay below 60 V on the {:e} A range", amps);
        }
        let _op = self.op_lock.lock().await;
        self.command(&format!("RANG {amps:.9}")).await?;
        info!("Current range set to {:e} A", amps);
        Ok(())
    }

    /// Enable or disable auto-ranging.
    pub async fn set_auto_range(&self, enabled: bool) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        self.command(&format!("RANG:AUTO {}", on_off(enabled))).await
    }

    async fn read_current_locked(&self) -> Option<f64> {
        if self.model == PicoammeterModel::K6487 {
            if let Err(e) = self.command("FUNC 'CURR'").await {
                warn!("Could not select current function: {}", e);
                return None;
            }
        }
        let reply = self.query("READ?").await?;
        let value = codec::parse_number(&reply);
        if value.is_none() {
            warn!(reply = %reply, "Failed to parse current reading");
        }
        value
    }

    /// Trigger and return one current reading (A).
    pub async fn measure_current(&self) -> Option<f64> {
        let _op = self.op_lock.lock().await;
        self.read_current_locked().await
    }

    /// Zero check shorts the input; use it when connecting or disconnecting.
    pub async fn set_zero_check(&self, enabled: bool) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        self.command(&format!("SYST:ZCH {}", on_off(enabled))).await
    }

    async fn zero_correct_locked(&self, enabled: bool) -> AppResult<()> {
        if enabled {
            self.command("SYST:ZCH ON").await?;
            self.command("SYST:ZCOR:ACQ").await?;
            self.command("SYST:ZCOR ON").await
        } else {
            self.command("SYST:ZCOR OFF").await
        }
    }

    /// Acquire and enable zero correction, or switch it off.
    pub async fn set_zero_correct(&self, enabled: bool) -> AppResult<()> {
        let _op = self.op_lock.lock().await;
        self.zero_correct_locked(enabled).await
    }

    /// Configure a reading filter.
    ///
    /// `param` is the median rank (1-5) or the number of averaged readings
    /// (2-100, moving average).
    pub async fn set_filter(&self, kind: FilterKind, enabled: bool, param: u32) -> AppResult<()> {
        let commands = match kind {
            FilterKind::Median => {
                if !(1..=5).contains(&param) {
                    return Err(DaqError::InvalidArgument(format!(
                        "median filter rank must be 1-5, got {param}"
                    )));
                }
                vec![format!("MED:RANK {param}"), format!("MED {}", on_off(enabled))]
            }
            FilterKind::Average => {
                if !(2..=100).contains(&param) {
                    return Err(DaqError::InvalidArgument(format!(
                        "average filter count must be 2-100, got {param}"
                    )));
                }
                vec![
                    format!("AVER:COUN {param}"),
                    "AVER:TCON MOV".to_string(),
                    format!("AVER {}", on_off(enabled)),
                ]
            }
        };

        let _op = self.op_lock.lock().await;
        for command in &commands {
            self.command(command).await?;
        }
        info!(?kind, enabled, param, "Filter configured");
        Ok(())
    }

    fn check_buffer_points(&self, points: usize) -> AppResult<()> {
        let max = self.model.max_buffer_points();
        if points == 0 || points > max {
            return Err(DaqError::InvalidArgument(format!(
                "buffer size must be 1-{max} points on model {}, got {points}",
                self.model
            )));
        }
        Ok(())
    }

    async fn configure_buffer_locked(&self, points: usize) -> AppResult<()> {
        self.command(&format!("TRAC:POIN {points}")).await?;
        self.command("TRAC:CLE").await?;
        self.command("TRAC:FEED:CONT NEXT").await
    }

    /// Size and clear the reading buffer, storing from the next reading on.
    pub async fn configure_buffer(&self, points: usize) -> AppResult<()> {
        self.check_buffer_points(points)?;
        let _op = self.op_lock.lock().await;
        self.configure_buffer_locked(points).await?;
        info!(points, "Buffer configured");
        Ok(())
    }

    /// Fast buffered capture of `points` readings on a fixed range.
    ///
    /// Returns `Ok(None)` when the buffer could not be read back.
    pub async fn capture_buffer(&self, points: usize, range: f64) -> AppResult<Option<Vec<f64>>> {
        self.check_buffer_points(points)?;
        if !matches_table(range, &MEASURE_RANGES) {
            return Err(DaqError::InvalidArgument(format!(
                "invalid current range {range:e} A"
            )));
        }

        let _op = self.op_lock.lock().await;
        self.configure_buffer_locked(points).await?;
        for command in [
            format!("RANG {range:.9}"),
            "NPLC .01".to_string(),
            "SYST:AZER:STAT OFF".to_string(),
            "DISP:ENAB OFF".to_string(),
            format!("TRIG:COUN {points}"),
            "TRIG:DEL 0".to_string(),
            "INIT".to_string(),
        ] {
            self.command(&command).await?;
        }

        let points_u32 = u32::try_from(points).unwrap_or(u32::MAX);
        let wait = BUFFER_TIME_PER_POINT * points_u32 + BUFFER_TIME_MARGIN;
        info!(points, wait = ?wait, "Buffered capture started");
        sleep(wait).await;

        let reply = self.query("TRAC:DATA?").await;
        if let Err(e) = self.command("DISP:ENAB ON").await {
            warn!("Could not re-enable display: {}", e);
        }

        Ok(reply.map(|text| {
            let mut data = codec::parse_list(&text);
            data.truncate(points);
            info!(received = data.len(), "Buffered capture complete");
            data
        }))
    }

    /// Send the preparation block used before a measurement series.
    ///
    /// Reset, auto-zero, range, then acquire and enable zero correction with
    /// zero check released at the end.
    pub async fn prepare_measurement(&self, range: CurrentRange) -> AppResult<()> {
        let mut commands = vec!["*RST".to_string(), "SYST:ACH ON".to_string()];
        match range {
            CurrentRange::Auto => commands.push("RANG:AUTO ON".to_string()),
            CurrentRange::Fixed(amps) => {
                if !matches_table(amps, &MEASURE_RANGES) {
                    return Err(DaqError::InvalidArgument(format!(
                        "invalid current range {amps:e} A"
                    )));
                }
                commands.push(format!("RANG {amps}"));
                commands.push("RANG:AUTO OFF".to_string());
            }
        }
        commands.extend(
            ["INIT", "SYST:ZCOR:ACQ", "SYST:ZCOR ON", "SYST:ZCH OFF"]
                .into_iter()
                .map(String::from),
        );

        let _op = self.op_lock.lock().await;
        for command in &commands {
            self.command(command).await?;
            sleep(PREPARE_SPACING).await;
        }
        info!(?range, "Measurement preparation sent");
        Ok(())
    }

    /// Select the voltage source range (10, 50 or 500 V). 6487 only.
    pub async fn set_voltage_source_range(&self, volts: u32) -> AppResult<()> {
        self.require_voltage_source("voltage source range")?;
        if !VOLTAGE_SOURCE_RANGES.contains(&volts) {
            return Err(DaqError::InvalidArgument(format!(
                "invalid voltage source range {volts} V, expected one of {VOLTAGE_SOURCE_RANGES:?}"
            )));
        }
        let _op = self.op_lock.lock().await;
        self.command(&format!("SOUR:VOLT:RANG {volts}")).await
    }

    /// Currently selected voltage source range. 6487 only.
    pub async fn voltage_source_range(&self) -> AppResult<Option<f64>> {
        self.require_voltage_source("voltage source range")?;
        let _op = self.op_lock.lock().await;
        Ok(self
            .query("SOUR:VOLT:RANG?")
            .await
            .and_then(|reply| codec::parse_number(&reply)))
    }

    async fn set_source_voltage_locked(&self, volts: f64) -> AppResult<()> {
        let range = self
            .query("SOUR:VOLT:RANG?")
            .await
            .and_then(|reply| codec::parse_number(&reply));
        if let Some(max) = range {
            if volts.abs() > max {
                return Err(DaqError::InvalidArgument(format!(
                    "{volts} V exceeds the {max} V source range"
                )));
            }
        }
        self.command(&format!("SOUR:VOLT {}", codec::format_setpoint(volts)))
            .await
    }

    /// Program the source voltage, bounded by the selected range. 6487 only.
    pub async fn set_source_voltage(&self, volts: f64) -> AppResult<()> {
        self.require_voltage_source("voltage source")?;
        let _op = self.op_lock.lock().await;
        self.set_source_voltage_locked(volts).await?;
        info!("Source voltage set to {:.3} V", volts);
        Ok(())
    }

    /// Select the source current clamp (25 µA to 25 mA). 6487 only.
    pub async fn set_current_clamp(&self, amps: f64) -> AppResult<()> {
        self.require_voltage_source("current clamp")?;
        if !matches_table(amps, &CURRENT_CLAMPS) {
            return Err(DaqError::InvalidArgument(format!(
                "invalid current clamp {amps:e} A, expected one of {CURRENT_CLAMPS:?}"
            )));
        }
        let _op = self.op_lock.lock().await;
        self.command(&format!("SOUR:VOLT:ILIM {amps:.6}")).await
    }

    /// Switch the voltage source output. 6487 only.
    pub async fn set_voltage_source_output(&self, enabled: bool) -> AppResult<()> {
        self.require_voltage_source("voltage source output")?;
        let _op = self.op_lock.lock().await;
        self.command(&format!("SOUR:VOLT:STAT {}", on_off(enabled)))
            .await
    }

    /// Smallest source range that covers `volts`.
    pub fn nearest_voltage_range(volts: f64) -> u32 {
        let volts = volts.abs();
        VOLTAGE_SOURCE_RANGES
            .iter()
            .copied()
            .find(|&range| f64::from(range) >= volts)
            .unwrap_or(VOLTAGE_SOURCE_RANGES[VOLTAGE_SOURCE_RANGES.len() - 1])
    }

    /// Measure resistance with the built-in source. 6487 only.
    ///
    /// The source is switched off again whatever the outcome.
    pub async fn measure_resistance(&self, volts: f64, clamp: f64) -> AppResult<Option<f64>> {
        self.require_voltage_source("resistance measurement")?;
        if !matches_table(clamp, &CURRENT_CLAMPS) {
            return Err(DaqError::InvalidArgument(format!(
                "invalid current clamp {clamp:e} A"
            )));
        }

        let _op = self.op_lock.lock().await;
        let range = Self::nearest_voltage_range(volts);
        self.command(&format!("SOUR:VOLT:RANG {range}")).await?;
        self.set_source_voltage_locked(volts).await?;
        self.command(&format!("SOUR:VOLT:ILIM {clamp:.6}")).await?;
        self.zero_correct_locked(true).await?;
        self.command("SYST:ZCH OFF").await?;
        self.command("SENS:OHMS ON").await?;
        sleep(OHMS_SETTLE).await;

        self.command("SOUR:VOLT:STAT ON").await?;
        sleep(SOURCE_SETTLE).await;
        let reply = self.query("READ?").await;
        self.command("SOUR:VOLT:STAT OFF").await?;

        let ohms = reply.as_deref().and_then(codec::parse_number);
        match ohms {
            Some(value) => info!("Measured resistance {:.2} Ω", value),
            None => warn!(reply = ?reply, "Resistance measurement failed"),
        }
        Ok(ohms)
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

#[async_trait]
impl CurrentMeter for KeithleyPicoammeter {
    async fn read_current(&self) -> Option<f64> {
        self.measure_current().await
    }
}

impl fmt::Debug for KeithleyPicoammeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeithleyPicoammeter")
            .field("model", &self.model)
            .field("bus", &self.bus.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTimings;
    use crate::transport::{MockHandle, MockTransport};
    use tracing_test::traced_test;

    fn fast_timings() -> KeithleyTimings {
        KeithleyTimings {
            command_settle: Duration::from_millis(1),
            read_timeout: Duration::from_millis(5),
            init_delay: Duration::from_millis(1),
            reset_delay: Duration::from_millis(1),
        }
    }

    fn meter_with<F>(model: PicoammeterModel, responder: F) -> (KeithleyPicoammeter, MockHandle)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let transport = MockTransport::with_responder(responder);
        let handle = transport.handle();
        let bus = BusManager::new(Box::new(transport), BusTimings::default());
        (KeithleyPicoammeter::new(bus, model, fast_timings()), handle)
    }

    fn idn(model: &'static str) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        move |line| match line {
            "*IDN?" => Some(format!("KEITHLEY INSTRUMENTS INC.,MODEL {model},1234567,A01")),
            "READ?" => Some("+2.345000E-09A,+1.2E+01,+0.0E+00".to_string()),
            "SOUR:VOLT:RANG?" => Some("10".to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_connect_checks_model() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, idn("6485"));
        let identity = meter.connect().await.unwrap();
        assert!(identity.contains("MODEL 6485"));
        assert_eq!(handle.written_lines(), vec!["*RST", "*IDN?"]);
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_model() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, idn("6485"));
        let result = meter.connect().await;
        assert!(matches!(result, Err(DaqError::IdentityMismatch { .. })));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_measure_current_per_model() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, idn("6485"));
        assert_eq!(meter.measure_current().await, Some(2.345e-9));
        assert_eq!(handle.written_lines(), vec!["READ?"]);

        let (meter, handle) = meter_with(PicoammeterModel::K6487, idn("6487"));
        assert_eq!(meter.read_current().await, Some(2.345e-9));
        assert_eq!(handle.written_lines(), vec!["FUNC 'CURR'", "READ?"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_silent_meter_reads_nothing() {
        let (meter, _handle) = meter_with(PicoammeterModel::K6485, |_| None);
        assert_eq!(meter.measure_current().await, None);
        assert!(logs_contain("No reply from picoammeter"));
    }

    #[tokio::test]
    async fn test_range_validation() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |_| None);
        assert!(matches!(
            meter.set_current_range(3e-6).await,
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(handle.written_lines().is_empty());

        meter.set_current_range(2e-6).await.unwrap();
        assert_eq!(handle.written_lines(), vec!["RANG 0.000002000"]);
    }

    #[test]
    fn test_parse_current_range() {
        assert_eq!("auto".parse::<CurrentRange>().unwrap(), CurrentRange::Auto);
        assert_eq!(
            "2e-6".parse::<CurrentRange>().unwrap(),
            CurrentRange::Fixed(2e-6)
        );
        assert!("5e-6".parse::<CurrentRange>().is_err());
    }

    #[tokio::test]
    async fn test_filter_commands() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |_| None);
        meter.set_filter(FilterKind::Average, true, 10).await.unwrap();
        meter.set_filter(FilterKind::Median, false, 3).await.unwrap();
        assert_eq!(
            handle.written_lines(),
            vec!["AVER:COUN 10", "AVER:TCON MOV", "AVER ON", "MED:RANK 3", "MED OFF"]
        );

        assert!(meter.set_filter(FilterKind::Median, true, 6).await.is_err());
        assert!(meter.set_filter(FilterKind::Average, true, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_buffer_limits_depend_on_model() {
        let (meter, _handle) = meter_with(PicoammeterModel::K6485, |_| None);
        assert!(meter.configure_buffer(2500).await.is_ok());
        assert!(meter.configure_buffer(2501).await.is_err());
        assert!(meter.configure_buffer(0).await.is_err());

        let (meter, _handle) = meter_with(PicoammeterModel::K6487, |_| None);
        assert!(meter.configure_buffer(3000).await.is_ok());
    }

    #[tokio::test]
    async fn test_capture_buffer_reads_list() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |line| {
            (line == "TRAC:DATA?").then(|| "1.0E-9,2.0E-9,3.0E-9,4.0E-9,5.0E-9".to_string())
        });

        let data = meter.capture_buffer(4, 2e-6).await.unwrap().unwrap();
        assert_eq!(data, vec![1.0e-9, 2.0e-9, 3.0e-9, 4.0e-9]);

        let lines = handle.written_lines();
        assert_eq!(lines.first().map(String::as_str), Some("TRAC:POIN 4"));
        assert_eq!(lines.last().map(String::as_str), Some("DISP:ENAB ON"));
        assert!(lines.contains(&"TRIG:COUN 4".to_string()));
    }

    #[tokio::test]
    async fn test_prepare_measurement_block() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |_| None);
        meter.prepare_measurement(CurrentRange::Auto).await.unwrap();
        assert_eq!(
            handle.written_lines(),
            vec![
                "*RST",
                "SYST:ACH ON",
                "RANG:AUTO ON",
                "INIT",
                "SYST:ZCOR:ACQ",
                "SYST:ZCOR ON",
                "SYST:ZCH OFF"
            ]
        );

        let (meter, handle) = meter_with(PicoammeterModel::K6485, |_| None);
        meter
            .prepare_measurement(CurrentRange::Fixed(2e-9))
            .await
            .unwrap();
        let lines = handle.written_lines();
        assert_eq!(lines[2], "RANG 0.000000002");
        assert_eq!(lines[3], "RANG:AUTO OFF");
    }

    #[tokio::test]
    async fn test_voltage_source_is_6487_only() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, idn("6485"));
        assert!(matches!(
            meter.set_source_voltage(5.0).await,
            Err(DaqError::Unsupported { .. })
        ));
        assert!(matches!(
            meter.measure_resistance(10.0, 2.5e-3).await,
            Err(DaqError::Unsupported { .. })
        ));
        assert!(handle.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_source_voltage_bounded_by_range() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, idn("6487"));
        assert!(matches!(
            meter.set_source_voltage(12.0).await,
            Err(DaqError::InvalidArgument(_))
        ));
        meter.set_source_voltage(5.0).await.unwrap();
        assert_eq!(
            handle.written_lines(),
            vec!["SOUR:VOLT:RANG?", "SOUR:VOLT:RANG?", "SOUR:VOLT 5.000"]
        );

        assert!(meter.set_current_clamp(1e-3).await.is_err());
        meter.set_current_clamp(2.5e-3).await.unwrap();
        assert_eq!(
            handle.written_lines().last().map(String::as_str),
            Some("SOUR:VOLT:ILIM 0.002500")
        );
    }

    #[tokio::test]
    async fn test_disconnect_6487_turns_source_off() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, idn("6487"));
        meter.disconnect().await.unwrap();
        meter.disconnect().await.unwrap();
        assert_eq!(handle.written_lines(), vec!["SOUR:VOLT:STAT OFF"]);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_release_one_lease() {
        let transport = MockTransport::with_responder(idn("6487"));
        let handle = transport.handle();
        let bus = BusManager::new(Box::new(transport), BusTimings::default());
        let meter = KeithleyPicoammeter::new(bus.clone(), PicoammeterModel::K6487, fast_timings());
        let supply = bus.power_supply(6);
        assert_eq!(bus.lease_count(), 2);

        let (first, second) = tokio::join!(meter.disconnect(), meter.disconnect());
        first.unwrap();
        second.unwrap();

        assert_eq!(bus.lease_count(), 1);
        assert!(handle.is_open());
        let source_off = handle
            .written_lines()
            .iter()
            .filter(|line| *line == "SOUR:VOLT:STAT OFF")
            .count();
        assert_eq!(source_off, 1);

        assert!(supply.set_voltage(1.0).await);
        assert_eq!(meter.measure_current().await, None);
    }

    #[tokio::test]
    async fn test_zero_check_and_auto_range_commands() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |_| None);
        meter.set_zero_check(true).await.unwrap();
        meter.set_zero_check(false).await.unwrap();
        meter.set_auto_range(true).await.unwrap();
        meter.set_auto_range(false).await.unwrap();
        meter.set_zero_correct(true).await.unwrap();
        meter.set_zero_correct(false).await.unwrap();
        assert_eq!(
            handle.written_lines(),
            vec![
                "SYST:ZCH ON",
                "SYST:ZCH OFF",
                "RANG:AUTO ON",
                "RANG:AUTO OFF",
                "SYST:ZCH ON",
                "SYST:ZCOR:ACQ",
                "SYST:ZCOR ON",
                "SYST:ZCOR OFF"
            ]
        );
    }

    #[tokio::test]
    async fn test_self_test_and_error_queue() {
        let (meter, handle) = meter_with(PicoammeterModel::K6485, |line| match line {
            "*TST?" => Some("0".to_string()),
            "SYST:ERR?" => Some("0,\"No error\"".to_string()),
            _ => None,
        });
        assert!(meter.self_test().await);
        assert_eq!(meter.error_status().await.as_deref(), Some("0,\"No error\""));
        assert_eq!(handle.written_lines(), vec!["*TST?", "SYST:ERR?"]);

        let (meter, _handle) = meter_with(PicoammeterModel::K6485, |line| {
            (line == "*TST?").then(|| "1".to_string())
        });
        assert!(!meter.self_test().await);
        assert_eq!(meter.error_status().await, None);
    }

    #[tokio::test]
    async fn test_voltage_source_range_selection() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, idn("6487"));
        meter.set_voltage_source_range(50).await.unwrap();
        assert!(matches!(
            meter.set_voltage_source_range(20).await,
            Err(DaqError::InvalidArgument(_))
        ));
        assert_eq!(meter.voltage_source_range().await.unwrap(), Some(10.0));
        assert_eq!(
            handle.written_lines(),
            vec!["SOUR:VOLT:RANG 50", "SOUR:VOLT:RANG?"]
        );

        let (meter, handle) = meter_with(PicoammeterModel::K6485, idn("6485"));
        assert!(matches!(
            meter.set_voltage_source_range(10).await,
            Err(DaqError::Unsupported { .. })
        ));
        assert!(handle.written_lines().is_empty());
    }

    fn ohmmeter(reading: Option<&'static str>) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        move |line| match line {
            "SOUR:VOLT:RANG?" => Some("10".to_string()),
            "READ?" => reading.map(String::from),
            _ => None,
        }
    }

    const RESISTANCE_SETUP: [&str; 10] = [
        "SOUR:VOLT:RANG 10",
        "SOUR:VOLT:RANG?",
        "SOUR:VOLT 5.000",
        "SOUR:VOLT:ILIM 0.002500",
        "SYST:ZCH ON",
        "SYST:ZCOR:ACQ",
        "SYST:ZCOR ON",
        "SYST:ZCH OFF",
        "SENS:OHMS ON",
        "SOUR:VOLT:STAT ON",
    ];

    #[tokio::test]
    async fn test_measure_resistance_sequence() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, ohmmeter(Some("+1.000000E+06")));

        let ohms = meter.measure_resistance(5.0, 2.5e-3).await.unwrap();
        assert_eq!(ohms, Some(1.0e6));

        let mut expected: Vec<&str> = RESISTANCE_SETUP.to_vec();
        expected.extend(["READ?", "SOUR:VOLT:STAT OFF"]);
        assert_eq!(handle.written_lines(), expected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_resistance_read_still_switches_source_off() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, ohmmeter(None));

        assert_eq!(meter.measure_resistance(5.0, 2.5e-3).await.unwrap(), None);

        let lines = handle.written_lines();
        assert_eq!(&lines[..RESISTANCE_SETUP.len()], RESISTANCE_SETUP);
        assert_eq!(lines.last().map(String::as_str), Some("SOUR:VOLT:STAT OFF"));
        assert!(logs_contain("Resistance measurement failed"));
    }

    #[tokio::test]
    async fn test_resistance_clamp_is_validated_first() {
        let (meter, handle) = meter_with(PicoammeterModel::K6487, ohmmeter(None));
        assert!(matches!(
            meter.measure_resistance(5.0, 1e-3).await,
            Err(DaqError::InvalidArgument(_))
        ));
        assert!(handle.written_lines().is_empty());
    }

    #[test]
    fn test_nearest_voltage_range() {
        assert_eq!(KeithleyPicoammeter::nearest_voltage_range(5.0), 10);
        assert_eq!(KeithleyPicoammeter::nearest_voltage_range(-20.0), 50);
        assert_eq!(KeithleyPicoammeter::nearest_voltage_range(600.0), 500);
    }
}
