//! In-memory transport for tests and the `sim` bench.
//!
//! `MockTransport` records every line written to it and feeds replies back
//! through an optional responder closure. A cloned [`MockHandle`] keeps access
//! to the recorded traffic after the transport has been handed to a bus.

use super::{ConnectionDescriptor, Transport};
use crate::codec;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Produces the reply (without terminator) for one written line.
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    partial: Vec<u8>,
    lines: Vec<String>,
    pending: VecDeque<u8>,
    closed: bool,
    fault: bool,
}

impl MockState {
    fn check(&self) -> AppResult<()> {
        if self.closed {
            return Err(DaqError::NotConnected);
        }
        if self.fault {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated device removed",
            )));
        }
        Ok(())
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panicking test thread must not hide traffic from the others
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated instrument link.
pub struct MockTransport {
    descriptor: ConnectionDescriptor,
    state: Arc<Mutex<MockState>>,
    responder: Option<Responder>,
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Silent transport: records writes, never answers.
    pub fn new() -> Self {
        Self {
            descriptor: ConnectionDescriptor::Simulated,
            state: Arc::new(Mutex::new(MockState::default())),
            responder: None,
        }
    }

    /// Transport that answers each written line through `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Handle for inspecting traffic after the transport is moved.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Bench simulator behind the `sim` descriptor.
    ///
    /// Emulates TDK-Lambda supplies at any multidrop address (setpoints are
    /// tracked per address and read back as measured values) and a Keithley
    /// 6485 that reads a fixed nanoamp current.
    pub fn simulated_bench() -> Self {
        let mut bench = SimulatedBench::default();
        Self::with_responder(move |line| bench.respond(line))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Every complete line written so far, without terminators.
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.state).lines.clone()
    }

    /// Queue bytes as if the instrument had sent them.
    pub fn push_input(&self, bytes: &[u8]) {
        lock(&self.state).pending.extend(bytes.iter().copied());
    }

    /// Make every following operation fail with an I/O error.
    pub fn inject_fault(&self) {
        lock(&self.state).fault = true;
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        !lock(&self.state).closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn is_open(&self) -> bool {
        !lock(&self.state).closed
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let complete = {
            let mut state = lock(&self.state);
            state.check()?;
            state.partial.extend_from_slice(bytes);

            let mut complete = Vec::new();
            while let Some(end) = state.partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.partial.drain(..=end).collect();
                let text = codec::decode(&line);
                state.lines.push(text.clone());
                complete.push(text);
            }
            complete
        };

        if let Some(responder) = self.responder.as_mut() {
            let replies: Vec<String> = complete
                .iter()
                .filter_map(|line| responder(line.as_str()))
                .collect();
            let mut state = lock(&self.state);
            for reply in replies {
                state.pending.extend(codec::encode(&reply));
            }
        }

        // Give sibling tasks a chance to run, as real I/O would
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        {
            let mut state = lock(&self.state);
            state.check()?;
            if let Some(line) = state.take_line() {
                return Ok(line);
            }
        }

        tokio::time::sleep(timeout).await;

        let mut state = lock(&self.state);
        state.check()?;
        match state.take_line() {
            Some(line) => Ok(line),
            None => Ok(state.pending.drain(..).collect()),
        }
    }

    async fn read_available(&mut self) -> AppResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.check()?;
        Ok(state.pending.drain(..).collect())
    }

    async fn bytes_available(&mut self) -> AppResult<usize> {
        let state = lock(&self.state);
        state.check()?;
        Ok(state.pending.len())
    }

    async fn clear_buffers(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.check()?;
        state.pending.clear();
        state.partial.clear();
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SimulatedSupply {
    voltage: f64,
    current: f64,
    output: bool,
}

/// Reply logic for the `sim` bench.
#[derive(Debug, Default)]
struct SimulatedBench {
    selected: u8,
    supplies: HashMap<u8, SimulatedSupply>,
    range: Option<f64>,
}

impl SimulatedBench {
    const SIM_CURRENT: f64 = 1.0e-9;
    const LOAD_OHMS: f64 = 1.0e3;

    fn supply(&mut self) -> &mut SimulatedSupply {
        self.supplies.entry(self.selected).or_default()
    }

    fn respond(&mut self, line: &str) -> Option<String> {
        let (header, arg) = match line.split_once(' ') {
            Some((h, a)) => (h, a.trim()),
            None => (line, ""),
        };

        match header {
            "INSTrument:NSELect" => {
                if let Ok(addr) = arg.parse() {
                    self.selected = addr;
                }
                None
            }
            "VOLT:AMPL" => {
                if let Ok(v) = arg.parse() {
                    self.supply().voltage = v;
                }
                None
            }
            "CURR:AMPL" => {
                if let Ok(v) = arg.parse() {
                    self.supply().current = v;
                }
                None
            }
            "OUTP:STAT" => {
                self.supply().output = arg == "1" || arg.eq_ignore_ascii_case("ON");
                None
            }
            ":VOLT?" | "MEAS:VOLT?" => Some(codec::format_setpoint(self.supply().voltage)),
            ":CURR?" => Some(codec::format_setpoint(self.supply().current)),
            "MEAS:CURR?" => {
                let supply = *self.supply();
                let drawn = if supply.output {
                    (supply.voltage / Self::LOAD_OHMS).min(supply.current)
                } else {
                    0.0
                };
                Some(codec::format_setpoint(drawn))
            }
            "OUTP?" => Some(if self.supply().output { "1" } else { "0" }.to_string()),
            "*IDN?" => Some(format!(
                "KEITHLEY INSTRUMENTS INC.,MODEL 6485,SIM{:02},1.0",
                self.selected
            )),
            "*TST?" => Some("0".to_string()),
            "SYST:ERR?" => Some("0,\"No error\"".to_string()),
            "RANG" => {
                self.range = arg.parse().ok();
                None
            }
            "RANG:AUTO" => {
                if arg.eq_ignore_ascii_case("ON") {
                    self.range = None;
                }
                None
            }
            "READ?" => {
                let reading = match self.range {
                    Some(range) => Self::SIM_CURRENT.min(range),
                    None => Self::SIM_CURRENT,
                };
                Some(format!("{reading:+.6E}A,+0.000000E+00,+0.000000E+00"))
            }
            "TRAC:DATA?" => Some(
                std::iter::repeat(format!("{:+.6E}", Self::SIM_CURRENT))
                    .take(4)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }
}
