//! Instrument drivers and the capabilities the schedulers rely on.
//!
//! Drivers never raise on a transient miss: a query that times out or returns
//! garbage is logged and comes back as `None`, so a running loop can decide
//! whether to retry.

pub mod console;
pub mod keithley;
pub mod tdk_lambda;

use async_trait::async_trait;

pub use console::ScpiConsole;
pub use keithley::{CurrentRange, FilterKind, KeithleyPicoammeter, PicoammeterModel};
pub use tdk_lambda::{SupplyStatus, TdkPowerSupply};

/// Capability for instruments with a programmable output voltage.
#[async_trait]
pub trait VoltageSource: Send + Sync {
    /// Command a new output voltage. Returns whether the command was delivered.
    async fn set_voltage(&self, volts: f64) -> bool;

    /// Read back the output voltage actually present.
    async fn read_voltage(&self) -> Option<f64>;
}

/// Capability for instruments that measure a current.
#[async_trait]
pub trait CurrentMeter: Send + Sync {
    /// Take one current reading in amperes.
    async fn read_current(&self) -> Option<f64>;
}
