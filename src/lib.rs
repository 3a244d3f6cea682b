//! Core library for the scpi_daq tools.
//!
//! Talks SCPI to TDK-Lambda power supplies sharing a multidrop RS-232 bus and
//! to Keithley 6485/6487 picoammeters, over serial, raw TCP or a built-in
//! simulator, and runs the polling and step-sweep routines built on them.
//!
//! Layering, leaves first:
//!
//! - [`transport`]: byte channels (serial, TCP, mock)
//! - [`codec`]: line framing and reply parsing
//! - [`bus`]: one transport shared by several addressed instruments
//! - [`instrument`]: drivers
//! - [`measurement`] and [`scheduler`]: samples, polls and sweeps
//!
//! # Example
//!
//! ```no_run
//! use scpi_daq::bus::BusManager;
//! use scpi_daq::config::Settings;
//!
//! # async fn run() -> scpi_daq::error::AppResult<()> {
//! let settings = Settings::load()?;
//! let bus = BusManager::open(&"COM21".parse()?, &settings).await?;
//! let supply = bus.power_supply(6);
//! supply.set_voltage(12.5).await;
//! println!("{:?}", supply.get_actual_voltage().await);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod instrument;
pub mod layout;
pub mod logging;
pub mod measurement;
pub mod scheduler;
pub mod storage;
pub mod transport;
