//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (the timings the instruments were characterised with)
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `SCPI_DAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCPI_DAQ_APPLICATION__LOG_LEVEL=debug
//! SCPI_DAQ_BUS__SELECT_SETTLE_MS=150
//! SCPI_DAQ_SWEEP__MAX_MEASURE_ATTEMPTS=5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scpi_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("select settle: {} ms", settings.bus.select_settle_ms);
//! # Ok::<(), scpi_daq::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or deserialize a provider.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values deserialized but failed validation.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial and TCP transport settings
    #[serde(default)]
    pub transport: TransportSettings,
    /// Multidrop bus timings for addressed power supplies
    #[serde(default)]
    pub bus: BusSettings,
    /// Picoammeter transaction timings
    #[serde(default)]
    pub picoammeter: PicoammeterSettings,
    /// Step-sweep scheduler settings
    #[serde(default)]
    pub sweep: SweepSettings,
    /// Fixed-interval poll defaults
    #[serde(default)]
    pub poll: PollSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scpi_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Transport timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Per-call timeout handed to the serial driver
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout_ms: u64,
    /// TCP connect timeout
    #[serde(default = "default_tcp_connect_timeout")]
    pub tcp_connect_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            serial_timeout_ms: default_serial_timeout(),
            tcp_connect_timeout_ms: default_tcp_connect_timeout(),
        }
    }
}

/// Timings of one addressed transaction on a shared bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Wait after `INSTrument:NSELect` before the command frame
    #[serde(default = "default_select_settle")]
    pub select_settle_ms: u64,
    /// First wait before checking for a reply
    #[serde(default = "default_response_wait")]
    pub response_wait_ms: u64,
    /// Second (last) wait when nothing arrived after the first
    #[serde(default = "default_response_retry")]
    pub response_retry_ms: u64,
    /// Wait after a command that expects no reply
    #[serde(default = "default_write_settle")]
    pub write_settle_ms: u64,
    /// Upper bound for reading one reply line
    #[serde(default = "default_bus_read_timeout")]
    pub read_timeout_ms: u64,
    /// Optional bound on waiting for the bus lock; unbounded when absent
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            select_settle_ms: default_select_settle(),
            response_wait_ms: default_response_wait(),
            response_retry_ms: default_response_retry(),
            write_settle_ms: default_write_settle(),
            read_timeout_ms: default_bus_read_timeout(),
            lock_timeout_ms: None,
        }
    }
}

/// Timings of a picoammeter transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PicoammeterSettings {
    /// Wait after every command before reading
    #[serde(default = "default_command_settle")]
    pub command_settle_ms: u64,
    /// Upper bound for reading one reply line
    #[serde(default = "default_meter_read_timeout")]
    pub read_timeout_ms: u64,
    /// Wait after opening the port before the first command
    #[serde(default = "default_init_delay")]
    pub init_delay_ms: u64,
    /// Wait after `*RST`
    #[serde(default = "default_reset_delay")]
    pub reset_delay_ms: u64,
}

impl Default for PicoammeterSettings {
    fn default() -> Self {
        Self {
            command_settle_ms: default_command_settle(),
            read_timeout_ms: default_meter_read_timeout(),
            init_delay_ms: default_init_delay(),
            reset_delay_ms: default_reset_delay(),
        }
    }
}

/// Step-sweep scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Wait after commanding a new voltage, counted inside the hold time
    #[serde(default = "default_sweep_settle")]
    pub settle_ms: u64,
    /// Measurement attempts per step before the sweep is aborted
    #[serde(default = "default_measure_attempts")]
    pub max_measure_attempts: u32,
    /// Wait between failed measurement attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Capacity of the sample channel between jobs and the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            settle_ms: default_sweep_settle(),
            max_measure_attempts: default_measure_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Fixed-interval poll defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    /// Interval between samples
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    /// Number of samples when the caller does not say
    #[serde(default = "default_poll_count")]
    pub count: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            count: default_poll_count(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_serial_timeout() -> u64 {
    100
}

fn default_tcp_connect_timeout() -> u64 {
    2000
}

fn default_select_settle() -> u64 {
    100
}

fn default_response_wait() -> u64 {
    150
}

fn default_response_retry() -> u64 {
    100
}

fn default_write_settle() -> u64 {
    50
}

fn default_bus_read_timeout() -> u64 {
    500
}

fn default_command_settle() -> u64 {
    100
}

fn default_meter_read_timeout() -> u64 {
    1000
}

fn default_init_delay() -> u64 {
    500
}

fn default_reset_delay() -> u64 {
    200
}

fn default_sweep_settle() -> u64 {
    50
}

fn default_measure_attempts() -> u32 {
    10
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    256
}

fn default_poll_interval() -> u64 {
    200
}

fn default_poll_count() -> u32 {
    10
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load defaults, `config/default.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; every key has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCPI_DAQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.sweep.max_measure_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "sweep.max_measure_attempts must be > 0".to_string(),
            ));
        }

        if self.sweep.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "sweep.channel_capacity must be > 0".to_string(),
            ));
        }

        if self.transport.serial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "transport.serial_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl TransportSettings {
    /// Serial driver timeout as a `Duration`.
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    /// TCP connect timeout as a `Duration`.
    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }
}

impl PollSettings {
    /// Poll interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_instrument_timings() {
        let settings = Settings::default();
        assert_eq!(settings.bus.select_settle_ms, 100);
        assert_eq!(settings.bus.response_wait_ms, 150);
        assert_eq!(settings.bus.response_retry_ms, 100);
        assert_eq!(settings.sweep.max_measure_attempts, 10);
        assert!(settings.bus.lock_timeout_ms.is_none());
        settings.validate().unwrap();
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.poll.count, 10);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[bus]\nselect_settle_ms = 20\nlock_timeout_ms = 5000\n\n[application]\nname = \"bench\"\nlog_level = \"debug\""
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.bus.select_settle_ms, 20);
        assert_eq!(settings.bus.lock_timeout_ms, Some(5000));
        assert_eq!(settings.bus.response_wait_ms, 150);
        assert_eq!(settings.application.name, "bench");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut settings = Settings::default();
        settings.sweep.max_measure_attempts = 0;
        assert!(settings.validate().is_err());
    }
}
