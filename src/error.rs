//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it provides a centralized way to report the things that can go wrong
//! between the operator and an instrument, from configuration problems to a
//! serial port that disappeared mid-transaction.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps loading errors from the figment-based configuration layer.
//! - **`Configuration`**: Semantic errors in values that parsed correctly but make
//!   no sense (an unknown log level, a zero retry budget).
//! - **`Io`**: Wraps `std::io::Error`; hard transport faults (port removed, socket
//!   reset) end up here.
//! - **`Connection`**: Opening a transport failed (port busy, host unreachable).
//!   Reported once, never retried automatically.
//! - **`BusLockTimeout`**: A bounded bus-lock acquisition gave up.
//! - **`InvalidSweep`** / **`InvalidArgument`** / **`Unsupported`**: Requests rejected
//!   before anything is written to the wire.
//!
//! Transient conditions (a query that times out, a reply that is not a number)
//! are *not* errors: drivers log them and hand back `None`.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Timed out after {waited:?} waiting for bus {bus}")]
    BusLockTimeout { bus: String, waited: Duration },

    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} is not supported by model {model}")]
    Unsupported { model: String, operation: String },

    #[error("Unexpected instrument identity (expected {expected}): {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Background job failed: {0}")]
    TaskJoin(String),
}

impl DaqError {
    /// Build a [`DaqError::Connection`] for a transport target.
    pub fn connection(target: impl ToString, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}
