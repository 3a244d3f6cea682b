//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(level: &str) -> String {
    format!("warn,scpi_daq={level}")
}

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` wins over `level` when set. Calling this twice is harmless; the
/// second call leaves the first subscriber in place.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
