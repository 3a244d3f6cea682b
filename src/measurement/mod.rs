//! Measurement samples and the log they are collected into.
//!
//! Worker tasks (polls, sweeps) never touch the log directly. They send
//! [`Sample`]s over a bounded channel and a single collector task appends
//! them, so readers always see samples in emission order.

pub mod station;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

pub use station::{MeasurementStation, Probe};

/// One voltage/current reading pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Supply voltage (V), if it was read or commanded
    pub voltage: Option<f64>,
    /// Measured current (A)
    pub current: Option<f64>,
    /// Local wall-clock time the reading was taken
    pub timestamp: DateTime<Local>,
}

impl Sample {
    /// Sample stamped with the current time.
    pub fn new(voltage: Option<f64>, current: Option<f64>) -> Self {
        Self {
            voltage,
            current,
            timestamp: Local::now(),
        }
    }

    /// Electrical power V·I when both values are present.
    pub fn power(&self) -> Option<f64> {
        Some(self.voltage? * self.current?)
    }

    /// True when neither value was obtained.
    pub fn is_empty(&self) -> bool {
        self.voltage.is_none() && self.current.is_none()
    }
}

/// Sending half used by workers.
pub type SampleSender = mpsc::Sender<Sample>;

/// Bounded sample channel.
pub fn sample_channel(capacity: usize) -> (SampleSender, mpsc::Receiver<Sample>) {
    mpsc::channel(capacity.max(1))
}

/// Ordered, shared record of every collected sample.
#[derive(Clone, Debug, Default)]
pub struct SampleLog {
    samples: Arc<RwLock<Vec<Sample>>>,
}

impl SampleLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain `rx` into the log until every sender is gone.
    ///
    /// Resolves to the number of samples collected.
    pub fn spawn_collector(&self, mut rx: mpsc::Receiver<Sample>) -> JoinHandle<usize> {
        let samples = Arc::clone(&self.samples);
        tokio::spawn(async move {
            let mut collected = 0;
            while let Some(sample) = rx.recv().await {
                samples.write().await.push(sample);
                collected += 1;
            }
            debug!(collected, "Sample channel closed");
            collected
        })
    }

    /// Append one sample directly (manual single measurements).
    pub async fn push(&self, sample: Sample) {
        self.samples.write().await.push(sample);
    }

    /// Copy of everything collected so far.
    pub async fn snapshot(&self) -> Vec<Sample> {
        self.samples.read().await.clone()
    }

    /// Number of collected samples.
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Whether nothing has been collected.
    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }
}
