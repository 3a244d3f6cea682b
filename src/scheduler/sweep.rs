//! Step sweep: set a voltage, hold it, measure halfway through the hold.
//!
//! Per step:
//!
//! 1. command the voltage and wait the settle time
//! 2. wait until the middle of the hold, measured from the start of the step
//! 3. read the current, retrying with a short backoff; give up on the whole
//!    sweep when every attempt fails
//! 4. emit the sample and wait out the rest of the hold
//!
//! The last step is always at exactly `stop`. Cancellation leaves the output
//! at whatever was last commanded.

use super::{emit, spawn_job, wait_for, wait_until, JobHandle, JobOutcome};
use crate::config::SweepSettings;
use crate::error::{AppResult, DaqError};
use crate::measurement::{MeasurementStation, Sample, SampleSender};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tolerance when comparing a step value with `stop`.
pub const VOLTAGE_EPSILON: f64 = 1e-12;

/// Upper bound on the number of steps in one sweep.
pub const MAX_STEPS: usize = 100_000;

/// Validated sweep parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    start: f64,
    stop: f64,
    step: f64,
    hold: Duration,
}

impl SweepPlan {
    /// Check and build a sweep plan.
    ///
    /// Rejected: non-finite values, a step pointing away from `stop`, a zero
    /// step when `start != stop`, and sweeps longer than [`MAX_STEPS`].
    pub fn new(start: f64, stop: f64, step: f64, hold: Duration) -> AppResult<Self> {
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(DaqError::InvalidSweep(format!(
                "start {start}, stop {stop} and step {step} must be finite"
            )));
        }

        let span = stop - start;
        if span.abs() > VOLTAGE_EPSILON {
            if step == 0.0 {
                return Err(DaqError::InvalidSweep(
                    "step must not be zero when start and stop differ".to_string(),
                ));
            }
            if span.signum() != step.signum() {
                return Err(DaqError::InvalidSweep(format!(
                    "step {step} points away from stop ({start} -> {stop})"
                )));
            }
            let steps = (span / step).ceil();
            if steps >= MAX_STEPS as f64 {
                return Err(DaqError::InvalidSweep(format!(
                    "{steps} steps exceeds the limit of {MAX_STEPS}"
                )));
            }
        }

        Ok(Self {
            start,
            stop,
            step,
            hold,
        })
    }

    /// First voltage.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last voltage.
    pub fn stop(&self) -> f64 {
        self.stop
    }

    /// Signed increment.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Time spent at each voltage.
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Every voltage the sweep visits, in order.
    ///
    /// Values are `start + i * step` so rounding does not accumulate; a value
    /// that would pass `stop` is clamped to it and ends the sequence.
    pub fn voltages(&self) -> Vec<f64> {
        if (self.stop - self.start).abs() <= VOLTAGE_EPSILON {
            return vec![self.stop];
        }

        let ascending = self.step > 0.0;
        let mut values = Vec::new();
        for i in 0..=MAX_STEPS {
            let v = self.start + self.step * i as f64;
            let overshoot = if ascending { v > self.stop } else { v < self.stop };
            if overshoot || (v - self.stop).abs() <= VOLTAGE_EPSILON {
                values.push(self.stop);
                break;
            }
            values.push(v);
        }
        values
    }
}

/// Delays and retry budget of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTimings {
    /// Wait after commanding each voltage
    pub settle: Duration,
    /// Measurement attempts per step before the sweep is aborted
    pub max_attempts: u32,
    /// Wait between failed attempts
    pub retry_backoff: Duration,
}

impl Default for SweepTimings {
    fn default() -> Self {
        Self::from(&SweepSettings::default())
    }
}

impl From<&SweepSettings> for SweepTimings {
    fn from(settings: &SweepSettings) -> Self {
        Self {
            settle: Duration::from_millis(settings.settle_ms),
            max_attempts: settings.max_measure_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

enum Reading {
    Current(f64),
    Failed(u32),
    Cancelled,
}

async fn measure_with_retry(
    station: &MeasurementStation,
    timings: &SweepTimings,
    cancel: &CancellationToken,
) -> Reading {
    let mut attempts = 0;
    loop {
        if let Some(current) = station.measure_current().await {
            return Reading::Current(current);
        }
        attempts += 1;
        if attempts >= timings.max_attempts {
            return Reading::Failed(attempts);
        }
        warn!(attempt = attempts, "Mid-step measurement failed, retrying");
        if !wait_for(cancel, timings.retry_backoff).await {
            return Reading::Cancelled;
        }
    }
}

/// Run `plan` on `station`, sending one sample per step to `tx`.
pub async fn run_sweep(
    station: &MeasurementStation,
    plan: &SweepPlan,
    timings: &SweepTimings,
    tx: &SampleSender,
    cancel: &CancellationToken,
) -> JobOutcome {
    let mut emitted = 0usize;

    for volts in plan.voltages() {
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled { samples: emitted };
        }

        let step_start = Instant::now();
        if !station.set_voltage(volts).await {
            warn!(volts, "Voltage command not delivered");
        }
        if !wait_for(cancel, timings.settle).await {
            return JobOutcome::Cancelled { samples: emitted };
        }
        if !wait_until(cancel, step_start + plan.hold / 2).await {
            return JobOutcome::Cancelled { samples: emitted };
        }

        let current = match measure_with_retry(station, timings, cancel).await {
            Reading::Current(current) => current,
            Reading::Cancelled => return JobOutcome::Cancelled { samples: emitted },
            Reading::Failed(attempts) => {
                error!(volts, attempts, "Mid-step measurement failed, aborting sweep");
                return JobOutcome::Aborted {
                    samples: emitted,
                    reason: format!("no current reading at {volts} V after {attempts} attempts"),
                };
            }
        };

        if !emit(tx, Sample::new(Some(volts), Some(current))).await {
            return JobOutcome::Aborted {
                samples: emitted,
                reason: "sample channel closed".to_string(),
            };
        }
        emitted += 1;
        info!("Sweep step: V={} I={:e}", volts, current);

        if !wait_until(cancel, step_start + plan.hold).await {
            return JobOutcome::Cancelled { samples: emitted };
        }
    }

    info!(samples = emitted, "Sweep complete");
    JobOutcome::Completed { samples: emitted }
}

/// Run a sweep on its own task.
///
/// The station needs a voltage source; without one nothing is spawned.
pub fn spawn_sweep(
    station: Arc<MeasurementStation>,
    plan: SweepPlan,
    timings: SweepTimings,
    tx: SampleSender,
) -> AppResult<JobHandle> {
    if !station.has_source() {
        return Err(DaqError::InvalidArgument(
            "a sweep needs a voltage source".to_string(),
        ));
    }

    info!(
        start = plan.start,
        stop = plan.stop,
        step = plan.step,
        hold = ?plan.hold,
        "Starting step sweep"
    );
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    Ok(spawn_job("sweep", cancel, async move {
        run_sweep(&station, &plan, &timings, &tx, &token).await
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(start: f64, stop: f64, step: f64) -> AppResult<SweepPlan> {
        SweepPlan::new(start, stop, step, Duration::from_millis(10))
    }

    #[test]
    fn test_half_volt_steps() {
        assert_eq!(plan(0.0, 1.0, 0.5).unwrap().voltages(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_last_step_is_clamped_to_stop() {
        let voltages = plan(0.0, 1.0, 0.3).unwrap().voltages();
        assert_eq!(voltages.len(), 5);
        assert_eq!(voltages.last(), Some(&1.0));
        assert!(voltages.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_descending_sweep() {
        let voltages = plan(5.0, 2.0, -1.5).unwrap().voltages();
        assert_eq!(voltages, vec![5.0, 3.5, 2.0]);
    }

    #[test]
    fn test_rounding_does_not_add_a_step() {
        let voltages = plan(0.0, 0.3, 0.1).unwrap().voltages();
        assert_eq!(voltages.len(), 4);
        assert_eq!(voltages[3], 0.3);
    }

    #[test]
    fn test_single_point_sweep() {
        assert_eq!(plan(2.0, 2.0, 0.0).unwrap().voltages(), vec![2.0]);
        assert_eq!(plan(2.0, 2.0, -1.0).unwrap().voltages(), vec![2.0]);
    }

    #[test]
    fn test_invalid_plans_rejected() {
        assert!(matches!(plan(0.0, 1.0, -0.5), Err(DaqError::InvalidSweep(_))));
        assert!(matches!(plan(1.0, 0.0, 0.5), Err(DaqError::InvalidSweep(_))));
        assert!(matches!(plan(0.0, 1.0, 0.0), Err(DaqError::InvalidSweep(_))));
        assert!(matches!(plan(f64::NAN, 1.0, 0.1), Err(DaqError::InvalidSweep(_))));
        assert!(matches!(plan(0.0, 1000.0, 1e-6), Err(DaqError::InvalidSweep(_))));
    }

    #[test]
    fn test_timings_from_settings() {
        let timings = SweepTimings::default();
        assert_eq!(timings.settle, Duration::from_millis(50));
        assert_eq!(timings.max_attempts, 10);
        assert_eq!(timings.retry_backoff, Duration::from_millis(100));
    }
}
