//! Background measurement jobs.
//!
//! A job is a spawned task plus a [`CancellationToken`]. Every wait inside a
//! job goes through [`wait_for`] or [`wait_until`], which return as soon as
//! the token fires, so a cancelled job exits at its next wait boundary. A
//! read that is already on the wire still runs to its transport timeout.

pub mod poll;
pub mod session;
pub mod sweep;

use crate::error::{AppResult, DaqError};
use crate::measurement::{Sample, SampleSender};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use poll::{spawn_poll, PollPlan};
pub use session::{spawn_supply_session, SessionPlan, SupplyTargets};
pub use sweep::{spawn_sweep, SweepPlan, SweepTimings};

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Ran to the end of its plan
    Completed {
        /// Samples emitted
        samples: usize,
    },
    /// Stopped by its cancellation token
    Cancelled {
        /// Samples emitted before the stop
        samples: usize,
    },
    /// Gave up on a fault
    Aborted {
        /// Samples emitted before the fault
        samples: usize,
        /// What went wrong
        reason: String,
    },
}

impl JobOutcome {
    /// Samples the job emitted.
    pub fn samples(&self) -> usize {
        match self {
            Self::Completed { samples }
            | Self::Cancelled { samples }
            | Self::Aborted { samples, .. } => *samples,
        }
    }
}

/// Handle to a running job.
#[derive(Debug)]
pub struct JobHandle {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Job name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone of the job's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the job to stop at its next wait boundary.
    pub fn cancel(&self) {
        info!(job = %self.name, "Stop requested");
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to end.
    pub async fn join(self) -> AppResult<JobOutcome> {
        let outcome = self
            .task
            .await
            .map_err(|e| DaqError::TaskJoin(format!("{}: {e}", self.name)))?;
        debug!(job = %self.name, ?outcome, "Job finished");
        Ok(outcome)
    }

    /// Cancel and wait for the job to end.
    pub async fn stop(self) -> AppResult<JobOutcome> {
        self.cancel();
        self.join().await
    }
}

/// Spawn `job` as a named task observing `cancel`.
pub(crate) fn spawn_job<F>(name: impl Into<String>, cancel: CancellationToken, job: F) -> JobHandle
where
    F: Future<Output = JobOutcome> + Send + 'static,
{
    let name = name.into();
    info!(job = %name, "Job started");
    JobHandle {
        name,
        cancel,
        task: tokio::spawn(job),
    }
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `false` when the token fired (immediately if it already had).
pub async fn wait_for(cancel: &CancellationToken, duration: Duration) -> bool {
    wait_until(cancel, Instant::now() + duration).await
}

/// Sleep until `deadline` unless cancelled first.
///
/// A deadline in the past returns `true` at once, unless the token fired.
pub async fn wait_until(cancel: &CancellationToken, deadline: Instant) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

/// Send a sample to the collector. `false` means the collector is gone.
pub(crate) async fn emit(tx: &SampleSender, sample: Sample) -> bool {
    tx.send(sample).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_early_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        assert!(!wait_for(&cancel, Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_after_cancel_is_immediate() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_for(&cancel, Duration::ZERO).await);
        assert!(!wait_until(&cancel, Instant::now()).await);
    }

    #[tokio::test]
    async fn test_wait_completes() {
        let cancel = CancellationToken::new();
        assert!(wait_for(&cancel, Duration::from_millis(1)).await);
        assert!(wait_until(&cancel, Instant::now() - Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_job_stop_reports_outcome() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let job = spawn_job("idle", cancel, async move {
            if wait_for(&token, Duration::from_secs(30)).await {
                JobOutcome::Completed { samples: 0 }
            } else {
                JobOutcome::Cancelled { samples: 0 }
            }
        });

        assert_eq!(job.name(), "idle");
        assert_eq!(job.stop().await.unwrap(), JobOutcome::Cancelled { samples: 0 });
    }
}
