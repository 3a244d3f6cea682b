//! Fixed-interval polling.

use super::{emit, spawn_job, wait_for, JobHandle, JobOutcome};
use crate::config::PollSettings;
use crate::measurement::{Probe, SampleSender};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often and how many times to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPlan {
    /// Number of samples; `None` polls until cancelled
    pub count: Option<u32>,
    /// Pause after each sample
    pub interval: Duration,
}

impl PollPlan {
    /// Take `count` samples, `interval` apart.
    pub fn new(count: u32, interval: Duration) -> Self {
        Self {
            count: Some(count),
            interval,
        }
    }

    /// Poll until cancelled (continuous supply read-back).
    pub fn continuous(interval: Duration) -> Self {
        Self {
            count: None,
            interval,
        }
    }
}

impl From<&PollSettings> for PollPlan {
    fn from(settings: &PollSettings) -> Self {
        Self::new(settings.count, settings.interval())
    }
}

/// Poll `probe` according to `plan`, sending each sample to `tx`.
///
/// A sample with no values is still emitted; the poll keeps going.
pub async fn run_poll(
    probe: &dyn Probe,
    plan: PollPlan,
    tx: &SampleSender,
    cancel: &CancellationToken,
) -> JobOutcome {
    let mut emitted = 0usize;
    let mut iteration = 0u32;

    loop {
        if plan.count.is_some_and(|count| iteration >= count) {
            return JobOutcome::Completed { samples: emitted };
        }
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled { samples: emitted };
        }

        let sample = probe.sample().await;
        if sample.is_empty() {
            warn!(iteration, "Poll returned no readings");
        } else {
            debug!(iteration, voltage = ?sample.voltage, current = ?sample.current, "Poll sample");
        }
        if !emit(tx, sample).await {
            return JobOutcome::Aborted {
                samples: emitted,
                reason: "sample channel closed".to_string(),
            };
        }
        emitted += 1;
        iteration = iteration.saturating_add(1);

        let last = plan.count.is_some_and(|count| iteration >= count);
        if !last && !wait_for(cancel, plan.interval).await {
            return JobOutcome::Cancelled { samples: emitted };
        }
    }
}

/// Run a poll on its own task.
pub fn spawn_poll(probe: Arc<dyn Probe>, plan: PollPlan, tx: SampleSender) -> JobHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    match plan.count {
        Some(count) => info!(count, interval = ?plan.interval, "Starting poll"),
        None => info!(interval = ?plan.interval, "Starting continuous poll"),
    }
    spawn_job("poll", cancel, async move {
        run_poll(probe.as_ref(), plan, &tx, &token).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{sample_channel, Sample};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingProbe {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn sample(&self) -> Sample {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                // One failed read in the middle
                Sample::new(None, None)
            } else {
                Sample::new(Some(f64::from(n)), Some(1e-9))
            }
        }
    }

    #[tokio::test]
    async fn test_poll_takes_count_samples_and_survives_failures() {
        let probe = Arc::new(CountingProbe::default());
        let (tx, mut rx) = sample_channel(16);

        let job = spawn_poll(probe.clone(), PollPlan::new(3, Duration::from_millis(1)), tx);
        assert_eq!(job.join().await.unwrap(), JobOutcome::Completed { samples: 3 });

        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        assert_eq!(samples.len(), 3);
        assert!(samples[1].is_empty());
        assert_eq!(samples[2].voltage, Some(2.0));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_continuous_poll_stops_promptly() {
        let probe = Arc::new(CountingProbe::default());
        let (tx, _rx) = sample_channel(1024);

        let job = spawn_poll(probe, PollPlan::continuous(Duration::from_secs(5)), tx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let outcome = job.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(outcome, JobOutcome::Cancelled { samples: 1 }));
    }

    #[tokio::test]
    async fn test_poll_ends_when_collector_is_gone() {
        let (tx, rx) = sample_channel(1);
        drop(rx);

        let outcome = run_poll(
            &CountingProbe::default(),
            PollPlan::continuous(Duration::from_millis(1)),
            &tx,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, JobOutcome::Aborted { samples: 0, .. }));
    }
}
