//! Supply session: energize a supply, watch its read-back, switch it off.
//!
//! Start: `*RST`, a short pause, voltage and current setpoints, output on.
//! Then the actual voltage and current are polled until the job is
//! cancelled or the collector goes away. Whatever ends the session, the
//! output is switched off before the job returns.

use super::poll::{run_poll, PollPlan};
use super::{spawn_job, wait_for, JobHandle, JobOutcome};
use crate::instrument::TdkPowerSupply;
use crate::measurement::SampleSender;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pause after `*RST` before the setpoints are sent.
pub const RESET_SETTLE: Duration = Duration::from_millis(200);

/// Setpoints applied when a session starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupplyTargets {
    /// Output voltage (V)
    pub voltage: f64,
    /// Current limit (A)
    pub current: f64,
}

/// What a session does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionPlan {
    /// Reset and energize with these setpoints; `None` only watches
    pub targets: Option<SupplyTargets>,
    /// Read-back interval
    pub interval: Duration,
}

async fn energize(supply: &TdkPowerSupply, targets: SupplyTargets, cancel: &CancellationToken) -> bool {
    info!(address = supply.address(), "Resetting supply before switching on");
    if !supply.reset().await {
        warn!(address = supply.address(), "Reset not delivered");
    }
    if !wait_for(cancel, RESET_SETTLE).await {
        return false;
    }

    let delivered = supply.set_voltage(targets.voltage).await
        && supply.set_current(targets.current).await
        && supply.set_output(true).await;
    if delivered {
        info!(address = supply.address(), "Supply initialised");
    } else {
        warn!(address = supply.address(), "Initial setup incomplete, watching anyway");
    }
    true
}

/// Run one session on `supply`, sending read-back samples to `tx`.
pub async fn run_supply_session(
    supply: &TdkPowerSupply,
    plan: &SessionPlan,
    tx: &SampleSender,
    cancel: &CancellationToken,
) -> JobOutcome {
    let energized = match plan.targets {
        Some(targets) => energize(supply, targets, cancel).await,
        None => true,
    };
    let outcome = if energized {
        run_poll(supply, PollPlan::continuous(plan.interval), tx, cancel).await
    } else {
        JobOutcome::Cancelled { samples: 0 }
    };

    if supply.set_output(false).await {
        info!(address = supply.address(), "Output switched off");
    } else {
        warn!(address = supply.address(), "Could not switch output off");
    }
    outcome
}

/// Run a supply session on its own task.
pub fn spawn_supply_session(
    supply: Arc<TdkPowerSupply>,
    plan: SessionPlan,
    tx: SampleSender,
) -> JobHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    info!(address = supply.address(), targets = ?plan.targets, "Starting supply session");
    spawn_job("supply session", cancel, async move {
        run_supply_session(&supply, &plan, &tx, &token).await
    })
}
