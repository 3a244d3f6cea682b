//! Shared instrument bus.
//!
//! A [`BusManager`] owns one physical transport and the bus-wide lock that
//! serializes every transaction on it. Several logical instruments at
//! different multidrop addresses borrow the same manager; the transport is
//! closed when the last of them lets go.

use crate::config::{BusSettings, Settings};
use crate::error::{AppResult, DaqError};
use crate::instrument::tdk_lambda::TdkPowerSupply;
use crate::transport::{self, ConnectionDescriptor, Transport};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Fixed delays of the address-select protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusTimings {
    /// Pause after `INSTrument:NSELect` so the supply can switch context
    pub select_settle: Duration,
    /// Wait before the first look for a reply
    pub response_wait: Duration,
    /// Second wait when nothing had arrived yet
    pub response_retry: Duration,
    /// Pause after a command that has no reply
    pub write_settle: Duration,
    /// Upper bound for reading one reply line
    pub read_timeout: Duration,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self::from(&BusSettings::default())
    }
}

impl From<&BusSettings> for BusTimings {
    fn from(settings: &BusSettings) -> Self {
        Self {
            select_settle: Duration::from_millis(settings.select_settle_ms),
            response_wait: Duration::from_millis(settings.response_wait_ms),
            response_retry: Duration::from_millis(settings.response_retry_ms),
            write_settle: Duration::from_millis(settings.write_settle_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
        }
    }
}

struct BusInner {
    label: String,
    transport: Mutex<Box<dyn Transport>>,
    timings: BusTimings,
    leases: AtomicUsize,
    /// Bound on waiting for `transport`, in ms; 0 means unbounded
    lock_timeout_ms: AtomicU64,
}

/// Owner of one physical transport and its serialization token.
///
/// Cloning is cheap; all clones share the same lock, lease count and lock
/// timeout.
#[derive(Clone)]
pub struct BusManager {
    inner: Arc<BusInner>,
}

impl BusManager {
    /// Wrap an already opened transport.
    pub fn new(transport: Box<dyn Transport>, timings: BusTimings) -> Self {
        let label = transport.descriptor().to_string();
        Self {
            inner: Arc::new(BusInner {
                label,
                transport: Mutex::new(transport),
                timings,
                leases: AtomicUsize::new(0),
                lock_timeout_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Give up waiting for the bus lock after `timeout`.
    ///
    /// Without this the wait is unbounded: a stalled transaction blocks
    /// every other user of the bus until it finishes.
    pub fn with_lock_timeout(self, timeout: Duration) -> Self {
        self.set_lock_timeout(Some(timeout));
        self
    }

    /// Bound (or unbound, with `None`) lock waits through every clone of
    /// this bus. Millisecond resolution, at least 1 ms.
    pub fn set_lock_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1));
        self.inner.lock_timeout_ms.store(ms, Ordering::SeqCst);
    }

    /// Current bound on lock waits.
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.inner.lock_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Open the transport `descriptor` names, using the configured timings.
    pub async fn open(descriptor: &ConnectionDescriptor, settings: &Settings) -> AppResult<Self> {
        let transport = transport::open(descriptor, &settings.transport).await?;
        info!(bus = %descriptor, "Bus opened");

        let bus = Self::new(transport, BusTimings::from(&settings.bus));
        Ok(match settings.bus.lock_timeout_ms {
            Some(ms) => bus.with_lock_timeout(Duration::from_millis(ms)),
            None => bus,
        })
    }

    /// Connection descriptor of the underlying transport, as text.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Protocol delays for this bus.
    pub fn timings(&self) -> &BusTimings {
        &self.inner.timings
    }

    /// Take the bus-wide lock.
    ///
    /// The returned guard is the only way to reach the transport; the bus is
    /// free again when it drops.
    pub async fn lock(&self) -> AppResult<MutexGuard<'_, Box<dyn Transport>>> {
        match self.lock_timeout() {
            None => Ok(self.inner.transport.lock().await),
            Some(limit) => tokio::time::timeout(limit, self.inner.transport.lock())
                .await
                .map_err(|_| {
                    warn!(bus = %self.inner.label, waited = ?limit, "Bus lock not acquired in time");
                    DaqError::BusLockTimeout {
                        bus: self.inner.label.clone(),
                        waited: limit,
                    }
                }),
        }
    }

    /// Proxy for the power supply at `address` on this bus.
    pub fn power_supply(&self, address: u8) -> TdkPowerSupply {
        self.acquire_lease();
        TdkPowerSupply::new(address, self.clone())
    }

    /// Register one more user of the transport.
    pub fn acquire_lease(&self) {
        let count = self.inner.leases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(bus = %self.inner.label, leases = count, "Bus lease acquired");
    }

    /// Drop one lease, closing the transport when it was the last.
    pub async fn release(&self) -> AppResult<()> {
        let previous = self
            .inner
            .leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                let mut transport = self.inner.transport.lock().await;
                transport.close().await?;
                info!(bus = %self.inner.label, "Last lease released, bus closed");
            }
            Ok(n) => debug!(bus = %self.inner.label, leases = n - 1, "Bus lease released"),
            Err(_) => warn!(bus = %self.inner.label, "Release without a lease ignored"),
        }
        Ok(())
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.inner.leases.load(Ordering::SeqCst)
    }

    /// Whether the underlying transport is still open.
    pub async fn is_open(&self) -> bool {
        self.inner.transport.lock().await.is_open()
    }
}

impl std::fmt::Debug for BusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusManager")
            .field("label", &self.inner.label)
            .field("leases", &self.lease_count())
            .field("lock_timeout", &self.lock_timeout())
            .finish()
    }
}
