//! Measurement station: a current meter, optionally paired with the supply
//! that biases the device under test.
//!
//! All reads go through the station's measurement lock, so a manual single
//! measurement and a running poll or sweep never overlap on the meter.

use super::Sample;
use crate::instrument::{CurrentMeter, TdkPowerSupply, VoltageSource};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Something a poll can take one sample from.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Take one sample. Missing readings are left empty, never raised.
    async fn sample(&self) -> Sample;
}

/// Current meter plus optional voltage source behind one measurement lock.
pub struct MeasurementStation {
    meter: Arc<dyn CurrentMeter>,
    source: Option<Arc<dyn VoltageSource>>,
    measure_lock: Mutex<()>,
}

impl MeasurementStation {
    /// Station reading currents from `meter`.
    pub fn new(meter: Arc<dyn CurrentMeter>) -> Self {
        Self {
            meter,
            source: None,
            measure_lock: Mutex::new(()),
        }
    }

    /// Attach the supply whose voltage is stepped and read back.
    pub fn with_source(mut self, source: Arc<dyn VoltageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether a voltage source is attached.
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Command the attached source. Returns `false` without a source.
    pub async fn set_voltage(&self, volts: f64) -> bool {
        match &self.source {
            Some(source) => source.set_voltage(volts).await,
            None => {
                warn!("No voltage source attached");
                false
            }
        }
    }

    /// Read back the source voltage, if a source is attached.
    pub async fn read_voltage(&self) -> Option<f64> {
        let source = self.source.as_ref()?;
        let _guard = self.measure_lock.lock().await;
        source.read_voltage().await
    }

    /// One current reading under the measurement lock.
    pub async fn measure_current(&self) -> Option<f64> {
        let _guard = self.measure_lock.lock().await;
        self.meter.read_current().await
    }

    /// Single measurement: meter current plus source read-back voltage.
    pub async fn measure_once(&self) -> Sample {
        let _guard = self.measure_lock.lock().await;
        let current = self.meter.read_current().await;
        let voltage = match &self.source {
            Some(source) => source.read_voltage().await,
            None => None,
        };
        debug!(?voltage, ?current, "Measurement taken");
        Sample::new(voltage, current)
    }
}

#[async_trait]
impl Probe for MeasurementStation {
    async fn sample(&self) -> Sample {
        self.measure_once().await
    }
}

/// Supply read-back: actual output voltage and current.
#[async_trait]
impl Probe for TdkPowerSupply {
    async fn sample(&self) -> Sample {
        let voltage = self.get_actual_voltage().await;
        let current = self.get_actual_current().await;
        Sample::new(voltage, current)
    }
}

impl std::fmt::Debug for MeasurementStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementStation")
            .field("has_source", &self.has_source())
            .finish()
    }
}
