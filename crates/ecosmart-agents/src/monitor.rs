//! Monitor agent.
//!
//! Each tick reads every monitored device concurrently, publishes one
//! [`ConsumptionSample`] per successful read and an [`Anomaly`] whenever a
//! reading deviates from the device's trailing mean by more than the
//! configured threshold. All samples of one tick share a generation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecosmart_core::config::MonitorConfig;
use ecosmart_core::{
    Anomaly, AnomalySeverity, ConsumptionSample, Device, EcoEvent, Error, Generation,
    GenerationCounter,
};
use ecosmart_devices::{with_timeout, DeviceMeter, RegistryView};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Result;
use crate::runtime::{Agent, AgentContext};

/// `|observed - baseline| / baseline`, or `None` without a positive baseline.
pub fn variance_ratio(observed: f64, baseline: f64) -> Option<f64> {
    if baseline <= 0.0 || !baseline.is_finite() {
        return None;
    }
    Some((observed - baseline).abs() / baseline)
}

/// Ratios within this of the threshold count as equal to it.
const RATIO_EPSILON: f64 = 1e-9;

/// Strictly greater than `threshold`; a ratio equal to it is normal.
pub fn is_anomalous(observed: f64, baseline: f64, threshold: f64) -> bool {
    variance_ratio(observed, baseline).is_some_and(|ratio| ratio - threshold > RATIO_EPSILON)
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub ticks: u64,
    pub readings: u64,
    pub read_failures: u64,
    pub anomalies: u64,
    pub last_reading: Option<DateTime<Utc>>,
}

/// Household draw from the latest batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumptionSummary {
    pub generation: Generation,
    pub total_watts: f64,
    pub active_devices: usize,
    pub devices: usize,
}

#[derive(Default)]
struct Shared {
    stats: MonitorStats,
    latest: Vec<ConsumptionSample>,
}

/// Read access to the monitor's counters and latest batch.
#[derive(Clone)]
pub struct MonitorView {
    shared: Arc<RwLock<Shared>>,
}

impl MonitorView {
    pub fn stats(&self) -> MonitorStats {
        self.shared.read().stats.clone()
    }

    pub fn latest_samples(&self) -> Vec<ConsumptionSample> {
        self.shared.read().latest.clone()
    }

    pub fn consumption_summary(&self) -> ConsumptionSummary {
        let shared = self.shared.read();
        ConsumptionSummary {
            generation: shared
                .latest
                .first()
                .map(|s| s.generation)
                .unwrap_or_default(),
            total_watts: shared.latest.iter().map(|s| s.watts).sum(),
            active_devices: shared.latest.iter().filter(|s| s.is_on).count(),
            devices: shared.latest.len(),
        }
    }
}

pub struct MonitorAgent {
    config: MonitorConfig,
    registry: RegistryView,
    meter: Arc<dyn DeviceMeter>,
    history: HashMap<String, VecDeque<f64>>,
    generations: GenerationCounter,
    shared: Arc<RwLock<Shared>>,
}

impl MonitorAgent {
    pub fn new(config: MonitorConfig, registry: RegistryView, meter: Arc<dyn DeviceMeter>) -> Self {
        Self {
            config,
            registry,
            meter,
            history: HashMap::new(),
            generations: GenerationCounter::new(),
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }

    pub fn view(&self) -> MonitorView {
        MonitorView {
            shared: self.shared.clone(),
        }
    }

    /// Mean of the trailing window, once enough history exists.
    fn baseline(&self, device_id: &str) -> Option<f64> {
        let history = self.history.get(device_id)?;
        if history.len() < self.config.min_baseline_samples {
            return None;
        }
        Some(history.iter().sum::<f64>() / history.len() as f64)
    }

    fn remember(&mut self, device_id: &str, watts: f64) {
        let window = self.config.baseline_window;
        let history = self.history.entry(device_id.to_string()).or_default();
        history.push_back(watts);
        while history.len() > window {
            history.pop_front();
        }
    }

    fn severity(&self, ratio: f64) -> AnomalySeverity {
        if ratio - self.config.high_severity_ratio > RATIO_EPSILON {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        }
    }

    async fn read_all(&self, devices: &[Device]) -> Vec<ecosmart_core::Result<f64>> {
        let limit = self.config.read_timeout();
        join_all(
            devices
                .iter()
                .map(|device| read_one(self.meter.clone(), device, limit)),
        )
        .await
    }
}

async fn read_one(
    meter: Arc<dyn DeviceMeter>,
    device: &Device,
    limit: Duration,
) -> ecosmart_core::Result<f64> {
    let what = format!("meter read for {}", device.id);
    let watts = with_timeout(limit, &what, meter.read_watts(device)).await?;
    if !watts.is_finite() || watts < 0.0 {
        return Err(Error::device(format!(
            "meter for {} returned {watts}",
            device.id
        )));
    }
    Ok(watts)
}

#[async_trait]
impl Agent for MonitorAgent {
    fn name(&self) -> &str {
        "monitor"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.poll_interval())
    }

    async fn tick(&mut self, ctx: &AgentContext) -> Result<()> {
        let devices = self.registry.select(Device::is_monitored);
        if devices.is_empty() {
            return Ok(());
        }

        let results = self.read_all(&devices).await;
        let generation = self.generations.next();
        let timestamp = ctx.now();
        let mut batch = Vec::with_capacity(devices.len());
        let mut failures = 0u64;
        let mut anomalies = 0u64;

        for (device, result) in devices.iter().zip(results) {
            let watts = match result {
                Ok(watts) => watts,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(device_id = %device.id, error = %e, "device read failed");
                    continue;
                }
            };

            let baseline = self.baseline(&device.id);
            let sample = ConsumptionSample {
                generation,
                device_id: device.id.clone(),
                timestamp,
                watts,
                baseline,
                is_on: device.is_on,
            };
            ctx.publish(EcoEvent::ConsumptionSample(sample.clone()))?;

            if let Some(baseline) = baseline {
                if is_anomalous(watts, baseline, self.config.anomaly_threshold) {
                    let ratio = variance_ratio(watts, baseline).unwrap_or_default();
                    let anomaly = Anomaly {
                        generation,
                        device_id: device.id.clone(),
                        timestamp,
                        observed_watts: watts,
                        baseline_watts: baseline,
                        variance_ratio: ratio,
                        severity: self.severity(ratio),
                    };
                    tracing::warn!(
                        device_id = %device.id,
                        watts,
                        baseline,
                        ratio,
                        "consumption anomaly"
                    );
                    ctx.publish(EcoEvent::Anomaly(anomaly))?;
                    anomalies += 1;
                }
            }

            self.remember(&device.id, watts);
            batch.push(sample);
        }

        let read = batch.len() as u64;
        {
            let mut shared = self.shared.write();
            shared.stats.ticks += 1;
            shared.stats.readings += read;
            shared.stats.read_failures += failures;
            shared.stats.anomalies += anomalies;
            if read > 0 {
                shared.stats.last_reading = Some(timestamp);
                shared.latest = batch;
            }
        }

        if read == 0 {
            return Err(Error::device(format!("all {} device reads failed", devices.len())).into());
        }
        tracing::debug!(generation = %generation, read, failures, "consumption batch published");
        Ok(())
    }
}
