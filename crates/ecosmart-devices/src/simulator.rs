//! Simulated household.
//!
//! Generates plausible per-device power readings from each device's usage
//! pattern and current registry state, and records actuator commands.
//! Seeded, so runs are reproducible. Faults can be injected per device for
//! testing the error paths of the agents.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecosmart_core::{Device, Error, Result, UsagePattern};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::adapter::{DeviceActuator, DeviceMeter};
use crate::registry::RegistryView;

/// Fraction of rated power drawn in standby.
const STANDBY_FACTOR: f64 = 0.01;
/// Relative noise applied to every reading.
const NOISE: f64 = 0.05;

/// Injected failure mode for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reads return an error.
    ReadError,
    /// Reads never complete.
    Hang,
    /// Actuation returns an error.
    ActuatorError,
}

/// An actuator call the simulator accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorCommand {
    pub device_id: String,
    pub on: bool,
    pub at: DateTime<Utc>,
}

/// Simulated meters and actuators for every registered device.
pub struct SimulatedHousehold {
    view: RegistryView,
    rng: Mutex<StdRng>,
    faults: Mutex<HashMap<String, Fault>>,
    fixed_readings: Mutex<HashMap<String, f64>>,
    commands: Mutex<Vec<ActuatorCommand>>,
}

impl SimulatedHousehold {
    pub fn new(view: RegistryView, seed: u64) -> Self {
        Self {
            view,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            faults: Mutex::new(HashMap::new()),
            fixed_readings: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Inject a fault for `device_id`.
    pub fn inject_fault(&self, device_id: impl Into<String>, fault: Fault) {
        self.faults.lock().insert(device_id.into(), fault);
    }

    pub fn clear_fault(&self, device_id: &str) {
        self.faults.lock().remove(device_id);
    }

    /// Force the next readings of `device_id` to `watts` until cleared.
    pub fn set_reading(&self, device_id: impl Into<String>, watts: f64) {
        self.fixed_readings.lock().insert(device_id.into(), watts);
    }

    pub fn clear_reading(&self, device_id: &str) {
        self.fixed_readings.lock().remove(device_id);
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands.lock().clone()
    }

    fn fault_for(&self, device_id: &str) -> Option<Fault> {
        self.faults.lock().get(device_id).copied()
    }

    /// Typical share of rated power while running.
    fn load_factor(pattern: UsagePattern) -> f64 {
        match pattern {
            UsagePattern::TemperatureDependent => 0.85,
            UsagePattern::ScheduleBased => 0.9,
            // Compressor duty cycle averaged over the polling interval.
            UsagePattern::Constant => 0.8,
            UsagePattern::Manual => 1.0,
            UsagePattern::EveningPeak => 0.75,
        }
    }

    fn simulate(&self, device: &Device) -> f64 {
        let is_on = self.view.is_on(&device.id).unwrap_or(device.is_on);
        let nominal = if is_on {
            device.power_watts * Self::load_factor(device.pattern)
        } else {
            device.power_watts * STANDBY_FACTOR
        };
        let noise = self.rng.lock().gen_range(-NOISE..=NOISE);
        (nominal * (1.0 + noise)).max(0.0)
    }
}

#[async_trait]
impl DeviceMeter for SimulatedHousehold {
    async fn read_watts(&self, device: &Device) -> Result<f64> {
        match self.fault_for(&device.id) {
            Some(Fault::ReadError) => {
                return Err(Error::device(format!("meter for {} unavailable", device.id)))
            }
            Some(Fault::Hang) => std::future::pending::<()>().await,
            _ => {}
        }
        if let Some(watts) = self.fixed_readings.lock().get(&device.id).copied() {
            return Ok(watts);
        }
        Ok(self.simulate(device))
    }
}

#[async_trait]
impl DeviceActuator for SimulatedHousehold {
    async fn set_power(&self, device: &Device, on: bool) -> Result<()> {
        if self.fault_for(&device.id) == Some(Fault::ActuatorError) {
            return Err(Error::device(format!("actuator for {} rejected command", device.id)));
        }
        self.commands.lock().push(ActuatorCommand {
            device_id: device.id.clone(),
            on,
            at: Utc::now(),
        });
        tracing::debug!(device_id = %device.id, on, "simulated actuation");
        Ok(())
    }
}
