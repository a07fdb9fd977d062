//! Hard limits applied before any actuation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ecosmart_core::config::SafetyConfig;
use ecosmart_core::{Device, RejectReason, TargetAction, UsagePattern};
use tokio::time::Instant;

pub struct SafetyPolicy {
    config: SafetyConfig,
    last_toggle: HashMap<String, Instant>,
}

impl SafetyPolicy {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            last_toggle: HashMap::new(),
        }
    }

    /// The device must exist, be controllable and not be critical.
    pub fn check_device(device: Option<&Device>) -> Result<&Device, RejectReason> {
        let device = device.ok_or(RejectReason::UnknownDevice)?;
        if !device.controllable {
            return Err(RejectReason::NotControllable);
        }
        if device.is_critical() {
            return Err(RejectReason::CriticalDevice);
        }
        Ok(device)
    }

    /// Climate devices stay on while the outdoor temperature is outside the
    /// comfort band. Unknown temperature passes.
    pub fn check_comfort(
        &self,
        device: &Device,
        target_on: bool,
        temperature_c: Option<f64>,
    ) -> Result<(), RejectReason> {
        let climate = device.hvac || device.pattern == UsagePattern::TemperatureDependent;
        match temperature_c {
            Some(t)
                if climate
                    && !target_on
                    && (t < self.config.min_temperature_c || t > self.config.max_temperature_c) =>
            {
                Err(RejectReason::ComfortBound)
            }
            _ => Ok(()),
        }
    }

    /// A deferral may not keep the device off longer than it tolerates.
    pub fn check_duty_cycle(
        device: &Device,
        action: &TargetAction,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        if let (Some(max_off), TargetAction::DeferUntil { resume_at, .. }) =
            (device.max_off_minutes, action)
        {
            if (*resume_at - now).num_minutes() > i64::from(max_off) {
                return Err(RejectReason::DutyCycle);
            }
        }
        Ok(())
    }

    /// Automated toggles of one device are spaced by the rest interval.
    pub fn check_rest(&self, device_id: &str, now: Instant) -> Result<(), RejectReason> {
        match self.last_toggle.get(device_id) {
            Some(last) if now.duration_since(*last) < self.config.min_toggle_interval() => {
                Err(RejectReason::RestInterval)
            }
            _ => Ok(()),
        }
    }

    pub fn record_toggle(&mut self, device_id: &str, at: Instant) {
        self.last_toggle.insert(device_id.to_string(), at);
    }
}
