//! System configuration.
//!
//! Loaded once at startup from TOML, optionally overridden from the
//! environment, validated, and read-only afterwards. Every section has
//! defaults so an empty file yields the built-in household.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Device, HourRange, Priority, PricingSchedule, RunWindow, UsagePattern};

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "ECOSMART_CONFIG";
    pub const POLL_INTERVAL_SECS: &str = "ECOSMART_POLL_INTERVAL_SECS";
    pub const WEATHER_REFRESH_SECS: &str = "ECOSMART_WEATHER_REFRESH_SECS";
    pub const ANOMALY_THRESHOLD: &str = "ECOSMART_ANOMALY_THRESHOLD";
    pub const DEBOUNCE_MS: &str = "ECOSMART_DEBOUNCE_MS";
    pub const LOG_JSON: &str = "ECOSMART_LOG_JSON";
}

/// Default values.
pub mod defaults {
    pub const POLL_INTERVAL_SECS: u64 = 30;
    pub const WEATHER_REFRESH_SECS: u64 = 3600;
    pub const OPTIMIZER_FALLBACK_SECS: u64 = 300;
    pub const CONTROLLER_RECONCILE_SECS: u64 = 60;
    pub const ANOMALY_THRESHOLD: f64 = 0.20;
    pub const HIGH_SEVERITY_RATIO: f64 = 0.50;
    pub const BASELINE_WINDOW: usize = 10;
    pub const MIN_BASELINE_SAMPLES: usize = 3;
    pub const DEBOUNCE_MS: u64 = 2000;
    pub const DEGRADED_THRESHOLD: u32 = 3;
    pub const TICK_TIMEOUT_SECS: u64 = 20;
    pub const IO_TIMEOUT_SECS: u64 = 5;
    pub const COOLING_THRESHOLD_C: f64 = 24.0;
    pub const HEATING_THRESHOLD_C: f64 = 18.0;
    pub const BASE_DEMAND_W: f64 = 800.0;
    pub const MIN_TEMPERATURE_C: f64 = 16.0;
    pub const MAX_TEMPERATURE_C: f64 = 30.0;
    pub const MIN_TOGGLE_INTERVAL_SECS: u64 = 300;
    pub const CURTAIL_BELOW_W: f64 = 500.0;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub location: String,
    /// Offset of local time from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            location: "Casablanca".to_string(),
            utc_offset_minutes: 60,
        }
    }
}

impl SiteConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Consecutive tick failures before an agent is degraded.
    pub degraded_threshold: u32,
    pub tick_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: defaults::DEGRADED_THRESHOLD,
            tick_timeout_secs: defaults::TICK_TIMEOUT_SECS,
        }
    }
}

impl RuntimeConfig {
    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub anomaly_threshold: f64,
    pub high_severity_ratio: f64,
    pub baseline_window: usize,
    pub min_baseline_samples: usize,
    pub read_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::POLL_INTERVAL_SECS * 1000,
            anomaly_threshold: defaults::ANOMALY_THRESHOLD,
            high_severity_ratio: defaults::HIGH_SEVERITY_RATIO,
            baseline_window: defaults::BASELINE_WINDOW,
            min_baseline_samples: defaults::MIN_BASELINE_SAMPLES,
            read_timeout_ms: defaults::IO_TIMEOUT_SECS * 1000,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub refresh_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub cooling_threshold_c: f64,
    pub heating_threshold_c: f64,
    /// Used until consumption history is available.
    pub base_demand_w: f64,
    /// Average outdoor temperature of the simulated climate.
    pub simulated_base_temp_c: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: defaults::WEATHER_REFRESH_SECS * 1000,
            fetch_timeout_ms: defaults::IO_TIMEOUT_SECS * 1000,
            cooling_threshold_c: defaults::COOLING_THRESHOLD_C,
            heating_threshold_c: defaults::HEATING_THRESHOLD_C,
            base_demand_w: defaults::BASE_DEMAND_W,
            simulated_base_temp_c: 22.0,
        }
    }
}

impl WeatherConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Inputs arriving within this window coalesce into one recomputation.
    pub debounce_ms: u64,
    pub fallback_interval_ms: u64,
    /// Upper bound on the summed power of shifted loads in any hour.
    pub max_deferred_load_watts: Option<f64>,
    /// HVAC demand below this during peak hours is curtailed.
    pub curtail_below_w: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: defaults::DEBOUNCE_MS,
            fallback_interval_ms: defaults::OPTIMIZER_FALLBACK_SECS * 1000,
            max_deferred_load_watts: None,
            curtail_below_w: defaults::CURTAIL_BELOW_W,
        }
    }
}

impl OptimizerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub reconcile_interval_ms: u64,
    pub actuator_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: defaults::CONTROLLER_RECONCILE_SECS * 1000,
            actuator_timeout_ms: defaults::IO_TIMEOUT_SECS * 1000,
        }
    }
}

impl ControllerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn actuator_timeout(&self) -> Duration {
        Duration::from_millis(self.actuator_timeout_ms)
    }
}

/// Hard limits the controller enforces regardless of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Outside this band climate devices may not be switched off.
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    /// Minimum time between two automated toggles of one device.
    pub min_toggle_interval_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_temperature_c: defaults::MIN_TEMPERATURE_C,
            max_temperature_c: defaults::MAX_TEMPERATURE_C,
            min_toggle_interval_secs: defaults::MIN_TOGGLE_INTERVAL_SECS,
        }
    }
}

impl SafetyConfig {
    pub fn min_toggle_interval(&self) -> Duration {
        Duration::from_secs(self.min_toggle_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub site: SiteConfig,
    pub devices: Vec<Device>,
    pub pricing: PricingSchedule,
    pub runtime: RuntimeConfig,
    pub monitor: MonitorConfig,
    pub weather: WeatherConfig,
    pub optimizer: OptimizerConfig,
    pub controller: ControllerConfig,
    pub safety: SafetyConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            devices: default_devices(),
            pricing: PricingSchedule::moroccan_onee(),
            runtime: RuntimeConfig::default(),
            monitor: MonitorConfig::default(),
            weather: WeatherConfig::default(),
            optimizer: OptimizerConfig::default(),
            controller: ControllerConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

/// Built-in household.
pub fn default_devices() -> Vec<Device> {
    vec![
        Device::new(
            "living_room_ac",
            2000.0,
            Priority::High,
            true,
            UsagePattern::TemperatureDependent,
        )
        .with_name("Living Room AC")
        .with_room("living_room")
        .with_efficiency("A+")
        .with_hvac(),
        Device::new(
            "bedroom_ac",
            1500.0,
            Priority::High,
            true,
            UsagePattern::ScheduleBased,
        )
        .with_name("Bedroom AC")
        .with_room("bedroom")
        .with_efficiency("A")
        .with_hvac(),
        Device::new(
            "led_lights",
            80.0,
            Priority::Medium,
            true,
            UsagePattern::ScheduleBased,
        )
        .with_name("LED Lighting")
        .with_room("all")
        .with_efficiency("A++")
        .with_run_window(RunWindow::at_hour(18, 300)),
        Device::new(
            "refrigerator",
            150.0,
            Priority::Critical,
            false,
            UsagePattern::Constant,
        )
        .with_name("Refrigerator")
        .with_room("kitchen")
        .with_efficiency("A++")
        .with_max_off_minutes(30)
        .with_state(true),
        Device::new(
            "washing_machine",
            800.0,
            Priority::Low,
            true,
            UsagePattern::Manual,
        )
        .with_name("Washing Machine")
        .with_room("utility")
        .with_efficiency("A+")
        .with_run_window(RunWindow::at_hour(18, 90))
        .with_cycle_minutes(90)
        .with_max_off_minutes(12 * 60),
        Device::new(
            "tv_entertainment",
            200.0,
            Priority::Low,
            true,
            UsagePattern::EveningPeak,
        )
        .with_name("TV & Entertainment")
        .with_room("living_room")
        .with_efficiency("A")
        .with_allowed_window(HourRange::new(17, 24)),
    ]
}

impl SystemConfig {
    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `ECOSMART_CONFIG` if set, otherwise use defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(env_vars::CONFIG_PATH) {
            Ok(path) => Self::load(path),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = env_parse::<u64>(env_vars::POLL_INTERVAL_SECS)? {
            self.monitor.poll_interval_ms = secs * 1000;
        }
        if let Some(secs) = env_parse::<u64>(env_vars::WEATHER_REFRESH_SECS)? {
            self.weather.refresh_interval_ms = secs * 1000;
        }
        if let Some(threshold) = env_parse::<f64>(env_vars::ANOMALY_THRESHOLD)? {
            self.monitor.anomaly_threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>(env_vars::DEBOUNCE_MS)? {
            self.optimizer.debounce_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !ids.insert(device.id.as_str()) {
                return Err(Error::config(format!("duplicate device id {}", device.id)));
            }
        }
        self.pricing.validate()?;

        if FixedOffset::east_opt(self.site.utc_offset_minutes * 60).is_none() {
            return Err(Error::config("utc offset out of range"));
        }
        if self.runtime.degraded_threshold == 0 {
            return Err(Error::config("degraded threshold must be at least 1"));
        }
        let threshold = self.monitor.anomaly_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::config("anomaly threshold must be in (0, 1]"));
        }
        if self.monitor.baseline_window == 0
            || self.monitor.min_baseline_samples == 0
            || self.monitor.min_baseline_samples > self.monitor.baseline_window
        {
            return Err(Error::config("invalid baseline window"));
        }
        for (name, value) in [
            ("monitor.poll_interval_ms", self.monitor.poll_interval_ms),
            ("monitor.read_timeout_ms", self.monitor.read_timeout_ms),
            ("weather.refresh_interval_ms", self.weather.refresh_interval_ms),
            ("weather.fetch_timeout_ms", self.weather.fetch_timeout_ms),
            ("optimizer.fallback_interval_ms", self.optimizer.fallback_interval_ms),
            ("controller.reconcile_interval_ms", self.controller.reconcile_interval_ms),
            ("controller.actuator_timeout_ms", self.controller.actuator_timeout_ms),
            ("runtime.tick_timeout_secs", self.runtime.tick_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be positive")));
            }
        }
        if self.weather.heating_threshold_c >= self.weather.cooling_threshold_c {
            return Err(Error::config("heating threshold must be below cooling threshold"));
        }
        if self.safety.min_temperature_c >= self.safety.max_temperature_c {
            return Err(Error::config("invalid safety temperature range"));
        }
        if let Some(cap) = self.optimizer.max_deferred_load_watts {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(Error::config("max deferred load must be positive"));
            }
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
