//! Demand model and the 24-hour forecast built from one reading.

use chrono::{DateTime, DurationRound, FixedOffset, Utc};
use ecosmart_core::config::WeatherConfig;
use ecosmart_core::model::local_hour;
use ecosmart_core::{
    DemandForecast, ForecastPoint, Generation, WeatherSource, FORECAST_HORIZON_HOURS,
};
use serde::{Deserialize, Serialize};

use super::fetcher::{SimulatedWeather, WeatherReading};

const MAX_COOLING_W: f64 = 3500.0;
const MAX_HEATING_W: f64 = 2000.0;
/// Degrees past the comfort band at which demand saturates.
const DEMAND_RAMP_C: f64 = 10.0;
const HEATING_CAP: f64 = 0.8;

/// Cooling load, rising linearly above `threshold_c` and saturating.
pub fn cooling_demand_w(temperature_c: f64, threshold_c: f64) -> f64 {
    if temperature_c <= threshold_c {
        return 0.0;
    }
    MAX_COOLING_W * ((temperature_c - threshold_c) / DEMAND_RAMP_C).min(1.0)
}

/// Heating load, rising linearly below `threshold_c` and saturating.
pub fn heating_demand_w(temperature_c: f64, threshold_c: f64) -> f64 {
    if temperature_c >= threshold_c {
        return 0.0;
    }
    MAX_HEATING_W * ((threshold_c - temperature_c) / DEMAND_RAMP_C).min(HEATING_CAP)
}

/// Typical lighting draw for a local hour.
pub fn lighting_w(hour: u8) -> f64 {
    match hour {
        6..=18 => 0.0,
        19..=23 => 80.0,
        _ => 20.0,
    }
}

/// Typical entertainment draw for a local hour.
pub fn entertainment_w(hour: u8) -> f64 {
    if (18..=23).contains(&hour) {
        200.0
    } else {
        50.0
    }
}

/// Build the forecast for the 24 hours starting at the hour containing `now`.
#[allow(clippy::too_many_arguments)]
pub fn build_forecast(
    generation: Generation,
    reading: &WeatherReading,
    source: WeatherSource,
    stale: bool,
    now: DateTime<Utc>,
    base_demand_w: f64,
    config: &WeatherConfig,
    offset: FixedOffset,
) -> DemandForecast {
    let horizon_start = now
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or(now);
    let observed_hour = local_hour(reading.observed_at, offset);
    let daily_mean = reading.temperature_c - SimulatedWeather::diurnal_offset(observed_hour);

    let points = (0..FORECAST_HORIZON_HOURS as u32)
        .map(|offset_h| {
            let starts_at = horizon_start + chrono::Duration::hours(i64::from(offset_h));
            let hour = local_hour(starts_at, offset);
            let temperature_c = daily_mean + SimulatedWeather::diurnal_offset(hour);
            let cooling = cooling_demand_w(temperature_c, config.cooling_threshold_c);
            let heating = heating_demand_w(temperature_c, config.heating_threshold_c);
            ForecastPoint {
                offset: offset_h,
                hour,
                starts_at,
                temperature_c,
                humidity_pct: reading.humidity_pct,
                cooling_demand_w: cooling,
                heating_demand_w: heating,
                total_demand_w: base_demand_w
                    + cooling
                    + heating
                    + lighting_w(hour)
                    + entertainment_w(hour),
            }
        })
        .collect();

    DemandForecast {
        generation,
        generated_at: now,
        source,
        stale,
        points,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Cooling,
    Heating,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Suggested HVAC operation for the current reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HvacAdvice {
    pub mode: HvacMode,
    pub setpoint_c: Option<f64>,
    pub urgency: Urgency,
}

impl HvacAdvice {
    pub fn for_temperature(temperature_c: f64, config: &WeatherConfig) -> Self {
        if temperature_c > config.cooling_threshold_c {
            let (setpoint, urgency) = if temperature_c > 35.0 {
                (22.0, Urgency::High)
            } else if temperature_c > 30.0 {
                (24.0, Urgency::Medium)
            } else {
                (26.0, Urgency::Low)
            };
            Self {
                mode: HvacMode::Cooling,
                setpoint_c: Some(setpoint),
                urgency,
            }
        } else if temperature_c < config.heating_threshold_c {
            let urgency = if temperature_c < config.heating_threshold_c - 8.0 {
                Urgency::High
            } else if temperature_c < config.heating_threshold_c - 4.0 {
                Urgency::Medium
            } else {
                Urgency::Low
            };
            Self {
                mode: HvacMode::Heating,
                setpoint_c: Some(20.0),
                urgency,
            }
        } else {
            Self {
                mode: HvacMode::Idle,
                setpoint_c: None,
                urgency: Urgency::Low,
            }
        }
    }
}
