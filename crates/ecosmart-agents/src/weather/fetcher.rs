//! Weather inputs: the fetch adapter and the built-in simulator.

use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use ecosmart_core::model::local_hour;
use ecosmart_core::Result;
use serde::{Deserialize, Serialize};

/// One observation returned by a [`WeatherFetcher`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    /// 0..1
    pub solar_potential: f64,
}

/// Source of live weather. Callers bound every fetch with a timeout.
#[async_trait]
pub trait WeatherFetcher: Send + Sync {
    async fn fetch(&self) -> Result<WeatherReading>;
}

/// Deterministic diurnal + seasonal weather model.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWeather {
    base_temp_c: f64,
    offset: FixedOffset,
}

impl SimulatedWeather {
    pub fn new(base_temp_c: f64, offset: FixedOffset) -> Self {
        Self {
            base_temp_c,
            offset,
        }
    }

    /// Temperature swing around the daily mean for a local hour.
    pub fn diurnal_offset(hour: u8) -> f64 {
        let h = f64::from(hour);
        if (6..=18).contains(&hour) {
            8.0 * ((h - 6.0) * PI / 12.0).sin()
        } else {
            -3.0 + 2.0 * ((h - 18.0) * PI / 12.0).sin()
        }
    }

    fn seasonal_offset(day_of_year: u32) -> f64 {
        8.0 * ((f64::from(day_of_year) - 80.0) * 2.0 * PI / 365.0).sin()
    }

    pub fn reading_at(&self, at: DateTime<Utc>) -> WeatherReading {
        let hour = local_hour(at, self.offset);
        let day_of_year = at.with_timezone(&self.offset).ordinal();
        let h = f64::from(hour);

        let temperature_c =
            self.base_temp_c + Self::diurnal_offset(hour) + Self::seasonal_offset(day_of_year);
        let humidity_pct = (60.0 + 20.0 * (h * PI / 12.0).sin()).clamp(30.0, 80.0);
        let solar_potential = if (6..=18).contains(&hour) {
            ((h - 6.0) * PI / 12.0).sin().max(0.0)
        } else {
            0.0
        };

        WeatherReading {
            observed_at: at,
            temperature_c,
            humidity_pct,
            solar_potential,
        }
    }
}

#[async_trait]
impl WeatherFetcher for SimulatedWeather {
    async fn fetch(&self) -> Result<WeatherReading> {
        Ok(self.reading_at(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, TimeZone};

    #[test]
    fn test_simulation_is_deterministic() {
        let sim = SimulatedWeather::new(22.0, Utc.fix());
        let at = Utc.with_ymd_and_hms(2024, 7, 15, 14, 0, 0).unwrap();
        assert_eq!(sim.reading_at(at), sim.reading_at(at));
    }

    #[test]
    fn test_afternoon_is_warmer_than_night() {
        let sim = SimulatedWeather::new(22.0, Utc.fix());
        let noon = sim.reading_at(Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap());
        let night = sim.reading_at(Utc.with_ymd_and_hms(2024, 7, 15, 2, 0, 0).unwrap());
        assert!(noon.temperature_c > night.temperature_c);
        assert!(noon.solar_potential > 0.99);
        assert_eq!(night.solar_potential, 0.0);
        assert!((30.0..=80.0).contains(&night.humidity_pct));
    }

    #[test]
    fn test_summer_is_warmer_than_winter() {
        let sim = SimulatedWeather::new(22.0, Utc.fix());
        let july = sim.reading_at(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap());
        let january = sim.reading_at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert!(july.temperature_c > january.temperature_c + 10.0);
    }
}
