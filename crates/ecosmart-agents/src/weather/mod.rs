//! Weather agent.
//!
//! Refreshes the outdoor reading once per interval and republishes a
//! [`WeatherSnapshot`] plus a 24-point [`DemandForecast`]. A failed fetch is
//! not retried until the next tick; meanwhile the last good reading is
//! republished with `stale = true`. Without any good reading the simulator
//! fills in, tagged [`WeatherSource::Simulated`].

mod fetcher;
mod forecast;

pub use fetcher::{SimulatedWeather, WeatherFetcher, WeatherReading};
pub use forecast::{
    build_forecast, cooling_demand_w, entertainment_w, heating_demand_w, lighting_w, HvacAdvice,
    HvacMode, Urgency,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use ecosmart_core::config::WeatherConfig;
use ecosmart_core::{
    DemandForecast, EcoEvent, Envelope, Error, Freshness, Generation, GenerationCounter,
    GenerationTracker, Topic, WeatherSnapshot, WeatherSource,
};
use ecosmart_devices::with_timeout;
use parking_lot::RwLock;

use crate::error::Result;
use crate::runtime::{Agent, AgentContext};

/// Batches kept for the household base-demand estimate.
const DEMAND_HISTORY: usize = 10;

#[derive(Default)]
struct Shared {
    snapshot: Option<WeatherSnapshot>,
    forecast: Option<DemandForecast>,
    advice: Option<HvacAdvice>,
}

/// Read access to the latest weather outputs.
#[derive(Clone)]
pub struct WeatherView {
    shared: Arc<RwLock<Shared>>,
}

impl WeatherView {
    pub fn snapshot(&self) -> Option<WeatherSnapshot> {
        self.shared.read().snapshot.clone()
    }

    pub fn forecast(&self) -> Option<DemandForecast> {
        self.shared.read().forecast.clone()
    }

    pub fn hvac_advice(&self) -> Option<HvacAdvice> {
        self.shared.read().advice
    }
}

/// Running total of the consumption batch currently arriving.
struct OpenBatch {
    generation: Generation,
    watts: f64,
}

pub struct WeatherAgent {
    config: WeatherConfig,
    offset: FixedOffset,
    fetcher: Option<Arc<dyn WeatherFetcher>>,
    simulator: SimulatedWeather,
    last_good: Option<WeatherReading>,
    generations: GenerationCounter,
    consumption: GenerationTracker,
    open_batch: Option<OpenBatch>,
    batch_totals: VecDeque<f64>,
    shared: Arc<RwLock<Shared>>,
}

impl WeatherAgent {
    /// Without a fetcher every tick publishes simulated weather.
    pub fn new(
        config: WeatherConfig,
        offset: FixedOffset,
        fetcher: Option<Arc<dyn WeatherFetcher>>,
    ) -> Self {
        let simulator = SimulatedWeather::new(config.simulated_base_temp_c, offset);
        Self {
            config,
            offset,
            fetcher,
            simulator,
            last_good: None,
            generations: GenerationCounter::new(),
            consumption: GenerationTracker::new(),
            open_batch: None,
            batch_totals: VecDeque::with_capacity(DEMAND_HISTORY),
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }

    pub fn view(&self) -> WeatherView {
        WeatherView {
            shared: self.shared.clone(),
        }
    }

    /// Trailing mean of closed household batches, or the configured default.
    pub fn base_demand_w(&self) -> f64 {
        if self.batch_totals.is_empty() {
            return self.config.base_demand_w;
        }
        self.batch_totals.iter().sum::<f64>() / self.batch_totals.len() as f64
    }

    fn record_sample(&mut self, generation: Generation, watts: f64) {
        match self.consumption.observe(generation) {
            Freshness::Fresh => {
                if let Some(closed) = self.open_batch.take() {
                    if self.batch_totals.len() == DEMAND_HISTORY {
                        self.batch_totals.pop_front();
                    }
                    self.batch_totals.push_back(closed.watts);
                }
                self.open_batch = Some(OpenBatch { generation, watts });
            }
            Freshness::Current => {
                if let Some(batch) = self.open_batch.as_mut() {
                    if batch.generation == generation {
                        batch.watts += watts;
                    }
                }
            }
            Freshness::Stale => {
                tracing::debug!(generation = %generation, "discarding stale consumption sample");
            }
        }
    }

    fn publish(
        &mut self,
        ctx: &AgentContext,
        reading: &WeatherReading,
        source: WeatherSource,
        stale: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let generation = self.generations.next();
        let snapshot = WeatherSnapshot {
            generation,
            observed_at: reading.observed_at,
            temperature_c: reading.temperature_c,
            humidity_pct: reading.humidity_pct,
            solar_potential: reading.solar_potential,
            source,
            stale,
        };
        let forecast = build_forecast(
            generation,
            reading,
            source,
            stale,
            now,
            self.base_demand_w(),
            &self.config,
            self.offset,
        );
        let advice = HvacAdvice::for_temperature(reading.temperature_c, &self.config);

        {
            let mut shared = self.shared.write();
            shared.snapshot = Some(snapshot.clone());
            shared.forecast = Some(forecast.clone());
            shared.advice = Some(advice);
        }

        tracing::debug!(
            generation = %generation,
            temperature_c = reading.temperature_c,
            ?source,
            stale,
            "weather published"
        );
        ctx.publish(EcoEvent::WeatherSnapshot(snapshot))?;
        ctx.publish(EcoEvent::DemandForecast(forecast))?;
        Ok(())
    }
}

fn check_reading(reading: WeatherReading) -> ecosmart_core::Result<WeatherReading> {
    let values = [
        reading.temperature_c,
        reading.humidity_pct,
        reading.solar_potential,
    ];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::weather("fetched reading contains non-finite values"));
    }
    Ok(reading)
}

#[async_trait]
impl Agent for WeatherAgent {
    fn name(&self) -> &str {
        "weather"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.refresh_interval())
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Consumption]
    }

    async fn handle_event(&mut self, envelope: Arc<Envelope>, _ctx: &AgentContext) -> Result<()> {
        if let EcoEvent::ConsumptionSample(sample) = &envelope.event {
            self.record_sample(sample.generation, sample.watts);
        }
        Ok(())
    }

    async fn tick(&mut self, ctx: &AgentContext) -> Result<()> {
        let now = ctx.now();
        let Some(fetcher) = self.fetcher.clone() else {
            let reading = self.simulator.reading_at(now);
            return self.publish(ctx, &reading, WeatherSource::Simulated, false, now);
        };

        let fetched = with_timeout(self.config.fetch_timeout(), "weather fetch", fetcher.fetch())
            .await
            .and_then(check_reading);
        match fetched {
            Ok(reading) => {
                self.last_good = Some(reading);
                self.publish(ctx, &reading, WeatherSource::Live, false, now)
            }
            Err(e) => {
                match self.last_good {
                    Some(last) => {
                        tracing::warn!(
                            error = %e,
                            "weather fetch failed, serving last good snapshot"
                        );
                        self.publish(ctx, &last, WeatherSource::Live, true, now)?;
                    }
                    None => {
                        tracing::warn!(
                            error = %e,
                            "weather fetch failed, serving simulated snapshot"
                        );
                        let reading = self.simulator.reading_at(now);
                        self.publish(ctx, &reading, WeatherSource::Simulated, false, now)?;
                    }
                }
                Err(e.into())
            }
        }
    }
}
