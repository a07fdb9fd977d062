//! Optimizer agent.
//!
//! Recomputes the plan whenever a fresh forecast or a fresh consumption
//! batch arrives. Arrivals within the debounce window coalesce into one
//! run, and a fallback interval replans even when nothing arrives. Each
//! run publishes exactly one [`OptimizationDecision`] with a new generation.

mod planner;

pub use planner::{plan, PlanInput, PlanSettings};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecosmart_core::config::OptimizerConfig;
use ecosmart_core::{
    DemandForecast, EcoEvent, Envelope, Freshness, Generation, GenerationCounter,
    GenerationTracker, OptimizationDecision, PricingSchedule, Topic,
};
use ecosmart_devices::RegistryView;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Result;
use crate::runtime::{Agent, AgentContext};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub runs: u64,
    /// Ticks that found no forecast to plan against.
    pub skipped: u64,
    pub stale_inputs_discarded: u64,
    pub cumulative_projected_savings: f64,
    pub last_generation: Option<Generation>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Shared {
    stats: OptimizerStats,
    latest: Option<OptimizationDecision>,
}

#[derive(Clone)]
pub struct OptimizerView {
    shared: Arc<RwLock<Shared>>,
}

impl OptimizerView {
    pub fn stats(&self) -> OptimizerStats {
        self.shared.read().stats.clone()
    }

    pub fn latest_decision(&self) -> Option<OptimizationDecision> {
        self.shared.read().latest.clone()
    }
}

pub struct OptimizerAgent {
    config: OptimizerConfig,
    settings: PlanSettings,
    pricing: PricingSchedule,
    registry: RegistryView,
    forecast: Option<DemandForecast>,
    forecasts: GenerationTracker,
    batches: GenerationTracker,
    observed: HashMap<String, f64>,
    generations: GenerationCounter,
    shared: Arc<RwLock<Shared>>,
}

impl OptimizerAgent {
    pub fn new(config: OptimizerConfig, pricing: PricingSchedule, registry: RegistryView) -> Self {
        Self {
            settings: PlanSettings::from(&config),
            config,
            pricing,
            registry,
            forecast: None,
            forecasts: GenerationTracker::new(),
            batches: GenerationTracker::new(),
            observed: HashMap::new(),
            generations: GenerationCounter::new(),
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }

    pub fn view(&self) -> OptimizerView {
        OptimizerView {
            shared: self.shared.clone(),
        }
    }

    fn discard(&self, what: &str, generation: Generation) {
        tracing::debug!(generation = %generation, "discarding stale {what}");
        self.shared.write().stats.stale_inputs_discarded += 1;
    }
}

#[async_trait]
impl Agent for OptimizerAgent {
    fn name(&self) -> &str {
        "optimizer"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.fallback_interval())
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Forecast, Topic::Consumption]
    }

    async fn handle_event(&mut self, envelope: Arc<Envelope>, ctx: &AgentContext) -> Result<()> {
        match &envelope.event {
            EcoEvent::DemandForecast(forecast) => {
                match self.forecasts.observe(forecast.generation) {
                    Freshness::Fresh => {
                        self.forecast = Some(forecast.clone());
                        ctx.schedule_tick(self.config.debounce());
                    }
                    Freshness::Current => {}
                    Freshness::Stale => self.discard("forecast", forecast.generation),
                }
            }
            EcoEvent::ConsumptionSample(sample) => match self.batches.observe(sample.generation) {
                Freshness::Fresh => {
                    self.observed.clear();
                    self.observed.insert(sample.device_id.clone(), sample.watts);
                    ctx.schedule_tick(self.config.debounce());
                }
                Freshness::Current => {
                    self.observed.insert(sample.device_id.clone(), sample.watts);
                }
                Freshness::Stale => self.discard("consumption sample", sample.generation),
            },
            _ => {}
        }
        Ok(())
    }

    async fn tick(&mut self, ctx: &AgentContext) -> Result<()> {
        let Some(forecast) = self.forecast.as_ref() else {
            tracing::debug!("no forecast yet, skipping plan");
            self.shared.write().stats.skipped += 1;
            return Ok(());
        };

        let devices = self.registry.snapshot();
        let now = ctx.now();
        let generation = self.generations.next();
        let decision = plan(&PlanInput {
            generation,
            now,
            forecast,
            pricing: &self.pricing,
            devices: &devices,
            observed_watts: &self.observed,
            consumption: self.batches.last(),
            settings: &self.settings,
        })?;

        tracing::info!(
            generation = %generation,
            actions = decision.actions.len(),
            projected_cost = decision.projected_cost,
            projected_savings = decision.projected_savings,
            "decision published"
        );
        {
            let mut shared = self.shared.write();
            shared.stats.runs += 1;
            shared.stats.cumulative_projected_savings += decision.projected_savings;
            shared.stats.last_generation = Some(generation);
            shared.stats.last_run = Some(now);
            shared.latest = Some(decision.clone());
        }
        ctx.publish(EcoEvent::OptimizationDecision(decision))?;
        Ok(())
    }
}
