//! Controller agent.
//!
//! The only component that changes device state. It owns the
//! [`RegistryWriter`] and the actuator, validates every command against the
//! safety policy and reports every outcome in an [`ExecutionReport`].
//!
//! Command sources, in precedence order:
//! - manual overrides, applied immediately and reverted on expiry
//! - the most recent optimization decision, executed on the next tick
//! - deferred activations recorded from that decision

mod safety;

pub use safety::SafetyPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecosmart_core::config::{ControllerConfig, SafetyConfig};
use ecosmart_core::{
    ActionOutcome, EcoEvent, Envelope, ExecutionReport, Freshness, Generation, GenerationTracker,
    OptimizationDecision, OverrideRequest, RejectReason, ReportSource, TargetAction, Topic,
};
use ecosmart_devices::{with_timeout, DeviceActuator, RegistryView, RegistryWriter};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;
use crate::runtime::{Agent, AgentContext};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub decisions_executed: u64,
    pub decisions_superseded: u64,
    pub applied: u64,
    pub rejected: u64,
    pub safety_blocks: u64,
    pub overrides_handled: u64,
    pub overrides_expired: u64,
    pub scheduled_runs: u64,
}

/// Manual override currently in force for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideStatus {
    pub request_id: String,
    pub device_id: String,
    pub desired_on: bool,
    pub expires_in_secs: u64,
}

#[derive(Default)]
struct Shared {
    stats: ControllerStats,
    active_generation: Option<Generation>,
    overrides: Vec<OverrideStatus>,
}

#[derive(Clone)]
pub struct ControllerView {
    shared: Arc<RwLock<Shared>>,
}

impl ControllerView {
    pub fn stats(&self) -> ControllerStats {
        self.shared.read().stats.clone()
    }

    /// Generation of the decision currently in force.
    pub fn active_generation(&self) -> Option<Generation> {
        self.shared.read().active_generation
    }

    pub fn overrides(&self) -> Vec<OverrideStatus> {
        self.shared.read().overrides.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Decision,
    Schedule,
    Override,
    Revert,
}

impl Command {
    fn automated(self) -> bool {
        matches!(self, Command::Decision | Command::Schedule)
    }
}

struct ActiveOverride {
    request_id: String,
    desired_on: bool,
    expires_at: Instant,
    /// State before the first override of this device.
    previous_on: bool,
}

#[derive(Debug, Clone)]
struct Activation {
    device_id: String,
    at: DateTime<Utc>,
    on: bool,
    generation: Generation,
}

pub struct ControllerAgent {
    config: ControllerConfig,
    safety: SafetyPolicy,
    writer: RegistryWriter,
    view: RegistryView,
    actuator: Arc<dyn DeviceActuator>,
    decisions: GenerationTracker,
    pending: Option<OptimizationDecision>,
    active: Option<OptimizationDecision>,
    activations: Vec<Activation>,
    overrides: HashMap<String, ActiveOverride>,
    weather: GenerationTracker,
    temperature_c: Option<f64>,
    shared: Arc<RwLock<Shared>>,
}

impl ControllerAgent {
    pub fn new(
        config: ControllerConfig,
        safety: SafetyConfig,
        writer: RegistryWriter,
        actuator: Arc<dyn DeviceActuator>,
    ) -> Self {
        Self {
            config,
            safety: SafetyPolicy::new(safety),
            view: writer.view(),
            writer,
            actuator,
            decisions: GenerationTracker::new(),
            pending: None,
            active: None,
            activations: Vec::new(),
            overrides: HashMap::new(),
            weather: GenerationTracker::new(),
            temperature_c: None,
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }

    pub fn view(&self) -> ControllerView {
        ControllerView {
            shared: self.shared.clone(),
        }
    }

    fn report(
        &self,
        ctx: &AgentContext,
        source: ReportSource,
        outcomes: Vec<ActionOutcome>,
    ) -> Result<()> {
        {
            let mut shared = self.shared.write();
            for outcome in &outcomes {
                match outcome.reject_reason() {
                    None => shared.stats.applied += 1,
                    Some(reason) => {
                        shared.stats.rejected += 1;
                        if reason.is_safety() {
                            shared.stats.safety_blocks += 1;
                        }
                    }
                }
            }
        }
        ctx.publish(EcoEvent::ExecutionReport(ExecutionReport {
            source,
            timestamp: ctx.now(),
            outcomes,
        }))?;
        Ok(())
    }

    fn supersede(&self, decision: &OptimizationDecision, ctx: &AgentContext) -> Result<()> {
        tracing::debug!(generation = %decision.generation, "decision superseded");
        self.shared.write().stats.decisions_superseded += 1;
        let outcomes = decision
            .actions
            .iter()
            .map(|a| ActionOutcome::rejected(&a.device_id, a.action, RejectReason::Superseded))
            .collect();
        self.report(
            ctx,
            ReportSource::Decision {
                generation: decision.generation,
            },
            outcomes,
        )
    }

    fn on_decision(&mut self, decision: &OptimizationDecision, ctx: &AgentContext) -> Result<()> {
        let generation = decision.generation;
        if let Some(last) = self.decisions.last() {
            if generation == last {
                tracing::debug!(generation = %generation, "duplicate decision ignored");
                return Ok(());
            }
            if generation < last {
                return self.supersede(decision, ctx);
            }
        }
        match &self.pending {
            Some(pending) if generation == pending.generation => return Ok(()),
            Some(pending) if generation < pending.generation => {
                return self.supersede(decision, ctx);
            }
            _ => {}
        }
        if let Some(previous) = self.pending.replace(decision.clone()) {
            self.supersede(&previous, ctx)?;
        }
        ctx.schedule_tick(Duration::ZERO);
        Ok(())
    }

    /// Validate and, if needed, actuate one command.
    async fn apply(
        &mut self,
        device_id: &str,
        requested: TargetAction,
        command: Command,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let device = self.view.get(device_id);
        let device = match SafetyPolicy::check_device(device.as_ref()) {
            Ok(device) => device.clone(),
            Err(reason) => return ActionOutcome::rejected(device_id, requested, reason),
        };
        if command.automated() && self.overrides.contains_key(device_id) {
            return ActionOutcome::rejected(device_id, requested, RejectReason::ManualOverride);
        }

        let target_on = requested.desired_on(now);
        if let Err(reason) = self.safety.check_comfort(&device, target_on, self.temperature_c) {
            return ActionOutcome::rejected(device_id, requested, reason);
        }
        if command == Command::Decision {
            if let Err(reason) = SafetyPolicy::check_duty_cycle(&device, &requested, now) {
                return ActionOutcome::rejected(device_id, requested, reason);
            }
        }
        if device.is_on == target_on {
            return ActionOutcome::applied(device_id, requested, false);
        }
        if command.automated() {
            if let Err(reason) = self.safety.check_rest(device_id, Instant::now()) {
                return ActionOutcome::rejected(device_id, requested, reason);
            }
        }

        let what = format!("actuator for {device_id}");
        let actuated = with_timeout(
            self.config.actuator_timeout(),
            &what,
            self.actuator.set_power(&device, target_on),
        )
        .await;
        if let Err(e) = actuated {
            tracing::warn!(device_id = %device_id, error = %e, "actuation failed");
            return ActionOutcome::rejected(
                device_id,
                requested,
                RejectReason::ActuatorFailure(e.to_string()),
            );
        }

        match self.writer.set_power_state(device_id, target_on, now) {
            Ok(changed) => {
                self.safety.record_toggle(device_id, Instant::now());
                tracing::info!(device_id = %device_id, on = target_on, ?command, "device switched");
                ActionOutcome::applied(device_id, requested, changed)
            }
            Err(e) => ActionOutcome::rejected(
                device_id,
                requested,
                RejectReason::ActuatorFailure(e.to_string()),
            ),
        }
    }

    async fn execute(
        &mut self,
        decision: OptimizationDecision,
        now: DateTime<Utc>,
        ctx: &AgentContext,
    ) -> Result<()> {
        self.decisions.observe(decision.generation);
        self.activations.clear();

        let mut outcomes = Vec::with_capacity(decision.actions.len());
        for action in &decision.actions {
            let outcome = self
                .apply(&action.device_id, action.action, Command::Decision, now)
                .await;
            let follow_up = outcome.is_applied()
                || outcome.reject_reason() == Some(&RejectReason::ManualOverride);
            if let (true, TargetAction::DeferUntil { resume_at, run_minutes }) =
                (follow_up, action.action)
            {
                let end = resume_at + chrono::Duration::minutes(i64::from(run_minutes));
                if now < resume_at {
                    self.activations.push(Activation {
                        device_id: action.device_id.clone(),
                        at: resume_at,
                        on: true,
                        generation: decision.generation,
                    });
                }
                if now < end {
                    self.activations.push(Activation {
                        device_id: action.device_id.clone(),
                        at: end,
                        on: false,
                        generation: decision.generation,
                    });
                }
            }
            outcomes.push(outcome);
        }
        self.activations.sort_by_key(|a| a.at);

        tracing::info!(
            generation = %decision.generation,
            applied = outcomes.iter().filter(|o| o.is_applied()).count(),
            rejected = outcomes.iter().filter(|o| !o.is_applied()).count(),
            "decision executed"
        );
        {
            let mut shared = self.shared.write();
            shared.stats.decisions_executed += 1;
            shared.active_generation = Some(decision.generation);
        }
        let source = ReportSource::Decision {
            generation: decision.generation,
        };
        self.active = Some(decision);
        self.report(ctx, source, outcomes)
    }

    async fn run_due_activations(&mut self, now: DateTime<Utc>, ctx: &AgentContext) -> Result<()> {
        let split = self.activations.partition_point(|a| a.at <= now);
        if split == 0 {
            return Ok(());
        }
        let due: Vec<Activation> = self.activations.drain(..split).collect();
        let generation = due[0].generation;
        let mut outcomes = Vec::with_capacity(due.len());
        for activation in due {
            let requested = if activation.on {
                TargetAction::On
            } else {
                TargetAction::Off
            };
            outcomes.push(
                self.apply(&activation.device_id, requested, Command::Schedule, now)
                    .await,
            );
        }
        self.shared.write().stats.scheduled_runs += outcomes.len() as u64;
        self.report(ctx, ReportSource::Schedule { generation }, outcomes)
    }

    async fn start_override(
        &mut self,
        request: &OverrideRequest,
        ctx: &AgentContext,
    ) -> Result<()> {
        if self
            .overrides
            .get(&request.device_id)
            .is_some_and(|o| o.request_id == request.request_id)
        {
            return Ok(());
        }
        let previous_on = match self.overrides.get(&request.device_id) {
            Some(existing) => existing.previous_on,
            None => self.view.is_on(&request.device_id).unwrap_or(false),
        };
        let requested = if request.desired_on {
            TargetAction::On
        } else {
            TargetAction::Off
        };

        let outcome = self
            .apply(&request.device_id, requested, Command::Override, ctx.now())
            .await;
        if outcome.is_applied() {
            tracing::info!(
                device_id = %request.device_id,
                on = request.desired_on,
                duration_secs = request.duration_secs,
                "manual override started"
            );
            self.overrides.insert(
                request.device_id.clone(),
                ActiveOverride {
                    request_id: request.request_id.clone(),
                    desired_on: request.desired_on,
                    expires_at: Instant::now() + request.duration(),
                    previous_on,
                },
            );
            ctx.schedule_tick(request.duration());
            self.shared.write().stats.overrides_handled += 1;
            self.publish_overrides();
        }
        self.report(
            ctx,
            ReportSource::Override {
                request_id: request.request_id.clone(),
            },
            vec![outcome],
        )
    }

    async fn expire_overrides(&mut self, now: DateTime<Utc>, ctx: &AgentContext) -> Result<()> {
        let instant = Instant::now();
        let mut expired: Vec<String> = self
            .overrides
            .iter()
            .filter(|(_, o)| o.expires_at <= instant)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for device_id in expired {
            let Some(finished) = self.overrides.remove(&device_id) else {
                continue;
            };
            let target_on = self
                .active
                .as_ref()
                .and_then(|d| d.action_for(&device_id))
                .map(|a| a.action.desired_on(now))
                .unwrap_or(finished.previous_on);
            let requested = if target_on {
                TargetAction::On
            } else {
                TargetAction::Off
            };
            let outcome = self.apply(&device_id, requested, Command::Revert, now).await;
            tracing::info!(device_id = %device_id, on = target_on, "manual override expired");
            self.shared.write().stats.overrides_expired += 1;
            self.report(ctx, ReportSource::OverrideExpired { device_id }, vec![outcome])?;
        }
        self.publish_overrides();
        Ok(())
    }

    fn publish_overrides(&self) {
        let instant = Instant::now();
        let mut overrides: Vec<OverrideStatus> = self
            .overrides
            .iter()
            .map(|(device_id, o)| OverrideStatus {
                request_id: o.request_id.clone(),
                device_id: device_id.clone(),
                desired_on: o.desired_on,
                expires_in_secs: o.expires_at.saturating_duration_since(instant).as_secs(),
            })
            .collect();
        overrides.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        self.shared.write().overrides = overrides;
    }

    /// Wake for the next override expiry or deferred activation.
    fn schedule_next_wake(&self, now: DateTime<Utc>, ctx: &AgentContext) {
        let instant = Instant::now();
        let next_expiry = self
            .overrides
            .values()
            .map(|o| o.expires_at.saturating_duration_since(instant))
            .min();
        let next_activation = self
            .activations
            .first()
            .map(|a| (a.at - now).to_std().unwrap_or(Duration::ZERO));
        let next = match (next_expiry, next_activation) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(after) = next {
            ctx.schedule_tick(after);
        }
    }
}

#[async_trait]
impl Agent for ControllerAgent {
    fn name(&self) -> &str {
        "controller"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.reconcile_interval())
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Decision, Topic::Override, Topic::Weather]
    }

    async fn handle_event(&mut self, envelope: Arc<Envelope>, ctx: &AgentContext) -> Result<()> {
        match &envelope.event {
            EcoEvent::OptimizationDecision(decision) => self.on_decision(decision, ctx),
            EcoEvent::OverrideRequest(request) => self.start_override(request, ctx).await,
            EcoEvent::WeatherSnapshot(snapshot) => {
                if self.weather.observe(snapshot.generation) == Freshness::Fresh {
                    self.temperature_c = Some(snapshot.temperature_c);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn tick(&mut self, ctx: &AgentContext) -> Result<()> {
        let now = ctx.now();
        self.expire_overrides(now, ctx).await?;
        if let Some(decision) = self.pending.take() {
            self.execute(decision, now, ctx).await?;
        }
        self.run_due_activations(now, ctx).await?;
        self.schedule_next_wake(now, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecosmart_core::{DecisionInputs, Device, DeviceAction, EventBus, Priority, UsagePattern};
    use ecosmart_devices::{registry, SimulatedHousehold};

    fn controller() -> (ControllerAgent, Arc<SimulatedHousehold>) {
        let devices = vec![
            Device::new("bedroom_ac", 1500.0, Priority::High, true, UsagePattern::ScheduleBased)
                .with_hvac(),
            Device::new("refrigerator", 150.0, Priority::Critical, false, UsagePattern::Constant)
                .with_state(true),
        ];
        let (writer, view) = registry(devices).unwrap();
        let household = Arc::new(SimulatedHousehold::new(view, 3));
        let agent = ControllerAgent::new(
            ControllerConfig::default(),
            SafetyConfig::default(),
            writer,
            household.clone(),
        );
        (agent, household)
    }

    fn decision(generation: u64, action: TargetAction) -> OptimizationDecision {
        OptimizationDecision {
            generation: Generation(generation),
            generated_at: Utc::now(),
            horizon_start: Utc::now(),
            actions: vec![DeviceAction {
                device_id: "bedroom_ac".into(),
                action,
                window: None,
                tags: Vec::new(),
            }],
            projected_cost: 0.0,
            baseline_cost: 0.0,
            projected_savings: 0.0,
            tags: Vec::new(),
            inputs: DecisionInputs {
                forecast: Generation(1),
                consumption: None,
            },
        }
    }

    #[tokio::test]
    async fn test_rest_interval_blocks_rapid_toggles() {
        let (mut agent, household) = controller();
        let now = Utc::now();
        let on = agent.apply("bedroom_ac", TargetAction::On, Command::Decision, now).await;
        assert_eq!(on.result, ecosmart_core::OutcomeResult::Applied { changed: true });

        let off = agent.apply("bedroom_ac", TargetAction::Off, Command::Decision, now).await;
        assert_eq!(off.reject_reason(), Some(&RejectReason::RestInterval));
        assert_eq!(household.commands().len(), 1);

        // Manual commands skip the rest interval.
        let manual = agent.apply("bedroom_ac", TargetAction::Off, Command::Override, now).await;
        assert!(manual.is_applied());
    }

    #[tokio::test]
    async fn test_critical_and_unknown_devices_rejected() {
        let (mut agent, _household) = controller();
        let now = Utc::now();
        let fridge = agent.apply("refrigerator", TargetAction::Off, Command::Decision, now).await;
        assert_eq!(fridge.reject_reason(), Some(&RejectReason::NotControllable));
        let ghost = agent.apply("ghost", TargetAction::On, Command::Override, now).await;
        assert_eq!(ghost.reject_reason(), Some(&RejectReason::UnknownDevice));
    }

    #[tokio::test]
    async fn test_actuator_failure_is_reported() {
        let (mut agent, household) = controller();
        household.inject_fault("bedroom_ac", ecosmart_devices::Fault::ActuatorError);
        let outcome = agent
            .apply("bedroom_ac", TargetAction::On, Command::Decision, Utc::now())
            .await;
        assert!(matches!(
            outcome.reject_reason(),
            Some(RejectReason::ActuatorFailure(_))
        ));
        assert_eq!(agent.view.is_on("bedroom_ac"), Some(false));
    }

    #[tokio::test]
    async fn test_older_decision_is_superseded_by_pending() {
        let (mut agent, _household) = controller();
        let bus = EventBus::new();
        let (_handle, mut reports) = bus.receiver(Topic::Execution);
        let ctx = AgentContext::detached("controller", bus.clone());

        agent.on_decision(&decision(2, TargetAction::On), &ctx).unwrap();
        assert!(ctx.pending_deadline().is_some());
        agent.on_decision(&decision(1, TargetAction::Off), &ctx).unwrap();
        assert_eq!(agent.pending.as_ref().map(|d| d.generation), Some(Generation(2)));

        let envelope = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .unwrap()
            .unwrap();
        let EcoEvent::ExecutionReport(report) = &envelope.event else {
            panic!("expected an execution report");
        };
        assert_eq!(report.decision_generation(), Some(Generation(1)));
        assert_eq!(
            report.outcomes[0].reject_reason(),
            Some(&RejectReason::Superseded)
        );
        assert_eq!(agent.view().stats().decisions_superseded, 1);
    }

    #[tokio::test]
    async fn test_override_blocks_decision_until_expiry() {
        let (mut agent, _household) = controller();
        let bus = EventBus::new();
        let ctx = AgentContext::detached("controller", bus);

        let request = OverrideRequest::new("bedroom_ac", true, Duration::from_secs(1800));
        agent.start_override(&request, &ctx).await.unwrap();
        assert_eq!(agent.view.is_on("bedroom_ac"), Some(true));
        assert_eq!(agent.view().overrides().len(), 1);

        let blocked = agent
            .apply("bedroom_ac", TargetAction::Off, Command::Decision, Utc::now())
            .await;
        assert_eq!(blocked.reject_reason(), Some(&RejectReason::ManualOverride));
    }
}
