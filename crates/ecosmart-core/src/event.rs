//! Typed events exchanged over the bus.
//!
//! Every record the agents produce is one variant of [`EcoEvent`], and every
//! variant belongs to exactly one [`Topic`]. Payloads are wrapped in an
//! [`Envelope`] behind an `Arc` before fan-out, so subscribers only ever see
//! immutable data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Generation, RunWindow};

/// Number of hourly points in a demand forecast.
pub const FORECAST_HORIZON_HOURS: usize = 24;

/// Topic key used by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Consumption,
    Anomaly,
    Weather,
    Forecast,
    Decision,
    Execution,
    Override,
    Health,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Consumption,
        Topic::Anomaly,
        Topic::Weather,
        Topic::Forecast,
        Topic::Decision,
        Topic::Execution,
        Topic::Override,
        Topic::Health,
    ];

    pub fn index(&self) -> usize {
        match self {
            Topic::Consumption => 0,
            Topic::Anomaly => 1,
            Topic::Weather => 2,
            Topic::Forecast => 3,
            Topic::Decision => 4,
            Topic::Execution => 5,
            Topic::Override => 6,
            Topic::Health => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Consumption => "consumption",
            Topic::Anomaly => "anomaly",
            Topic::Weather => "weather",
            Topic::Forecast => "forecast",
            Topic::Decision => "decision",
            Topic::Execution => "execution",
            Topic::Override => "override",
            Topic::Health => "health",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device reading taken by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionSample {
    /// Shared by every sample of one monitor tick.
    pub generation: Generation,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub watts: f64,
    /// Trailing mean of earlier readings; absent until enough history exists.
    pub baseline: Option<f64>,
    pub is_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Medium,
    High,
}

/// Reading that deviates from its baseline by more than the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub generation: Generation,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub observed_watts: f64,
    pub baseline_watts: f64,
    pub variance_ratio: f64,
    pub severity: AnomalySeverity,
}

/// Where a weather reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherSource {
    Live,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub generation: Generation,
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    /// 0.0 (none) to 1.0 (full sun).
    pub solar_potential: f64,
    pub source: WeatherSource,
    /// Set when a refresh failed and this is the last good reading.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Hours after the forecast start.
    pub offset: u32,
    /// Local hour of day.
    pub hour: u8,
    pub starts_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub cooling_demand_w: f64,
    pub heating_demand_w: f64,
    pub total_demand_w: f64,
}

impl ForecastPoint {
    pub fn hvac_demand_w(&self) -> f64 {
        self.cooling_demand_w + self.heating_demand_w
    }
}

/// Hourly demand estimates, regenerated wholesale on each weather refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandForecast {
    pub generation: Generation,
    pub generated_at: DateTime<Utc>,
    pub source: WeatherSource,
    pub stale: bool,
    pub points: Vec<ForecastPoint>,
}

impl DemandForecast {
    pub fn horizon_start(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|p| p.starts_at)
    }

    pub fn total_energy_kwh(&self) -> f64 {
        self.points.iter().map(|p| p.total_demand_w).sum::<f64>() / 1000.0
    }

    pub fn peak_demand_w(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.total_demand_w)
            .fold(0.0, f64::max)
    }
}

/// Requested device state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetAction {
    On,
    Off,
    /// Keep off until `resume_at`, then run for `run_minutes`.
    DeferUntil {
        resume_at: DateTime<Utc>,
        run_minutes: u32,
    },
}

impl TargetAction {
    /// Desired power state at `now`.
    pub fn desired_on(&self, now: DateTime<Utc>) -> bool {
        match self {
            TargetAction::On => true,
            TargetAction::Off => false,
            TargetAction::DeferUntil {
                resume_at,
                run_minutes,
            } => {
                let end = *resume_at + chrono::Duration::minutes(i64::from(*run_minutes));
                now >= *resume_at && now < end
            }
        }
    }
}

impl fmt::Display for TargetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAction::On => f.write_str("on"),
            TargetAction::Off => f.write_str("off"),
            TargetAction::DeferUntil {
                resume_at,
                run_minutes,
            } => write!(f, "defer until {} for {}m", resume_at.format("%H:%M"), run_minutes),
        }
    }
}

/// Why the optimizer proposed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleTag {
    PeakAvoidance,
    ShiftedToOffPeak,
    ShiftedToNormal,
    NoFeasibleShift,
    DefaultSchedule,
    ObservedRunning,
    ComfortDemand,
    NoDemand,
    PeakCurtailment,
    LoadCapReached,
    StaleForecast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAction {
    pub device_id: String,
    pub action: TargetAction,
    /// Planned window in local time, when the action follows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<RunWindow>,
    #[serde(default)]
    pub tags: Vec<RationaleTag>,
}

/// Generations of the inputs a decision was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecisionInputs {
    pub forecast: Generation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumption: Option<Generation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationDecision {
    /// Also the decision id.
    pub generation: Generation,
    pub generated_at: DateTime<Utc>,
    pub horizon_start: DateTime<Utc>,
    pub actions: Vec<DeviceAction>,
    pub projected_cost: f64,
    pub baseline_cost: f64,
    pub projected_savings: f64,
    #[serde(default)]
    pub tags: Vec<RationaleTag>,
    #[serde(default)]
    pub inputs: DecisionInputs,
}

impl OptimizationDecision {
    pub fn action_for(&self, device_id: &str) -> Option<&DeviceAction> {
        self.actions.iter().find(|a| a.device_id == device_id)
    }
}

/// What triggered an execution report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportSource {
    Decision { generation: Generation },
    Override { request_id: String },
    OverrideExpired { device_id: String },
    Schedule { generation: Generation },
}

/// Reason code for a rejected action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownDevice,
    NotControllable,
    CriticalDevice,
    ManualOverride,
    ComfortBound,
    DutyCycle,
    RestInterval,
    Superseded,
    ActuatorFailure(String),
}

impl RejectReason {
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            RejectReason::CriticalDevice
                | RejectReason::ComfortBound
                | RejectReason::DutyCycle
                | RejectReason::RestInterval
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeResult {
    Applied { changed: bool },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub device_id: String,
    pub requested: TargetAction,
    pub result: OutcomeResult,
}

impl ActionOutcome {
    pub fn applied(device_id: impl Into<String>, requested: TargetAction, changed: bool) -> Self {
        Self {
            device_id: device_id.into(),
            requested,
            result: OutcomeResult::Applied { changed },
        }
    }

    pub fn rejected(
        device_id: impl Into<String>,
        requested: TargetAction,
        reason: RejectReason,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            requested,
            result: OutcomeResult::Rejected { reason },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.result, OutcomeResult::Applied { .. })
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match &self.result {
            OutcomeResult::Rejected { reason } => Some(reason),
            OutcomeResult::Applied { .. } => None,
        }
    }
}

/// Append-only audit record of what the controller did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub source: ReportSource,
    pub timestamp: DateTime<Utc>,
    pub outcomes: Vec<ActionOutcome>,
}

impl ExecutionReport {
    pub fn decision_generation(&self) -> Option<Generation> {
        match &self.source {
            ReportSource::Decision { generation } | ReportSource::Schedule { generation } => {
                Some(*generation)
            }
            _ => None,
        }
    }

    pub fn outcome_for(&self, device_id: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.device_id == device_id)
    }
}

/// Manual control request from outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub request_id: String,
    pub device_id: String,
    pub desired_on: bool,
    pub duration_secs: u64,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OverrideRequest {
    pub fn new(
        device_id: impl Into<String>,
        desired_on: bool,
        duration: std::time::Duration,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            desired_on,
            duration_secs: duration.as_secs(),
            requested_at: Utc::now(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.duration_secs)
    }
}

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Degraded => "degraded",
            AgentState::Stopping => "stopping",
        }
    }

    /// Running or degraded agents keep ticking.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Running | AgentState::Degraded)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub agent: String,
    pub state: AgentState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Closed set of messages carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EcoEvent {
    ConsumptionSample(ConsumptionSample),
    Anomaly(Anomaly),
    WeatherSnapshot(WeatherSnapshot),
    DemandForecast(DemandForecast),
    OptimizationDecision(OptimizationDecision),
    ExecutionReport(ExecutionReport),
    OverrideRequest(OverrideRequest),
    HealthStatus(HealthStatus),
}

impl EcoEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EcoEvent::ConsumptionSample(_) => Topic::Consumption,
            EcoEvent::Anomaly(_) => Topic::Anomaly,
            EcoEvent::WeatherSnapshot(_) => Topic::Weather,
            EcoEvent::DemandForecast(_) => Topic::Forecast,
            EcoEvent::OptimizationDecision(_) => Topic::Decision,
            EcoEvent::ExecutionReport(_) => Topic::Execution,
            EcoEvent::OverrideRequest(_) => Topic::Override,
            EcoEvent::HealthStatus(_) => Topic::Health,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EcoEvent::ConsumptionSample(_) => "ConsumptionSample",
            EcoEvent::Anomaly(_) => "Anomaly",
            EcoEvent::WeatherSnapshot(_) => "WeatherSnapshot",
            EcoEvent::DemandForecast(_) => "DemandForecast",
            EcoEvent::OptimizationDecision(_) => "OptimizationDecision",
            EcoEvent::ExecutionReport(_) => "ExecutionReport",
            EcoEvent::OverrideRequest(_) => "OverrideRequest",
            EcoEvent::HealthStatus(_) => "HealthStatus",
        }
    }

    /// Records the persistence sink stores.
    pub fn is_persistable(&self) -> bool {
        matches!(
            self,
            EcoEvent::ConsumptionSample(_)
                | EcoEvent::Anomaly(_)
                | EcoEvent::WeatherSnapshot(_)
                | EcoEvent::DemandForecast(_)
                | EcoEvent::OptimizationDecision(_)
                | EcoEvent::ExecutionReport(_)
        )
    }

    /// Reject payloads that are structurally unusable.
    pub fn validate(&self) -> Result<()> {
        match self {
            EcoEvent::ConsumptionSample(s) => {
                require_id("device_id", &s.device_id)?;
                require_finite("watts", s.watts)?;
                if s.watts < 0.0 {
                    return Err(Error::validation("watts must not be negative"));
                }
                if let Some(baseline) = s.baseline {
                    require_finite("baseline", baseline)?;
                }
            }
            EcoEvent::Anomaly(a) => {
                require_id("device_id", &a.device_id)?;
                require_finite("observed_watts", a.observed_watts)?;
                require_finite("baseline_watts", a.baseline_watts)?;
                require_finite("variance_ratio", a.variance_ratio)?;
            }
            EcoEvent::WeatherSnapshot(w) => {
                require_finite("temperature_c", w.temperature_c)?;
                require_finite("humidity_pct", w.humidity_pct)?;
                require_finite("solar_potential", w.solar_potential)?;
            }
            EcoEvent::DemandForecast(f) => {
                if f.points.len() != FORECAST_HORIZON_HOURS {
                    return Err(Error::validation(format!(
                        "forecast must have {} points, got {}",
                        FORECAST_HORIZON_HOURS,
                        f.points.len()
                    )));
                }
                for point in &f.points {
                    require_finite("temperature_c", point.temperature_c)?;
                    require_finite("total_demand_w", point.total_demand_w)?;
                    if point.hour > 23 {
                        return Err(Error::validation("forecast hour out of range"));
                    }
                }
            }
            EcoEvent::OptimizationDecision(d) => {
                for action in &d.actions {
                    require_id("device_id", &action.device_id)?;
                }
                require_finite("projected_cost", d.projected_cost)?;
                require_finite("projected_savings", d.projected_savings)?;
            }
            EcoEvent::ExecutionReport(r) => {
                for outcome in &r.outcomes {
                    require_id("device_id", &outcome.device_id)?;
                }
            }
            EcoEvent::OverrideRequest(o) => {
                require_id("request_id", &o.request_id)?;
                require_id("device_id", &o.device_id)?;
                if o.duration_secs == 0 {
                    return Err(Error::validation("override duration must be positive"));
                }
            }
            EcoEvent::HealthStatus(h) => {
                require_id("agent", &h.agent)?;
            }
        }
        Ok(())
    }
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_finite(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::validation(format!("{field} must be finite")));
    }
    Ok(())
}

/// Event metadata for tracking and correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Optional correlation ID (for grouping related events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event source (component that published)
    pub source: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Immutable unit of delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub event: EcoEvent,
    pub metadata: EventMetadata,
}
