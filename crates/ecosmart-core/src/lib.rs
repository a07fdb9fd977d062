//! EcoSmart core.
//!
//! Shared foundation for the agent pipeline:
//! - [`eventbus`]: in-process publish/subscribe broker
//! - [`event`]: the closed set of typed messages and their topics
//! - [`model`]: devices, pricing schedule and generation numbers
//! - [`config`]: TOML configuration with environment overrides
//! - [`sink`]: outbound persistence sink

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod model;
pub mod sink;

pub use config::SystemConfig;
pub use error::{Error, Result};
pub use event::{
    ActionOutcome, AgentState, Anomaly, AnomalySeverity, ConsumptionSample, DecisionInputs,
    DemandForecast, DeviceAction, EcoEvent, Envelope, EventMetadata, ExecutionReport,
    ForecastPoint, HealthStatus, OptimizationDecision, OutcomeResult, OverrideRequest,
    RationaleTag, RejectReason, ReportSource, TargetAction, Topic, WeatherSnapshot, WeatherSource,
    FORECAST_HORIZON_HOURS,
};
pub use eventbus::{
    handler_fn, BusStats, EventBus, EventBusReceiver, EventHandler, SharedEventBus,
    SubscriptionHandle,
};
pub use model::{
    Device, Freshness, Generation, GenerationCounter, GenerationTracker, HourRange, Priority,
    PricingSchedule, RunWindow, Tier, TierRange, UsagePattern,
};
pub use sink::{attach_sink, MemorySink, NoOpSink, RecordSink};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
