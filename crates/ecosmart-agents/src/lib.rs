//! EcoSmart agents.
//!
//! Four cooperating agents coordinate household energy use over the
//! shared [`EventBus`](ecosmart_core::EventBus):
//!
//! | Agent | Consumes | Produces |
//! |---|---|---|
//! | [`MonitorAgent`] | meter readings | consumption samples, anomalies |
//! | [`WeatherAgent`] | weather readings, consumption | weather snapshots, demand forecasts |
//! | [`OptimizerAgent`] | forecasts, consumption | optimization decisions |
//! | [`ControllerAgent`] | decisions, overrides, weather | execution reports |
//!
//! Each agent is driven by the [`runtime`], and [`EcoSystem`] wires the
//! four together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ecosmart_agents::EcoSystem;
//! use ecosmart_core::{EventBus, SystemConfig};
//!
//! #[tokio::main]
//! async fn main() -> ecosmart_agents::Result<()> {
//!     let mut system = EcoSystem::simulated(&SystemConfig::default(), EventBus::new(), 42)?;
//!     system.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     system.stop().await
//! }
//! ```

pub mod controller;
pub mod error;
pub mod monitor;
pub mod optimizer;
pub mod runtime;
pub mod system;
pub mod weather;

pub use controller::{
    ControllerAgent, ControllerStats, ControllerView, OverrideStatus, SafetyPolicy,
};
pub use error::{AgentError, Result};
pub use monitor::{ConsumptionSummary, MonitorAgent, MonitorStats, MonitorView};
pub use optimizer::{plan, OptimizerAgent, OptimizerStats, OptimizerView, PlanInput, PlanSettings};
pub use runtime::{Agent, AgentContext, AgentHandle, AgentRuntime};
pub use system::{Adapters, EcoSystem};
pub use weather::{
    HvacAdvice, HvacMode, SimulatedWeather, Urgency, WeatherAgent, WeatherFetcher,
    WeatherReading, WeatherView,
};
