//! System supervisor.
//!
//! Builds the device registry and the four agents from a [`SystemConfig`],
//! starts them in pipeline order (monitor, weather, optimizer, controller)
//! and stops them in reverse, so no agent outlives the consumers of its
//! output.

use std::sync::Arc;

use ecosmart_core::{
    AgentState, EcoEvent, Envelope, EventBus, HealthStatus, OverrideRequest, SystemConfig,
};
use ecosmart_devices::{
    registry, DeviceActuator, DeviceMeter, RegistryView, RegistryWriter, SimulatedHousehold,
};

use crate::controller::{ControllerAgent, ControllerView};
use crate::error::Result;
use crate::monitor::{MonitorAgent, MonitorView};
use crate::optimizer::{OptimizerAgent, OptimizerView};
use crate::runtime::{AgentHandle, AgentRuntime};
use crate::weather::{WeatherAgent, WeatherFetcher, WeatherView};

/// Source tag for overrides submitted through the supervisor.
const OPERATOR: &str = "operator";

/// Inbound adapters the agents talk to.
pub struct Adapters {
    pub meter: Arc<dyn DeviceMeter>,
    pub actuator: Arc<dyn DeviceActuator>,
    /// `None` runs the weather agent on simulated readings.
    pub weather: Option<Arc<dyn WeatherFetcher>>,
}

/// The running agent pipeline.
pub struct EcoSystem {
    bus: EventBus,
    registry: RegistryView,
    handles: Vec<AgentHandle>,
    monitor: MonitorView,
    weather: WeatherView,
    optimizer: OptimizerView,
    controller: ControllerView,
    household: Option<Arc<SimulatedHousehold>>,
}

impl EcoSystem {
    pub fn new(config: &SystemConfig, bus: EventBus, adapters: Adapters) -> Result<Self> {
        config.validate()?;
        let (writer, view) = registry(config.devices.clone())?;
        Ok(Self::assemble(config, bus, writer, view, adapters))
    }

    /// Pipeline over a seeded [`SimulatedHousehold`] and simulated weather.
    pub fn simulated(config: &SystemConfig, bus: EventBus, seed: u64) -> Result<Self> {
        config.validate()?;
        let (writer, view) = registry(config.devices.clone())?;
        let household = Arc::new(SimulatedHousehold::new(view.clone(), seed));
        let adapters = Adapters {
            meter: household.clone(),
            actuator: household.clone(),
            weather: None,
        };
        let mut system = Self::assemble(config, bus, writer, view, adapters);
        system.household = Some(household);
        Ok(system)
    }

    fn assemble(
        config: &SystemConfig,
        bus: EventBus,
        writer: RegistryWriter,
        view: RegistryView,
        adapters: Adapters,
    ) -> Self {
        let monitor = MonitorAgent::new(config.monitor.clone(), view.clone(), adapters.meter);
        let weather =
            WeatherAgent::new(config.weather.clone(), config.site.offset(), adapters.weather);
        let optimizer =
            OptimizerAgent::new(config.optimizer.clone(), config.pricing.clone(), view.clone());
        let controller = ControllerAgent::new(
            config.controller.clone(),
            config.safety.clone(),
            writer,
            adapters.actuator,
        );

        let views = (monitor.view(), weather.view(), optimizer.view(), controller.view());
        let handles = vec![
            AgentRuntime::spawn(monitor, bus.clone(), &config.runtime),
            AgentRuntime::spawn(weather, bus.clone(), &config.runtime),
            AgentRuntime::spawn(optimizer, bus.clone(), &config.runtime),
            AgentRuntime::spawn(controller, bus.clone(), &config.runtime),
        ];

        Self {
            bus,
            registry: view,
            handles,
            monitor: views.0,
            weather: views.1,
            optimizer: views.2,
            controller: views.3,
            household: None,
        }
    }

    /// Start every agent. On failure the agents already started are
    /// stopped again and the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        for index in 0..self.handles.len() {
            if let Err(e) = self.handles[index].start().await {
                for started in self.handles[..index].iter_mut().rev() {
                    if let Err(stop_err) = started.stop().await {
                        tracing::warn!(
                            agent = %started.name(),
                            error = %stop_err,
                            "rollback stop failed"
                        );
                    }
                }
                return Err(e);
            }
        }
        tracing::info!(agents = self.handles.len(), "ecosmart pipeline started");
        Ok(())
    }

    /// Stop every running agent, controller first. Returns the first error.
    pub async fn stop(&mut self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles.iter_mut().rev() {
            if handle.state() == AgentState::Stopped {
                continue;
            }
            if let Err(e) = handle.stop().await {
                tracing::warn!(agent = %handle.name(), error = %e, "agent stop failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("ecosmart pipeline stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| h.state().is_active())
    }

    pub fn health(&self) -> Vec<HealthStatus> {
        self.handles.iter().map(AgentHandle::health).collect()
    }

    pub fn agent_state(&self, name: &str) -> Option<AgentState> {
        self.handles
            .iter()
            .find(|h| h.name() == name)
            .map(AgentHandle::state)
    }

    /// Publish a manual override for the controller.
    pub fn submit_override(&self, request: OverrideRequest) -> Result<Arc<Envelope>> {
        tracing::info!(
            device_id = %request.device_id,
            on = request.desired_on,
            duration_secs = request.duration_secs,
            "override submitted"
        );
        Ok(self.bus.emit(EcoEvent::OverrideRequest(request), OPERATOR)?)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &RegistryView {
        &self.registry
    }

    pub fn monitor(&self) -> &MonitorView {
        &self.monitor
    }

    pub fn weather(&self) -> &WeatherView {
        &self.weather
    }

    pub fn optimizer(&self) -> &OptimizerView {
        &self.optimizer
    }

    pub fn controller(&self) -> &ControllerView {
        &self.controller
    }

    /// The simulator behind a [`EcoSystem::simulated`] pipeline.
    pub fn household(&self) -> Option<&Arc<SimulatedHousehold>> {
        self.household.as_ref()
    }
}
