//! EcoSmart devices.
//!
//! - [`registry`]: device arena with one writer and read-only views
//! - [`adapter`]: meter and actuator traits the agents call
//! - [`simulator`]: deterministic simulated household

pub mod adapter;
pub mod registry;
pub mod simulator;

pub use adapter::{with_timeout, DeviceActuator, DeviceMeter};
pub use registry::{registry, RegistryView, RegistryWriter};
pub use simulator::{ActuatorCommand, Fault, SimulatedHousehold};
