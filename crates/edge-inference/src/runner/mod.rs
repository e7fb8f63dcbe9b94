//! Runner contract, declarative runner table and the built-in backends.

pub mod chat_client;
pub mod definition;
pub mod factory;
pub mod hardware;
pub mod local_runner;
pub mod mock_runner;
pub mod parameters;
pub mod registry;
pub mod remote_runner;
pub mod runner_trait;
pub mod types;

pub use definition::{HardwareRequirement, RunnerDefinition, RunnerType};
pub use factory::{resolve_binding, RunnerContext, RunnerFactory};
pub use hardware::{HardwareProbe, StaticHardwareProbe, SystemHardwareProbe};
pub use parameters::{ParameterDescriptor, ParameterType, ValidationResult};
pub use registry::RunnerRegistry;
pub use runner_trait::{ModelBinding, Runner, RunnerStream};
pub use types::{InferenceRequest, InferenceResult, ParamMap, Value};
