// edge-inference/crates/edge-inference/src/lib.rs

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model_store;
pub mod orchestrator;
pub mod runner;
pub mod status;
pub mod telemetry;

// Public API exports
pub use capability::Capability;
pub use config::{EngineConfig, EngineSettings, RunnerSettings};
pub use dispatcher::{CapabilityDispatcher, InstanceState, RunnerInstance};
pub use engine::{EngineBuilder, InferenceEngine};
pub use error::{DownloadError, RunnerError, RunnerErrorCode};
pub use orchestrator::{RequestOrchestrator, ResultStream};
pub use runner::{InferenceRequest, InferenceResult, ParamMap, Runner, Value};
pub use status::{RequestEvent, StatusSink, TracingStatusSink};
