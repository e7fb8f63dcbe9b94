//! Request admission, parameter resolution, tracking and streaming.

pub mod params;
pub mod request_orchestrator;
pub mod result_stream;
pub mod tracker;

pub use params::{resolve, ResolvedParams, CALLER_ALLOW_LIST};
pub use request_orchestrator::RequestOrchestrator;
pub use result_stream::{ResultSink, ResultStream};
pub use tracker::RequestTracker;
