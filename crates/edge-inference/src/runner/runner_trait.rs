use async_trait::async_trait;
use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use super::parameters::{validate_against, ParameterDescriptor, ValidationResult};
use super::types::{InferenceRequest, InferenceResult, ParamMap};
use crate::capability::Capability;
use crate::error::RunnerError;

/// Stream produced by a natively streaming runner. The last element must be
/// terminal; anything after it is dropped by the orchestrator.
pub type RunnerStream = Pin<Box<dyn Stream<Item = InferenceResult> + Send>>;

/// The model a runner is asked to load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelBinding {
    pub model_id: Option<String>,
    /// Directory holding the model's files.
    pub model_dir: Option<PathBuf>,
    /// Resolved entry point inside `model_dir`.
    pub entry_path: Option<PathBuf>,
}

impl ModelBinding {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn remote(model_id: impl Into<String>) -> Self {
        Self {
            model_id: Some(model_id.into()),
            ..Default::default()
        }
    }
}

/// Backend contract implemented by every runner.
///
/// Methods take `&self`: one instance may serve overlapping `run` calls, and a
/// runner that cannot do so serializes internally. Load and unload are already
/// serialized per capability by the dispatcher.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability>;

    async fn load(
        &self,
        model: &ModelBinding,
        settings: &ParamMap,
        initial_params: &ParamMap,
    ) -> Result<(), RunnerError>;

    /// One-shot execution. `stream_requested` is informational for runners
    /// that cannot stream.
    async fn run(
        &self,
        request: &InferenceRequest,
        stream_requested: bool,
        cancel: CancellationToken,
    ) -> Result<InferenceResult, RunnerError>;

    /// Whether `run_stream` is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn run_stream(
        &self,
        _request: InferenceRequest,
        _cancel: CancellationToken,
    ) -> Result<RunnerStream, RunnerError> {
        Err(RunnerError::processing(format!(
            "runner {} does not support streaming",
            self.name()
        )))
    }

    async fn unload(&self) -> Result<(), RunnerError>;

    fn is_loaded(&self) -> bool;

    fn parameter_schema(&self) -> Vec<ParameterDescriptor>;

    fn validate_parameters(&self, params: &ParamMap) -> ValidationResult {
        validate_against(&self.parameter_schema(), params)
    }
}
