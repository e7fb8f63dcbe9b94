//! Runner backed by a hosted OpenAI-compatible API. Overlapping runs are
//! independent HTTP requests.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::chat_client::ChatClient;
use super::parameters::{text_generation_schema, ParameterDescriptor};
use super::runner_trait::{ModelBinding, Runner, RunnerStream};
use super::types::{InferenceRequest, InferenceResult, ParamMap};
use crate::capability::Capability;
use crate::error::RunnerError;

pub struct RemoteChatRunner {
    name: String,
    capabilities: Vec<Capability>,
    client: ChatClient,
    model: ArcSwapOption<String>,
}

impl RemoteChatRunner {
    pub fn new(
        name: &str,
        capabilities: Vec<Capability>,
        base_url: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, RunnerError> {
        Ok(Self {
            name: name.to_string(),
            capabilities,
            client: ChatClient::new(base_url, Some(api_key), timeout)?,
            model: ArcSwapOption::empty(),
        })
    }

    fn current_model(&self) -> Result<Arc<String>, RunnerError> {
        self.model
            .load_full()
            .ok_or_else(|| RunnerError::model_not_loaded(format!("{} is not loaded", self.name)))
    }

    fn require_prompt(request: &InferenceRequest) -> Result<(), RunnerError> {
        match request.prompt() {
            Some(p) if !p.trim().is_empty() => Ok(()),
            _ => Err(RunnerError::invalid_input("missing text input 'prompt'")),
        }
    }
}

#[async_trait]
impl Runner for RemoteChatRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    async fn load(
        &self,
        model: &ModelBinding,
        _settings: &ParamMap,
        _initial_params: &ParamMap,
    ) -> Result<(), RunnerError> {
        let model_id = model
            .model_id
            .clone()
            .ok_or_else(|| RunnerError::invalid_input(format!("{} needs a model id", self.name)))?;
        info!("Remote runner {} bound to {} at {}", self.name, model_id, self.client.base_url());
        self.model.store(Some(Arc::new(model_id)));
        Ok(())
    }

    async fn run(
        &self,
        request: &InferenceRequest,
        _stream_requested: bool,
        cancel: CancellationToken,
    ) -> Result<InferenceResult, RunnerError> {
        let model = self.current_model()?;
        Self::require_prompt(request)?;

        let (content, finish_reason) = tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::processing("request cancelled")),
            done = self.client.complete(&model, request) => done?,
        };

        let mut result = InferenceResult::text_complete("text", content).with_metadata("model", model.as_str());
        if let Some(reason) = finish_reason {
            result = result.with_metadata("finish_reason", reason);
        }
        Ok(result)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn run_stream(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<RunnerStream, RunnerError> {
        let model = self.current_model()?;
        Self::require_prompt(&request)?;
        let deltas = self.client.stream(&model, &request).await?;
        let name = self.name.clone();

        let stream = async_stream::stream! {
            futures_util::pin_mut!(deltas);
            let mut full = String::new();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = deltas.next() => next,
                };
                match next {
                    Some(Ok(delta)) => {
                        full.push_str(&delta);
                        yield InferenceResult::text_partial("text", delta);
                    }
                    Some(Err(e)) => {
                        warn!("Stream from {} failed: {}", name, e);
                        yield InferenceResult::failure(e);
                        return;
                    }
                    None => break,
                }
            }
            yield InferenceResult::text_complete("text", full);
        };
        Ok(Box::pin(stream))
    }

    async fn unload(&self) -> Result<(), RunnerError> {
        self.model.store(None);
        info!("Remote runner {} released", self.name);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.model.load().is_some()
    }

    fn parameter_schema(&self) -> Vec<ParameterDescriptor> {
        text_generation_schema()
    }
}
