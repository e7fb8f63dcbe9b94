//! Request admission and execution.
//!
//! Each request is admitted and tracked before its task starts, so it can be
//! cancelled as soon as its stream is handed out. The task resolves parameters, acquires
//! the capability's runner, and feeds a [`ResultStream`] that carries zero or
//! more partial results followed by exactly one terminal result. Cancellation
//! drops the task's pipeline at its next suspension point and closes the
//! stream without a terminal element.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::params::{resolve, stream_requested};
use super::result_stream::{channel, ResultSink, ResultStream};
use super::tracker::RequestTracker;
use crate::capability::Capability;
use crate::config::EngineSettings;
use crate::dispatcher::CapabilityDispatcher;
use crate::error::{RunnerError, RunnerErrorCode};
use crate::metrics;
use crate::runner::{InferenceRequest, InferenceResult, ParamMap, ValidationResult};
use crate::status::{RequestEvent, StatusSink};

struct Inner {
    dispatcher: Arc<CapabilityDispatcher>,
    tracker: RequestTracker,
    sink: Arc<dyn StatusSink>,
    buffer: usize,
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    pub fn new(dispatcher: Arc<CapabilityDispatcher>, sink: Arc<dyn StatusSink>, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                tracker: RequestTracker::new(),
                sink,
                buffer,
            }),
        }
    }

    /// Run `request` and expose its results as a stream. Streams natively when
    /// the runner supports it, unless the caller passed `stream: false`.
    /// Must be called from within a Tokio runtime.
    pub fn process_stream(&self, request: InferenceRequest, capability: Capability) -> ResultStream {
        self.spawn(request, capability, true)
    }

    /// Run `request` to its terminal result. A request cancelled while in
    /// flight resolves to [`InferenceResult::cancelled`].
    pub async fn process(&self, request: InferenceRequest, capability: Capability) -> InferenceResult {
        let mut stream = self.spawn(request, capability, false);
        while let Some(result) = stream.next().await {
            if result.is_terminal() {
                return result;
            }
        }
        InferenceResult::cancelled()
    }

    /// Stop a live request. True only for the first cancel of a tracked id.
    pub fn cancel(&self, request_id: &str) -> bool {
        let cancelled = self.inner.tracker.cancel(request_id);
        if cancelled {
            info!("Cancel requested for {}", request_id);
        }
        cancelled
    }

    pub fn is_tracked(&self, request_id: &str) -> bool {
        self.inner.tracker.is_tracked(request_id)
    }

    pub fn active_requests(&self) -> Vec<String> {
        self.inner.tracker.active_requests()
    }

    pub fn current_settings(&self) -> Arc<EngineSettings> {
        self.inner.dispatcher.current_settings()
    }

    pub fn update_settings(&self, settings: EngineSettings) {
        self.inner.dispatcher.update_settings(settings);
    }

    pub fn runner_parameter_defaults(&self, runner_name: &str) -> Result<ParamMap, RunnerError> {
        self.inner.dispatcher.runner_parameter_defaults(runner_name)
    }

    fn spawn(&self, request: InferenceRequest, capability: Capability, streaming: bool) -> ResultStream {
        let cancel = CancellationToken::new();
        let (sink, stream) = channel(&request.session_id, self.inner.buffer, cancel.clone());
        let admission = self.inner.admit(&request.session_id, capability, &cancel);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match admission {
                Ok(generation) => {
                    inner
                        .drive(request, capability, streaming, sink, cancel, generation)
                        .await
                }
                Err(e) => {
                    metrics::inc_request(capability.as_str(), "rejected");
                    sink.finish(InferenceResult::failure(e)).await;
                }
            }
        });
        stream
    }
}

impl Inner {
    /// Register the request so `cancel` sees it from the moment its stream
    /// exists. Returns the tracking generation.
    fn admit(
        &self,
        request_id: &str,
        capability: Capability,
        cancel: &CancellationToken,
    ) -> Result<u64, RunnerError> {
        if request_id.trim().is_empty() {
            return Err(RunnerError::invalid_input("session id must not be empty"));
        }
        self.tracker
            .register(request_id, capability, cancel.clone())
            .ok_or_else(|| RunnerError::invalid_input(format!("request {} is already in flight", request_id)))
    }

    async fn drive(
        &self,
        request: InferenceRequest,
        capability: Capability,
        streaming: bool,
        sink: ResultSink,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let request_id = request.session_id.clone();
        metrics::inc_in_flight();
        self.sink.request_event(&RequestEvent::Started {
            request_id: request_id.clone(),
            capability,
        });
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            done = self.pipeline(&request, capability, streaming, &sink, &cancel) => Some(done),
        };
        metrics::dec_in_flight();
        metrics::observe_request_duration(started.elapsed().as_secs_f64());

        let (terminal, runner) = match outcome {
            Some(done) if !cancel.is_cancelled() => done,
            _ => {
                info!("Request {} cancelled after {:?}", request_id, started.elapsed());
                metrics::inc_request(capability.as_str(), "cancelled");
                self.sink.request_event(&RequestEvent::Cancelled {
                    request_id,
                    capability,
                });
                return;
            }
        };

        self.tracker.finish(&request_id, generation);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let terminal = terminal.with_metadata("elapsed_ms", elapsed_ms.to_string());
        let success = terminal.error.is_none();
        match &terminal.error {
            None => debug!("Request {} completed in {}ms", request_id, elapsed_ms),
            Some(e) => warn!("Request {} failed: {}", request_id, e),
        }

        metrics::inc_request(capability.as_str(), if success { "success" } else { "error" });
        self.sink.request_event(&RequestEvent::Finished {
            request_id,
            capability,
            runner,
            success,
            elapsed_ms,
        });
        sink.finish(terminal).await;
    }

    /// Everything between admission and the terminal result. Returns the
    /// terminal result and the runner that produced it.
    async fn pipeline(
        &self,
        request: &InferenceRequest,
        capability: Capability,
        streaming: bool,
        sink: &ResultSink,
        cancel: &CancellationToken,
    ) -> (InferenceResult, Option<String>) {
        let request_id = request.session_id.clone();
        let instance = match self.dispatcher.acquire(capability).await {
            Ok(instance) => instance,
            Err(e) => return (InferenceResult::failure(e), None),
        };
        let runner = &instance.runner;
        let runner_name = instance.name().to_string();
        let decorate = |result: InferenceResult| {
            let mut result = result.with_metadata("runner", runner_name.as_str());
            if let Some(model_id) = &instance.model_id {
                result = result.with_metadata("model_id", model_id.as_str());
            }
            result
        };

        let schema = runner.parameter_schema();
        let settings = self.dispatcher.current_settings();
        let engine_params = settings.overrides_for(&runner_name);
        let resolved = resolve(&schema, &engine_params, &request.params);
        for key in &resolved.discarded {
            warn!(
                "Discarding caller parameter '{}' for request {} ({})",
                key, request_id, runner_name
            );
        }

        let stream = stream_requested(&resolved, &engine_params, &request.params, streaming);
        let mut params = resolved.params;
        params.insert("stream".to_string(), serde_json::Value::Bool(stream));

        if let ValidationResult::Invalid(problems) = runner.validate_parameters(&params) {
            let error = RunnerError::validation(problems.join("; "));
            return (decorate(InferenceResult::failure(error)), Some(runner_name.clone()));
        }
        let request = request.with_resolved_params(params);

        let terminal = if stream && runner.supports_streaming() {
            match runner.run_stream(request, cancel.clone()).await {
                Ok(mut results) => {
                    let mut terminal = None;
                    while let Some(result) = results.next().await {
                        if result.is_terminal() {
                            terminal = Some(result);
                            break;
                        }
                        if !sink.emit_partial(result).await {
                            warn!("Caller dropped the result stream of {}", request_id);
                            terminal = Some(InferenceResult::failure(RunnerError::processing(
                                "result stream closed by caller",
                            )));
                            break;
                        }
                    }
                    terminal.unwrap_or_else(|| {
                        debug!("Runner {} ended its stream without a terminal result", runner_name);
                        InferenceResult::complete(HashMap::new())
                    })
                }
                Err(e) => InferenceResult::failure(e),
            }
        } else {
            match runner.run(&request, stream, cancel.clone()).await {
                Ok(mut result) => {
                    result.partial = false;
                    result
                }
                Err(e) => InferenceResult::failure(e),
            }
        };

        if let Some(e) = &terminal.error {
            if e.code == RunnerErrorCode::ModelNotLoaded {
                error!("Runner {} lost its model: {}", runner_name, e);
                self.dispatcher.mark_failed(capability, &instance).await;
            }
        }
        (decorate(terminal), Some(runner_name.clone()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RunnerSettings};
    use crate::model_store::{DownloadManager, ModelCatalog, ModelVersionStore};
    use crate::runner::definition::RunnerType;
    use crate::runner::{RunnerDefinition, RunnerFactory, RunnerRegistry, StaticHardwareProbe};
    use crate::status::TracingStatusSink;
    use serde_json::json;

    fn create_test_orchestrator(dir: &std::path::Path, settings: EngineSettings) -> RequestOrchestrator {
        let config = Arc::new(EngineConfig::with_models_dir(dir));
        let registry = RunnerRegistry::from_definitions([(
            Capability::TextGeneration,
            vec![RunnerDefinition::new("mock_llm", "mock", 100, RunnerType::Mock).as_fallback()],
        )])
        .unwrap();
        let catalog = Arc::new(ModelCatalog::default());
        let versions = Arc::new(ModelVersionStore::open(dir.join("versions.json")).unwrap());
        let downloads =
            DownloadManager::new(catalog, versions.clone(), &config, Arc::new(TracingStatusSink)).unwrap();
        let dispatcher = CapabilityDispatcher::new(
            config,
            Arc::new(registry),
            Arc::new(RunnerFactory::with_builtin_runners()),
            Arc::new(StaticHardwareProbe::none()),
            downloads,
            versions,
            settings,
        );
        RequestOrchestrator::new(Arc::new(dispatcher), Arc::new(TracingStatusSink), 8)
    }

    fn mock_settings(params: &[(&str, serde_json::Value)]) -> EngineSettings {
        EngineSettings::default().with_runner(
            "mock_llm",
            RunnerSettings {
                params: params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_process_returns_single_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), EngineSettings::default());

        let request = InferenceRequest::new("r1").with_input("prompt", "hello world");
        let result = orchestrator.process(request, Capability::TextGeneration).await;

        assert!(result.is_success());
        assert_eq!(result.text("text"), Some("hello world"));
        assert_eq!(result.metadata.get("runner").map(String::as_str), Some("mock_llm"));
        assert!(result.metadata.contains_key("elapsed_ms"));
        assert!(!orchestrator.is_tracked("r1"));
    }

    #[tokio::test]
    async fn test_stream_partials_then_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), EngineSettings::default());

        let request = InferenceRequest::new("r2").with_input("prompt", "a b c");
        let results: Vec<InferenceResult> = orchestrator
            .process_stream(request, Capability::TextGeneration)
            .collect()
            .await;

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.partial));
        assert_eq!(results.iter().filter(|r| r.is_terminal()).count(), 1);
        assert_eq!(results[3].text("text"), Some("a b c"));
    }

    #[tokio::test]
    async fn test_caller_can_opt_out_of_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), EngineSettings::default());

        let request = InferenceRequest::new("r3")
            .with_input("prompt", "a b c")
            .with_param("stream", json!(false));
        let results: Vec<InferenceResult> = orchestrator
            .process_stream(request, Capability::TextGeneration)
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
    }

    #[tokio::test]
    async fn test_invalid_engine_params_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), mock_settings(&[("temperature", json!(5.0))]));

        let result = orchestrator
            .process(
                InferenceRequest::new("r4").with_input("prompt", "x"),
                Capability::TextGeneration,
            )
            .await;
        assert_eq!(
            result.error.map(|e| e.code),
            Some(RunnerErrorCode::ValidationError)
        );
    }

    #[tokio::test]
    async fn test_admission_errors_are_terminal_results() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), EngineSettings::default());

        let empty = orchestrator
            .process(InferenceRequest::new(""), Capability::TextGeneration)
            .await;
        assert_eq!(empty.error.map(|e| e.code), Some(RunnerErrorCode::InvalidInput));

        let unsupported = orchestrator
            .process(
                InferenceRequest::new("r5").with_input("text", "hi"),
                Capability::TextToSpeech,
            )
            .await;
        assert_eq!(
            unsupported.error.map(|e| e.code),
            Some(RunnerErrorCode::ResourceUnavailable)
        );
        assert!(orchestrator.active_requests().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_live_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            create_test_orchestrator(dir.path(), mock_settings(&[("token_delay_ms", json!(50))]));

        let request = InferenceRequest::new("dup").with_input("prompt", "one two three");
        let mut first = orchestrator.process_stream(request.clone(), Capability::TextGeneration);
        assert!(first.next().await.unwrap().partial);

        let second = orchestrator.process(request, Capability::TextGeneration).await;
        assert_eq!(second.error.map(|e| e.code), Some(RunnerErrorCode::InvalidInput));

        let rest: Vec<InferenceResult> = first.collect().await;
        assert!(rest.last().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_settings_introspection() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), EngineSettings::default());

        assert!(orchestrator.current_settings().runners.is_empty());
        orchestrator.update_settings(mock_settings(&[("max_tokens", json!(64))]));
        assert_eq!(
            orchestrator.current_settings().overrides_for("mock_llm").get("max_tokens"),
            Some(&json!(64))
        );
        let defaults = orchestrator.runner_parameter_defaults("mock_llm").unwrap();
        assert_eq!(defaults.get("max_tokens"), Some(&json!(512)));
    }

    #[tokio::test]
    async fn test_engine_stream_setting_applies_without_caller_value() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = create_test_orchestrator(dir.path(), mock_settings(&[("stream", json!(false))]));

        let request = InferenceRequest::new("r6").with_input("prompt", "a b c");
        let results: Vec<InferenceResult> = orchestrator
            .process_stream(request, Capability::TextGeneration)
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text("text"), Some("a b c"));

        let request = InferenceRequest::new("r7")
            .with_input("prompt", "a b c")
            .with_param("stream", json!(true));
        let results: Vec<InferenceResult> = orchestrator
            .process_stream(request, Capability::TextGeneration)
            .collect()
            .await;
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_right_after_submit() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            create_test_orchestrator(dir.path(), mock_settings(&[("token_delay_ms", json!(20))]));

        let request = InferenceRequest::new("early").with_input("prompt", "a b c d e");
        let stream = orchestrator.process_stream(request.clone(), Capability::TextGeneration);
        assert!(orchestrator.is_tracked("early"));

        let duplicate = orchestrator.process(request, Capability::TextGeneration).await;
        assert_eq!(duplicate.error.map(|e| e.code), Some(RunnerErrorCode::InvalidInput));

        assert!(orchestrator.cancel("early"));
        assert!(!orchestrator.cancel("early"));
        let results: Vec<InferenceResult> = stream.collect().await;
        assert!(results.is_empty());
        assert!(!orchestrator.is_tracked("early"));
    }

    #[tokio::test]
    async fn test_cancelled_process_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            create_test_orchestrator(dir.path(), mock_settings(&[("token_delay_ms", json!(50))]));

        let pending = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .process(
                        InferenceRequest::new("slow").with_input("prompt", "one two three four"),
                        Capability::TextGeneration,
                    )
                    .await
            })
        };
        while !orchestrator.is_tracked("slow") {
            tokio::task::yield_now().await;
        }
        assert!(orchestrator.cancel("slow"));

        let result = pending.await.unwrap();
        assert!(result.is_cancelled());
        assert!(!result.is_success());
    }
}
