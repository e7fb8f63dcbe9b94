//! Mechanical runner used as the always-available fallback.
//!
//! Echoes its input. Text capabilities stream one word per partial result.
//! Accepts overlapping `run` calls.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::parameters::{text_generation_schema, ParameterDescriptor};
use super::runner_trait::{ModelBinding, Runner, RunnerStream};
use super::types::{InferenceRequest, InferenceResult, ParamMap, Value};
use crate::capability::Capability;
use crate::error::RunnerError;

pub struct MockRunner {
    name: String,
    capability: Capability,
    loaded: AtomicBool,
}

impl MockRunner {
    pub fn new(name: &str, capability: Capability) -> Self {
        Self {
            name: name.to_string(),
            capability,
            loaded: AtomicBool::new(false),
        }
    }

    fn ensure_loaded(&self) -> Result<(), RunnerError> {
        if self.loaded.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RunnerError::model_not_loaded(format!("{} is not loaded", self.name)))
        }
    }

    fn streams(&self) -> bool {
        matches!(
            self.capability,
            Capability::TextGeneration | Capability::VisionTextGeneration
        )
    }

    fn required_text<'a>(&self, request: &'a InferenceRequest) -> Result<&'a str, RunnerError> {
        request
            .prompt()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| RunnerError::invalid_input("missing text input 'prompt'"))
    }

    fn respond(&self, request: &InferenceRequest) -> Result<InferenceResult, RunnerError> {
        let result = match self.capability {
            Capability::TextGeneration | Capability::VisionTextGeneration => {
                InferenceResult::text_complete("text", self.required_text(request)?)
            }
            Capability::SpeechToText => {
                let audio = request
                    .inputs
                    .get("audio")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| RunnerError::invalid_input("missing audio input 'audio'"))?;
                InferenceResult::text_complete("text", format!("[{} bytes of audio]", audio.len()))
            }
            Capability::TextToSpeech => {
                let text = self.required_text(request)?;
                InferenceResult::complete(HashMap::from([(
                    "audio".to_string(),
                    Value::Bytes(text.as_bytes().to_vec()),
                )]))
            }
            Capability::ContentSafety => {
                let text = self.required_text(request)?;
                let flagged = text.to_lowercase().contains("unsafe");
                InferenceResult::complete(HashMap::from([(
                    "safe".to_string(),
                    Value::Json(serde_json::json!(!flagged)),
                )]))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![self.capability]
    }

    async fn load(
        &self,
        model: &ModelBinding,
        _settings: &ParamMap,
        _initial_params: &ParamMap,
    ) -> Result<(), RunnerError> {
        info!(
            "Mock runner {} loaded (model: {})",
            self.name,
            model.model_id.as_deref().unwrap_or("none")
        );
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run(
        &self,
        request: &InferenceRequest,
        _stream_requested: bool,
        _cancel: CancellationToken,
    ) -> Result<InferenceResult, RunnerError> {
        self.ensure_loaded()?;
        self.respond(request)
    }

    fn supports_streaming(&self) -> bool {
        self.streams()
    }

    async fn run_stream(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<RunnerStream, RunnerError> {
        self.ensure_loaded()?;
        if !self.streams() {
            return Err(RunnerError::processing(format!("{} does not stream", self.name)));
        }
        let text = self.required_text(&request)?.to_string();
        let delay = Duration::from_millis(request.param_u64("token_delay_ms").unwrap_or(0));
        let name = self.name.clone();

        let stream = async_stream::stream! {
            let mut full = String::new();
            for word in text.split_whitespace() {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    debug!("{} stopped streaming on cancellation", name);
                    return;
                }
                if !full.is_empty() {
                    full.push(' ');
                }
                full.push_str(word);
                yield InferenceResult::text_partial("text", word);
            }
            yield InferenceResult::text_complete("text", full);
        };
        Ok(Box::pin(stream))
    }

    async fn unload(&self) -> Result<(), RunnerError> {
        self.loaded.store(false, Ordering::SeqCst);
        info!("Mock runner {} unloaded", self.name);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn parameter_schema(&self) -> Vec<ParameterDescriptor> {
        let mut schema = text_generation_schema();
        schema.push(
            ParameterDescriptor::integer("token_delay_ms", 0)
                .range(0.0, 10_000.0)
                .describe("Pause before each streamed word"),
        );
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn loaded(capability: Capability) -> MockRunner {
        let runner = MockRunner::new("mock", capability);
        runner
            .load(&ModelBinding::none(), &ParamMap::new(), &ParamMap::new())
            .await
            .unwrap();
        runner
    }

    #[tokio::test]
    async fn test_run_requires_load() {
        let runner = MockRunner::new("mock_llm", Capability::TextGeneration);
        let request = InferenceRequest::new("s").with_input("prompt", "hi");
        let err = runner
            .run(&request, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::RunnerErrorCode::ModelNotLoaded);
    }

    #[tokio::test]
    async fn test_echo_and_missing_input() {
        let runner = loaded(Capability::TextGeneration).await;
        let ok = runner
            .run(
                &InferenceRequest::new("s").with_input("prompt", "hello there"),
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ok.text("text"), Some("hello there"));

        let err = runner
            .run(&InferenceRequest::new("s"), false, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::RunnerErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_stream_emits_words_then_final() {
        let runner = loaded(Capability::TextGeneration).await;
        let request = InferenceRequest::new("s").with_input("prompt", "one two three");
        let results: Vec<InferenceResult> = runner
            .run_stream(request, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.partial));
        assert_eq!(results[1].text("text"), Some("two"));
        assert!(results[3].is_success());
        assert_eq!(results[3].text("text"), Some("one two three"));
    }

    #[tokio::test]
    async fn test_other_capabilities() {
        let tts = loaded(Capability::TextToSpeech).await;
        let out = tts
            .run(&InferenceRequest::new("s").with_input("text", "hi"), false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.outputs.get("audio").and_then(Value::as_bytes), Some(&b"hi"[..]));
        assert!(!tts.supports_streaming());

        let asr = loaded(Capability::SpeechToText).await;
        let out = asr
            .run(
                &InferenceRequest::new("s").with_input("audio", vec![0u8; 16]),
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.text("text"), Some("[16 bytes of audio]"));

        let guard = loaded(Capability::ContentSafety).await;
        let out = guard
            .run(
                &InferenceRequest::new("s").with_input("text", "totally UNSAFE"),
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.outputs.get("safe"), Some(&Value::Json(serde_json::json!(false))));
    }
}
