//! Runner that hosts a GGUF model in a local llama-server process and talks
//! to it over loopback HTTP.
//!
//! llama-server queues overlapping requests itself, so runs are not serialized
//! here.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::chat_client::ChatClient;
use super::parameters::{text_generation_schema, ParameterDescriptor};
use super::runner_trait::{ModelBinding, Runner, RunnerStream};
use super::types::{InferenceRequest, InferenceResult, ParamMap};
use crate::capability::Capability;
use crate::error::RunnerError;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LocalServerOptions {
    pub binary: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub threads: u32,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
}

struct Loaded {
    model_id: String,
    client: ChatClient,
}

pub struct LocalServerRunner {
    name: String,
    capabilities: Vec<Capability>,
    options: LocalServerOptions,
    process: Mutex<Option<Child>>,
    loaded: ArcSwapOption<Loaded>,
}

impl LocalServerRunner {
    pub fn new(name: &str, capabilities: Vec<Capability>, options: LocalServerOptions) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            options,
            process: Mutex::new(None),
            loaded: ArcSwapOption::empty(),
        }
    }

    fn current(&self) -> Result<Arc<Loaded>, RunnerError> {
        self.loaded
            .load_full()
            .ok_or_else(|| RunnerError::model_not_loaded(format!("{} is not loaded", self.name)))
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.options.host, self.options.port)
    }

    async fn is_healthy(&self, http: &reqwest::Client) -> bool {
        match http.get(format!("{}/health", self.base_url())).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn start_server(&self, model_path: &PathBuf, settings: &ParamMap) -> Result<Child, RunnerError> {
        let binary = self
            .options
            .binary
            .as_ref()
            .ok_or_else(|| RunnerError::resource_unavailable("local runtime binary is not configured"))?;
        if !binary.exists() {
            return Err(RunnerError::resource_unavailable(format!(
                "llama-server binary not found at: {}",
                binary.display()
            )));
        }

        let ctx_size = settings
            .get("context_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(4096);
        let gpu_layers = settings.get("gpu_layers").and_then(|v| v.as_u64()).unwrap_or(0);

        info!("Starting llama-server for {}: {}", self.name, model_path.display());
        info!("  Binary: {}", binary.display());
        info!("  Port: {}", self.options.port);
        info!("  Context Size: {}", ctx_size);

        let mut child = Command::new(binary)
            .arg("--model")
            .arg(model_path)
            .arg("--host")
            .arg(&self.options.host)
            .arg("--port")
            .arg(self.options.port.to_string())
            .arg("--ctx-size")
            .arg(ctx_size.to_string())
            .arg("--threads")
            .arg(self.options.threads.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::resource_unavailable("failed to spawn llama-server").with_cause(e))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        let deadline = tokio::time::Instant::now() + self.options.startup_timeout;
        while tokio::time::Instant::now() < deadline {
            sleep(HEALTH_POLL_INTERVAL).await;
            if let Ok(Some(status)) = child.try_wait() {
                return Err(RunnerError::processing(format!("llama-server exited during startup: {}", status)));
            }
            if self.is_healthy(&http).await {
                info!("llama-server ready for {}", self.name);
                return Ok(child);
            }
        }

        let _ = child.kill().await;
        Err(RunnerError::processing(format!(
            "llama-server failed to start within {}s",
            self.options.startup_timeout.as_secs()
        )))
    }

    async fn stop_server(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            match child.kill().await {
                Ok(()) => info!("llama-server for {} stopped", self.name),
                Err(e) => warn!("Failed to kill llama-server for {}: {}", self.name, e),
            }
        }
    }
}

#[async_trait]
impl Runner for LocalServerRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    async fn load(
        &self,
        model: &ModelBinding,
        settings: &ParamMap,
        _initial_params: &ParamMap,
    ) -> Result<(), RunnerError> {
        let model_id = model
            .model_id
            .clone()
            .ok_or_else(|| RunnerError::model_not_loaded(format!("{} needs a model", self.name)))?;
        let entry = model
            .entry_path
            .as_ref()
            .filter(|p| p.exists())
            .ok_or_else(|| RunnerError::model_not_loaded(format!("model file for {} is missing", model_id)))?;

        self.stop_server().await;
        let child = self.start_server(entry, settings).await?;
        *self.process.lock().await = Some(child);

        let client = ChatClient::new(&self.base_url(), None, self.options.request_timeout)?;
        self.loaded.store(Some(Arc::new(Loaded { model_id, client })));
        Ok(())
    }

    async fn run(
        &self,
        request: &InferenceRequest,
        _stream_requested: bool,
        cancel: CancellationToken,
    ) -> Result<InferenceResult, RunnerError> {
        let loaded = self.current()?;
        let (content, finish_reason) = tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::processing("request cancelled")),
            done = loaded.client.complete(&loaded.model_id, request) => done?,
        };
        let mut result = InferenceResult::text_complete("text", content);
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
        let loaded = self.current()?;
        let mut deltas = loaded.client.stream(&loaded.model_id, &request).await?;

        let stream = async_stream::stream! {
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
        self.loaded.store(None);
        self.stop_server().await;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load().is_some()
    }

    fn parameter_schema(&self) -> Vec<ParameterDescriptor> {
        let mut schema = text_generation_schema();
        schema.push(ParameterDescriptor::integer("context_size", 4096).range(512.0, 131_072.0));
        schema.push(ParameterDescriptor::integer("gpu_layers", 0).range(0.0, 999.0));
        schema
    }
}
