//! Engine assembly: configuration in, a running orchestrator out.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::capability::Capability;
use crate::config::{EngineConfig, EngineSettings};
use crate::dispatcher::CapabilityDispatcher;
use crate::metrics;
use crate::model_store::{DownloadManager, ModelCatalog, ModelVersionStore};
use crate::orchestrator::{RequestOrchestrator, ResultStream};
use crate::runner::{HardwareProbe, InferenceRequest, InferenceResult, RunnerFactory, RunnerRegistry, SystemHardwareProbe};
use crate::status::{StatusSink, TracingStatusSink};

pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<RunnerRegistry>,
    catalog: Option<ModelCatalog>,
    settings: Option<EngineSettings>,
    factory: Option<RunnerFactory>,
    probe: Option<Arc<dyn HardwareProbe>>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
            catalog: None,
            settings: None,
            factory: None,
            probe: None,
            sink: None,
        }
    }

    pub fn registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn factory(mut self, factory: RunnerFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HardwareProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Load whatever was not supplied from the configured files or the
    /// built-in tables, then wire the components.
    pub fn build(self) -> Result<InferenceEngine> {
        metrics::init_metrics();
        let config = Arc::new(self.config);

        let registry = match (self.registry, &config.runner_registry) {
            (Some(registry), _) => registry,
            (None, Some(path)) => RunnerRegistry::from_file(path)?,
            (None, None) => RunnerRegistry::builtin()?,
        };
        let catalog = match (self.catalog, &config.model_catalog) {
            (Some(catalog), _) => catalog,
            (None, Some(path)) => ModelCatalog::from_file(path)?,
            (None, None) => ModelCatalog::builtin()?,
        };
        let settings = match (self.settings, &config.engine_settings_path) {
            (Some(settings), _) => settings,
            (None, Some(path)) => EngineSettings::load(path)?,
            (None, None) => EngineSettings::default(),
        };

        std::fs::create_dir_all(&config.models_dir)
            .with_context(|| format!("Failed to create models dir: {}", config.models_dir.display()))?;

        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingStatusSink));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemHardwareProbe::from_config(&config)));
        let factory = Arc::new(self.factory.unwrap_or_else(RunnerFactory::with_builtin_runners));

        let catalog = Arc::new(catalog);
        let registry = Arc::new(registry);
        let versions = Arc::new(ModelVersionStore::open(&config.version_store_path)?);
        let downloads = DownloadManager::new(catalog.clone(), versions.clone(), &config, sink.clone())?;
        let dispatcher = Arc::new(CapabilityDispatcher::new(
            config.clone(),
            registry.clone(),
            factory,
            probe,
            downloads.clone(),
            versions.clone(),
            settings,
        ));
        let orchestrator = RequestOrchestrator::new(dispatcher.clone(), sink, config.stream_buffer);

        info!(
            "Inference engine ready: {} capabilities, {} catalog models",
            registry.capabilities().count(),
            catalog.models().len()
        );
        Ok(InferenceEngine {
            config,
            registry,
            catalog,
            versions,
            downloads,
            dispatcher,
            orchestrator,
        })
    }
}

pub struct InferenceEngine {
    config: Arc<EngineConfig>,
    registry: Arc<RunnerRegistry>,
    catalog: Arc<ModelCatalog>,
    versions: Arc<ModelVersionStore>,
    downloads: DownloadManager,
    dispatcher: Arc<CapabilityDispatcher>,
    orchestrator: RequestOrchestrator,
}

impl InferenceEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn from_config(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn versions(&self) -> &ModelVersionStore {
        &self.versions
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn dispatcher(&self) -> &CapabilityDispatcher {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    pub async fn process(&self, request: InferenceRequest, capability: Capability) -> InferenceResult {
        self.orchestrator.process(request, capability).await
    }

    pub fn process_stream(&self, request: InferenceRequest, capability: Capability) -> ResultStream {
        self.orchestrator.process_stream(request, capability)
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.orchestrator.cancel(request_id)
    }

    /// Cancel live requests and unload every runner.
    pub async fn shutdown(&self) {
        let live = self.orchestrator.active_requests();
        for request_id in &live {
            self.orchestrator.cancel(request_id);
        }
        self.dispatcher.unload_all().await;
        info!("Inference engine stopped ({} requests cancelled)", live.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StaticHardwareProbe;

    fn create_test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::with_models_dir(dir.join("models"))
    }

    #[tokio::test]
    async fn test_builtin_engine_falls_back_to_mock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::builder(create_test_config(dir.path()))
            .probe(Arc::new(StaticHardwareProbe::none()))
            .build()
            .unwrap();

        for capability in [Capability::TextGeneration, Capability::ContentSafety] {
            let result = engine
                .process(InferenceRequest::new(format!("r-{}", capability)).with_input("text", "hi"), capability)
                .await;
            assert!(result.is_success(), "{:?}", result.error);
        }
        assert_eq!(
            engine.dispatcher().active_runner(Capability::TextGeneration).await,
            Some(("mock_llm".to_string(), None))
        );

        engine.shutdown().await;
        assert!(engine.dispatcher().active_runner(Capability::TextGeneration).await.is_none());
    }

    #[test]
    fn test_build_fails_on_missing_registry_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.runner_registry = Some(dir.path().join("missing.json"));
        assert!(InferenceEngine::from_config(config).is_err());
    }
}
