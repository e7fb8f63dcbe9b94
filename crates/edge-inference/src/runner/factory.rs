//! Static construction table for runners plus an instance cache keyed by
//! runner name.

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::definition::RunnerDefinition;
use super::local_runner::{LocalServerOptions, LocalServerRunner};
use super::mock_runner::MockRunner;
use super::remote_runner::RemoteChatRunner;
use super::runner_trait::{ModelBinding, Runner};
use crate::capability::Capability;
use crate::config::{EngineConfig, EngineSettings};
use crate::error::RunnerError;
use crate::model_store::catalog::ModelDefinition;

/// Everything a constructor may consult when building a runner.
pub struct RunnerContext<'a> {
    pub capability: Capability,
    pub definition: &'a RunnerDefinition,
    pub config: &'a EngineConfig,
    pub settings: &'a EngineSettings,
}

impl RunnerContext<'_> {
    /// Per-runner key from engine settings, else the configured remote key.
    pub fn api_key(&self) -> Result<String, RunnerError> {
        self.settings
            .for_runner(&self.definition.name)
            .and_then(|s| s.api_key.clone())
            .or_else(|| self.config.remote_api_key.clone())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                RunnerError::authentication(format!("no API key configured for {}", self.definition.name))
            })
    }
}

pub type Constructor =
    Arc<dyn Fn(&RunnerContext<'_>) -> Result<Arc<dyn Runner>, RunnerError> + Send + Sync>;

pub struct RunnerFactory {
    constructors: HashMap<String, Constructor>,
    instances: DashMap<String, Arc<dyn Runner>>,
}

impl RunnerFactory {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Table with the `mock`, `remote_chat` and `local_server` implementations.
    pub fn with_builtin_runners() -> Self {
        let mut factory = Self::empty();

        factory.register("mock", |ctx| {
            Ok(Arc::new(MockRunner::new(&ctx.definition.name, ctx.capability)) as Arc<dyn Runner>)
        });

        factory.register("remote_chat", |ctx| {
            let runner = RemoteChatRunner::new(
                &ctx.definition.name,
                vec![ctx.capability],
                &ctx.config.remote_api_base,
                ctx.api_key()?,
                Duration::from_secs(120),
            )?;
            Ok(Arc::new(runner) as Arc<dyn Runner>)
        });

        factory.register("local_server", |ctx| {
            let options = LocalServerOptions {
                binary: ctx.config.local_runtime_bin.clone(),
                host: ctx.config.local_runtime_host.clone(),
                port: ctx.config.local_runtime_port,
                threads: ctx.config.threads,
                startup_timeout: Duration::from_secs(120),
                request_timeout: Duration::from_secs(600),
            };
            Ok(Arc::new(LocalServerRunner::new(&ctx.definition.name, vec![ctx.capability], options))
                as Arc<dyn Runner>)
        });

        factory
    }

    pub fn register<F>(&mut self, implementation: &str, constructor: F)
    where
        F: Fn(&RunnerContext<'_>) -> Result<Arc<dyn Runner>, RunnerError> + Send + Sync + 'static,
    {
        self.constructors.insert(implementation.to_string(), Arc::new(constructor));
    }

    pub fn implementations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a fresh instance, bypassing the cache.
    pub fn create(&self, ctx: &RunnerContext<'_>) -> Result<Arc<dyn Runner>, RunnerError> {
        let constructor = self.constructors.get(&ctx.definition.implementation).ok_or_else(|| {
            RunnerError::resource_unavailable(format!(
                "no implementation registered as '{}' (runner {})",
                ctx.definition.implementation, ctx.definition.name
            ))
        })?;
        info!(
            "Constructing runner {} ({})",
            ctx.definition.name, ctx.definition.implementation
        );
        constructor(ctx)
    }

    pub fn get_or_create(&self, ctx: &RunnerContext<'_>) -> Result<Arc<dyn Runner>, RunnerError> {
        if let Some(existing) = self.instances.get(&ctx.definition.name) {
            debug!("Reusing cached runner {}", ctx.definition.name);
            return Ok(existing.value().clone());
        }
        let runner = self.create(ctx)?;
        self.instances.insert(ctx.definition.name.clone(), runner.clone());
        Ok(runner)
    }

    /// Cached instance for `name`, if one was built.
    pub fn cached(&self, name: &str) -> Option<Arc<dyn Runner>> {
        self.instances.get(name).map(|r| r.value().clone())
    }

    pub fn evict(&self, name: &str) -> bool {
        self.instances.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.instances.clear();
    }
}

impl Default for RunnerFactory {
    fn default() -> Self {
        Self::with_builtin_runners()
    }
}

/// Binding for `model_id`, resolving its entry point under `models_dir` when the
/// catalog knows the model.
pub fn resolve_binding(
    models_dir: &Path,
    model_id: Option<&str>,
    model: Option<&ModelDefinition>,
) -> ModelBinding {
    match (model_id, model) {
        (Some(id), Some(def)) => ModelBinding {
            model_id: Some(id.to_string()),
            model_dir: Some(def.model_dir(models_dir)),
            entry_path: Some(def.entry_path(models_dir)),
        },
        (Some(id), None) => ModelBinding::remote(id),
        (None, _) => ModelBinding::none(),
    }
}
