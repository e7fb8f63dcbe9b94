//! Capability dispatcher: owns the single active runner instance per
//! capability.
//!
//! Load, unload and model switches for one capability are serialized by that
//! capability's slot lock. Runs are not; the active instance is handed out as
//! an `Arc` and callers execute on it concurrently.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::config::{EngineConfig, EngineSettings};
use crate::error::RunnerError;
use crate::metrics;
use crate::model_store::{DownloadManager, ModelVersionStore};
use crate::runner::factory::{resolve_binding, RunnerContext, RunnerFactory};
use crate::runner::parameters::defaults_of;
use crate::runner::{HardwareProbe, ParamMap, Runner, RunnerDefinition, RunnerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unloaded,
    Loaded,
    Failed,
}

impl InstanceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => InstanceState::Loaded,
            2 => InstanceState::Failed,
            _ => InstanceState::Unloaded,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InstanceState::Unloaded => 0,
            InstanceState::Loaded => 1,
            InstanceState::Failed => 2,
        }
    }
}

/// A runner bound to a model.
pub struct RunnerInstance {
    pub definition: RunnerDefinition,
    pub runner: Arc<dyn Runner>,
    pub model_id: Option<String>,
    state: AtomicU8,
}

impl RunnerInstance {
    fn new(definition: RunnerDefinition, runner: Arc<dyn Runner>, model_id: Option<String>) -> Self {
        Self {
            definition,
            runner,
            model_id,
            state: AtomicU8::new(InstanceState::Unloaded.as_u8()),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn is_usable(&self) -> bool {
        self.state() == InstanceState::Loaded && self.runner.is_loaded()
    }
}

type Slot = Arc<Mutex<Option<Arc<RunnerInstance>>>>;

pub struct CapabilityDispatcher {
    config: Arc<EngineConfig>,
    registry: Arc<RunnerRegistry>,
    factory: Arc<RunnerFactory>,
    probe: Arc<dyn HardwareProbe>,
    downloads: DownloadManager,
    versions: Arc<ModelVersionStore>,
    settings: ArcSwap<EngineSettings>,
    slots: DashMap<Capability, Slot>,
}

impl CapabilityDispatcher {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<RunnerRegistry>,
        factory: Arc<RunnerFactory>,
        probe: Arc<dyn HardwareProbe>,
        downloads: DownloadManager,
        versions: Arc<ModelVersionStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            probe,
            downloads,
            versions,
            settings: ArcSwap::from_pointee(settings),
            slots: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn current_settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    /// Replace the engine settings. Applies to the next request and the next
    /// load; already loaded runners keep their load-time settings.
    pub fn update_settings(&self, settings: EngineSettings) {
        self.settings.store(Arc::new(settings));
        info!("Engine settings updated");
    }

    fn slot(&self, capability: Capability) -> Slot {
        self.slots
            .entry(capability)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    /// Active instance for `capability`, selecting and loading one if none is
    /// active or the active one has failed. A definition that fails to load is
    /// excluded and selection runs once more before giving up.
    pub async fn acquire(&self, capability: Capability) -> Result<Arc<RunnerInstance>, RunnerError> {
        let slot = self.slot(capability);
        let mut active = slot.lock().await;

        if let Some(instance) = active.as_ref() {
            if instance.is_usable() {
                return Ok(instance.clone());
            }
            warn!(
                "Active runner {} for {} is no longer usable, reselecting",
                instance.name(),
                capability
            );
            self.discard(instance).await;
            *active = None;
        }

        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<RunnerError> = None;
        for attempt in 0..2 {
            let definition = match self
                .registry
                .select_runner_excluding(capability, self.probe.as_ref(), &excluded)
            {
                Ok(definition) => definition,
                Err(e) => match last_error {
                    Some(_) => break,
                    None => return Err(e),
                },
            };

            match self.load_definition(capability, &definition, None).await {
                Ok(instance) => {
                    *active = Some(instance.clone());
                    return Ok(instance);
                }
                Err(e) => {
                    warn!(
                        "Loading {} for {} failed (attempt {}): {}",
                        definition.name,
                        capability,
                        attempt + 1,
                        e
                    );
                    excluded.push(definition.name.clone());
                    last_error = Some(e);
                }
            }
        }

        let mut error = RunnerError::model_not_loaded(format!("no runner could be loaded for {}", capability));
        if let Some(cause) = last_error {
            error = error.with_cause(cause);
        }
        Err(error)
    }

    fn model_for(&self, definition: &RunnerDefinition, settings: &EngineSettings) -> Option<String> {
        settings
            .model_for(&definition.name)
            .map(str::to_string)
            .or_else(|| self.versions.current_for(&definition.name))
            .or_else(|| definition.default_model_id.clone())
    }

    async fn load_definition(
        &self,
        capability: Capability,
        definition: &RunnerDefinition,
        model_override: Option<&str>,
    ) -> Result<Arc<RunnerInstance>, RunnerError> {
        let settings = self.settings.load_full();
        let model_id = model_override
            .map(str::to_string)
            .or_else(|| self.model_for(definition, &settings));

        if definition.runner_type.uses_local_model() {
            let id = model_id.as_deref().ok_or_else(|| {
                RunnerError::model_not_loaded(format!("runner {} has no model configured", definition.name))
            })?;
            if !self.downloads.is_ready(id).await {
                info!("Model {} for {} is not ready, downloading", id, definition.name);
            }
            self.downloads.ensure_ready(id).await?;
        }

        let ctx = RunnerContext {
            capability,
            definition,
            config: &self.config,
            settings: &settings,
        };
        let runner = self.factory.get_or_create(&ctx)?;
        let model = model_id.as_deref().and_then(|id| self.downloads.catalog().get(id));
        let binding = resolve_binding(self.downloads.models_dir(), model_id.as_deref(), model);

        let overrides = settings.overrides_for(&definition.name);
        let mut initial = defaults_of(&runner.parameter_schema());
        initial.extend(overrides.clone());

        let instance = Arc::new(RunnerInstance::new(definition.clone(), runner, model_id.clone()));
        info!(
            "Loading runner {} for {} (model: {})",
            definition.name,
            capability,
            model_id.as_deref().unwrap_or("none")
        );
        match instance.runner.load(&binding, &overrides, &initial).await {
            Ok(()) => {
                instance.set_state(InstanceState::Loaded);
                metrics::inc_runner_load(&definition.name, "success");
                info!("Runner {} loaded for {}", definition.name, capability);
                Ok(instance)
            }
            Err(e) => {
                instance.set_state(InstanceState::Failed);
                metrics::inc_runner_load(&definition.name, "failure");
                self.factory.evict(&definition.name);
                Err(e)
            }
        }
    }

    async fn discard(&self, instance: &RunnerInstance) {
        if let Err(e) = instance.runner.unload().await {
            warn!("Unloading {} failed: {}", instance.name(), e);
        }
        if instance.state() == InstanceState::Failed {
            self.factory.evict(instance.name());
        }
        instance.set_state(InstanceState::Unloaded);
    }

    /// Mark `instance` failed so the next `acquire` reselects. Ignored when
    /// `instance` is no longer the active one for `capability`.
    pub async fn mark_failed(&self, capability: Capability, instance: &Arc<RunnerInstance>) {
        let slot = self.slot(capability);
        let active = slot.lock().await;
        match active.as_ref() {
            Some(current) if Arc::ptr_eq(current, instance) => {
                warn!("Marking runner {} for {} as failed", current.name(), capability);
                current.set_state(InstanceState::Failed);
            }
            _ => debug!(
                "Runner {} for {} was already replaced, not marking failed",
                instance.name(),
                capability
            ),
        }
    }

    /// Unload the active instance. Returns whether one was active.
    pub async fn release(&self, capability: Capability) -> bool {
        let slot = self.slot(capability);
        let mut active = slot.lock().await;
        match active.take() {
            Some(instance) => {
                info!("Releasing runner {} for {}", instance.name(), capability);
                self.discard(&instance).await;
                true
            }
            None => {
                debug!("Nothing loaded for {}", capability);
                false
            }
        }
    }

    pub async fn unload_all(&self) {
        let capabilities: Vec<Capability> = self.slots.iter().map(|e| *e.key()).collect();
        for capability in capabilities {
            self.release(capability).await;
        }
    }

    /// Unload the active instance and load `model_id` into the runner the
    /// catalog builds it for. On success that model becomes the runner's
    /// current selection in the version store.
    pub async fn switch_model(&self, capability: Capability, model_id: &str) -> Result<(), RunnerError> {
        let model = self
            .downloads
            .catalog()
            .get(model_id)
            .cloned()
            .ok_or_else(|| RunnerError::invalid_input(format!("unknown model: {}", model_id)))?;
        if !model.capabilities.contains(&capability) {
            return Err(RunnerError::invalid_input(format!(
                "model {} does not serve {}",
                model_id, capability
            )));
        }
        let definition = self
            .registry
            .find_for(capability, &model.runner)
            .filter(|d| d.enabled)
            .cloned()
            .ok_or_else(|| {
                RunnerError::resource_unavailable(format!(
                    "runner {} is not available for {}",
                    model.runner, capability
                ))
            })?;
        if !self.probe.satisfies_all(&definition.requirements) {
            return Err(RunnerError::resource_unavailable(format!(
                "requirements of runner {} are not met",
                definition.name
            )));
        }

        let slot = self.slot(capability);
        let mut active = slot.lock().await;
        if let Some(previous) = active.take() {
            info!("Switching {} from {} to model {}", capability, previous.name(), model_id);
            self.discard(&previous).await;
        }

        let instance = self
            .load_definition(capability, &definition, Some(model_id))
            .await
            .map_err(|e| RunnerError::model_not_loaded(format!("failed to load {}", model_id)).with_cause(e))?;
        *active = Some(instance);

        if let Err(e) = self.versions.set_current(&definition.name, model_id).await {
            warn!("Failed to record {} as current for {}: {}", model_id, definition.name, e);
        }
        Ok(())
    }

    /// Name and model of the active instance, if any.
    pub async fn active_runner(&self, capability: Capability) -> Option<(String, Option<String>)> {
        let slot = self.slot(capability);
        let active = slot.lock().await;
        active
            .as_ref()
            .filter(|i| i.state() == InstanceState::Loaded)
            .map(|i| (i.name().to_string(), i.model_id.clone()))
    }

    /// Declared parameter defaults of a runner, by name.
    pub fn runner_parameter_defaults(&self, runner_name: &str) -> Result<ParamMap, RunnerError> {
        let (capability, definition) = self
            .registry
            .capabilities()
            .find_map(|cap| self.registry.find_for(cap, runner_name).map(|d| (cap, d.clone())))
            .ok_or_else(|| RunnerError::invalid_input(format!("unknown runner: {}", runner_name)))?;

        let runner = match self.factory.cached(runner_name) {
            Some(runner) => runner,
            None => {
                let settings = self.settings.load_full();
                let ctx = RunnerContext {
                    capability,
                    definition: &definition,
                    config: &self.config,
                    settings: &settings,
                };
                self.factory.create(&ctx)?
            }
        };
        Ok(defaults_of(&runner.parameter_schema()))
    }
}
