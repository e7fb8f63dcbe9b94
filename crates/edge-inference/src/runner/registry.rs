//! Declarative runner table and selection strategy.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use super::definition::RunnerDefinition;
use super::hardware::HardwareProbe;
use crate::capability::Capability;
use crate::error::RunnerError;

const BUILTIN_RUNNERS: &str = include_str!("../../assets/runners.json");

/// Capability → definitions, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RunnerRegistry {
    table: BTreeMap<Capability, Vec<RunnerDefinition>>,
}

impl RunnerRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_RUNNERS).context("Built-in runner table is invalid")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read runner table: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid runner table: {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Vec<RunnerDefinition>> = serde_json::from_str(raw)?;
        let mut registry = Self::default();
        for (key, definitions) in parsed {
            let capability: Capability = key.parse().map_err(anyhow::Error::msg)?;
            registry.insert(capability, definitions)?;
        }
        info!(
            "Runner registry loaded: {} capabilities, {} definitions",
            registry.table.len(),
            registry.table.values().map(Vec::len).sum::<usize>()
        );
        Ok(registry)
    }

    pub fn from_definitions(
        entries: impl IntoIterator<Item = (Capability, Vec<RunnerDefinition>)>,
    ) -> Result<Self> {
        let mut registry = Self::default();
        for (capability, definitions) in entries {
            registry.insert(capability, definitions)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, capability: Capability, definitions: Vec<RunnerDefinition>) -> Result<()> {
        let mut seen = HashSet::new();
        for def in &definitions {
            if !seen.insert(def.name.as_str()) {
                anyhow::bail!("duplicate runner '{}' for capability {}", def.name, capability);
            }
        }
        if !definitions.iter().any(|d| d.fallback && d.enabled) {
            warn!("Capability {} has no enabled fallback runner", capability);
        }
        self.table.entry(capability).or_default().extend(definitions);
        Ok(())
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.table.keys().copied()
    }

    pub fn definitions_for(&self, capability: Capability) -> &[RunnerDefinition] {
        self.table.get(&capability).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First definition with this name, across all capabilities.
    pub fn find(&self, name: &str) -> Option<&RunnerDefinition> {
        self.table.values().flatten().find(|d| d.name == name)
    }

    pub fn find_for(&self, capability: Capability, name: &str) -> Option<&RunnerDefinition> {
        self.definitions_for(capability).iter().find(|d| d.name == name)
    }

    pub fn select_runner(
        &self,
        capability: Capability,
        probe: &dyn HardwareProbe,
    ) -> Result<RunnerDefinition, RunnerError> {
        self.select_runner_excluding(capability, probe, &[])
    }

    /// Lowest priority number among enabled, non-excluded definitions whose
    /// requirements hold; equal priorities resolve to the earlier declaration.
    /// Falls back to the first enabled, non-excluded fallback definition.
    pub fn select_runner_excluding(
        &self,
        capability: Capability,
        probe: &dyn HardwareProbe,
        excluded: &[String],
    ) -> Result<RunnerDefinition, RunnerError> {
        let definitions = self.definitions_for(capability);
        let eligible = |d: &&RunnerDefinition| d.enabled && !excluded.iter().any(|x| *x == d.name);

        let selected = definitions
            .iter()
            .filter(eligible)
            .filter(|d| {
                let ok = probe.satisfies_all(&d.requirements);
                if !ok {
                    debug!("Runner {} filtered out for {}: requirements unmet", d.name, capability);
                }
                ok
            })
            .min_by_key(|d| d.priority);

        if let Some(def) = selected {
            info!("Selected runner {} (priority {}) for {}", def.name, def.priority, capability);
            return Ok(def.clone());
        }

        if let Some(def) = definitions.iter().filter(eligible).find(|d| d.fallback) {
            warn!("No eligible runner for {}, using fallback {}", capability, def.name);
            return Ok(def.clone());
        }

        Err(RunnerError::resource_unavailable(format!(
            "no runner available for capability {}",
            capability
        )))
    }
}
