//! Hardware and runtime probing for runner selection.
//!
//! Probes are consulted on every selection so conditions that recover
//! (connectivity restored, credentials configured) are picked up on the next
//! load without restarting the engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use sysinfo::System;
use tracing::debug;

use super::definition::HardwareRequirement;
use crate::config::EngineConfig;

pub trait HardwareProbe: Send + Sync {
    fn satisfies(&self, requirement: &HardwareRequirement) -> bool;

    fn satisfies_all(&self, requirements: &[HardwareRequirement]) -> bool {
        requirements.iter().all(|r| self.satisfies(r))
    }
}

/// Probe backed by the host: RAM from `sysinfo`, accelerators and credentials
/// from configuration, connectivity from a flag the host keeps current.
pub struct SystemHardwareProbe {
    npu: bool,
    gpu: bool,
    api_key: bool,
    local_runtime: Option<PathBuf>,
    network: AtomicBool,
    system: Mutex<System>,
}

impl SystemHardwareProbe {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            npu: config.npu_available,
            gpu: config.gpu_available,
            api_key: config.remote_api_key.is_some(),
            local_runtime: config.local_runtime_bin.clone(),
            network: AtomicBool::new(true),
            system: Mutex::new(System::new()),
        }
    }

    /// Record a connectivity change reported by the host.
    pub fn set_network_available(&self, available: bool) {
        self.network.store(available, Ordering::Relaxed);
    }

    fn total_ram_gb(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.total_memory() / 1024 / 1024 / 1024
            }
            Err(_) => 0,
        }
    }
}

impl HardwareProbe for SystemHardwareProbe {
    fn satisfies(&self, requirement: &HardwareRequirement) -> bool {
        let ok = match requirement {
            HardwareRequirement::Npu => self.npu,
            HardwareRequirement::Gpu => self.gpu,
            HardwareRequirement::MinRamGb(gb) => self.total_ram_gb() >= u64::from(*gb),
            HardwareRequirement::Network => self.network.load(Ordering::Relaxed),
            HardwareRequirement::ApiKey => self.api_key,
            HardwareRequirement::LocalRuntime => {
                self.local_runtime.as_ref().map(|p| p.exists()).unwrap_or(false)
            }
        };
        debug!("Requirement {} satisfied: {}", requirement, ok);
        ok
    }
}

/// Fixed answer set, for tests and for hosts that probe out of process.
#[derive(Debug, Clone, Default)]
pub struct StaticHardwareProbe {
    available: HashSet<HardwareRequirement>,
    ram_gb: u32,
}

impl StaticHardwareProbe {
    pub fn new(available: &[HardwareRequirement], ram_gb: u32) -> Self {
        Self {
            available: available.iter().copied().collect(),
            ram_gb,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl HardwareProbe for StaticHardwareProbe {
    fn satisfies(&self, requirement: &HardwareRequirement) -> bool {
        match requirement {
            HardwareRequirement::MinRamGb(gb) => self.ram_gb >= *gb,
            other => self.available.contains(other),
        }
    }
}
