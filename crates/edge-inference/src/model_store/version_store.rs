//! Durable record of downloaded models and the current model per runner.
//!
//! Readers get lock-free snapshots through `ArcSwap`; writers are serialized by
//! a mutex and persist the whole record with a write-then-rename so a crash
//! never leaves a truncated file behind.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::catalog::ModelDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionEntry {
    pub model_id: String,
    pub files: Vec<ManifestFile>,
    /// blake3 over the manifest, guards against hand-edited records.
    pub checksum: String,
    pub total_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
}

impl ModelVersionEntry {
    fn manifest_checksum(files: &[ManifestFile]) -> String {
        let mut hasher = blake3::Hasher::new();
        for file in files {
            hasher.update(file.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(&file.size.to_le_bytes());
            if let Some(digest) = &file.sha256 {
                hasher.update(digest.as_bytes());
            }
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    fn is_consistent(&self) -> bool {
        Self::manifest_checksum(&self.files) == self.checksum
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub models: BTreeMap<String, ModelVersionEntry>,
    /// runner name → current model id
    #[serde(default)]
    pub current: BTreeMap<String, String>,
}

pub struct ModelVersionStore {
    path: PathBuf,
    snapshot: ArcSwap<VersionRecord>,
    write_lock: Mutex<()>,
}

impl ModelVersionStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read version store: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt version store: {}", path.display()))?
        } else {
            VersionRecord::default()
        };
        info!(
            "Version store opened at {} ({} models)",
            path.display(),
            record.models.len()
        );
        Ok(Self {
            path,
            snapshot: ArcSwap::from_pointee(record),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<VersionRecord> {
        self.snapshot.load_full()
    }

    pub fn entry(&self, model_id: &str) -> Option<ModelVersionEntry> {
        self.snapshot.load().models.get(model_id).cloned()
    }

    pub fn entries(&self) -> Vec<ModelVersionEntry> {
        self.snapshot.load().models.values().cloned().collect()
    }

    pub fn current_for(&self, runner: &str) -> Option<String> {
        self.snapshot.load().current.get(runner).cloned()
    }

    /// Record a completed download from the files now on disk.
    pub async fn record(&self, model: &ModelDefinition, models_dir: &Path) -> Result<ModelVersionEntry> {
        let model_dir = model.model_dir(models_dir);
        let mut files = Vec::new();
        for resolved in model.resolved_files() {
            let meta = tokio::fs::metadata(model_dir.join(&resolved.name))
                .await
                .with_context(|| format!("Missing file {} for {}", resolved.name, model.id))?;
            files.push(ManifestFile {
                name: resolved.name,
                size: meta.len(),
                sha256: resolved.sha256,
            });
        }
        let entry = ModelVersionEntry {
            model_id: model.id.clone(),
            checksum: ModelVersionEntry::manifest_checksum(&files),
            total_bytes: files.iter().map(|f| f.size).sum(),
            files,
            downloaded_at: Utc::now(),
        };

        let stored = entry.clone();
        self.update(move |record| {
            record.models.insert(stored.model_id.clone(), stored);
        })
        .await?;
        info!("Recorded model {} ({} bytes)", entry.model_id, entry.total_bytes);
        Ok(entry)
    }

    /// Remove a model's record and any current-selection pointing at it.
    pub async fn remove(&self, model_id: &str) -> Result<bool> {
        if self.entry(model_id).is_none() {
            return Ok(false);
        }
        let id = model_id.to_string();
        self.update(move |record| {
            record.models.remove(&id);
            record.current.retain(|_, current| *current != id);
        })
        .await?;
        info!("Removed version record for {}", model_id);
        Ok(true)
    }

    pub async fn set_current(&self, runner: &str, model_id: &str) -> Result<()> {
        if self.entry(model_id).is_none() {
            anyhow::bail!("model {} is not downloaded", model_id);
        }
        let (runner_key, id) = (runner.to_string(), model_id.to_string());
        self.update(move |record| {
            record.current.insert(runner_key, id);
        })
        .await?;
        info!("Current model for {} set to {}", runner, model_id);
        Ok(())
    }

    /// A model is ready when it has a consistent record and every declared
    /// file is on disk, non-empty, and matches the recorded and declared size.
    pub async fn is_ready(&self, model: &ModelDefinition, models_dir: &Path) -> bool {
        let Some(entry) = self.entry(&model.id) else {
            return false;
        };
        if !entry.is_consistent() {
            warn!("Version record for {} fails its checksum", model.id);
            return false;
        }

        let model_dir = model.model_dir(models_dir);
        let resolved = model.resolved_files();
        if resolved.len() != entry.files.len() {
            debug!("Manifest for {} does not match the catalog file set", model.id);
            return false;
        }

        for file in &resolved {
            let Some(recorded) = entry.files.iter().find(|m| m.name == file.name) else {
                return false;
            };
            let on_disk = match tokio::fs::metadata(model_dir.join(&file.name)).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    debug!("{} missing file {}", model.id, file.name);
                    return false;
                }
            };
            let declared_ok = file.size.map(|declared| declared == on_disk).unwrap_or(true);
            if on_disk == 0 || on_disk != recorded.size || !declared_ok {
                return false;
            }
        }
        true
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut VersionRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot.load_full()).clone();
        mutate(&mut next);
        self.persist(&next).await?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    async fn persist(&self, record: &VersionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
