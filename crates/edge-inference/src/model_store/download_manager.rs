//! Resumable, deduplicated model downloads.
//!
//! One transfer task runs per model id. Later callers for the same id attach
//! to it as listeners and share its outcome. Files stream into `<name>.part`
//! and are renamed into place once complete, so nothing half-written ever
//! carries a final name. A model is recorded in the version store only after
//! the full file set re-validates.

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::catalog::{ModelCatalog, ModelDefinition, ResolvedFile};
use super::integrity::verify_file;
use super::progress::{DownloadEvent, DownloadListener, DownloadState, DownloadStatus, FileProgress, SpeedSampler};
use super::version_store::ModelVersionStore;
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::metrics;
use crate::status::StatusSink;

const STOP_NONE: u8 = 0;
const STOP_CANCEL: u8 = 1;
const STOP_PAUSE: u8 = 2;

type Outcome = Option<Result<(), DownloadError>>;

struct Transfer {
    listeners: Mutex<Vec<Arc<dyn DownloadListener>>>,
    outcome: watch::Sender<Outcome>,
    cancel: CancellationToken,
    stop_reason: AtomicU8,
    sampler: Mutex<SpeedSampler>,
}

impl Transfer {
    fn new(sample_window: Duration) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            listeners: Mutex::new(Vec::new()),
            outcome,
            cancel: CancellationToken::new(),
            stop_reason: AtomicU8::new(STOP_NONE),
            sampler: Mutex::new(SpeedSampler::new(sample_window)),
        }
    }

    fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    fn stop(&self, reason: u8) {
        let _ = self
            .stop_reason
            .compare_exchange(STOP_NONE, reason, Ordering::SeqCst, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn interruption(&self) -> DownloadError {
        match self.stop_reason.load(Ordering::SeqCst) {
            STOP_PAUSE => DownloadError::Paused,
            _ => DownloadError::Cancelled,
        }
    }
}

/// Waits for a transfer's shared outcome.
pub struct DownloadHandle {
    model_id: String,
    rx: watch::Receiver<Outcome>,
}

impl DownloadHandle {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub async fn wait(mut self) -> Result<(), DownloadError> {
        loop {
            let current = self.rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone().unwrap_or(Err(DownloadError::Cancelled));
            }
        }
    }
}

enum MirrorError {
    /// Try the next mirror.
    Skip(DownloadError),
    Abort(DownloadError),
}

struct Inner {
    catalog: Arc<ModelCatalog>,
    versions: Arc<ModelVersionStore>,
    models_dir: PathBuf,
    client: reqwest::Client,
    parallelism: usize,
    sample_window: Duration,
    in_flight: DashMap<String, Arc<Transfer>>,
    states: DashMap<String, DownloadState>,
    sink: Arc<dyn StatusSink>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        versions: Arc<ModelVersionStore>,
        config: &EngineConfig,
        sink: Arc<dyn StatusSink>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.download_timeout_seconds))
            .user_agent(concat!("edge-inference/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build download HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                catalog,
                versions,
                models_dir: config.models_dir.clone(),
                client,
                parallelism: config.download_parallelism.max(1),
                sample_window: Duration::from_millis(config.progress_sample_ms.max(1)),
                in_flight: DashMap::new(),
                states: DashMap::new(),
                sink,
            }),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.inner.models_dir
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    pub async fn is_ready(&self, model_id: &str) -> bool {
        match self.inner.catalog.get(model_id) {
            Some(model) => self.inner.versions.is_ready(model, &self.inner.models_dir).await,
            None => false,
        }
    }

    /// Resolve once the model is ready, downloading it if needed.
    pub async fn ensure_ready(&self, model_id: &str) -> Result<(), DownloadError> {
        if self.is_ready(model_id).await {
            debug!("Model {} already ready", model_id);
            return Ok(());
        }
        self.download(model_id, None).await
    }

    pub async fn download(
        &self,
        model_id: &str,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<(), DownloadError> {
        self.start(model_id, listener)?.wait().await
    }

    /// Start a transfer, or attach to the one already running for this id.
    pub fn start(
        &self,
        model_id: &str,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<DownloadHandle, DownloadError> {
        let model = self
            .inner
            .catalog
            .get(model_id)
            .cloned()
            .ok_or_else(|| DownloadError::UnknownModel(model_id.to_string()))?;

        let (transfer, fresh) = match self.inner.in_flight.entry(model_id.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let transfer = Arc::new(Transfer::new(self.inner.sample_window));
                slot.insert(transfer.clone());
                (transfer, true)
            }
        };

        if let Some(listener) = listener {
            transfer.add_listener(listener);
        }
        let handle = DownloadHandle {
            model_id: model_id.to_string(),
            rx: transfer.outcome.subscribe(),
        };

        if fresh {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.run(model, transfer).await;
            });
        } else {
            info!("Attached to in-flight download of {}", model_id);
        }
        Ok(handle)
    }

    /// Stop a transfer and discard its partial files. Also discards the
    /// partial files of a paused download.
    pub async fn cancel(&self, model_id: &str) -> bool {
        if let Some(transfer) = self.inner.in_flight.get(model_id).map(|t| t.value().clone()) {
            info!("Cancelling download of {}", model_id);
            transfer.stop(STOP_CANCEL);
            return true;
        }

        let paused = self
            .inner
            .states
            .get(model_id)
            .map(|s| s.status == DownloadStatus::Paused)
            .unwrap_or(false);
        if !paused {
            return false;
        }
        if let Some(model) = self.inner.catalog.get(model_id) {
            self.inner.remove_part_files(model).await;
        }
        self.inner.set_status(model_id, DownloadStatus::Cancelled, None);
        let event = DownloadEvent::Cancelled {
            model_id: model_id.to_string(),
        };
        self.inner.sink.download_event(&event);
        true
    }

    /// Stop a transfer, keeping partial files for `resume`.
    pub fn pause(&self, model_id: &str) -> bool {
        match self.inner.in_flight.get(model_id).map(|t| t.value().clone()) {
            Some(transfer) => {
                info!("Pausing download of {}", model_id);
                transfer.stop(STOP_PAUSE);
                true
            }
            None => false,
        }
    }

    pub fn resume(
        &self,
        model_id: &str,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Result<DownloadHandle, DownloadError> {
        let paused = self
            .inner
            .states
            .get(model_id)
            .map(|s| s.status == DownloadStatus::Paused)
            .unwrap_or(false);
        if paused {
            info!("Resuming download of {}", model_id);
            let event = DownloadEvent::Resumed {
                model_id: model_id.to_string(),
            };
            if let Some(listener) = &listener {
                listener.on_event(&event);
            }
            self.inner.sink.download_event(&event);
        }
        self.start(model_id, listener)
    }

    pub fn state(&self, model_id: &str) -> Option<DownloadState> {
        self.inner.states.get(model_id).map(|s| s.clone())
    }

    /// Delete a model's files and version record. Cancels a running transfer first.
    pub async fn remove_model(&self, model_id: &str) -> Result<bool, DownloadError> {
        let model = self
            .inner
            .catalog
            .get(model_id)
            .ok_or_else(|| DownloadError::UnknownModel(model_id.to_string()))?;

        let running = self.inner.in_flight.get(model_id).map(|t| t.value().clone());
        if let Some(transfer) = running {
            transfer.stop(STOP_CANCEL);
            let mut rx = transfer.outcome.subscribe();
            while rx.borrow().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let removed_record = self
            .inner
            .versions
            .remove(model_id)
            .await
            .map_err(|e| DownloadError::Io {
                file_name: "versions.json".into(),
                message: e.to_string(),
            })?;

        let dir = model.model_dir(&self.inner.models_dir);
        let removed_files = if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| DownloadError::io(model_id, e))?;
            true
        } else {
            false
        };
        self.inner.states.remove(model_id);
        info!("Removed model {}", model_id);
        Ok(removed_record || removed_files)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, model: ModelDefinition, transfer: Arc<Transfer>) {
        metrics::inc_active_downloads();
        let result = match self.transfer_model(&model, &transfer).await {
            Err(_) if transfer.cancel.is_cancelled() => Err(transfer.interruption()),
            other => other,
        };

        let outcome = match result {
            Ok(total_bytes) => {
                info!("Download of {} completed ({} bytes)", model.id, total_bytes);
                self.finish_state(&model.id, DownloadStatus::Completed, None);
                self.emit(&transfer, DownloadEvent::Completed {
                    model_id: model.id.clone(),
                    total_bytes,
                });
                metrics::inc_download("completed");
                Ok(())
            }
            Err(DownloadError::Paused) => {
                info!("Download of {} paused", model.id);
                self.set_status(&model.id, DownloadStatus::Paused, None);
                self.emit(&transfer, DownloadEvent::Paused {
                    model_id: model.id.clone(),
                });
                metrics::inc_download("paused");
                Err(DownloadError::Paused)
            }
            Err(DownloadError::Cancelled) => {
                info!("Download of {} cancelled", model.id);
                self.remove_part_files(&model).await;
                self.set_status(&model.id, DownloadStatus::Cancelled, None);
                self.emit(&transfer, DownloadEvent::Cancelled {
                    model_id: model.id.clone(),
                });
                metrics::inc_download("cancelled");
                Err(DownloadError::Cancelled)
            }
            Err(e) => {
                error!("Download of {} failed: {}", model.id, e);
                self.set_status(&model.id, DownloadStatus::Failed, Some(e.to_string()));
                self.emit(&transfer, DownloadEvent::Failed {
                    model_id: model.id.clone(),
                    file_name: e.file_name().map(str::to_string),
                    error: e.clone(),
                });
                metrics::inc_download("failed");
                Err(e)
            }
        };

        transfer.outcome.send_replace(Some(outcome));
        self.in_flight.remove(&model.id);
        metrics::dec_active_downloads();
    }

    async fn transfer_model(&self, model: &ModelDefinition, transfer: &Transfer) -> Result<u64, DownloadError> {
        let files = model.resolved_files();
        if self.versions.is_ready(model, &self.models_dir).await {
            let total: u64 = files.iter().filter_map(|f| f.size).sum();
            self.states.insert(model.id.clone(), {
                let mut state = DownloadState::queued(&model.id, Vec::new());
                state.status = DownloadStatus::Completed;
                state.progress_percent = 100.0;
                state
            });
            return Ok(total);
        }

        let dir = model.model_dir(&self.models_dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(model.id.clone(), e))?;

        let mut progress = Vec::with_capacity(files.len());
        let mut pending = Vec::new();
        for file in &files {
            let mut entry = FileProgress::new(&file.name, file.size);
            if let Some(len) = completed_len(&dir, file).await {
                debug!("{} already present for {}", file.name, model.id);
                entry.downloaded_bytes = len;
                entry.completed = true;
            } else {
                pending.push(file.clone());
            }
            progress.push(entry);
        }

        let mut state = DownloadState::queued(&model.id, progress);
        state.status = DownloadStatus::Downloading;
        state.refresh_totals();
        let total_bytes = state.total_bytes;
        self.states.insert(model.id.clone(), state);

        info!(
            "Downloading {}: {} files ({} pending)",
            model.id,
            files.len(),
            pending.len()
        );
        self.emit(transfer, DownloadEvent::Started {
            model_id: model.id.clone(),
            total_files: files.len(),
            total_bytes,
        });

        stream::iter(pending.into_iter().map(Ok::<_, DownloadError>))
            .try_for_each_concurrent(self.parallelism, |file| {
                let dir = dir.clone();
                async move { self.fetch_file(&model.id, &dir, &file, transfer).await }
            })
            .await?;

        let mut total = 0;
        for file in &files {
            match verify_file(&dir, file).await {
                Ok(len) => total += len,
                Err(e) => {
                    warn!("Validation of {} failed, purging: {}", model.id, e);
                    if let Err(purge) = tokio::fs::remove_dir_all(&dir).await {
                        error!("Failed to purge {}: {}", dir.display(), purge);
                    }
                    return Err(e);
                }
            }
        }

        self.versions
            .record(model, &self.models_dir)
            .await
            .map_err(|e| DownloadError::Io {
                file_name: "versions.json".into(),
                message: e.to_string(),
            })?;
        Ok(total)
    }

    async fn fetch_file(
        &self,
        model_id: &str,
        dir: &Path,
        file: &ResolvedFile,
        transfer: &Transfer,
    ) -> Result<(), DownloadError> {
        let final_path = dir.join(&file.name);
        let part_path = part_path_for(&final_path);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(file.name.clone(), e))?;
        }

        let mut last_reported = 0u64;
        let mut last_skip = None;
        for url in &file.urls {
            match self
                .fetch_from(model_id, url, &part_path, file, transfer, &mut last_reported)
                .await
            {
                Ok(size) => {
                    tokio::fs::rename(&part_path, &final_path)
                        .await
                        .map_err(|e| DownloadError::io(file.name.clone(), e))?;
                    self.mark_file_completed(model_id, &file.name, size);
                    self.emit(transfer, DownloadEvent::FileCompleted {
                        model_id: model_id.to_string(),
                        file_name: file.name.clone(),
                        size,
                    });
                    return Ok(());
                }
                Err(MirrorError::Skip(e)) => {
                    warn!("Mirror {} unusable for {}: {}", url, file.name, e);
                    last_skip = Some(e);
                }
                Err(MirrorError::Abort(e)) => return Err(e),
            }
        }

        Err(match last_skip {
            Some(e @ DownloadError::Network { .. }) => e,
            _ => DownloadError::FileNotFound {
                file_name: file.name.clone(),
            },
        })
    }

    async fn fetch_from(
        &self,
        model_id: &str,
        url: &str,
        part_path: &Path,
        file: &ResolvedFile,
        transfer: &Transfer,
        last_reported: &mut u64,
    ) -> Result<u64, MirrorError> {
        let name = file.name.as_str();
        let io_err = |e: std::io::Error| MirrorError::Abort(DownloadError::io(name, e));

        let mut offset = tokio::fs::metadata(part_path).await.map(|m| m.len()).unwrap_or(0);
        if let Some(size) = file.size {
            if offset == size && size > 0 {
                debug!("{} fully present in partial file", name);
                return Ok(offset);
            }
            if offset > size {
                warn!("Partial file for {} is larger than declared, restarting", name);
                tokio::fs::remove_file(part_path).await.map_err(io_err)?;
                offset = 0;
            }
        }

        let mut request = self.client.get(url);
        if offset > 0 {
            let range = match file.size {
                Some(size) => format!("bytes={}-{}", offset, size - 1),
                None => format!("bytes={}-", offset),
            };
            info!("Resuming {} at byte {} ({})", name, offset, range);
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => return Err(MirrorError::Abort(transfer.interruption())),
            sent = request.send() => sent.map_err(|e| MirrorError::Skip(DownloadError::Network {
                file_name: name.to_string(),
                message: e.to_string(),
            }))?,
        };

        let status = response.status();
        let append = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK => {
                if offset > 0 {
                    warn!("Server ignored range request for {}, restarting from zero", name);
                }
                offset = 0;
                false
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(MirrorError::Skip(DownloadError::FileNotFound {
                    file_name: name.to_string(),
                }))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let _ = tokio::fs::remove_file(part_path).await;
                return Err(MirrorError::Abort(DownloadError::Network {
                    file_name: name.to_string(),
                    message: "range not satisfiable; partial file discarded".into(),
                }));
            }
            other => {
                return Err(MirrorError::Abort(DownloadError::Network {
                    file_name: name.to_string(),
                    message: format!("HTTP {}", other),
                }))
            }
        };

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part_path)
            .await
            .map_err(io_err)?;

        let mut written = offset;
        let mut body = Box::pin(response.bytes_stream());
        loop {
            let next = tokio::select! {
                biased;
                _ = transfer.cancel.cancelled() => {
                    let _ = out.flush().await;
                    return Err(MirrorError::Abort(transfer.interruption()));
                }
                chunk = body.next() => chunk,
            };
            match next {
                Some(Ok(chunk)) => {
                    out.write_all(&chunk).await.map_err(io_err)?;
                    written += chunk.len() as u64;
                    metrics::add_downloaded_bytes(chunk.len() as u64);
                    self.report_progress(transfer, model_id, file, written, last_reported);
                }
                Some(Err(e)) => {
                    let _ = out.flush().await;
                    return Err(MirrorError::Abort(DownloadError::Network {
                        file_name: name.to_string(),
                        message: e.to_string(),
                    }));
                }
                None => break,
            }
        }
        out.flush().await.map_err(io_err)?;
        out.sync_all().await.map_err(io_err)?;

        if let Some(size) = file.size {
            if written < size {
                return Err(MirrorError::Abort(DownloadError::Network {
                    file_name: name.to_string(),
                    message: format!("connection closed after {} of {} bytes", written, size),
                }));
            }
            if written > size {
                let _ = tokio::fs::remove_file(part_path).await;
                return Err(MirrorError::Abort(DownloadError::ValidationFailed {
                    file_name: name.to_string(),
                    reason: format!("received {} bytes, expected {}", written, size),
                }));
            }
        }
        Ok(written)
    }

    fn report_progress(
        &self,
        transfer: &Transfer,
        model_id: &str,
        file: &ResolvedFile,
        file_bytes: u64,
        last_reported: &mut u64,
    ) {
        let now = Instant::now();
        let update = self.states.get_mut(model_id).and_then(|mut state| {
            if let Some(entry) = state.file_mut(&file.name) {
                entry.downloaded_bytes = file_bytes;
            }
            state.refresh_totals();
            state.current_file = Some(file.name.clone());

            let mut sampler = transfer.sampler.lock().ok()?;
            sampler.record(now, state.downloaded_bytes);
            state.speed_bps = sampler.bytes_per_second();
            let remaining = state.total_bytes.map(|t| t.saturating_sub(state.downloaded_bytes));
            state.eta_seconds = sampler.eta_seconds(remaining);

            let emit = file_bytes > *last_reported && sampler.should_emit(now);
            emit.then(|| (state.progress_percent, state.speed_bps, state.eta_seconds))
        });

        if let Some((overall_percent, speed_bps, eta_seconds)) = update {
            *last_reported = file_bytes;
            self.emit(transfer, DownloadEvent::Progress {
                model_id: model_id.to_string(),
                file_name: file.name.clone(),
                file_downloaded: file_bytes,
                file_total: file.size,
                overall_percent,
                speed_bps,
                eta_seconds,
            });
        }
    }

    fn mark_file_completed(&self, model_id: &str, file_name: &str, size: u64) {
        if let Some(mut state) = self.states.get_mut(model_id) {
            if let Some(entry) = state.file_mut(file_name) {
                entry.downloaded_bytes = size;
                entry.completed = true;
            }
            state.refresh_totals();
        }
    }

    fn set_status(&self, model_id: &str, status: DownloadStatus, error: Option<String>) {
        if let Some(mut state) = self.states.get_mut(model_id) {
            state.status = status;
            state.error = error;
            state.speed_bps = 0.0;
            state.eta_seconds = None;
        }
    }

    fn finish_state(&self, model_id: &str, status: DownloadStatus, error: Option<String>) {
        self.set_status(model_id, status, error);
        if let Some(mut state) = self.states.get_mut(model_id) {
            state.current_file = None;
            state.progress_percent = 100.0;
        }
    }

    fn emit(&self, transfer: &Transfer, event: DownloadEvent) {
        let listeners = transfer
            .listeners
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener.on_event(&event);
        }
        self.sink.download_event(&event);
    }

    async fn remove_part_files(&self, model: &ModelDefinition) {
        let dir = model.model_dir(&self.models_dir);
        for file in model.resolved_files() {
            let part = part_path_for(&dir.join(&file.name));
            match tokio::fs::remove_file(&part).await {
                Ok(()) => debug!("Removed {}", part.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", part.display(), e),
            }
        }
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Length of a finished file that can be kept as-is.
async fn completed_len(dir: &Path, file: &ResolvedFile) -> Option<u64> {
    let len = tokio::fs::metadata(dir.join(&file.name)).await.ok()?.len();
    match file.size {
        Some(size) if size == len => Some(len),
        None if len > 0 => Some(len),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_store::catalog::{EntryPoint, EntryPointKind, ModelFile};
    use crate::status::TracingStatusSink;

    fn model(id: &str, files: Vec<ModelFile>) -> ModelDefinition {
        let entry = files[0].file_name.clone().unwrap_or_default();
        ModelDefinition {
            id: id.into(),
            runner: "cpu_llm".into(),
            backend: "llama.cpp".into(),
            ram_gb: 1.0,
            files,
            entry_point: EntryPoint {
                kind: EntryPointKind::File,
                value: entry,
            },
            capabilities: vec![],
        }
    }

    fn manager(dir: &Path, models: Vec<ModelDefinition>) -> DownloadManager {
        let mut config = EngineConfig::with_models_dir(dir);
        config.progress_sample_ms = 1;
        let catalog = Arc::new(ModelCatalog::from_models(models).unwrap());
        let versions = Arc::new(ModelVersionStore::open(config.version_store_path.clone()).unwrap());
        DownloadManager::new(catalog, versions, &config, Arc::new(TracingStatusSink)).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<DownloadEvent>>>, Arc<dyn DownloadListener>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn DownloadListener> = Arc::new(move |e: &DownloadEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (events, listener)
    }

    #[tokio::test]
    async fn test_download_validates_and_records() {
        let mut server = mockito::Server::new_async().await;
        let a = server.mock("GET", "/a.bin").with_body("aaaa").create_async().await;
        let b = server.mock("GET", "/b.json").with_body("{}").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let m = model(
            "m1",
            vec![
                ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())]).with_size(4),
                ModelFile::single("b.json", &[&format!("{}/b.json", server.url())]),
            ],
        );
        let manager = manager(dir.path(), vec![m]);
        let (events, listener) = recorder();

        manager.download("m1", Some(listener)).await.unwrap();

        a.assert_async().await;
        b.assert_async().await;
        assert!(manager.is_ready("m1").await);
        assert_eq!(std::fs::read(dir.path().join("m1/a.bin")).unwrap(), b"aaaa");
        assert!(!dir.path().join("m1/a.bin.part").exists());

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(DownloadEvent::Started { total_files: 2, .. })));
        assert!(matches!(events.last(), Some(DownloadEvent::Completed { total_bytes: 6, .. })));
        let completed_files = events
            .iter()
            .filter(|e| matches!(e, DownloadEvent::FileCompleted { .. }))
            .count();
        assert_eq!(completed_files, 2);
        assert_eq!(manager.state("m1").unwrap().status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_mirror_fallback_on_404() {
        let mut server = mockito::Server::new_async().await;
        let missing = server.mock("GET", "/primary/a.bin").with_status(404).create_async().await;
        let mirror = server.mock("GET", "/mirror/a.bin").with_body("data").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let m = model(
            "m1",
            vec![ModelFile::single(
                "a.bin",
                &[
                    &format!("{}/primary/a.bin", server.url()),
                    &format!("{}/mirror/a.bin", server.url()),
                ],
            )],
        );
        let manager = manager(dir.path(), vec![m]);

        manager.ensure_ready("m1").await.unwrap();
        missing.assert_async().await;
        mirror.assert_async().await;
    }

    #[tokio::test]
    async fn test_all_mirrors_missing_reports_file() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server.mock("GET", "/a.bin").with_status(404).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let m = model("m1", vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())])]);
        let manager = manager(dir.path(), vec![m]);
        let (events, listener) = recorder();

        let err = manager.download("m1", Some(listener)).await.unwrap_err();
        assert_eq!(
            err,
            DownloadError::FileNotFound {
                file_name: "a.bin".into()
            }
        );
        assert!(!manager.is_ready("m1").await);
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(DownloadEvent::Failed { file_name: Some(name), .. }) if name == "a.bin"
        ));
        assert_eq!(manager.state("m1").unwrap().status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_checksum_failure_purges_model() {
        let mut server = mockito::Server::new_async().await;
        let _a = server.mock("GET", "/a.bin").with_body("tampered").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let m = model(
            "m1",
            vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())]).with_sha256(&"0".repeat(64))],
        );
        let manager = manager(dir.path(), vec![m]);

        let err = manager.ensure_ready("m1").await.unwrap_err();
        assert!(matches!(err, DownloadError::ValidationFailed { .. }));
        assert!(!dir.path().join("m1").exists());
        assert!(!manager.is_ready("m1").await);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_transfer() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![7u8; 64 * 1024];
        let a = server
            .mock("GET", "/a.bin")
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let m = model("m1", vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())])]);
        let manager = manager(dir.path(), vec![m]);

        let first = manager.start("m1", None).unwrap();
        let second = manager.start("m1", None).unwrap();

        let (r1, r2) = tokio::join!(first.wait(), second.wait());
        assert!(r1.is_ok());
        assert_eq!(r1, r2);
        a.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), vec![]);
        assert_eq!(
            manager.ensure_ready("ghost").await,
            Err(DownloadError::UnknownModel("ghost".into()))
        );
        assert!(!manager.cancel("ghost").await);
        assert!(!manager.pause("ghost"));
    }

    #[tokio::test]
    async fn test_remove_model_deletes_files_and_record() {
        let mut server = mockito::Server::new_async().await;
        let _a = server.mock("GET", "/a.bin").with_body("abc").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let m = model("m1", vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())])]);
        let manager = manager(dir.path(), vec![m]);

        manager.ensure_ready("m1").await.unwrap();
        assert!(manager.remove_model("m1").await.unwrap());
        assert!(!manager.is_ready("m1").await);
        assert!(!dir.path().join("m1").exists());
        assert!(!manager.remove_model("m1").await.unwrap());
    }

    /// 5000 bytes in 100-byte chunks, slowly enough to interrupt.
    fn slow_body(w: &mut dyn std::io::Write) -> std::io::Result<()> {
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            w.write_all(&[7u8; 100])?;
            w.flush()?;
        }
        Ok(())
    }

    async fn wait_for_part_bytes(path: &Path, min: u64) -> u64 {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(meta) = tokio::fs::metadata(path).await {
                    if meta.len() >= min {
                        return meta.len();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_discards_partial_file() {
        let mut server = mockito::Server::new_async().await;
        let _slow = server
            .mock("GET", "/a.bin")
            .with_chunked_body(slow_body)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let m = model(
            "m1",
            vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())]).with_size(5000)],
        );
        let manager = manager(dir.path(), vec![m]);
        let (events, listener) = recorder();
        let part = dir.path().join("m1/a.bin.part");

        let handle = manager.start("m1", Some(listener)).unwrap();
        wait_for_part_bytes(&part, 100).await;
        assert!(manager.cancel("m1").await);

        assert_eq!(handle.wait().await, Err(DownloadError::Cancelled));
        assert!(!part.exists());
        assert!(!dir.path().join("m1/a.bin").exists());
        assert_eq!(manager.state("m1").unwrap().status, DownloadStatus::Cancelled);
        assert!(!manager.is_ready("m1").await);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(DownloadEvent::Cancelled { .. })
        ));
        assert!(!manager.cancel("m1").await);
    }

    #[tokio::test]
    async fn test_pause_then_resume_continues_from_offset() {
        let mut server = mockito::Server::new_async().await;
        let _slow = server
            .mock("GET", "/a.bin")
            .match_header("range", mockito::Matcher::Missing)
            .with_chunked_body(slow_body)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let m = model(
            "m1",
            vec![ModelFile::single("a.bin", &[&format!("{}/a.bin", server.url())]).with_size(5000)],
        );
        let manager = manager(dir.path(), vec![m]);
        let (events, listener) = recorder();
        let part = dir.path().join("m1/a.bin.part");

        let handle = manager.start("m1", Some(listener.clone())).unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_ready("m1").await })
        };
        wait_for_part_bytes(&part, 200).await;
        assert!(manager.pause("m1"));

        assert_eq!(handle.wait().await, Err(DownloadError::Paused));
        assert_eq!(waiter.await.unwrap(), Err(DownloadError::Paused));
        assert_eq!(manager.state("m1").unwrap().status, DownloadStatus::Paused);
        let offset = std::fs::metadata(&part).unwrap().len();
        assert!(offset > 0 && offset < 5000, "offset {}", offset);

        let rest = server
            .mock("GET", "/a.bin")
            .match_header("range", format!("bytes={}-4999", offset).as_str())
            .with_status(206)
            .with_body(vec![7u8; (5000 - offset) as usize])
            .expect(1)
            .create_async()
            .await;

        manager.resume("m1", Some(listener)).unwrap().wait().await.unwrap();

        rest.assert_async().await;
        assert_eq!(std::fs::read(dir.path().join("m1/a.bin")).unwrap(), vec![7u8; 5000]);
        assert!(!part.exists());
        assert!(manager.is_ready("m1").await);

        let events = events.lock().unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        let paused = names.iter().position(|n| *n == "paused").unwrap();
        let resumed = names.iter().position(|n| *n == "resumed").unwrap();
        assert!(paused < resumed);
        assert!(matches!(events.last(), Some(DownloadEvent::Completed { total_bytes: 5000, .. })));
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path_for(Path::new("/m/a.bin")),
            PathBuf::from("/m/a.bin.part")
        );
    }
}
