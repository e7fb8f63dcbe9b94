//! Download state, events and progress math.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub name: String,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub completed: bool,
}

impl FileProgress {
    pub fn new(name: &str, total_bytes: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            downloaded_bytes: 0,
            total_bytes,
            completed: false,
        }
    }

    fn fraction(&self) -> f64 {
        if self.completed {
            return 1.0;
        }
        match self.total_bytes {
            Some(total) if total > 0 => (self.downloaded_bytes as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Snapshot of one model's download, owned by the download manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub model_id: String,
    pub status: DownloadStatus,
    pub files: Vec<FileProgress>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub progress_percent: f32,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub error: Option<String>,
}

impl DownloadState {
    pub fn queued(model_id: &str, files: Vec<FileProgress>) -> Self {
        let total_bytes = files.iter().map(|f| f.total_bytes).sum();
        Self {
            model_id: model_id.to_string(),
            status: DownloadStatus::Queued,
            files,
            downloaded_bytes: 0,
            total_bytes,
            progress_percent: 0.0,
            speed_bps: 0.0,
            eta_seconds: None,
            current_file: None,
            error: None,
        }
    }

    /// Recompute aggregate fields from per-file progress.
    pub fn refresh_totals(&mut self) {
        self.downloaded_bytes = self.files.iter().map(|f| f.downloaded_bytes).sum();
        self.progress_percent = aggregate_percent(&self.files);
    }

    pub fn file_mut(&mut self, name: &str) -> Option<&mut FileProgress> {
        self.files.iter_mut().find(|f| f.name == name)
    }
}

/// Overall percentage. Byte-weighted when every file declares a size;
/// otherwise weighted by file count, with in-flight files contributing their
/// known byte fraction.
pub fn aggregate_percent(files: &[FileProgress]) -> f32 {
    if files.is_empty() {
        return 100.0;
    }
    let declared: Option<u64> = files.iter().map(|f| f.total_bytes).sum();
    let ratio = match declared {
        Some(total) if total > 0 => {
            let done: u64 = files
                .iter()
                .map(|f| {
                    let cap = f.total_bytes.unwrap_or(0);
                    if f.completed {
                        cap
                    } else {
                        f.downloaded_bytes.min(cap)
                    }
                })
                .sum();
            done as f64 / total as f64
        }
        _ => files.iter().map(FileProgress::fraction).sum::<f64>() / files.len() as f64,
    };
    (ratio * 100.0).clamp(0.0, 100.0) as f32
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        model_id: String,
        total_files: usize,
        total_bytes: Option<u64>,
    },
    Progress {
        model_id: String,
        file_name: String,
        file_downloaded: u64,
        file_total: Option<u64>,
        overall_percent: f32,
        speed_bps: f64,
        eta_seconds: Option<u64>,
    },
    FileCompleted {
        model_id: String,
        file_name: String,
        size: u64,
    },
    Completed {
        model_id: String,
        total_bytes: u64,
    },
    Failed {
        model_id: String,
        file_name: Option<String>,
        error: DownloadError,
    },
    Paused {
        model_id: String,
    },
    Resumed {
        model_id: String,
    },
    Cancelled {
        model_id: String,
    },
}

impl DownloadEvent {
    pub fn model_id(&self) -> &str {
        match self {
            DownloadEvent::Started { model_id, .. }
            | DownloadEvent::Progress { model_id, .. }
            | DownloadEvent::FileCompleted { model_id, .. }
            | DownloadEvent::Completed { model_id, .. }
            | DownloadEvent::Failed { model_id, .. }
            | DownloadEvent::Paused { model_id }
            | DownloadEvent::Resumed { model_id }
            | DownloadEvent::Cancelled { model_id } => model_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::FileCompleted { .. } => "file_completed",
            DownloadEvent::Completed { .. } => "completed",
            DownloadEvent::Failed { .. } => "failed",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::Resumed { .. } => "resumed",
            DownloadEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Receives download events. Called from the transfer task; keep it quick.
pub trait DownloadListener: Send + Sync {
    fn on_event(&self, event: &DownloadEvent);
}

impl<F> DownloadListener for F
where
    F: Fn(&DownloadEvent) + Send + Sync,
{
    fn on_event(&self, event: &DownloadEvent) {
        self(event)
    }
}

/// Transfer rate over a sliding window of byte-count samples.
#[derive(Debug)]
pub struct SpeedSampler {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl SpeedSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            last_emit: None,
        }
    }

    /// Record the cumulative byte count at `now`.
    pub fn record(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push_back((now, total_bytes));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _)) if now.duration_since(*t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((t0, b0)), Some((t1, b1))) if t1 > t0 => {
                let secs = t1.duration_since(*t0).as_secs_f64();
                b1.saturating_sub(*b0) as f64 / secs
            }
            _ => 0.0,
        }
    }

    pub fn eta_seconds(&self, remaining_bytes: Option<u64>) -> Option<u64> {
        let speed = self.bytes_per_second();
        match remaining_bytes {
            Some(remaining) if speed > 0.0 => Some((remaining as f64 / speed).ceil() as u64),
            _ => None,
        }
    }

    /// True at most once per window; throttles progress events.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, done: u64, total: Option<u64>, completed: bool) -> FileProgress {
        FileProgress {
            name: name.into(),
            downloaded_bytes: done,
            total_bytes: total,
            completed,
        }
    }

    #[test]
    fn test_aggregate_is_byte_weighted_with_known_sizes() {
        let files = vec![
            file("a.bin", 800, Some(2000), false),
            file("b.json", 50, Some(50), true),
        ];
        let pct = aggregate_percent(&files);
        assert!((pct - (850.0 / 2050.0 * 100.0) as f32).abs() < 0.01);
    }

    #[test]
    fn test_aggregate_falls_back_to_file_count() {
        let files = vec![
            file("a.bin", 500, Some(1000), false),
            file("b.json", 10, None, true),
            file("c.txt", 10, None, false),
        ];
        let pct = aggregate_percent(&files);
        assert!((pct - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_and_eta() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::new(Duration::from_millis(500));
        sampler.record(start, 0);
        sampler.record(start + Duration::from_millis(250), 500);
        sampler.record(start + Duration::from_millis(500), 1000);

        let speed = sampler.bytes_per_second();
        assert!((speed - 2000.0).abs() < 1.0);
        assert_eq!(sampler.eta_seconds(Some(4000)), Some(2));
        assert_eq!(sampler.eta_seconds(None), None);
    }

    #[test]
    fn test_should_emit_throttles() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::new(Duration::from_millis(500));
        assert!(sampler.should_emit(start));
        assert!(!sampler.should_emit(start + Duration::from_millis(100)));
        assert!(sampler.should_emit(start + Duration::from_millis(600)));
    }

    #[test]
    fn test_closure_listener() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let listener = move |_: &DownloadEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        listener.on_event(&DownloadEvent::Paused { model_id: "m".into() });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
