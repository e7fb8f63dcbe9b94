//! Outbound status events for the host (notifications, indicators, logs).
//!
//! The core only pushes into a [`StatusSink`]; nothing flows back.

use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::model_store::progress::DownloadEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Started {
        request_id: String,
        capability: Capability,
    },
    Finished {
        request_id: String,
        capability: Capability,
        runner: Option<String>,
        success: bool,
        elapsed_ms: u64,
    },
    Cancelled {
        request_id: String,
        capability: Capability,
    },
}

pub trait StatusSink: Send + Sync {
    fn request_event(&self, _event: &RequestEvent) {}

    fn download_event(&self, _event: &DownloadEvent) {}
}

/// Sink that records events as tracing output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn request_event(&self, event: &RequestEvent) {
        match event {
            RequestEvent::Started { request_id, capability } => {
                debug!("Request {} started ({})", request_id, capability)
            }
            RequestEvent::Finished {
                request_id,
                runner,
                success,
                elapsed_ms,
                ..
            } => debug!(
                "Request {} finished on {} in {}ms (success: {})",
                request_id,
                runner.as_deref().unwrap_or("-"),
                elapsed_ms,
                success
            ),
            RequestEvent::Cancelled { request_id, .. } => info!("Request {} cancelled", request_id),
        }
    }

    fn download_event(&self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Progress {
                model_id,
                file_name,
                overall_percent,
                speed_bps,
                ..
            } => debug!(
                "Download {}: {} {:.1}% ({:.0} B/s)",
                model_id, file_name, overall_percent, speed_bps
            ),
            DownloadEvent::Failed { model_id, error, .. } => {
                warn!("Download {} failed: {}", model_id, error)
            }
            other => info!("Download {}: {}", other.model_id(), other.name()),
        }
    }
}
