use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct Metrics {
    requests: IntCounterVec,
    in_flight_requests: IntGauge,
    request_duration: Histogram,
    downloads: IntCounterVec,
    active_downloads: IntGauge,
    downloaded_bytes: IntCounter,
    runner_loads: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build() -> prometheus::Result<Metrics> {
    let metrics = Metrics {
        requests: IntCounterVec::new(
            prometheus::opts!("inference_requests_total", "Inference requests by capability and outcome"),
            &["capability", "outcome"],
        )?,
        in_flight_requests: IntGauge::new("inference_requests_in_flight", "Requests currently tracked")?,
        request_duration: Histogram::with_opts(HistogramOpts::new(
            "inference_request_duration_seconds",
            "Time from admission to terminal result",
        ))?,
        downloads: IntCounterVec::new(
            prometheus::opts!("model_downloads_total", "Finished model downloads by outcome"),
            &["outcome"],
        )?,
        active_downloads: IntGauge::new("model_downloads_active", "Model downloads in flight")?,
        downloaded_bytes: IntCounter::new("model_downloaded_bytes_total", "Bytes written by model downloads")?,
        runner_loads: IntCounterVec::new(
            prometheus::opts!("runner_loads_total", "Runner load attempts by runner and outcome"),
            &["runner", "outcome"],
        )?,
    };

    REGISTRY.register(Box::new(metrics.requests.clone()))?;
    REGISTRY.register(Box::new(metrics.in_flight_requests.clone()))?;
    REGISTRY.register(Box::new(metrics.request_duration.clone()))?;
    REGISTRY.register(Box::new(metrics.downloads.clone()))?;
    REGISTRY.register(Box::new(metrics.active_downloads.clone()))?;
    REGISTRY.register(Box::new(metrics.downloaded_bytes.clone()))?;
    REGISTRY.register(Box::new(metrics.runner_loads.clone()))?;
    Ok(metrics)
}

/// Register collectors. Safe to call more than once.
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }
    match build() {
        Ok(metrics) => {
            let _ = METRICS.set(metrics);
        }
        Err(e) => warn!("Metrics disabled: {}", e),
    }
}

pub fn inc_request(capability: &str, outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.requests.with_label_values(&[capability, outcome]).inc();
    }
}

pub fn inc_in_flight() {
    if let Some(m) = METRICS.get() {
        m.in_flight_requests.inc();
    }
}

pub fn dec_in_flight() {
    if let Some(m) = METRICS.get() {
        m.in_flight_requests.dec();
    }
}

pub fn observe_request_duration(seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.request_duration.observe(seconds);
    }
}

pub fn inc_download(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.downloads.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_active_downloads() {
    if let Some(m) = METRICS.get() {
        m.active_downloads.inc();
    }
}

pub fn dec_active_downloads() {
    if let Some(m) = METRICS.get() {
        m.active_downloads.dec();
    }
}

pub fn add_downloaded_bytes(bytes: u64) {
    if let Some(m) = METRICS.get() {
        m.downloaded_bytes.inc_by(bytes);
    }
}

pub fn inc_runner_load(runner: &str, outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.runner_loads.with_label_values(&[runner, outcome]).inc();
    }
}

/// Prometheus text exposition of every registered collector.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
