use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::runner::types::ParamMap;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub models_dir: PathBuf,
    pub model_catalog: Option<PathBuf>,
    pub runner_registry: Option<PathBuf>,
    pub version_store_path: PathBuf,
    pub engine_settings_path: Option<PathBuf>,
    pub stream_buffer: usize,
    pub download_parallelism: usize,
    pub download_timeout_seconds: u64,
    pub progress_sample_ms: u64,
    pub remote_api_base: String,
    pub remote_api_key: Option<String>,
    pub local_runtime_bin: Option<PathBuf>,
    pub local_runtime_host: String,
    pub local_runtime_port: u16,
    pub threads: u32,
    pub npu_available: bool,
    pub gpu_available: bool,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let models_dir = PathBuf::from(env::var("MODELS_DIR").unwrap_or_else(|_| "./models".into()));
        let version_store_path = env::var("VERSION_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| models_dir.join("versions.json"));

        let threads = if env::var("THREADS").unwrap_or_else(|_| "auto".into()) == "auto" {
            Self::auto_detect_threads()
        } else {
            env::var("THREADS").unwrap_or_else(|_| "4".into()).parse().unwrap_or(4)
        };

        let local_runtime_bin = optional_path("LOCAL_RUNTIME_BIN");
        if let Some(bin) = &local_runtime_bin {
            if !bin.exists() {
                warn!("LOCAL_RUNTIME_BIN set but binary doesn't exist: {}", bin.display());
            }
        }

        Ok(Self {
            models_dir,
            model_catalog: optional_path("MODEL_CATALOG"),
            runner_registry: optional_path("RUNNER_REGISTRY"),
            version_store_path,
            engine_settings_path: optional_path("ENGINE_SETTINGS"),
            stream_buffer: env::var("STREAM_BUFFER")
                .unwrap_or_else(|_| "32".into())
                .parse()
                .context("STREAM_BUFFER must be a positive integer")?,
            download_parallelism: env::var("DOWNLOAD_PARALLELISM")
                .unwrap_or_else(|_| "2".into())
                .parse()
                .context("DOWNLOAD_PARALLELISM must be a positive integer")?,
            download_timeout_seconds: env::var("DOWNLOAD_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()?,
            progress_sample_ms: env::var("PROGRESS_SAMPLE_MS")
                .unwrap_or_else(|_| "500".into())
                .parse()?,
            remote_api_base: env::var("REMOTE_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com".into()),
            remote_api_key: env::var("REMOTE_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            local_runtime_bin,
            local_runtime_host: env::var("LOCAL_RUNTIME_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            local_runtime_port: env::var("LOCAL_RUNTIME_PORT")
                .unwrap_or_else(|_| "8081".into())
                .parse()?,
            threads,
            npu_available: env_flag("NPU_AVAILABLE"),
            gpu_available: env_flag("GPU_AVAILABLE"),
        })
    }

    /// Configuration rooted at `models_dir` with every other value at its default.
    pub fn with_models_dir(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        Self {
            version_store_path: models_dir.join("versions.json"),
            models_dir,
            model_catalog: None,
            runner_registry: None,
            engine_settings_path: None,
            stream_buffer: 32,
            download_parallelism: 2,
            download_timeout_seconds: 3600,
            progress_sample_ms: 500,
            remote_api_base: "https://api.openai.com".to_string(),
            remote_api_key: None,
            local_runtime_bin: None,
            local_runtime_host: "127.0.0.1".to_string(),
            local_runtime_port: 8081,
            threads: 4,
            npu_available: false,
            gpu_available: false,
        }
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            1..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            _ => 8,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Models Dir: {}", self.models_dir.display());
        info!("- Version Store: {}", self.version_store_path.display());
        info!(
            "- Model Catalog: {}",
            self.model_catalog
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in".into())
        );
        info!(
            "- Runner Registry: {}",
            self.runner_registry
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in".into())
        );
        info!("- Stream Buffer: {}", self.stream_buffer);
        info!("- Download Parallelism: {}", self.download_parallelism);
        info!("- Download Timeout: {}s", self.download_timeout_seconds);
        info!("- Remote API: {}", self.remote_api_base);
        info!("- Remote API Key: {}", if self.remote_api_key.is_some() { "set" } else { "unset" });
        info!(
            "- Local Runtime: {}",
            self.local_runtime_bin
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".into())
        );
        info!("- Threads: {}", self.threads);
        info!("- NPU: {}, GPU: {}", self.npu_available, self.gpu_available);
    }

    pub fn local_runtime_url(&self) -> String {
        format!("http://{}:{}", self.local_runtime_host, self.local_runtime_port)
    }
}

fn optional_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Engine-level overrides for one runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub params: ParamMap,
}

/// Mutable engine settings. Replaced as a whole snapshot, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSettings>,
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine settings: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid engine settings: {}", path.display()))
    }

    pub fn for_runner(&self, runner: &str) -> Option<&RunnerSettings> {
        self.runners.get(runner)
    }

    pub fn overrides_for(&self, runner: &str) -> ParamMap {
        self.for_runner(runner)
            .map(|s| s.params.clone())
            .unwrap_or_default()
    }

    pub fn model_for(&self, runner: &str) -> Option<&str> {
        self.for_runner(runner).and_then(|s| s.model_id.as_deref())
    }

    pub fn with_runner(mut self, runner: &str, settings: RunnerSettings) -> Self {
        self.runners.insert(runner.to_string(), settings);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_config() -> EngineConfig {
        EngineConfig::with_models_dir("/tmp/edge-models")
    }

    #[test]
    fn test_config_defaults() {
        let config = create_test_config();
        assert_eq!(config.stream_buffer, 32);
        assert_eq!(config.download_parallelism, 2);
        assert_eq!(config.progress_sample_ms, 500);
        assert_eq!(
            config.version_store_path,
            PathBuf::from("/tmp/edge-models/versions.json")
        );
    }

    #[test]
    fn test_local_runtime_url() {
        let config = create_test_config();
        assert_eq!(config.local_runtime_url(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_auto_detect_threads_is_positive() {
        assert!(EngineConfig::auto_detect_threads() >= 1);
    }

    #[test]
    fn test_engine_settings_parse() {
        let settings: EngineSettings = serde_json::from_value(json!({
            "runners": {
                "cpu_llm": {
                    "model_id": "qwen-0.5b",
                    "params": {"temperature": 0.2}
                }
            }
        }))
        .unwrap();

        assert_eq!(settings.model_for("cpu_llm"), Some("qwen-0.5b"));
        assert_eq!(settings.overrides_for("cpu_llm").get("temperature"), Some(&json!(0.2)));
        assert!(settings.overrides_for("mock_llm").is_empty());
    }

    #[test]
    fn test_engine_settings_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"runners":{"remote_llm":{"api_key":"sk-test"}}}"#).unwrap();

        let settings = EngineSettings::load(&path).unwrap();
        assert_eq!(
            settings.for_runner("remote_llm").and_then(|s| s.api_key.as_deref()),
            Some("sk-test")
        );
        assert!(EngineSettings::load(&dir.path().join("missing.json")).is_err());
    }
}
