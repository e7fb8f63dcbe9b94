//! Error taxonomy for runners and model downloads.
//!
//! Runner failures never escape the core as raw errors: they are carried as
//! [`RunnerError`] values inside a terminal `InferenceResult`. Download failures
//! use the parallel [`DownloadError`] taxonomy and reach callers through the
//! listener interface and the `ensure_ready` outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerErrorCode {
    ModelNotLoaded,
    InvalidInput,
    ResourceUnavailable,
    ProcessingError,
    AuthenticationError,
    NetworkError,
    QuotaExceeded,
    ValidationError,
}

impl RunnerErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerErrorCode::ModelNotLoaded => "model_not_loaded",
            RunnerErrorCode::InvalidInput => "invalid_input",
            RunnerErrorCode::ResourceUnavailable => "resource_unavailable",
            RunnerErrorCode::ProcessingError => "processing_error",
            RunnerErrorCode::AuthenticationError => "authentication_error",
            RunnerErrorCode::NetworkError => "network_error",
            RunnerErrorCode::QuotaExceeded => "quota_exceeded",
            RunnerErrorCode::ValidationError => "validation_error",
        }
    }
}

impl fmt::Display for RunnerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced at the runner boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RunnerError {
    pub code: RunnerErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl RunnerError {
    pub fn new(code: RunnerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn model_not_loaded(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::ModelNotLoaded, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::InvalidInput, message)
    }

    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::ResourceUnavailable, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::ProcessingError, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::AuthenticationError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::NetworkError, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::QuotaExceeded, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorCode::ValidationError, message)
    }
}

/// Failure of a model download. Cloneable so every listener attached to a
/// deduplicated transfer observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("file not found on any mirror: {file_name}")]
    FileNotFound { file_name: String },

    #[error("network error while downloading {file_name}: {message}")]
    Network { file_name: String, message: String },

    #[error("validation failed for {file_name}: {reason}")]
    ValidationFailed { file_name: String, reason: String },

    #[error("I/O error on {file_name}: {message}")]
    Io { file_name: String, message: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("download paused")]
    Paused,
}

impl DownloadError {
    /// Name of the file that caused the failure, when known.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            DownloadError::FileNotFound { file_name }
            | DownloadError::Network { file_name, .. }
            | DownloadError::ValidationFailed { file_name, .. }
            | DownloadError::Io { file_name, .. } => Some(file_name),
            _ => None,
        }
    }

    pub fn io(file_name: impl Into<String>, err: std::io::Error) -> Self {
        DownloadError::Io {
            file_name: file_name.into(),
            message: err.to_string(),
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, DownloadError::Cancelled | DownloadError::Paused)
    }
}

impl From<DownloadError> for RunnerError {
    fn from(err: DownloadError) -> Self {
        let code = match err {
            DownloadError::UnknownModel(_) => RunnerErrorCode::ResourceUnavailable,
            _ => RunnerErrorCode::ModelNotLoaded,
        };
        RunnerError::new(code, "model is not ready for inference").with_cause(err)
    }
}
