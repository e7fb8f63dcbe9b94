//! Request and result types shared by every runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::RunnerError;

/// Named execution parameters. Ordered so resolution output is deterministic.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// A named input or output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// One inference call. Built once by the caller; the orchestrator derives a
/// copy carrying the resolved parameters instead of mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub session_id: String,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub params: ParamMap,
    pub timestamp: DateTime<Utc>,
}

impl InferenceRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            inputs: HashMap::new(),
            params: ParamMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// New request with a random session id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_text)
    }

    /// The primary text input: `prompt`, then `text`.
    pub fn prompt(&self) -> Option<&str> {
        self.text("prompt").or_else(|| self.text("text"))
    }

    pub(crate) fn with_resolved_params(&self, params: ParamMap) -> Self {
        Self {
            session_id: self.session_id.clone(),
            inputs: self.inputs.clone(),
            params,
            timestamp: self.timestamp,
        }
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(|v| v.as_bool())
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(|v| v.as_f64())
    }

    pub fn param_u64(&self, name: &str) -> Option<u64> {
        self.params.get(name).and_then(|v| v.as_u64())
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }
}

const CANCELLED_KEY: &str = "cancelled";

/// One element of a result stream.
///
/// A stream is zero or more results with `partial == true` followed by exactly
/// one terminal result (`partial == false` or `error.is_some()`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceResult {
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunnerError>,
}

impl InferenceResult {
    pub fn partial(outputs: HashMap<String, Value>) -> Self {
        Self {
            outputs,
            partial: true,
            ..Default::default()
        }
    }

    pub fn complete(outputs: HashMap<String, Value>) -> Self {
        Self {
            outputs,
            partial: false,
            ..Default::default()
        }
    }

    pub fn failure(error: RunnerError) -> Self {
        Self {
            partial: false,
            error: Some(error),
            ..Default::default()
        }
    }

    /// Terminal stand-in for a request that was cancelled before finishing.
    pub fn cancelled() -> Self {
        Self::complete(HashMap::new()).with_metadata(CANCELLED_KEY, "true")
    }

    pub fn text_partial(key: &str, text: impl Into<String>) -> Self {
        Self::partial(HashMap::from([(key.to_string(), Value::Text(text.into()))]))
    }

    pub fn text_complete(key: &str, text: impl Into<String>) -> Self {
        Self::complete(HashMap::from([(key.to_string(), Value::Text(text.into()))]))
    }

    pub fn is_terminal(&self) -> bool {
        !self.partial || self.error.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.is_terminal() && self.error.is_none() && !self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.metadata.get(CANCELLED_KEY).map(String::as_str) == Some("true")
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).and_then(Value::as_text)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;

    #[test]
    fn test_prompt_prefers_prompt_over_text() {
        let request = InferenceRequest::new("s1")
            .with_input("text", "fallback")
            .with_input("prompt", "primary");
        assert_eq!(request.prompt(), Some("primary"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!InferenceResult::text_partial("text", "a").is_terminal());
        assert!(InferenceResult::text_complete("text", "a").is_terminal());

        let mut errored_partial = InferenceResult::text_partial("text", "a");
        errored_partial.error = Some(RunnerError::processing("boom"));
        assert!(errored_partial.is_terminal());
        assert!(!errored_partial.is_success());
    }

    #[test]
    fn test_cancelled_result_is_not_success() {
        let cancelled = InferenceResult::cancelled();
        assert!(cancelled.is_terminal());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_success());
        assert!(cancelled.error.is_none());
        assert!(!InferenceResult::text_complete("text", "a").is_cancelled());
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&Value::Text("hi".into())).unwrap();
        assert_eq!(json, r#"{"type":"text","value":"hi"}"#);
    }

    #[test]
    fn test_resolved_params_do_not_touch_original() {
        let request = InferenceRequest::new("s1").with_param("stream", serde_json::json!(true));
        let mut params = ParamMap::new();
        params.insert("temperature".into(), serde_json::json!(0.2));
        let derived = request.with_resolved_params(params);
        assert_eq!(request.param_bool("stream"), Some(true));
        assert_eq!(derived.param_bool("stream"), None);
        assert_eq!(derived.session_id, "s1");
    }
}
