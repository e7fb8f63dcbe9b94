//! Three-layer parameter resolution: runner defaults, then engine overrides,
//! then the caller keys that are allowed through.

use crate::runner::parameters::{defaults_of, ParameterDescriptor};
use crate::runner::ParamMap;

/// Caller keys accepted for every runner.
pub const CALLER_ALLOW_LIST: &[&str] = &["stream", "response_format", "language", "microphone_mode"];

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub params: ParamMap,
    /// Caller keys that were dropped, in key order.
    pub discarded: Vec<String>,
}

pub fn caller_may_set(schema: &[ParameterDescriptor], key: &str) -> bool {
    CALLER_ALLOW_LIST.contains(&key) || schema.iter().any(|d| d.name == key && d.caller_overridable)
}

/// Pure merge of the three layers. Later layers win key by key.
pub fn resolve(schema: &[ParameterDescriptor], engine: &ParamMap, caller: &ParamMap) -> ResolvedParams {
    let mut params = defaults_of(schema);
    params.extend(engine.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut discarded = Vec::new();
    for (key, value) in caller {
        if caller_may_set(schema, key) {
            params.insert(key.clone(), value.clone());
        } else {
            discarded.push(key.clone());
        }
    }
    ResolvedParams { params, discarded }
}

/// Whether the runner should stream. A `stream` value set by the caller or
/// the engine layer wins; otherwise the entry point's mode decides.
pub fn stream_requested(resolved: &ResolvedParams, engine: &ParamMap, caller: &ParamMap, mode: bool) -> bool {
    if !engine.contains_key("stream") && !caller.contains_key("stream") {
        return mode;
    }
    resolved
        .params
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(mode)
}
