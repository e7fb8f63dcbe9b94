//! Self-describing runner parameter schemas and validation.

use serde::{Deserialize, Serialize};

use super::types::ParamMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Bool,
    Integer,
    Float,
    String,
}

/// One entry of a runner's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub param_type: ParameterType,
    pub default: serde_json::Value,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Allowed values for string parameters; empty means unconstrained.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Callers may override this parameter per request.
    #[serde(default)]
    pub caller_overridable: bool,
    #[serde(default)]
    pub description: String,
}

impl ParameterDescriptor {
    fn new(name: &str, param_type: ParameterType, default: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            default,
            min: None,
            max: None,
            allowed: Vec::new(),
            caller_overridable: false,
            description: String::new(),
        }
    }

    pub fn bool(name: &str, default: bool) -> Self {
        Self::new(name, ParameterType::Bool, serde_json::json!(default))
    }

    pub fn integer(name: &str, default: i64) -> Self {
        Self::new(name, ParameterType::Integer, serde_json::json!(default))
    }

    pub fn float(name: &str, default: f64) -> Self {
        Self::new(name, ParameterType::Float, serde_json::json!(default))
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self::new(name, ParameterType::String, serde_json::json!(default))
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn one_of(mut self, allowed: &[&str]) -> Self {
        self.allowed = allowed.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn caller_overridable(mut self) -> Self {
        self.caller_overridable = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Check a single value against this descriptor.
    pub fn check(&self, value: &serde_json::Value) -> Result<(), String> {
        let numeric = match self.param_type {
            ParameterType::Bool => {
                return if value.is_boolean() {
                    Ok(())
                } else {
                    Err(format!("{} must be a boolean", self.name))
                };
            }
            ParameterType::Integer => value
                .as_i64()
                .map(|v| v as f64)
                .ok_or_else(|| format!("{} must be an integer", self.name))?,
            ParameterType::Float => value
                .as_f64()
                .ok_or_else(|| format!("{} must be a number", self.name))?,
            ParameterType::String => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("{} must be a string", self.name))?;
                if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a == s) {
                    return Err(format!(
                        "{} must be one of [{}], got '{}'",
                        self.name,
                        self.allowed.join(", "),
                        s
                    ));
                }
                return Ok(());
            }
        };

        if let Some(min) = self.min {
            if numeric < min {
                return Err(format!("{} must be >= {}, got {}", self.name, min, numeric));
            }
        }
        if let Some(max) = self.max {
            if numeric > max {
                return Err(format!("{} must be <= {}, got {}", self.name, max, numeric));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<String>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Validate the keys of `params` that the schema knows about. Keys outside the
/// schema are left to the runner.
pub fn validate_against(schema: &[ParameterDescriptor], params: &ParamMap) -> ValidationResult {
    let problems: Vec<String> = schema
        .iter()
        .filter_map(|descriptor| {
            params
                .get(&descriptor.name)
                .and_then(|value| descriptor.check(value).err())
        })
        .collect();

    if problems.is_empty() {
        ValidationResult::Valid
    } else {
        ValidationResult::Invalid(problems)
    }
}

/// Default values declared by a schema.
pub fn defaults_of(schema: &[ParameterDescriptor]) -> ParamMap {
    schema
        .iter()
        .map(|d| (d.name.clone(), d.default.clone()))
        .collect()
}

/// The parameter set most text runners share.
pub fn text_generation_schema() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::float("temperature", 0.7)
            .range(0.0, 2.0)
            .describe("Sampling temperature"),
        ParameterDescriptor::integer("max_tokens", 512)
            .range(1.0, 32768.0)
            .describe("Upper bound on generated tokens"),
        ParameterDescriptor::float("top_p", 0.95).range(0.0, 1.0),
        ParameterDescriptor::bool("stream", false).caller_overridable(),
        ParameterDescriptor::string("response_format", "text")
            .one_of(&["text", "json"])
            .caller_overridable(),
        ParameterDescriptor::string("language", "en").caller_overridable(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_of_schema() {
        let defaults = defaults_of(&text_generation_schema());
        assert_eq!(defaults.get("temperature"), Some(&json!(0.7)));
        assert_eq!(defaults.get("stream"), Some(&json!(false)));
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut params = ParamMap::new();
        params.insert("temperature".into(), json!(3.5));
        params.insert("max_tokens".into(), json!("lots"));
        params.insert("response_format".into(), json!("xml"));
        params.insert("unrelated".into(), json!({"any": "thing"}));

        match validate_against(&text_generation_schema(), &params) {
            ValidationResult::Invalid(problems) => {
                assert_eq!(problems.len(), 3);
                assert!(problems.iter().any(|p| p.contains("temperature")));
                assert!(problems.iter().any(|p| p.contains("max_tokens")));
                assert!(problems.iter().any(|p| p.contains("response_format")));
            }
            ValidationResult::Valid => panic!("expected invalid parameters"),
        }
    }

    #[test]
    fn test_integer_rejects_fractional_values() {
        let descriptor = ParameterDescriptor::integer("max_tokens", 16).range(1.0, 64.0);
        assert!(descriptor.check(&json!(8)).is_ok());
        assert!(descriptor.check(&json!(8.5)).is_err());
        assert!(descriptor.check(&json!(0)).is_err());
    }
}
