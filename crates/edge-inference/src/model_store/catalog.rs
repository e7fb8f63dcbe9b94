//! Declarative model catalog.
//!
//! Each entry lists the files a model needs. A file entry is exactly one of:
//! a single `fileName`, a `group` of names sharing base urls, or a `pattern`
//! expanded `count` times (`{index}`, `{index:05}`, `{count}`, `{count:05}`).

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::capability::Capability;

const BUILTIN_MODELS: &str = include_str!("../../assets/models.json");

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{(index|count)(?::0(\d+))?\}").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPointKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    #[serde(rename = "type")]
    pub kind: EntryPointKind,
    pub value: String,
}

/// A file entry as written in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    #[serde(default, alias = "fileName")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(rename = "type", default)]
    pub file_type: String,
    /// Candidate urls, tried in order.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub blake3: Option<String>,
}

/// A concrete file after group/pattern expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub name: String,
    pub file_type: String,
    pub urls: Vec<String>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub blake3: Option<String>,
}

impl ModelFile {
    pub fn single(name: &str, urls: &[&str]) -> Self {
        Self {
            file_name: Some(name.to_string()),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_sha256(mut self, digest: &str) -> Self {
        self.sha256 = Some(digest.to_string());
        self
    }

    fn mirrors(&self) -> Vec<String> {
        self.urls.iter().cloned().chain(self.url.clone()).collect()
    }

    fn validate(&self, model_id: &str) -> Result<()> {
        let kinds = [self.file_name.is_some(), self.group.is_some(), self.pattern.is_some()]
            .iter()
            .filter(|k| **k)
            .count();
        if kinds != 1 {
            bail!("model {}: file entry must have exactly one of fileName, group or pattern", model_id);
        }
        if self.mirrors().is_empty() {
            bail!("model {}: file entry has no urls", model_id);
        }
        if self.group.is_some() && self.files.is_empty() {
            bail!("model {}: group entry lists no files", model_id);
        }
        if self.pattern.is_some() && self.count.unwrap_or(0) == 0 {
            bail!("model {}: pattern entry needs a positive count", model_id);
        }
        Ok(())
    }

    /// Expand this entry into concrete files.
    pub fn expand(&self) -> Vec<ResolvedFile> {
        let mirrors = self.mirrors();
        let joined = |name: &str| -> Vec<String> {
            mirrors
                .iter()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), name))
                .collect()
        };
        let build = |name: String, urls: Vec<String>, whole: bool| ResolvedFile {
            name,
            file_type: self.file_type.clone(),
            urls,
            size: if whole { self.size } else { None },
            sha256: if whole { self.sha256.clone() } else { None },
            blake3: if whole { self.blake3.clone() } else { None },
        };

        if let Some(name) = &self.file_name {
            return vec![build(name.clone(), mirrors.clone(), true)];
        }
        if self.group.is_some() {
            let whole = self.files.len() == 1;
            return self
                .files
                .iter()
                .map(|name| build(name.clone(), joined(name), whole))
                .collect();
        }
        match (&self.pattern, self.count) {
            (Some(pattern), Some(count)) => (1..=count)
                .map(|index| {
                    let name = expand_pattern(pattern, index, count);
                    let urls = joined(&name);
                    build(name, urls, count == 1)
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn expand_pattern(pattern: &str, index: u32, count: u32) -> String {
    PLACEHOLDER
        .replace_all(pattern, |caps: &Captures| {
            let value = if &caps[1] == "index" { index } else { count };
            match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
                Some(width) => format!("{:0width$}", value, width = width),
                None => value.to_string(),
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    /// Runner this model is built for.
    pub runner: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default, alias = "ramGB")]
    pub ram_gb: f32,
    pub files: Vec<ModelFile>,
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ModelDefinition {
    pub fn resolved_files(&self) -> Vec<ResolvedFile> {
        self.files.iter().flat_map(ModelFile::expand).collect()
    }

    pub fn model_dir(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.id)
    }

    pub fn entry_path(&self, models_dir: &Path) -> PathBuf {
        self.model_dir(models_dir).join(&self.entry_point.value)
    }

    /// Sum of declared sizes, if every file declares one.
    pub fn total_size(&self) -> Option<u64> {
        self.resolved_files().iter().map(|f| f.size).sum()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("model entry with empty id");
        }
        if self.files.is_empty() {
            bail!("model {}: no files declared", self.id);
        }
        for file in &self.files {
            file.validate(&self.id)?;
        }

        let mut names = HashSet::new();
        for file in self.resolved_files() {
            if file.name.contains("..") || file.name.starts_with('/') || file.name.contains('\\') {
                bail!("model {}: unsafe file name '{}'", self.id, file.name);
            }
            if !names.insert(file.name.clone()) {
                bail!("model {}: duplicate file '{}'", self.id, file.name);
            }
        }
        if self.entry_point.kind == EntryPointKind::File && !names.contains(&self.entry_point.value) {
            bail!(
                "model {}: entry point '{}' is not one of its files",
                self.id,
                self.entry_point.value
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelDefinition>,
}

impl ModelCatalog {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_MODELS).context("Built-in model catalog is invalid")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid model catalog: {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let models: Vec<ModelDefinition> = serde_json::from_str(raw)?;
        let catalog = Self::from_models(models)?;
        info!("Model catalog loaded: {} models", catalog.models.len());
        Ok(catalog)
    }

    /// Validate entries and fill in capabilities inferred from the runner name.
    pub fn from_models(mut models: Vec<ModelDefinition>) -> Result<Self> {
        let mut ids = HashSet::new();
        for model in &mut models {
            model.validate()?;
            if !ids.insert(model.id.clone()) {
                bail!("duplicate model id '{}'", model.id);
            }
            if model.capabilities.is_empty() {
                model.capabilities = Capability::infer_from_runner(&model.runner);
            }
        }
        Ok(Self { models })
    }

    pub fn get(&self, id: &str) -> Option<&ModelDefinition> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn models(&self) -> &[ModelDefinition] {
        &self.models
    }

    pub fn for_runner<'a>(&'a self, runner: &'a str) -> impl Iterator<Item = &'a ModelDefinition> + 'a {
        self.models.iter().filter(move |m| m.runner == runner)
    }

    pub fn for_capability(&self, capability: Capability) -> impl Iterator<Item = &ModelDefinition> + '_ {
        self.models
            .iter()
            .filter(move |m| m.capabilities.contains(&capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = ModelCatalog::builtin().unwrap();
        assert!(!catalog.models().is_empty());
        for model in catalog.models() {
            assert!(!model.capabilities.is_empty(), "{} has no capabilities", model.id);
        }
    }

    #[test]
    fn test_catalog_parses_camel_case_and_infers_capabilities() {
        let raw = r#"[{
            "id": "whisper-tiny",
            "runner": "npu_asr",
            "backend": "onnx",
            "ramGB": 1.5,
            "files": [
                {"fileName": "encoder.onnx", "type": "model", "url": "https://a.example/encoder.onnx", "size": 10},
                {"group": "tokenizer", "files": ["vocab.json", "merges.txt"], "type": "tokenizer",
                 "urls": ["https://a.example/tok/", "https://b.example/tok"]}
            ],
            "entry_point": {"type": "file", "value": "encoder.onnx"}
        }]"#;
        let catalog = ModelCatalog::from_json(raw).unwrap();
        let model = catalog.get("whisper-tiny").unwrap();

        assert_eq!(model.ram_gb, 1.5);
        assert_eq!(model.capabilities, vec![Capability::SpeechToText]);

        let files = model.resolved_files();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].urls, vec!["https://a.example/encoder.onnx"]);
        assert_eq!(
            files[1].urls,
            vec!["https://a.example/tok/vocab.json", "https://b.example/tok/vocab.json"]
        );
        assert_eq!(model.total_size(), None);
    }

    #[test]
    fn test_pattern_expansion() {
        let file = ModelFile {
            pattern: Some("model-{index:05}-of-{count:05}.safetensors".into()),
            count: Some(3),
            urls: vec!["https://hf.example/repo".into()],
            ..Default::default()
        };
        let names: Vec<String> = file.expand().into_iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00003.safetensors",
                "model-00002-of-00003.safetensors",
                "model-00003-of-00003.safetensors",
            ]
        );
        assert_eq!(expand_pattern("part{index}.bin", 7, 9), "part7.bin");
    }

    #[test]
    fn test_rejects_ambiguous_file_entry() {
        let raw = r#"[{"id":"x","runner":"cpu_llm","files":[
            {"fileName":"a.bin","pattern":"b{index}","count":2,"url":"https://e/a"}],
            "entry_point":{"type":"file","value":"a.bin"}}]"#;
        assert!(ModelCatalog::from_json(raw).is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids_and_unsafe_names() {
        let model = ModelDefinition {
            id: "m".into(),
            runner: "cpu_llm".into(),
            backend: String::new(),
            ram_gb: 1.0,
            files: vec![ModelFile::single("a.bin", &["https://e/a.bin"])],
            entry_point: EntryPoint {
                kind: EntryPointKind::File,
                value: "a.bin".into(),
            },
            capabilities: vec![],
        };
        assert!(ModelCatalog::from_models(vec![model.clone(), model.clone()]).is_err());

        let mut unsafe_model = model;
        unsafe_model.files = vec![ModelFile::single("../escape.bin", &["https://e/x"])];
        unsafe_model.entry_point.value = "../escape.bin".into();
        assert!(ModelCatalog::from_models(vec![unsafe_model]).is_err());
    }

    #[test]
    fn test_entry_point_must_be_declared() {
        let raw = r#"[{"id":"x","runner":"cpu_llm","files":[{"fileName":"a.bin","url":"https://e/a"}],
            "entry_point":{"type":"file","value":"b.bin"}}]"#;
        assert!(ModelCatalog::from_json(raw).is_err());
    }
}
