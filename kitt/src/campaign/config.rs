//! Campaign YAML schema. Unknown keys are rejected at load.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::KittError;
use crate::types::{estimate_size_gb, ModelFormat};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub campaign_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub models: Vec<ModelEntry>,
    pub engines: Vec<EngineEntry>,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub quant_filter: QuantFilter,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Advisory; cells on a single-GPU host always run sequentially.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<serde_yaml::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safetensors_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gguf_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_tag: Option<String>,
    /// Overrides the name-based size estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<f64>,
}

impl ModelEntry {
    /// Formats this model can be fetched in, from its declared artifacts.
    pub fn formats(&self) -> BTreeSet<ModelFormat> {
        let mut set = BTreeSet::new();
        if self.safetensors_repo.is_some() {
            set.insert(ModelFormat::Safetensors);
        }
        if self.gguf_repo.is_some() || self.ollama_tag.is_some() {
            set.insert(ModelFormat::Gguf);
        }
        set
    }

    /// The artifact reference to hand to the agent for a given format.
    pub fn artifact(&self, format: ModelFormat) -> Option<&str> {
        match format {
            ModelFormat::Safetensors | ModelFormat::Pytorch => {
                self.safetensors_repo.as_deref()
            }
            ModelFormat::Gguf => self
                .gguf_repo
                .as_deref()
                .or(self.ollama_tag.as_deref()),
        }
    }

    pub fn estimated_size_gb(&self) -> f64 {
        self.size_gb.unwrap_or_else(|| estimate_size_gb(&self.name))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineEntry {
    pub name: String,
    /// Suite to run for every cell of this engine.
    pub suite: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    #[serde(default)]
    pub reserve_gb: f64,
    #[serde(default)]
    pub cleanup_after_run: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantFilter {
    /// Glob patterns; matching model names are left out of the matrix.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    /// When non-empty, only matching model names stay in.
    #[serde(default)]
    pub include_only: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_model_size_gb: Option<f64>,
}

/// Parses and validates a campaign config. Engine names must be registered.
pub fn parse(yaml: &str) -> Result<CampaignConfig, KittError> {
    let config: CampaignConfig = serde_yaml::from_str(yaml)
        .map_err(|e| KittError::Validation(format!("campaign config: {e}")))?;
    if config.campaign_name.trim().is_empty() {
        return Err(KittError::Validation("campaign_name must not be empty".into()));
    }
    if config.models.is_empty() {
        return Err(KittError::Validation("campaign needs at least one model".into()));
    }
    if config.engines.is_empty() {
        return Err(KittError::Validation("campaign needs at least one engine".into()));
    }
    for engine in &config.engines {
        if crate::engines::lookup(&engine.name).is_none() {
            return Err(KittError::Validation(format!(
                "unknown engine: {}",
                engine.name
            )));
        }
    }
    for filter in config
        .quant_filter
        .skip_patterns
        .iter()
        .chain(&config.quant_filter.include_only)
    {
        glob::Pattern::new(filter)
            .map_err(|e| KittError::Validation(format!("bad glob {filter:?}: {e}")))?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
campaign_name: smoke
models:
  - name: llama-3.1-8b-q4_k_m
    gguf_repo: ggml-org/llama-3.1-8b-gguf
engines:
  - name: llama_cpp
    suite: smoke
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.campaign_name, "smoke");
        assert!(!config.parallel);
        assert!(!config.disk.cleanup_after_run);
        assert!(config.resource_limits.max_model_size_gb.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = format!("{MINIMAL}\nretries: 3\n");
        assert!(matches!(parse(&yaml), Err(KittError::Validation(_))));
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let yaml = r#"
campaign_name: x
models:
  - name: m
    gguf_repo: r
engines:
  - name: triton
    suite: smoke
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown engine"));
    }

    #[test]
    fn bad_glob_is_rejected() {
        let yaml = r#"
campaign_name: x
models:
  - name: m
    gguf_repo: r
engines:
  - name: ollama
    suite: smoke
quant_filter:
  skip_patterns: ["[?"]
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn model_formats_follow_artifacts() {
        let model = ModelEntry {
            name: "m".into(),
            safetensors_repo: Some("org/m".into()),
            gguf_repo: None,
            ollama_tag: Some("m:latest".into()),
            size_gb: None,
        };
        let formats = model.formats();
        assert!(formats.contains(&ModelFormat::Safetensors));
        assert!(formats.contains(&ModelFormat::Gguf));
        assert_eq!(model.artifact(ModelFormat::Gguf), Some("m:latest"));
    }
}
