//! Matrix expansion: `(model, engine)` pairs become runnable cells, ordered
//! by ascending estimated model size.
//!
//! Quant-filtered models never enter the matrix. Pairs excluded for
//! compatibility or size reasons ARE emitted, as skipped cells: they count
//! toward `total_runs` and `skipped`, so campaign totals are stable from
//! launch.

use glob::Pattern;

use crate::engines;
use crate::error::{KittError, PreflightReason};
use crate::types::ModelFormat;

use super::config::{CampaignConfig, ModelEntry};

/// One runnable element of the matrix.
#[derive(Clone, Debug)]
pub struct Cell {
    pub model: ModelEntry,
    pub engine: String,
    pub suite: String,
    /// Artifact reference handed to the agent (repo or tag).
    pub artifact: String,
    pub format: ModelFormat,
    pub estimated_size_gb: f64,
}

impl Cell {
    /// Stable identity of a cell inside its campaign, used for resume.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.artifact, self.engine, self.suite)
    }
}

/// A pair excluded at expansion time, with the machine reason.
#[derive(Clone, Debug)]
pub struct SkippedCell {
    pub model: String,
    pub engine: String,
    pub suite: String,
    pub reason: PreflightReason,
}

#[derive(Clone, Debug, Default)]
pub struct Expansion {
    pub cells: Vec<Cell>,
    pub skipped: Vec<SkippedCell>,
}

impl Expansion {
    pub fn total(&self) -> u32 {
        (self.cells.len() + self.skipped.len()) as u32
    }
}

/// Expands the matrix. `free_disk_gb` is the assigned agent's last reported
/// free storage; `None` skips the reserve check.
pub fn expand(config: &CampaignConfig, free_disk_gb: Option<f64>) -> Result<Expansion, KittError> {
    let skip_patterns = compile(&config.quant_filter.skip_patterns)?;
    let include_only = compile(&config.quant_filter.include_only)?;

    let mut expansion = Expansion::default();
    for model in &config.models {
        if skip_patterns.iter().any(|p| p.matches(&model.name)) {
            continue;
        }
        if !include_only.is_empty() && !include_only.iter().any(|p| p.matches(&model.name)) {
            continue;
        }
        let model_formats = model.formats();
        let size = model.estimated_size_gb();

        for engine_entry in &config.engines {
            let engine = engines::lookup(&engine_entry.name).ok_or_else(|| {
                KittError::Validation(format!("unknown engine: {}", engine_entry.name))
            })?;
            let format = engine
                .supported_formats
                .iter()
                .find(|f| model_formats.contains(f))
                .copied();
            let Some(format) = format else {
                expansion.skipped.push(SkippedCell {
                    model: model.name.clone(),
                    engine: engine_entry.name.clone(),
                    suite: engine_entry.suite.clone(),
                    reason: PreflightReason::UnsupportedFormat,
                });
                continue;
            };

            if let Some(max) = config.resource_limits.max_model_size_gb {
                if size > max {
                    expansion.skipped.push(SkippedCell {
                        model: model.name.clone(),
                        engine: engine_entry.name.clone(),
                        suite: engine_entry.suite.clone(),
                        reason: PreflightReason::ModelTooLarge,
                    });
                    continue;
                }
            }
            if let Some(free) = free_disk_gb {
                if free - size < config.disk.reserve_gb {
                    expansion.skipped.push(SkippedCell {
                        model: model.name.clone(),
                        engine: engine_entry.name.clone(),
                        suite: engine_entry.suite.clone(),
                        reason: PreflightReason::ModelTooLarge,
                    });
                    continue;
                }
            }

            let artifact = model
                .artifact(format)
                .ok_or_else(|| {
                    KittError::Validation(format!(
                        "model {} declares no artifact for {format}",
                        model.name
                    ))
                })?
                .to_string();
            expansion.cells.push(Cell {
                model: model.clone(),
                engine: engine_entry.name.clone(),
                suite: engine_entry.suite.clone(),
                artifact,
                format,
                estimated_size_gb: size,
            });
        }
    }

    expansion
        .cells
        .sort_by(|a, b| a.estimated_size_gb.total_cmp(&b.estimated_size_gb));
    Ok(expansion)
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, KittError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| KittError::Validation(format!("bad glob {p:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::config::parse;

    const TWO_BY_TWO: &str = r#"
campaign_name: matrix
models:
  - name: tiny-1b-q4_k_m
    gguf_repo: org/tiny-1b-gguf
  - name: solid-13b
    safetensors_repo: org/solid-13b
engines:
  - name: llama_cpp
    suite: smoke
  - name: ollama
    suite: smoke
"#;

    #[test]
    fn gguf_only_engines_skip_safetensors_model() {
        let config = parse(TWO_BY_TWO).unwrap();
        let expansion = expand(&config, None).unwrap();
        assert_eq!(expansion.cells.len(), 2);
        assert!(expansion.cells.iter().all(|c| c.format == ModelFormat::Gguf));
        assert_eq!(expansion.skipped.len(), 2);
        assert!(expansion
            .skipped
            .iter()
            .all(|s| s.reason == PreflightReason::UnsupportedFormat));
        assert_eq!(expansion.total(), 4);
    }

    #[test]
    fn cells_are_ordered_by_ascending_size() {
        let yaml = r#"
campaign_name: sizes
models:
  - name: big-70b-q4_k_m
    gguf_repo: org/big
  - name: small-1b-q4_k_m
    gguf_repo: org/small
engines:
  - name: llama_cpp
    suite: smoke
"#;
        let config = parse(yaml).unwrap();
        let expansion = expand(&config, None).unwrap();
        let names: Vec<_> = expansion.cells.iter().map(|c| c.model.name.as_str()).collect();
        assert_eq!(names, vec!["small-1b-q4_k_m", "big-70b-q4_k_m"]);
    }

    #[test]
    fn quant_filter_drops_models_silently() {
        let yaml = r#"
campaign_name: filtered
models:
  - name: keep-7b-q4_k_m
    gguf_repo: org/keep
  - name: drop-7b-q8_0
    gguf_repo: org/drop
engines:
  - name: llama_cpp
    suite: smoke
quant_filter:
  skip_patterns: ["*q8*"]
"#;
        let config = parse(yaml).unwrap();
        let expansion = expand(&config, None).unwrap();
        assert_eq!(expansion.cells.len(), 1);
        assert_eq!(expansion.cells[0].model.name, "keep-7b-q4_k_m");
        // Filtered models are not skipped cells; they never entered the matrix.
        assert!(expansion.skipped.is_empty());
    }

    #[test]
    fn size_cap_and_disk_reserve_skip_cells() {
        let yaml = r#"
campaign_name: capped
models:
  - name: big-70b-q4_k_m
    gguf_repo: org/big
  - name: small-1b-q4_k_m
    gguf_repo: org/small
engines:
  - name: llama_cpp
    suite: smoke
resource_limits:
  max_model_size_gb: 10
disk:
  reserve_gb: 5
"#;
        let config = parse(yaml).unwrap();
        let expansion = expand(&config, Some(6.0)).unwrap();
        // big fails the cap; small (0.56 GiB) fits 6 - 0.56 >= 5.
        assert_eq!(expansion.cells.len(), 1);
        assert_eq!(expansion.skipped.len(), 1);
        assert_eq!(expansion.skipped[0].reason, PreflightReason::ModelTooLarge);

        let tight = expand(&config, Some(5.2)).unwrap();
        assert!(tight.cells.is_empty());
        assert_eq!(tight.skipped.len(), 2);
    }

    #[test]
    fn include_only_keeps_matching_models() {
        let yaml = r#"
campaign_name: only
models:
  - name: a-7b-q4_k_m
    gguf_repo: org/a
  - name: b-7b-q5_k_m
    gguf_repo: org/b
engines:
  - name: ollama
    suite: smoke
quant_filter:
  include_only: ["*q4*"]
"#;
        let config = parse(yaml).unwrap();
        let expansion = expand(&config, None).unwrap();
        assert_eq!(expansion.cells.len(), 1);
        assert_eq!(expansion.cells[0].model.name, "a-7b-q4_k_m");
    }
}
