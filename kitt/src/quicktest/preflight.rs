//! Static compatibility checks performed before any command is queued.

use crate::engines::{self, EngineSpec};
use crate::error::{KittError, PreflightReason};
use crate::store::AgentRecord;
use crate::types::{estimate_size_gb, ModelFormat};

/// Validates an `(agent, engine, model)` combination. Returns the engine spec
/// so callers don't look it up twice. `format_hint` lets callers that already
/// resolved the artifact (the campaign executor) skip name-based inference.
pub fn check_dispatch(
    agent: &AgentRecord,
    engine_name: &str,
    model: &str,
    format_hint: Option<ModelFormat>,
    max_model_size_gb: Option<f64>,
) -> Result<&'static EngineSpec, KittError> {
    let engine = engines::lookup(engine_name)
        .ok_or_else(|| KittError::Validation(format!("unknown engine: {engine_name}")))?;

    let format = format_hint.or_else(|| ModelFormat::infer(model)).ok_or_else(|| {
        KittError::preflight(
            PreflightReason::UnsupportedFormat,
            format!("cannot infer model format from {model:?}"),
        )
    })?;
    if !engine.supports_format(format) {
        return Err(KittError::preflight(
            PreflightReason::UnsupportedFormat,
            format!("{engine_name} does not load {format} models"),
        ));
    }

    if !engine.supports_arch(agent.cpu_arch) {
        return Err(KittError::preflight(
            PreflightReason::UnsupportedArch,
            format!(
                "{engine_name} has no {} image for agent {}",
                agent.cpu_arch.as_str(),
                agent.name
            ),
        ));
    }

    if let Some(max) = max_model_size_gb {
        let estimated = estimate_size_gb(model);
        if estimated > max {
            return Err(KittError::preflight(
                PreflightReason::ModelTooLarge,
                format!("estimated {estimated:.1} GiB exceeds limit {max:.1} GiB"),
            ));
        }
    }

    Ok(engine)
}
