//! Error taxonomy for the control plane. API edges map these onto HTTP
//! statuses; executors log, count, and continue.

use thiserror::Error;

use crate::store::StoreError;

/// Machine-readable reason for a preflight rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightReason {
    UnsupportedFormat,
    UnsupportedArch,
    ModelTooLarge,
}

impl PreflightReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreflightReason::UnsupportedFormat => "unsupported_format",
            PreflightReason::UnsupportedArch => "unsupported_arch",
            PreflightReason::ModelTooLarge => "model_too_large",
        }
    }
}

impl std::fmt::Display for PreflightReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum KittError {
    /// Malformed input: bad YAML, unknown setting key, bad UUID.
    #[error("validation: {0}")]
    Validation(String),
    /// Missing or invalid bearer, CSRF mismatch.
    #[error("auth: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Illegal state transition or dispatch to an unavailable agent.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Engine/model/platform incompatibility, rejected before dispatch.
    #[error("preflight: {reason}: {detail}")]
    Preflight {
        reason: PreflightReason,
        detail: String,
    },
    /// Retryable: DB busy, network timeout on agent.
    #[error("transient: {0}")]
    Transient(String),
    /// Deprecated surface (legacy content-addressed results storage).
    #[error("gone: {0}")]
    Gone(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// Refuse-to-start class: migration failure, missing required config.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl KittError {
    pub fn preflight(reason: PreflightReason, detail: impl Into<String>) -> Self {
        KittError::Preflight {
            reason,
            detail: detail.into(),
        }
    }
}

pub type Result<T, E = KittError> = std::result::Result<T, E>;
