//! Health, CSRF issuance, the agent distribution, and the retired legacy
//! results store.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use kitt::KittError;

use crate::app::AppState;
use crate::error::ApiError;

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let version = state
        .ctrl
        .run_blocking(|ctrl| Ok(ctrl.store.schema_version()?))
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "schema_version": version,
    })))
}

/// Hands a browser session a CSRF token for later mutating calls.
pub async fn issue_csrf(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "csrf_token": state.csrf.issue() }))
}

/// The legacy content-addressed results store is retired; the database is the
/// sole source of truth.
pub async fn karr_gone() -> ApiError {
    KittError::Gone("content-addressed results storage was removed".into()).into()
}

/// Bootstrap script: fetches the package, verifies its checksum, unpacks,
/// and starts the daemon against this controller.
pub async fn install_script(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let script = format!(
        r#"#!/bin/sh
set -eu
KITT_URL="${{KITT_URL:-{url}}}"
KITT_HOME="${{KITT_HOME:-$HOME/.kitt}}"
mkdir -p "$KITT_HOME"
echo "fetching agent package from $KITT_URL/agent/package"
curl -fsSL -D "$KITT_HOME/package.headers" -o "$KITT_HOME/kitt-agent.tar.gz" "$KITT_URL/agent/package"
expected=$(grep -i '^x-checksum-sha256:' "$KITT_HOME/package.headers" | tr -d '\r' | cut -d' ' -f2)
actual=$(sha256sum "$KITT_HOME/kitt-agent.tar.gz" | cut -d' ' -f1)
if [ "$expected" != "$actual" ]; then
    echo "checksum mismatch: expected $expected got $actual" >&2
    exit 1
fi
tar -xzf "$KITT_HOME/kitt-agent.tar.gz" -C "$KITT_HOME"
echo "installed; start with: $KITT_HOME/kitt-agent start --controller $KITT_URL"
"#,
        url = state.public_url
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/x-shellscript")],
        script,
    )
}

/// Serves the agent tarball with its SHA-256 so installs are verifiable.
pub async fn agent_package(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .agent_package
        .clone()
        .ok_or_else(|| KittError::NotFound("no agent package configured".into()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| KittError::NotFound(format!("agent package {path:?}: {e}")))?;
    let checksum = hex::encode(Sha256::digest(&bytes));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::HeaderName::from_static("x-checksum-sha256"),
                checksum,
            ),
        ],
        bytes,
    ))
}
