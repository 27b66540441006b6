//! Quick-test endpoints: dispatch, status/log ingestion, cancellation, and
//! the per-agent capability matrix.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use kitt::quicktest::{self, DispatchRequest};
use kitt::store::QuickTestFilter;
use kitt::types::ModelFormat;
use kitt::KittError;
use stream_event::{LogLine, StatusUpdate};

use crate::app::AppState;
use crate::auth::{require_agent, require_write};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub agent: String,
    pub model: String,
    pub engine: String,
    pub suite: String,
    #[serde(default)]
    pub force: bool,
}

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DispatchBody>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let test = quicktest::dispatch(
        &state.ctrl,
        DispatchRequest {
            agent: body.agent,
            model: body.model,
            engine: body.engine,
            suite: body.suite,
            force: body.force,
            campaign_id: None,
            format: None,
        },
    )
    .await?;
    Ok(Json(serde_json::to_value(test).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub agent: Option<String>,
    pub campaign: Option<String>,
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<kitt::TestStatus>()
                .map_err(KittError::Validation)
        })
        .transpose()?;
    let filter = QuickTestFilter {
        agent_id: query.agent,
        campaign_id: query.campaign,
        status,
        active: false,
    };
    let tests = state
        .ctrl
        .run_blocking(move |ctrl| Ok(ctrl.store.list_quick_tests(&filter)?))
        .await?;
    Ok(Json(json!({ "quick_tests": tests })))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let test = state
        .ctrl
        .run_blocking(move |ctrl| {
            ctrl.store
                .get_quick_test(&id)?
                .ok_or_else(|| KittError::NotFound(format!("quick test {id}")))
        })
        .await?;
    Ok(Json(serde_json::to_value(test).unwrap_or_default()))
}

/// Agents push log batches here; each line fans out live and is persisted.
pub async fn push_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(batch): Json<Vec<LogLine>>,
) -> Result<Json<Value>, ApiError> {
    let agent = owning_agent(&state, &id).await?;
    require_agent(&state, &agent, &headers).await?;
    let appended = batch.len();
    state
        .ctrl
        .run_blocking(move |ctrl| quicktest::append_logs(ctrl, &id, &batch))
        .await?;
    Ok(Json(json!({ "appended": appended })))
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lines = state
        .ctrl
        .run_blocking(move |ctrl| quicktest::logs(ctrl, &id))
        .await?;
    Ok(Json(json!({ "logs": lines })))
}

/// Agents post `running` / `completed` / `failed` transitions here.
pub async fn post_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    let agent = owning_agent(&state, &id).await?;
    require_agent(&state, &agent, &headers).await?;
    let test = state
        .ctrl
        .run_blocking(move |ctrl| quicktest::record_status(ctrl, &id, &update))
        .await?;
    Ok(Json(serde_json::to_value(test).unwrap_or_default()))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let test = state
        .ctrl
        .run_blocking(move |ctrl| quicktest::cancel(ctrl, &id))
        .await?;
    Ok(Json(serde_json::to_value(test).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
pub struct CapabilitiesBody {
    /// Optional model path; adds a format check per engine.
    #[serde(default)]
    pub model: Option<String>,
}

/// Which engines each agent can run, and why not where it can't.
pub async fn agent_capabilities(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CapabilitiesBody>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let matrix = state
        .ctrl
        .run_blocking(move |ctrl| {
            let format = body.model.as_deref().and_then(ModelFormat::infer);
            let mut rows = Vec::new();
            for agent in ctrl.agents.list()? {
                let engines: Vec<Value> = kitt::engines::engines()
                    .iter()
                    .map(|engine| {
                        let (compatible, reason) = if !engine.supports_arch(agent.cpu_arch) {
                            (false, Some("unsupported_arch"))
                        } else if matches!(format, Some(f) if !engine.supports_format(f)) {
                            (false, Some("unsupported_format"))
                        } else {
                            (true, None)
                        };
                        json!({
                            "name": engine.name,
                            "compatible": compatible,
                            "reason": reason,
                        })
                    })
                    .collect();
                rows.push(json!({
                    "agent_id": agent.id,
                    "name": agent.name,
                    "cpu_arch": agent.cpu_arch.as_str(),
                    "engines": engines,
                }));
            }
            Ok(rows)
        })
        .await?;
    Ok(Json(json!({ "agents": matrix })))
}

/// The agent a test belongs to; log/status pushes authenticate against it.
async fn owning_agent(state: &Arc<AppState>, test_id: &str) -> Result<String, ApiError> {
    let id = test_id.to_string();
    let agent_id = state
        .ctrl
        .run_blocking(move |ctrl| {
            ctrl.store
                .get_quick_test(&id)?
                .map(|t| t.agent_id)
                .ok_or_else(|| KittError::NotFound(format!("quick test {id}")))
        })
        .await?;
    Ok(agent_id)
}
