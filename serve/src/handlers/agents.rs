//! Agent lifecycle endpoints: register, heartbeat, tokens, settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use stream_event::{CommandKind, HeartbeatRequest, RegisterRequest};

use crate::app::AppState;
use crate::auth::{require_agent, require_write};
use crate::error::ApiError;

pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let resp = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.register(&req))
        .await?;
    Ok(Json(serde_json::to_value(resp).unwrap_or_default()))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent(&state, &id, &headers).await?;
    let resp = state
        .ctrl
        .run_blocking(move |ctrl| {
            let resp = ctrl.agents.heartbeat(&agent.id, &req)?;
            // Handing out run_test over a heartbeat is the dispatch ack.
            for cmd in &resp.commands {
                if cmd.kind == CommandKind::RunTest {
                    if let Some(test_id) = cmd.payload.get("test_id").and_then(|v| v.as_str()) {
                        kitt::quicktest::mark_dispatched(ctrl, test_id)?;
                    }
                }
            }
            Ok(resp)
        })
        .await?;
    Ok(Json(serde_json::to_value(resp).unwrap_or_default()))
}

#[derive(serde::Deserialize)]
pub struct TestAgentBody {
    pub name: String,
}

/// Creates (or returns) a virtual agent used for UI and integration testing.
pub async fn create_test_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TestAgentBody>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let agent = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.register_test_agent(&body.name))
        .await?;
    Ok(Json(serde_json::to_value(agent).unwrap_or_default()))
}

pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let raw = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.rotate_token(&id))
        .await?;
    Ok(Json(json!({ "token": raw })))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let agents = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.list())
        .await?;
    Ok(Json(json!({ "agents": agents })))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.get(&id))
        .await?;
    Ok(Json(serde_json::to_value(agent).unwrap_or_default()))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.remove(&id))
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let settings = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.effective_settings(&id))
        .await?;
    Ok(Json(json!({ "settings": settings })))
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let settings = state
        .ctrl
        .run_blocking(move |ctrl| {
            for (key, value) in &body {
                ctrl.agents.put_setting(&id, key, value)?;
            }
            ctrl.agents.effective_settings(&id)
        })
        .await?;
    Ok(Json(json!({ "settings": settings })))
}
