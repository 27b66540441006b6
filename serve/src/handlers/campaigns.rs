//! Campaign lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use kitt::campaign;

use crate::app::AppState;
use crate::auth::require_write;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub config_yaml: String,
    #[serde(default)]
    pub agent: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let record = campaign::create(&state.ctrl, body.config_yaml, body.agent).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let campaigns = state
        .ctrl
        .run_blocking(|ctrl| Ok(ctrl.store.list_campaigns()?))
        .await?;
    Ok(Json(json!({ "campaigns": campaigns })))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .ctrl
        .run_blocking(move |ctrl| {
            ctrl.store
                .get_campaign(&id)?
                .ok_or_else(|| kitt::KittError::NotFound(format!("campaign {id}")))
        })
        .await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub config_yaml: String,
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let record = campaign::update_config(&state.ctrl, id, body.config_yaml).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
pub struct LaunchBody {
    #[serde(default)]
    pub agent: Option<String>,
}

pub async fn launch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<LaunchBody>>,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let agent = body.and_then(|Json(b)| b.agent);
    let record = campaign::launch(&state.ctrl, id, agent).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let record = campaign::cancel(&state.ctrl, id).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lines = campaign::logs(&state.ctrl, id).await?;
    Ok(Json(json!({ "logs": lines })))
}
