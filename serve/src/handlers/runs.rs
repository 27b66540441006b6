//! Result queries, lossless export, deletion, and aggregation.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use kitt::store::{GroupBy, RunFilter};
use kitt::KittError;

use crate::app::AppState;
use crate::auth::require_write;
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub model: Option<String>,
    pub engine: Option<String>,
    pub suite: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = RunFilter {
        model: q.model,
        engine: q.engine,
        suite: q.suite,
        since: q.since,
        until: q.until,
        limit: q.limit,
        offset: q.offset,
    };
    let runs = state
        .ctrl
        .run_blocking(move |ctrl| Ok(ctrl.store.query_runs(&filter)?))
        .await?;
    Ok(Json(json!({ "runs": runs })))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .ctrl
        .run_blocking(move |ctrl| {
            ctrl.store
                .get_run(&id)?
                .ok_or_else(|| KittError::NotFound(format!("run {id}")))
        })
        .await?;
    Ok(Json(serde_json::to_value(run).unwrap_or_default()))
}

/// Returns the stored metrics blob verbatim, whitespace and all.
pub async fn export(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = state
        .ctrl
        .run_blocking(move |ctrl| {
            ctrl.store
                .get_run(&id)?
                .map(|r| r.raw_json)
                .ok_or_else(|| KittError::NotFound(format!("run {id}")))
        })
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        raw,
    ))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_write(&state, &headers)?;
    let deleted = state
        .ctrl
        .run_blocking(move |ctrl| {
            if !ctrl.store.delete_run(&id)? {
                return Err(KittError::NotFound(format!("run {id}")));
            }
            Ok(true)
        })
        .await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    pub group_by: String,
    pub metric: String,
}

pub async fn aggregate(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AggregateQuery>,
) -> Result<Json<Value>, ApiError> {
    let group_by = match q.group_by.as_str() {
        "model" => GroupBy::Model,
        "engine" => GroupBy::Engine,
        "suite" => GroupBy::Suite,
        other => {
            return Err(
                KittError::Validation(format!("group_by must be model|engine|suite, got {other}"))
                    .into(),
            )
        }
    };
    let rows = state
        .ctrl
        .run_blocking(move |ctrl| Ok(ctrl.store.aggregate(group_by, &q.metric)?))
        .await?;
    Ok(Json(json!({ "groups": rows })))
}
