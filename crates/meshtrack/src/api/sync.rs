//! `/api/sync` handlers: the pull endpoint peers page through, the manual
//! trigger, and scheduler introspection.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiResult, AppState};
use crate::storage::SinceQuery;
use crate::sync::MAX_PAGE_SIZE;

const DEFAULT_PAGE: usize = 200;

#[derive(Debug, Deserialize)]
pub(super) struct PullParams {
    #[serde(default)]
    since: i64,
    after_id: Option<String>,
    limit: Option<usize>,
    origin: Option<String>,
}

/// Reports in `(created_at, id)` order, from `since` inclusive or strictly
/// after `(since, after_id)`.
pub(super) async fn pull(
    State(state): State<AppState>,
    params: Result<Query<PullParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(params) = params?;
    let query = SinceQuery {
        origin: params.origin.filter(|o| !o.is_empty()),
        since: params.since,
        after_id: params.after_id.filter(|a| !a.is_empty()),
        limit: params.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE_SIZE),
    };
    let reports = state.storage.get_since(&query)?;

    Ok(Json(json!({
        "status": "success",
        "count": reports.len(),
        "data": reports,
    })))
}

pub(super) async fn trigger(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let report = state.engine.run_cycle().await?;
    Ok(Json(json!({
        "status": "success",
        "data": report,
    })))
}

pub(super) async fn status(State(state): State<AppState>) -> Json<Value> {
    let settings = state.engine.settings();
    let status = state.engine.status();
    Json(json!({
        "status": "success",
        "enabled": settings.enabled,
        "interval_secs": settings.interval.as_secs(),
        "running": status.running,
        "cycle_count": status.cycle_count,
        "last_cycle_at": status.last_cycle_at,
        "last_report": status.last_report,
    }))
}

pub(super) async fn peers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let entries = state.storage.sync_log().list()?;
    Ok(Json(json!({
        "status": "success",
        "count": entries.len(),
        "data": entries,
    })))
}
