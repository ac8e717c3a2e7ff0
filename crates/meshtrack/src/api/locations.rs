//! `/api/locations` handlers.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::{ApiError, ApiResult, AppState};
use crate::report::{EntityType, Position, ReportDraft};

const DEFAULT_LIMIT: usize = 100;

/// Parse an optional entity type parameter; blank means no filter.
fn parse_type(raw: Option<&str>) -> ApiResult<Option<EntityType>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(s.parse::<EntityType>()?)),
        None => Ok(None),
    }
}

pub(super) async fn ingest(
    State(state): State<AppState>,
    body: Result<Json<ReportDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(draft) = body?;
    let report = draft.finalize(state.identity.id())?;
    let appended = state.storage.append(&report)?;

    let status = if appended.inserted {
        debug!(id = %appended.report.id, origin = %appended.report.origin_node_id, "Ingested report");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({
            "status": "success",
            "data": appended.report,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct LatestParams {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    limit: Option<usize>,
}

pub(super) async fn latest(
    State(state): State<AppState>,
    params: Result<Query<LatestParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(params) = params?;
    let entity_type = parse_type(params.entity_type.as_deref())?;
    let reports = state
        .storage
        .get_latest(entity_type, params.limit.unwrap_or(DEFAULT_LIMIT))?;

    Ok(Json(json!({
        "status": "success",
        "count": reports.len(),
        "data": reports,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryParams {
    since: Option<i64>,
    limit: Option<usize>,
}

pub(super) async fn history(
    State(state): State<AppState>,
    entity_id: Result<Path<String>, PathRejection>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Path(entity_id) = entity_id?;
    let Query(params) = params?;
    let entity_id = Uuid::parse_str(&entity_id)
        .map_err(|_| ApiError::bad_request(format!("invalid entity_id '{entity_id}'")))?;

    let reports = state.storage.get_history(
        &entity_id,
        params.since,
        params.limit.unwrap_or(DEFAULT_LIMIT),
    )?;

    Ok(Json(json!({
        "status": "success",
        "entity_id": entity_id,
        "count": reports.len(),
        "data": reports,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct NearbyRequest {
    center: Position,
    #[serde(rename = "radiusKm")]
    radius_km: f64,
    #[serde(rename = "entityType", default)]
    entity_type: Option<String>,
}

pub(super) async fn nearby(
    State(state): State<AppState>,
    body: Result<Json<NearbyRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = body?;
    let entity_type = parse_type(request.entity_type.as_deref())?;
    let hits = state
        .storage
        .get_nearby(&request.center, request.radius_km, entity_type)?;

    Ok(Json(json!({
        "status": "success",
        "center": request.center,
        "radiusKm": request.radius_km,
        "entityType": entity_type,
        "count": hits.len(),
        "data": hits,
    })))
}

pub(super) async fn node_id(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "node_id": state.identity.id(),
    }))
}

pub(super) async fn types() -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": EntityType::ALL,
    }))
}
