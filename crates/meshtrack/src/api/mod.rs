//! HTTP API.
//!
//! Every response is a JSON object with a `status` field: `"success"` plus the
//! payload, or `"error"` plus a `message`. Peers use the same API to discover
//! each other, pull reports (`GET /api/sync`) and push them (`POST /api/locations/`).

mod locations;
mod sync;

use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::error;

use crate::error::Error;
use crate::node::NodeIdentity;
use crate::storage::Storage;
use crate::sync::SyncEngine;

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The local Location Store.
    pub storage: Arc<Storage>,
    /// This node's identity.
    pub identity: NodeIdentity,
    /// The sync engine, for the manual trigger and status endpoints.
    pub engine: Arc<SyncEngine>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/locations", post(locations::ingest))
        .route("/api/locations/", post(locations::ingest))
        .route("/api/locations/latest", get(locations::latest))
        .route("/api/locations/history/:entity_id", get(locations::history))
        .route("/api/locations/nearby", post(locations::nearby))
        .route("/api/locations/node-id", get(locations::node_id))
        .route("/api/locations/types", get(locations::types))
        .route("/api/sync", get(sync::pull).post(sync::trigger))
        .route("/api/sync/status", get(sync::status))
        .route("/api/sync/peers", get(sync::peers))
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not found")
}

/// An error rendered as `{status: "error", message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::CycleInProgress => StatusCode::CONFLICT,
            Error::Network { .. } | Error::Timeout { .. } | Error::PartialBatch { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "status": "error",
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// Result type for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
