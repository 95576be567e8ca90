//! Schema registry endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use via_core::schema::{detect_schema, SchemaRecord};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn save(
    State(state): State<Arc<AppState>>,
    Json(record): Json<SchemaRecord>,
) -> Result<Json<SchemaRecord>, ApiError> {
    if record.source_name.trim().is_empty() {
        return Err(ApiError::bad_request("source_name must not be empty"));
    }
    state.schemas.save(&record)?;
    Ok(Json(record))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path(source_name): Path<String>,
) -> Result<Json<SchemaRecord>, ApiError> {
    state
        .schemas
        .get(&source_name)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no schema for source {source_name:?}")))
}

/// Body of `POST /api/v1/schemas/detect`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectRequest {
    pub source_name: String,
    pub sample_logs: Vec<String>,
}

pub async fn detect(
    State(_state): State<Arc<AppState>>,
    Json(request): Json<DetectRequest>,
) -> Result<Json<SchemaRecord>, ApiError> {
    detect_schema(&request.source_name, &request.sample_logs)
        .map(Json)
        .ok_or_else(|| ApiError::bad_request("could not detect a schema from the samples"))
}
