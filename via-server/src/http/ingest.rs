//! Ingest endpoint

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use via_core::event::LogEvent;

use crate::error::ApiError;
use crate::ingest::IngestReport;
use crate::state::AppState;

/// Body of `POST /api/v1/ingest/stream`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<LogEvent>,
}

/// Per-batch ingest accounting.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub deduped: usize,
    pub parse_failed: usize,
    pub warnings: Vec<String>,
}

impl From<IngestReport> for IngestResponse {
    fn from(report: IngestReport) -> Self {
        Self {
            accepted: report.accepted,
            deduped: report.deduped,
            parse_failed: report.parse_failed,
            warnings: report.warnings,
        }
    }
}

pub async fn ingest_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let report = state.ingest.ingest_batch(request.events).await?;
    Ok(Json(report.into()))
}
