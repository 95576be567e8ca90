//! HTTP server module

mod analysis;
mod control;
mod ingest;
mod schemas;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

pub use analysis::{
    AnomalyView, ClustersRequest, ClustersResponse, RhythmAnomaliesRequest,
    RhythmAnomaliesResponse, TriageRequest, TriageResponse,
};
pub use control::{
    ControlRulesResponse, LiftRequest, LiftResponse, PatchRequest, PatchResponse,
    SuppressRequest, SuppressResponse,
};
pub use ingest::{IngestRequest, IngestResponse};

/// Create the HTTP router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ingest/stream", post(ingest::ingest_stream))
        .route(
            "/api/v1/analysis/tier1/rhythm_anomalies",
            post(analysis::rhythm_anomalies),
        )
        .route("/api/v1/analysis/tier2/clusters", post(analysis::clusters))
        .route("/api/v1/analysis/tier2/triage", post(analysis::triage))
        .route("/api/v1/control/suppress", post(control::suppress))
        .route("/api/v1/control/patch", post(control::patch))
        .route("/api/v1/control/lift", post(control::lift))
        .route("/api/v1/control/rules", get(control::rules))
        .route("/api/v1/schemas", post(schemas::save))
        .route("/api/v1/schemas/detect", post(schemas::detect))
        .route("/api/v1/schemas/:source_name", get(schemas::get_schema))
        .with_state(state)
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub tier1_points: usize,
    pub tier2_collections: usize,
    pub promotion_degraded: bool,
    pub uptime_seconds: i64,
}

/// Liveness plus the two gauges operators watch first.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let tier1_points = state.tier1.point_count().await.unwrap_or(0);
    let tier2_collections = state.forensic.partition_count().await.unwrap_or(0);

    Json(HealthResponse {
        ok: true,
        tier1_points,
        tier2_collections,
        promotion_degraded: state.promotion.is_degraded(),
        uptime_seconds: state.uptime_seconds(),
    })
}
