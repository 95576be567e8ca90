//! Analysis endpoints: Tier-1 anomaly pass and federated Tier-2 queries

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use via_core::event::LogEvent;
use via_core::rhythm::RhythmHash;

use crate::error::ApiError;
use crate::federation::{Incident, IncidentFilters, DEFAULT_TRIAGE_LIMIT};
use crate::state::AppState;
use crate::tier1::RhythmAnomaly;

const DEFAULT_TOP_K: usize = 20;

/// Body of `POST /api/v1/analysis/tier1/rhythm_anomalies`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RhythmAnomaliesRequest {
    pub window_sec: i64,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// One anomalous rhythm class on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnomalyView {
    pub rhythm_hash: RhythmHash,
    pub representative: LogEvent,
    pub score: f64,
    pub count: usize,
    pub first_ts: i64,
    pub last_ts: i64,
}

impl From<RhythmAnomaly> for AnomalyView {
    fn from(a: RhythmAnomaly) -> Self {
        Self {
            rhythm_hash: a.rhythm_hash,
            representative: a.representative,
            score: a.score,
            count: a.count,
            first_ts: a.first_ts,
            last_ts: a.last_ts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RhythmAnomaliesResponse {
    pub anomalies: Vec<AnomalyView>,
    pub promoted: Vec<RhythmHash>,
}

pub async fn rhythm_anomalies(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RhythmAnomaliesRequest>,
) -> Result<Json<RhythmAnomaliesResponse>, ApiError> {
    if request.window_sec <= 0 {
        return Err(ApiError::bad_request("window_sec must be positive"));
    }
    let now = Utc::now().timestamp();
    let (anomalies, promoted) = state
        .run_analysis(
            now,
            request.window_sec,
            request.top_k.unwrap_or(DEFAULT_TOP_K),
            request.threshold,
        )
        .await?;
    Ok(Json(RhythmAnomaliesResponse {
        anomalies: anomalies.into_iter().map(AnomalyView::from).collect(),
        promoted,
    }))
}

/// Body of `POST /api/v1/analysis/tier2/clusters`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClustersRequest {
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(default)]
    pub filters: Option<IncidentFilters>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClustersResponse {
    pub incidents: Vec<Incident>,
    pub warnings: Vec<String>,
}

pub async fn clusters(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClustersRequest>,
) -> Result<Json<ClustersResponse>, ApiError> {
    if request.start_ts > request.end_ts {
        return Err(ApiError::bad_request("start_ts must not exceed end_ts"));
    }
    let filters = request.filters.unwrap_or_default();
    let (incidents, warnings) = state
        .federation
        .clusters(request.start_ts, request.end_ts, &filters)
        .await;
    Ok(Json(ClustersResponse {
        incidents,
        warnings,
    }))
}

/// Body of `POST /api/v1/analysis/tier2/triage`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriageRequest {
    pub start_ts: i64,
    pub end_ts: i64,
    pub positive_ids: Vec<Uuid>,
    #[serde(default)]
    pub negative_ids: Vec<Uuid>,
    #[serde(default)]
    pub filters: Option<IncidentFilters>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriageResponse {
    pub incidents: Vec<Incident>,
    pub warnings: Vec<String>,
}

pub async fn triage(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriageRequest>,
) -> Result<Json<TriageResponse>, ApiError> {
    if request.positive_ids.is_empty() {
        return Err(ApiError::bad_request("positive_ids must not be empty"));
    }
    if request.start_ts > request.end_ts {
        return Err(ApiError::bad_request("start_ts must not exceed end_ts"));
    }
    let filters = request.filters.unwrap_or_default();
    let (incidents, warnings) = state
        .federation
        .triage(
            request.start_ts,
            request.end_ts,
            &request.positive_ids,
            &request.negative_ids,
            &filters,
            request.limit.unwrap_or(DEFAULT_TRIAGE_LIMIT),
        )
        .await;
    Ok(Json(TriageResponse {
        incidents,
        warnings,
    }))
}
