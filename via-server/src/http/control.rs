//! Control loop endpoints: suppress, patch, lift, rules

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use via_core::control::regression::RegressionRecord;
use via_core::control::ControlRecord;
use via_core::rhythm::RhythmHash;

use crate::error::ApiError;
use crate::state::AppState;

/// Body of `POST /api/v1/control/suppress`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SuppressRequest {
    pub rhythm_hash: RhythmHash,
    pub ttl_sec: i64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuppressResponse {
    pub ok: bool,
    pub expires_at: Option<i64>,
}

pub async fn suppress(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SuppressRequest>,
) -> Result<Json<SuppressResponse>, ApiError> {
    if request.ttl_sec <= 0 {
        return Err(ApiError::bad_request("ttl_sec must be positive"));
    }
    let now = Utc::now().timestamp();
    let record = state.control.suppress(
        request.rhythm_hash,
        now,
        request.ttl_sec,
        request.reason.as_deref(),
        request.operator_id.as_deref(),
    )?;
    info!(hash = %request.rhythm_hash, expires_at = ?record.expires_at, "suppressed rhythm class");
    Ok(Json(SuppressResponse {
        ok: true,
        expires_at: record.expires_at,
    }))
}

/// Body of `POST /api/v1/control/patch`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchRequest {
    pub rhythm_hash: RhythmHash,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatchResponse {
    pub ok: bool,
}

/// Patch a rhythm class as permanently normal. The first patch of a hash
/// snapshots its current Tier-1 events into the regression log.
pub async fn patch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PatchRequest>,
) -> Result<Json<PatchResponse>, ApiError> {
    let now = Utc::now().timestamp();
    let (_, newly) = state.control.patch(
        request.rhythm_hash,
        now,
        request.reason.as_deref(),
        request.operator_id.as_deref(),
    )?;

    if newly {
        let events = state
            .tier1
            .snapshot_events(
                request.rhythm_hash,
                via_core::control::regression::MAX_SNAPSHOT_EVENTS,
            )
            .await?;
        state.regression.append(RegressionRecord {
            rhythm_hash: request.rhythm_hash,
            events,
            patched_at: now,
            operator_id: request.operator_id.clone(),
        })?;
        info!(hash = %request.rhythm_hash, "patched rhythm class, regression case recorded");
    }

    Ok(Json(PatchResponse { ok: true }))
}

/// Body of `POST /api/v1/control/lift`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LiftRequest {
    pub rhythm_hash: RhythmHash,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LiftResponse {
    pub ok: bool,
    pub existed: bool,
}

pub async fn lift(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LiftRequest>,
) -> Result<Json<LiftResponse>, ApiError> {
    let now = Utc::now().timestamp();
    let existed = state.control.lift(request.rhythm_hash, now)?;
    info!(hash = %request.rhythm_hash, existed, "lifted control record");
    Ok(Json(LiftResponse { ok: true, existed }))
}

/// Everything currently active, split by kind.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlRulesResponse {
    pub patches: Vec<ControlRecord>,
    pub suppressions: Vec<ControlRecord>,
}

pub async fn rules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ControlRulesResponse>, ApiError> {
    let now = Utc::now().timestamp();
    let mut patches = Vec::new();
    let mut suppressions = Vec::new();
    for record in state.control.rules(now)? {
        match record.kind {
            via_core::control::ControlKind::Patch => patches.push(record),
            via_core::control::ControlKind::Suppress => suppressions.push(record),
        }
    }
    Ok(Json(ControlRulesResponse {
        patches,
        suppressions,
    }))
}
