//! Background workers
//!
//! Three loops run next to the HTTP server: the active-set refresher, the
//! sweeper (Tier-1 eviction, Tier-2 retention, daily IDF rebuild), and the
//! periodic anomaly analysis. Each failure is logged and the loop carries
//! on; only the process-level invariants abort the daemon.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use via_core::embed::sparse::IdfSnapshot;
use via_core::error::ViaError;
use via_core::vector::ScrollRequest;

use crate::forensic::FORENSIC_PREFIX;
use crate::state::AppState;

/// Active-set refresh cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Anomalies considered per periodic analysis pass.
const ANALYSIS_TOP_K: usize = 20;

/// Messages sampled per partition for the IDF rebuild.
const IDF_SAMPLE_PER_PARTITION: usize = 2000;

/// Spawn all background loops. Handles are returned so a graceful shutdown
/// can abort them.
pub fn spawn_background_tasks(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    let mut handles = vec![spawn_refresher(state.clone()), spawn_sweeper(state.clone())];
    if state.config.analysis_interval_sec > 0 {
        handles.push(spawn_analysis(state));
    }
    handles
}

fn spawn_refresher(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = state.control.refresh(Utc::now().timestamp()) {
                error!(%err, "active-set refresh failed");
            }
        }
    })
}

fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.sweep_interval_sec.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_idf_day: Option<String> = None;
        loop {
            ticker.tick().await;
            let now = Utc::now().timestamp();

            if let Err(err) = state.tier1.evict(now).await {
                error!(%err, "Tier-1 eviction failed");
            }
            match state
                .forensic
                .retention_sweep(now, state.config.t2_retention_days)
                .await
            {
                Ok(dropped) if !dropped.is_empty() => {
                    info!(count = dropped.len(), "retention dropped Tier-2 partitions");
                }
                Ok(_) => {}
                Err(err) => error!(%err, "Tier-2 retention sweep failed"),
            }
            if let Err(err) = state.control.sweep(now) {
                error!(%err, "control sweep failed");
            }

            let today = Utc::now().format("%Y_%m_%d").to_string();
            if last_idf_day.as_deref() != Some(&today) {
                match rebuild_idf(&state).await {
                    Ok(docs) => {
                        debug!(docs, day = %today, "IDF snapshot rebuilt");
                        last_idf_day = Some(today);
                    }
                    Err(err) => error!(%err, "IDF rebuild failed"),
                }
            }
        }
    })
}

fn spawn_analysis(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.analysis_interval_sec;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh instance has
        // a full window of data before its first pass.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Utc::now().timestamp();
            match state
                .run_analysis(now, interval as i64, ANALYSIS_TOP_K, None)
                .await
            {
                Ok((anomalies, promoted)) if !anomalies.is_empty() => {
                    info!(
                        anomalies = anomalies.len(),
                        promoted = promoted.len(),
                        "periodic analysis found anomalies"
                    );
                }
                Ok(_) => debug!("periodic analysis found nothing"),
                Err(err) => error!(%err, "periodic analysis failed"),
            }
        }
    })
}

/// Rebuild the BM25 IDF snapshot from representative messages across every
/// existing forensic partition.
async fn rebuild_idf(state: &Arc<AppState>) -> Result<usize, ViaError> {
    let backend = state.forensic.backend();
    let mut docs: Vec<String> = Vec::new();
    for name in backend.list_collections().await? {
        if !name.starts_with(FORENSIC_PREFIX) {
            continue;
        }
        let points = backend
            .scroll(
                &name,
                ScrollRequest {
                    filter: None,
                    limit: IDF_SAMPLE_PER_PARTITION,
                },
            )
            .await?;
        docs.extend(points.iter().filter_map(|p| {
            p.payload
                .get("representative_message")
                .and_then(Value::as_str)
                .map(str::to_string)
        }));
    }
    let count = docs.len();
    state
        .idf
        .install(IdfSnapshot::build(docs.iter().map(String::as_str)));
    Ok(count)
}
