//! Shared application state for the VIA server

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use via_core::config::ViaConfig;
use via_core::control::regression::RegressionRecorder;
use via_core::control::{ControlRegistry, SqliteControlStore};
use via_core::embed::sparse::IdfIndex;
use via_core::embed::{HashingEmbedder, SharedEmbedder};
use via_core::error::ViaError;
use via_core::rhythm::RhythmHash;
use via_core::schema::SchemaRegistry;
use via_core::vector::VectorBackend;

use crate::federation::FederatedQuery;
use crate::forensic::ForensicStore;
use crate::ingest::IngestCoordinator;
use crate::promote::PromotionPipeline;
use crate::tier1::{RhythmAnomaly, Tier1Config, Tier1Monitor, TIER1_DENSE_DIM};

/// Queue depth of the Tier-1 embedder singleton.
const TIER1_EMBED_QUEUE: usize = 256;

/// Shared state accessible by all handlers and workers.
pub struct AppState {
    pub config: ViaConfig,
    pub tier1: Arc<Tier1Monitor>,
    pub ingest: Arc<IngestCoordinator>,
    pub promotion: Arc<PromotionPipeline>,
    pub forensic: Arc<ForensicStore>,
    pub federation: Arc<FederatedQuery>,
    pub control: Arc<ControlRegistry>,
    pub regression: Arc<RegressionRecorder>,
    pub schemas: Arc<SchemaRegistry>,
    pub idf: Arc<IdfIndex>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the component graph over the given vector backend and reset the
    /// Tier-1 collection.
    pub async fn initialize(
        config: ViaConfig,
        backend: Arc<dyn VectorBackend>,
    ) -> Result<Arc<Self>, ViaError> {
        let control_store = Arc::new(SqliteControlStore::open(&config.control_store_path)?);
        let control = Arc::new(ControlRegistry::new(control_store)?);
        let regression = Arc::new(RegressionRecorder::new(&config.regression_log_path));
        let schemas = Arc::new(SchemaRegistry::open(&config.control_store_path)?);
        let idf = Arc::new(IdfIndex::new());

        let tier1 = Arc::new(Tier1Monitor::new(
            backend.clone(),
            Arc::new(SharedEmbedder::new(
                Arc::new(HashingEmbedder::new(TIER1_DENSE_DIM)),
                TIER1_EMBED_QUEUE,
            )),
            Tier1Config {
                window_sec: config.t1_window_sec,
                max_points: config.t1_max_points,
                threshold: config.anomaly_threshold,
                alpha: config.anomaly_alpha,
            },
        ));
        tier1.reset().await?;

        let forensic = Arc::new(ForensicStore::new(backend));
        let promotion = Arc::new(PromotionPipeline::new(
            forensic.clone(),
            control.clone(),
            idf.clone(),
        ));
        let federation = Arc::new(FederatedQuery::new(
            forensic.clone(),
            Duration::from_millis(config.query_timeout_ms),
        ));
        let ingest = Arc::new(IngestCoordinator::new(tier1.clone(), config.dedup_capacity));

        Ok(Arc::new(Self {
            config,
            tier1,
            ingest,
            promotion,
            forensic,
            federation,
            control,
            regression,
            schemas,
            idf,
            started_at: Utc::now(),
        }))
    }

    /// One anomaly pass: score the window, then hand every returned class to
    /// the promotion pipeline.
    pub async fn run_analysis(
        &self,
        now: i64,
        window_sec: i64,
        top_k: usize,
        threshold: Option<f64>,
    ) -> Result<(Vec<RhythmAnomaly>, Vec<RhythmHash>), ViaError> {
        // The pass acts on control truth as of `now`, not the last timer
        // tick: a suppression that expired a moment ago must not hide the
        // class from this analysis.
        self.control.refresh(now)?;
        let active = self.control.active_set();
        let anomalies = self
            .tier1
            .rhythm_anomalies(now, window_sec, top_k, threshold, &active, &self.control)
            .await?;
        let promoted = self.promotion.promote(&anomalies, now).await?;
        Ok((anomalies, promoted))
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
