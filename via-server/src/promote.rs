//! Promotion pipeline
//!
//! Lifts anomalous rhythm classes out of Tier-1 into the permanent forensic
//! index. One incident record per `(rhythm_hash, UTC day)`: the record id is
//! a stable hash of both, so overlapping analysis windows upsert in place
//! instead of duplicating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};
use via_core::control::ControlRegistry;
use via_core::embed::sparse::IdfIndex;
use via_core::embed::{Embedder, HashingEmbedder, SharedEmbedder};
use via_core::error::ViaError;
use via_core::rhythm::{incident_id, RhythmHash};
use via_core::vector::Point;

use crate::forensic::{ForensicStore, TIER2_DENSE_DIM};
use crate::tier1::RhythmAnomaly;

/// Queue depth of the Tier-2 embedder singleton.
const EMBED_QUEUE: usize = 32;

/// How long a single promotion keeps retrying before degrading.
const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(60);

const RETRY_BASE: Duration = Duration::from_millis(100);

/// The promotion worker shared by the analysis endpoint and the periodic
/// analysis task.
pub struct PromotionPipeline {
    forensic: Arc<ForensicStore>,
    control: Arc<ControlRegistry>,
    idf: Arc<IdfIndex>,
    // High-fidelity embedder, built on first promotion.
    embedder: OnceCell<Arc<SharedEmbedder>>,
    degraded: AtomicBool,
    retry_deadline: Duration,
}

impl PromotionPipeline {
    pub fn new(
        forensic: Arc<ForensicStore>,
        control: Arc<ControlRegistry>,
        idf: Arc<IdfIndex>,
    ) -> Self {
        Self {
            forensic,
            control,
            idf,
            embedder: OnceCell::new(),
            degraded: AtomicBool::new(false),
            retry_deadline: DEFAULT_RETRY_DEADLINE,
        }
    }

    /// Shrink the retry deadline (tests exercise the degraded path).
    pub fn with_retry_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = deadline;
        self
    }

    /// Whether the last promotion pass hit a persistent failure.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn embedder(&self) -> Arc<SharedEmbedder> {
        self.embedder
            .get_or_init(|| async {
                debug!(dim = TIER2_DENSE_DIM, "initializing Tier-2 embedder");
                Arc::new(SharedEmbedder::new(
                    Arc::new(HashingEmbedder::new(TIER2_DENSE_DIM)),
                    EMBED_QUEUE,
                ))
            })
            .await
            .clone()
    }

    /// Promote a set of anomalies at `now`. Returns the hashes that made it
    /// into Tier-2; persistent failures flip the degraded flag and are
    /// skipped rather than surfaced to the caller.
    #[instrument(skip(self, anomalies), fields(candidates = anomalies.len()))]
    pub async fn promote(
        &self,
        anomalies: &[RhythmAnomaly],
        now: i64,
    ) -> Result<Vec<RhythmHash>, ViaError> {
        if anomalies.is_empty() {
            return Ok(Vec::new());
        }

        let mut promoted = Vec::with_capacity(anomalies.len());
        let mut any_failed = false;
        for anomaly in anomalies {
            match self.promote_one(anomaly, now).await {
                Ok(()) => promoted.push(anomaly.rhythm_hash),
                Err(err) => {
                    any_failed = true;
                    error!(
                        hash = %anomaly.rhythm_hash,
                        %err,
                        "promotion degraded; Tier-1 continues to serve"
                    );
                }
            }
        }
        self.degraded.store(any_failed, Ordering::Relaxed);
        Ok(promoted)
    }

    async fn promote_one(&self, anomaly: &RhythmAnomaly, now: i64) -> Result<(), ViaError> {
        let rep = &anomaly.representative;
        let embedder = self.embedder().await;

        let deadline = Instant::now() + self.retry_deadline;
        let dense = retry_until(deadline, || async { Ok(embedder.embed(&rep.message).await?) })
            .await?;
        let sparse = self.idf.snapshot().encode(&rep.message);

        let collection =
            retry_until(deadline, || async { Ok(self.forensic.ensure_daily(now).await?) }).await?;
        let day = ForensicStore::day_key(now);
        let id = incident_id(anomaly.rhythm_hash, &day);

        let existing = self
            .forensic
            .backend()
            .retrieve(&collection, &[id])
            .await?
            .into_iter()
            .next();
        let newly = existing.is_none();
        let payload = merge_payload(existing.map(|p| p.payload), anomaly, now);

        let point = Point {
            id,
            dense,
            sparse: Some(sparse),
            payload,
        };
        retry_until(deadline, || {
            let point = point.clone();
            async { Ok(self.forensic.backend().upsert(&collection, vec![point]).await?) }
        })
        .await?;

        if newly {
            self.control.record_promotion(anomaly.rhythm_hash, now)?;
        }
        debug!(hash = %anomaly.rhythm_hash, %collection, newly, "promoted rhythm class");
        Ok(())
    }
}

/// Merge a re-promotion into the existing same-day record: counts and spans
/// grow monotonically, the original promotion instant is kept.
fn merge_payload(existing: Option<Value>, anomaly: &RhythmAnomaly, now: i64) -> Value {
    let rep = &anomaly.representative;
    let mut count = anomaly.count as i64;
    let mut first_seen = anomaly.first_ts;
    let mut last_seen = anomaly.last_ts;
    let mut promoted_at = now;
    let mut promoted_score = anomaly.score;

    if let Some(old) = existing {
        let get = |key: &str| old.get(key).and_then(Value::as_i64);
        count = count.max(get("count").unwrap_or(0));
        first_seen = first_seen.min(get("first_seen_ts").unwrap_or(first_seen));
        last_seen = last_seen.max(get("last_seen_ts").unwrap_or(last_seen));
        promoted_at = get("promoted_at").unwrap_or(promoted_at);
        promoted_score = promoted_score
            .max(old.get("promoted_score").and_then(Value::as_f64).unwrap_or(0.0));
    }

    json!({
        "rhythm_hash": anomaly.rhythm_hash.to_string(),
        "service": rep.service,
        "level": rep.level.as_str(),
        "representative_message": rep.message,
        "first_seen_ts": first_seen,
        "last_seen_ts": last_seen,
        "count": count,
        "promoted_at": promoted_at,
        "promoted_score": promoted_score,
    })
}

/// Retry an operation with exponential backoff until it succeeds or the
/// deadline passes; the terminal error is returned as-is.
async fn retry_until<T, F, Fut>(deadline: Instant, mut op: F) -> Result<T, ViaError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ViaError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let pause = RETRY_BASE * 2u32.saturating_pow(attempt.min(6));
                if Instant::now() + pause >= deadline {
                    return Err(err);
                }
                warn!(attempt, %err, "promotion step failed; backing off");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use via_core::control::SqliteControlStore;
    use via_core::event::{Level, LogEvent};
    use via_core::vector::{MemoryBackend, ScrollRequest};

    const NOW: i64 = 1_717_200_030; // 2024-06-01T00:00:30Z

    fn anomaly(hash: u64, count: usize) -> RhythmAnomaly {
        RhythmAnomaly {
            rhythm_hash: RhythmHash(hash),
            representative: LogEvent::new(
                NOW - 10,
                "gateway",
                Level::Error,
                "assertion failed at /app/src/main.c:42",
            ),
            score: 0.97,
            count,
            first_ts: NOW - 55,
            last_ts: NOW - 10,
        }
    }

    fn pipeline() -> (PromotionPipeline, Arc<ForensicStore>, Arc<ControlRegistry>) {
        let forensic = Arc::new(ForensicStore::new(Arc::new(MemoryBackend::new())));
        let control = Arc::new(
            ControlRegistry::new(Arc::new(SqliteControlStore::open_in_memory().unwrap())).unwrap(),
        );
        let idf = Arc::new(IdfIndex::new());
        (
            PromotionPipeline::new(forensic.clone(), control.clone(), idf),
            forensic,
            control,
        )
    }

    #[tokio::test]
    async fn promotes_into_the_daily_partition() {
        let (p, forensic, _) = pipeline();
        let promoted = p.promote(&[anomaly(1, 30)], NOW).await.unwrap();
        assert_eq!(promoted, vec![RhythmHash(1)]);
        assert!(!p.is_degraded());

        let points = forensic
            .backend()
            .scroll("forensic_2024_06_01", ScrollRequest::default())
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        let payload = &points[0].payload;
        assert_eq!(payload["count"], 30);
        assert_eq!(payload["rhythm_hash"], RhythmHash(1).to_string());
        assert!(payload["representative_message"]
            .as_str()
            .unwrap()
            .contains("assertion failed"));
        assert!(points[0].sparse.is_some());
        assert_eq!(points[0].dense.len(), TIER2_DENSE_DIM);
    }

    #[tokio::test]
    async fn repromotion_within_a_day_is_idempotent() {
        let (p, forensic, _) = pipeline();
        p.promote(&[anomaly(1, 30)], NOW).await.unwrap();
        p.promote(&[anomaly(1, 12)], NOW + 120).await.unwrap();

        let points = forensic
            .backend()
            .scroll("forensic_2024_06_01", ScrollRequest::default())
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        // Count stays at the larger observation, promoted_at at the first.
        assert_eq!(points[0].payload["count"], 30);
        assert_eq!(points[0].payload["promoted_at"], NOW);
    }

    #[tokio::test]
    async fn next_day_gets_its_own_record() {
        let (p, forensic, _) = pipeline();
        p.promote(&[anomaly(1, 30)], NOW).await.unwrap();
        p.promote(&[anomaly(1, 5)], NOW + 86_400).await.unwrap();

        assert!(forensic
            .backend()
            .collection_exists("forensic_2024_06_01")
            .await
            .unwrap());
        assert!(forensic
            .backend()
            .collection_exists("forensic_2024_06_02")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn first_promotion_bumps_prevalence() {
        let (p, _, control) = pipeline();
        assert!((control.novelty(RhythmHash(1), NOW).unwrap() - 1.0).abs() < 1e-9);
        p.promote(&[anomaly(1, 30)], NOW).await.unwrap();
        let after = control.novelty(RhythmHash(1), NOW).unwrap();
        assert!(after < 1.0);

        // Same-day re-promotion does not double-count (the counter only
        // decays a hair over the minute).
        p.promote(&[anomaly(1, 30)], NOW + 60).await.unwrap();
        let again = control.novelty(RhythmHash(1), NOW + 60).unwrap();
        assert!((again - after).abs() < 1e-3);
    }

    #[tokio::test]
    async fn empty_input_promotes_nothing() {
        let (p, forensic, _) = pipeline();
        let promoted = p.promote(&[], NOW).await.unwrap();
        assert!(promoted.is_empty());
        assert_eq!(forensic.partition_count().await.unwrap(), 0);
    }
}
