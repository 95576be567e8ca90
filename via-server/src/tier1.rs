//! Tier-1 rhythm monitor
//!
//! Sliding-window index over recent events. Every ingested event lands here
//! with its rhythm hash and a cheap 64-D skeleton embedding; the anomaly
//! pass aggregates the window by hash and scores each class on novelty and
//! frequency. The collection is owned exclusively by this monitor and is
//! recreated on process start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;
use via_core::control::{ActiveSet, ControlRegistry};
use via_core::embed::Embedder;
use via_core::error::ViaError;
use via_core::event::{Level, LogEvent};
use via_core::rhythm::{EncodedEvent, RhythmHash};
use via_core::vector::{
    CollectionSpec, DenseConfig, Distance, Filter, Point, ScrollRequest, VectorBackend,
};

/// Name of the ephemeral Tier-1 collection.
pub const TIER1_COLLECTION: &str = "rhythm_monitor";

/// Dimensionality of the Tier-1 skeleton embedding.
pub const TIER1_DENSE_DIM: usize = 64;

/// Slack allowed past the window before eviction catches up.
pub const EVICTION_GRACE_SEC: i64 = 60;

/// Normalizer for the frequency z-score in the anomaly score.
const Z_NORM: f64 = 4.0;

/// Floor for the frequency term: a silent template pulls the score down,
/// but never to minus infinity.
const FREQ_FLOOR: f64 = -8.0;

const MINUTE: i64 = 60;

/// Tier-1 scoring and retention knobs.
#[derive(Debug, Clone)]
pub struct Tier1Config {
    pub window_sec: i64,
    pub max_points: usize,
    pub threshold: f64,
    pub alpha: f64,
}

/// One anomalous rhythm class in the analysis window.
#[derive(Debug, Clone)]
pub struct RhythmAnomaly {
    pub rhythm_hash: RhythmHash,
    pub representative: LogEvent,
    pub score: f64,
    pub count: usize,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// The sliding-window monitor.
pub struct Tier1Monitor {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    config: Tier1Config,
}

impl Tier1Monitor {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        config: Tier1Config,
    ) -> Self {
        Self {
            backend,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &Tier1Config {
        &self.config
    }

    fn collection_spec() -> CollectionSpec {
        CollectionSpec {
            dense: DenseConfig {
                size: TIER1_DENSE_DIM,
                distance: Distance::Dot,
                on_disk: false,
                scalar_int8: false,
            },
            sparse: false,
            payload_indices: vec!["ts".to_string(), "rhythm_hash".to_string()],
        }
    }

    /// Recreate the collection. Tier-1 owns it and never carries state
    /// across restarts.
    pub async fn reset(&self) -> Result<(), ViaError> {
        self.backend.drop_collection(TIER1_COLLECTION).await?;
        self.backend
            .ensure_collection(TIER1_COLLECTION, &Self::collection_spec())
            .await?;
        Ok(())
    }

    fn payload_of(event: &LogEvent, hash: RhythmHash) -> Value {
        json!({
            "ts": event.ts,
            "service": event.service,
            "level": event.level.as_str(),
            "rhythm_hash": hash.to_string(),
            "message": event.message,
        })
    }

    fn event_from_payload(payload: &Value) -> Option<LogEvent> {
        Some(LogEvent::new(
            payload.get("ts")?.as_i64()?,
            payload.get("service")?.as_str()?,
            Level::parse(payload.get("level")?.as_str()?)?,
            payload.get("message")?.as_str()?,
        ))
    }

    /// Index one already-encoded batch, in input order.
    pub async fn index_batch(
        &self,
        items: &[(LogEvent, EncodedEvent)],
    ) -> Result<(), ViaError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut points = Vec::with_capacity(items.len());
        for (event, encoded) in items {
            let dense = self.embedder.embed(&encoded.skeleton).await?;
            points.push(Point {
                id: encoded.id,
                dense,
                sparse: None,
                payload: Self::payload_of(event, encoded.hash),
            });
        }
        self.backend.upsert(TIER1_COLLECTION, points).await?;
        Ok(())
    }

    /// Which of the given ids are already indexed. Backs the ingest dedup's
    /// second line of defense against replayed tails.
    pub async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<Uuid>, ViaError> {
        let found = self.backend.retrieve(TIER1_COLLECTION, ids).await?;
        Ok(found.into_iter().map(|p| p.id).collect())
    }

    pub async fn point_count(&self) -> Result<usize, ViaError> {
        Ok(self.backend.count(TIER1_COLLECTION).await?)
    }

    /// Most recent events of one rhythm class, newest first. Used for
    /// regression snapshots.
    pub async fn snapshot_events(
        &self,
        hash: RhythmHash,
        limit: usize,
    ) -> Result<Vec<LogEvent>, ViaError> {
        let points = self
            .backend
            .scroll(
                TIER1_COLLECTION,
                ScrollRequest {
                    filter: Some(Filter::new().equals("rhythm_hash", hash.to_string())),
                    limit: 0,
                },
            )
            .await?;
        let mut events: Vec<LogEvent> = points
            .iter()
            .filter_map(|p| Self::event_from_payload(&p.payload))
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.ts));
        events.truncate(limit);
        Ok(events)
    }

    /// Drop points that have aged out of the window, then enforce the hard
    /// point cap (oldest first).
    #[instrument(skip(self))]
    pub async fn evict(&self, now: i64) -> Result<usize, ViaError> {
        let horizon = now - self.config.window_sec;
        let stale = self
            .backend
            .scroll(
                TIER1_COLLECTION,
                ScrollRequest {
                    filter: Some(Filter::new().range("ts", None, Some(horizon - 1))),
                    limit: 0,
                },
            )
            .await?;
        let ids: Vec<Uuid> = stale.iter().map(|p| p.id).collect();
        let mut removed = if ids.is_empty() {
            0
        } else {
            self.backend.delete_points(TIER1_COLLECTION, &ids).await?
        };

        let count = self.backend.count(TIER1_COLLECTION).await?;
        if count > self.config.max_points {
            let mut all: Vec<(i64, Uuid)> = self
                .backend
                .scroll(TIER1_COLLECTION, ScrollRequest::default())
                .await?
                .iter()
                .map(|p| (p.payload.get("ts").and_then(Value::as_i64).unwrap_or(0), p.id))
                .collect();
            all.sort_by_key(|(ts, _)| *ts);
            let excess: Vec<Uuid> = all
                .iter()
                .take(count - self.config.max_points)
                .map(|(_, id)| *id)
                .collect();
            removed += self.backend.delete_points(TIER1_COLLECTION, &excess).await?;
        }

        if removed > 0 {
            debug!(removed, "evicted Tier-1 points");
        }
        Ok(removed)
    }

    /// Score the window and return the top anomalous rhythm classes.
    ///
    /// Classes in the active suppress/patch set never appear. Everything
    /// returned is eligible for promotion.
    #[instrument(skip(self, active, control))]
    pub async fn rhythm_anomalies(
        &self,
        now: i64,
        window_sec: i64,
        top_k: usize,
        threshold: Option<f64>,
        active: &ActiveSet,
        control: &ControlRegistry,
    ) -> Result<Vec<RhythmAnomaly>, ViaError> {
        let threshold = threshold.unwrap_or(self.config.threshold);
        let window_start = now - window_sec.max(0);

        let points = self
            .backend
            .scroll(
                TIER1_COLLECTION,
                ScrollRequest {
                    filter: Some(Filter::new().range("ts", Some(window_start), Some(now))),
                    limit: 0,
                },
            )
            .await?;
        if points.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        // Aggregate by hash: timestamps plus the representative candidate.
        struct ClassAgg {
            timestamps: Vec<i64>,
            rep: (i64, String, Value),
        }
        let mut classes: HashMap<RhythmHash, ClassAgg> = HashMap::new();
        for p in &points {
            let Some(hash) = p
                .payload
                .get("rhythm_hash")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<RhythmHash>().ok())
            else {
                continue;
            };
            if active.is_hidden(hash) {
                continue;
            }
            let ts = p.payload.get("ts").and_then(Value::as_i64).unwrap_or(0);
            let id = p.id.to_string();
            let entry = classes.entry(hash).or_insert_with(|| ClassAgg {
                timestamps: Vec::new(),
                rep: (ts, id.clone(), p.payload.clone()),
            });
            entry.timestamps.push(ts);
            // Most recent wins; ties break toward the larger id.
            if (ts, &id) > (entry.rep.0, &entry.rep.1) {
                entry.rep = (ts, id, p.payload.clone());
            }
        }

        let mut anomalies: Vec<RhythmAnomaly> = Vec::new();
        for (hash, agg) in classes {
            let count = agg.timestamps.len();
            let first_ts = *agg.timestamps.iter().min().unwrap_or(&now);
            let last_ts = *agg.timestamps.iter().max().unwrap_or(&now);

            let novelty = control.novelty(hash, now)?;
            let freq = frequency_term(&agg.timestamps, window_start, now);
            let score = self.config.alpha * novelty + (1.0 - self.config.alpha) * freq;

            if score < threshold {
                continue;
            }
            let Some(representative) = Self::event_from_payload(&agg.rep.2) else {
                continue;
            };
            anomalies.push(RhythmAnomaly {
                rhythm_hash: hash,
                representative,
                score,
                count,
                first_ts,
                last_ts,
            });
        }

        anomalies.sort_by(|a, b| b.score.total_cmp(&a.score));
        anomalies.truncate(top_k);
        debug!(found = anomalies.len(), "rhythm anomaly pass complete");
        Ok(anomalies)
    }
}

/// Frequency anomaly term in [FREQ_FLOOR, 1].
///
/// The final minute's count is z-scored against the per-minute rate over the
/// rest of the window. A class with no history before the final minute is
/// new: its z is +inf and the term saturates at 1.
fn frequency_term(timestamps: &[i64], window_start: i64, now: i64) -> f64 {
    let last_start = now - MINUTE;
    let c_last = timestamps.iter().filter(|&&ts| ts > last_start).count() as f64;

    if last_start <= window_start {
        // Sub-minute window: no rate history can exist.
        return 1.0;
    }
    let first_ts = timestamps.iter().min().copied().unwrap_or(now);
    if first_ts > last_start {
        // First seen inside the final minute.
        return 1.0;
    }

    let bucket_count = (((last_start - window_start) + MINUTE - 1) / MINUTE).max(1) as usize;
    let mut buckets = vec![0f64; bucket_count];
    for &ts in timestamps.iter().filter(|&&ts| ts <= last_start) {
        let idx = (((ts - window_start) / MINUTE).max(0) as usize).min(bucket_count - 1);
        buckets[idx] += 1.0;
    }

    let mean = buckets.iter().sum::<f64>() / bucket_count as f64;
    let variance = buckets.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / bucket_count as f64;
    let sigma = variance.sqrt();

    let z = if sigma > 0.0 {
        (c_last - mean) / sigma
    } else if (c_last - mean).abs() < f64::EPSILON {
        0.0
    } else if c_last > mean {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    };

    (z / Z_NORM).min(1.0).max(FREQ_FLOOR)
}
