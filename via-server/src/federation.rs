//! Federated Tier-2 queries
//!
//! Cluster and triage queries fan out across every daily partition whose day
//! overlaps the requested range. Partitions run concurrently, each under the
//! query deadline; one that times out or errors contributes nothing and is
//! named in `warnings[]` instead of failing the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;
use via_core::rhythm::RhythmHash;
use via_core::vector::{Filter, GroupedSearchRequest, RecommendRequest, ScoredPoint};

use crate::forensic::ForensicStore;

/// Global result budget for cluster queries, split across partitions.
const CLUSTERS_LIMIT: usize = 100;

/// Default result budget for triage queries.
pub const DEFAULT_TRIAGE_LIMIT: usize = 50;

/// Optional payload filters accepted by both query operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl IncidentFilters {
    fn to_filter(&self, start_ts: i64, end_ts: i64) -> Filter {
        let mut filter = Filter::new()
            .range("first_seen_ts", None, Some(end_ts))
            .range("last_seen_ts", Some(start_ts), None);
        if let Some(service) = &self.service {
            filter = filter.equals("service", service.clone());
        }
        if let Some(level) = &self.level {
            filter = filter.equals("level", level.clone());
        }
        filter
    }
}

/// One Tier-2 incident as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub rhythm_hash: RhythmHash,
    pub service: String,
    pub level: String,
    pub representative_message: String,
    pub first_seen_ts: i64,
    pub last_seen_ts: i64,
    pub count: i64,
    pub promoted_at: i64,
    pub promoted_score: f64,
    /// Partition the incident was read from.
    pub partition: String,
    /// Triage relevance (mean positive minus mean negative cosine); absent
    /// for cluster queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Incident {
    fn from_payload(id: Uuid, payload: &Value, partition: &str, score: Option<f32>) -> Option<Self> {
        Some(Self {
            id,
            rhythm_hash: payload.get("rhythm_hash")?.as_str()?.parse().ok()?,
            service: payload.get("service")?.as_str()?.to_string(),
            level: payload.get("level")?.as_str()?.to_string(),
            representative_message: payload.get("representative_message")?.as_str()?.to_string(),
            first_seen_ts: payload.get("first_seen_ts")?.as_i64()?,
            last_seen_ts: payload.get("last_seen_ts")?.as_i64()?,
            count: payload.get("count")?.as_i64()?,
            promoted_at: payload.get("promoted_at")?.as_i64()?,
            promoted_score: payload.get("promoted_score")?.as_f64()?,
            partition: partition.to_string(),
            score,
        })
    }
}

/// Query result plus the partitions that failed to answer in time.
pub type Federated<T> = (T, Vec<String>);

/// The query layer over the daily partitions.
pub struct FederatedQuery {
    forensic: Arc<ForensicStore>,
    timeout: Duration,
}

impl FederatedQuery {
    pub fn new(forensic: Arc<ForensicStore>, timeout: Duration) -> Self {
        Self { forensic, timeout }
    }

    /// One incident per rhythm class across the window, newest promotion
    /// first. Duplicates across partitions keep the record with the larger
    /// count.
    #[instrument(skip(self, filters))]
    pub async fn clusters(
        &self,
        start_ts: i64,
        end_ts: i64,
        filters: &IncidentFilters,
    ) -> Federated<Vec<Incident>> {
        let partitions = match self.forensic.existing_in_window(start_ts, end_ts).await {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, "partition enumeration failed");
                return (Vec::new(), vec!["partition_listing".to_string()]);
            }
        };
        if partitions.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let per_partition = (CLUSTERS_LIMIT / partitions.len()).max(1);
        let filter = filters.to_filter(start_ts, end_ts);
        let backend = self.forensic.backend();

        let tasks = partitions.iter().map(|name| {
            let backend = backend.clone();
            let filter = filter.clone();
            let name = name.clone();
            async move {
                let request = GroupedSearchRequest {
                    vector: None,
                    filter: Some(filter),
                    group_by: "rhythm_hash".to_string(),
                    group_size: 1,
                    limit: per_partition,
                };
                let result =
                    tokio::time::timeout(self.timeout, backend.search_groups(&name, request))
                        .await;
                (name, result)
            }
        });

        let mut warnings = Vec::new();
        let mut by_hash: HashMap<RhythmHash, Incident> = HashMap::new();
        for (name, outcome) in join_all(tasks).await {
            let groups = match outcome {
                Ok(Ok(groups)) => groups,
                Ok(Err(err)) => {
                    warn!(partition = %name, %err, "partition query failed");
                    warnings.push(name);
                    continue;
                }
                Err(_) => {
                    warn!(partition = %name, "partition query timed out");
                    warnings.push(name);
                    continue;
                }
            };
            for group in groups {
                let Some(hit) = group.hits.first() else { continue };
                let Some(incident) = Incident::from_payload(hit.id, &hit.payload, &name, None)
                else {
                    continue;
                };
                match by_hash.get(&incident.rhythm_hash) {
                    Some(kept) if kept.count >= incident.count => {}
                    _ => {
                        by_hash.insert(incident.rhythm_hash, incident);
                    }
                }
            }
        }

        let mut incidents: Vec<Incident> = by_hash.into_values().collect();
        incidents.sort_by_key(|i| std::cmp::Reverse(i.promoted_at));
        (incidents, warnings)
    }

    /// Recommendation triage: positive/negative example incident ids against
    /// the dense space, merged by round-robin interleave and re-ranked on
    /// the recommend score.
    #[instrument(skip(self, filters), fields(positives = positive_ids.len()))]
    pub async fn triage(
        &self,
        start_ts: i64,
        end_ts: i64,
        positive_ids: &[Uuid],
        negative_ids: &[Uuid],
        filters: &IncidentFilters,
        limit: usize,
    ) -> Federated<Vec<Incident>> {
        let partitions = match self.forensic.existing_in_window(start_ts, end_ts).await {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, "partition enumeration failed");
                return (Vec::new(), vec!["partition_listing".to_string()]);
            }
        };
        if partitions.is_empty() || positive_ids.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let filter = filters.to_filter(start_ts, end_ts);
        let backend = self.forensic.backend();

        let tasks = partitions.iter().map(|name| {
            let backend = backend.clone();
            let filter = filter.clone();
            let name = name.clone();
            let request = RecommendRequest {
                positive: positive_ids.to_vec(),
                negative: negative_ids.to_vec(),
                filter: Some(filter),
                limit,
            };
            async move {
                let result =
                    tokio::time::timeout(self.timeout, backend.recommend(&name, request)).await;
                (name, result)
            }
        });

        let mut warnings = Vec::new();
        let mut per_partition: Vec<(String, Vec<ScoredPoint>)> = Vec::new();
        for (name, outcome) in join_all(tasks).await {
            match outcome {
                Ok(Ok(hits)) => per_partition.push((name, hits)),
                Ok(Err(err)) => {
                    warn!(partition = %name, %err, "partition recommend failed");
                    warnings.push(name);
                }
                Err(_) => {
                    warn!(partition = %name, "partition recommend timed out");
                    warnings.push(name);
                }
            }
        }

        // Round-robin interleave, then a stable global re-rank by score.
        let mut interleaved: Vec<Incident> = Vec::new();
        let mut cursors: Vec<usize> = vec![0; per_partition.len()];
        loop {
            let mut advanced = false;
            for (slot, (name, hits)) in per_partition.iter().enumerate() {
                if let Some(hit) = hits.get(cursors[slot]) {
                    cursors[slot] += 1;
                    advanced = true;
                    if let Some(incident) =
                        Incident::from_payload(hit.id, &hit.payload, name, Some(hit.score))
                    {
                        interleaved.push(incident);
                    }
                }
            }
            if !advanced {
                break;
            }
        }

        interleaved.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0))
        });
        interleaved.truncate(limit);
        (interleaved, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use via_core::vector::{MemoryBackend, Point, VectorBackend};

    const DAY1: i64 = 1_717_200_030; // 2024-06-01
    const DAY0: i64 = DAY1 - 86_400; // 2024-05-31

    fn incident_payload(hash: u64, service: &str, count: i64, promoted_at: i64) -> Value {
        json!({
            "rhythm_hash": RhythmHash(hash).to_string(),
            "service": service,
            "level": "ERROR",
            "representative_message": format!("assertion failed at /app/main.c:{hash}"),
            "first_seen_ts": promoted_at - 60,
            "last_seen_ts": promoted_at - 5,
            "count": count,
            "promoted_at": promoted_at,
            "promoted_score": 0.9,
        })
    }

    fn dense(seed: f32) -> Vec<f32> {
        let mut v = vec![seed; 384];
        v[0] = 1.0;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    async fn seeded_store() -> Arc<ForensicStore> {
        let store = Arc::new(ForensicStore::new(Arc::new(MemoryBackend::new())));
        for (day_ts, hash, count) in [(DAY0, 1u64, 40i64), (DAY1, 1, 10), (DAY1, 2, 7)] {
            let name = store.ensure_daily(day_ts).await.unwrap();
            let id = via_core::rhythm::incident_id(RhythmHash(hash), &ForensicStore::day_key(day_ts));
            store
                .backend()
                .upsert(
                    &name,
                    vec![Point {
                        id,
                        dense: dense(hash as f32 * 0.1),
                        sparse: None,
                        payload: incident_payload(hash, "gateway", count, day_ts),
                    }],
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn clusters_deduplicate_across_partitions_keeping_larger_count() {
        let store = seeded_store().await;
        let fed = FederatedQuery::new(store, Duration::from_secs(3));

        let (incidents, warnings) = fed
            .clusters(DAY0 - 3600, DAY1 + 3600, &IncidentFilters::default())
            .await;
        assert!(warnings.is_empty());
        assert_eq!(incidents.len(), 2);

        let one = incidents.iter().find(|i| i.rhythm_hash == RhythmHash(1)).unwrap();
        assert_eq!(one.count, 40);
        assert_eq!(one.partition, "forensic_2024_05_31");
        // Newest promotion sorts first.
        assert_eq!(incidents[0].rhythm_hash, RhythmHash(2));
    }

    #[tokio::test]
    async fn clusters_respect_service_filter() {
        let store = seeded_store().await;
        let fed = FederatedQuery::new(store, Duration::from_secs(3));
        let filters = IncidentFilters {
            service: Some("billing".to_string()),
            level: None,
        };
        let (incidents, _) = fed.clusters(DAY0 - 3600, DAY1 + 3600, &filters).await;
        assert!(incidents.is_empty());
    }

    #[tokio::test]
    async fn clusters_on_empty_window_return_nothing() {
        let store = Arc::new(ForensicStore::new(Arc::new(MemoryBackend::new())));
        let fed = FederatedQuery::new(store, Duration::from_secs(3));
        let (incidents, warnings) = fed.clusters(0, 100, &IncidentFilters::default()).await;
        assert!(incidents.is_empty());
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn triage_orders_by_recommend_score() {
        let store = Arc::new(ForensicStore::new(Arc::new(MemoryBackend::new())));
        let name = store.ensure_daily(DAY1).await.unwrap();

        let mk = |id: u128, v: Vec<f32>, hash: u64| Point {
            id: Uuid::from_u128(id),
            dense: v,
            sparse: None,
            payload: incident_payload(hash, "gateway", 5, DAY1),
        };
        let mut close = vec![0.0f32; 384];
        close[0] = 1.0;
        close[1] = 0.1;
        let mut far = vec![0.0f32; 384];
        far[1] = 1.0;
        let mut anchor = vec![0.0f32; 384];
        anchor[0] = 1.0;

        store
            .backend()
            .upsert(&name, vec![mk(1, anchor, 1), mk(2, close, 2), mk(3, far, 3)])
            .await
            .unwrap();

        let fed = FederatedQuery::new(store, Duration::from_secs(3));
        let (incidents, warnings) = fed
            .triage(
                DAY1 - 3600,
                DAY1 + 3600,
                &[Uuid::from_u128(1)],
                &[],
                &IncidentFilters::default(),
                10,
            )
            .await;
        assert!(warnings.is_empty());
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].id, Uuid::from_u128(2));
        // Ordered by non-increasing score.
        assert!(incidents[0].score.unwrap() >= incidents[1].score.unwrap());
    }

    #[tokio::test]
    async fn triage_without_positives_is_empty() {
        let store = seeded_store().await;
        let fed = FederatedQuery::new(store, Duration::from_secs(3));
        let (incidents, _) = fed
            .triage(DAY0, DAY1, &[], &[], &IncidentFilters::default(), 10)
            .await;
        assert!(incidents.is_empty());
    }

    #[tokio::test]
    async fn slow_partition_is_flagged_not_fatal() {
        let inner = Arc::new(MemoryBackend::new());
        let seed_store = ForensicStore::new(inner.clone());
        for (day_ts, hash) in [(DAY0, 1u64), (DAY1, 2)] {
            let name = seed_store.ensure_daily(day_ts).await.unwrap();
            let id = via_core::rhythm::incident_id(RhythmHash(hash), &ForensicStore::day_key(day_ts));
            inner
                .upsert(
                    &name,
                    vec![Point {
                        id,
                        dense: dense(0.2),
                        sparse: None,
                        payload: incident_payload(hash, "gateway", 5, day_ts),
                    }],
                )
                .await
                .unwrap();
        }

        // The 05-31 partition answers slower than the deadline.
        let slow = Arc::new(via_core::vector::SlowBackend::for_collection(
            inner,
            "forensic_2024_05_31",
            Duration::from_millis(300),
        ));
        let fed = FederatedQuery::new(
            Arc::new(ForensicStore::new(slow)),
            Duration::from_millis(100),
        );

        let (incidents, warnings) = fed
            .clusters(DAY0 - 3600, DAY1 + 3600, &IncidentFilters::default())
            .await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].rhythm_hash, RhythmHash(2));
        assert_eq!(warnings, vec!["forensic_2024_05_31".to_string()]);
    }
}
