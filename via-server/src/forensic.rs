//! Tier-2 forensic store façade
//!
//! Thin layer over the vector backend that enforces the daily collection
//! naming, the hybrid dense+sparse layout, and retention. Collections are
//! created lazily on first write and never mutated after their day closes,
//! except to be dropped by the retention sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{info, warn};
use via_core::error::VectorError;
use via_core::vector::{CollectionSpec, DenseConfig, Distance, VectorBackend};

/// Prefix for daily Tier-2 partitions.
pub const FORENSIC_PREFIX: &str = "forensic_";

/// Dimensionality of the Tier-2 dense embedding.
pub const TIER2_DENSE_DIM: usize = 384;

/// Naming, layout, and retention for the daily partitions.
pub struct ForensicStore {
    backend: Arc<dyn VectorBackend>,
}

impl ForensicStore {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn VectorBackend> {
        self.backend.clone()
    }

    /// Collection layout shared by every partition: on-disk INT8-quantized
    /// cosine dense space, BM25 sparse space, and the standard payload
    /// indices.
    pub fn collection_spec() -> CollectionSpec {
        CollectionSpec {
            dense: DenseConfig {
                size: TIER2_DENSE_DIM,
                distance: Distance::Cosine,
                on_disk: true,
                scalar_int8: true,
            },
            sparse: true,
            payload_indices: vec![
                "service".to_string(),
                "rhythm_hash".to_string(),
                "promoted_at".to_string(),
                "first_seen_ts".to_string(),
                "last_seen_ts".to_string(),
            ],
        }
    }

    /// `forensic_YYYY_MM_DD` for the UTC day containing `ts`.
    pub fn collection_name(ts: i64) -> String {
        let day = DateTime::<Utc>::from_timestamp(ts, 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .date_naive();
        format!("{FORENSIC_PREFIX}{}", day.format("%Y_%m_%d"))
    }

    /// The UTC day key (`YYYY_MM_DD`) for an incident id.
    pub fn day_key(ts: i64) -> String {
        let day = DateTime::<Utc>::from_timestamp(ts, 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .date_naive();
        day.format("%Y_%m_%d").to_string()
    }

    /// Names of every partition whose day overlaps `[start_ts, end_ts]`,
    /// oldest first. Purely computed; existence is not checked.
    pub fn collections_for_window(start_ts: i64, end_ts: i64) -> Vec<String> {
        let start = DateTime::<Utc>::from_timestamp(start_ts.min(end_ts), 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .date_naive();
        let end = DateTime::<Utc>::from_timestamp(end_ts.max(start_ts), 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .date_naive();

        let mut out = Vec::new();
        let mut day = start;
        while day <= end {
            out.push(format!("{FORENSIC_PREFIX}{}", day.format("%Y_%m_%d")));
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        out
    }

    /// Partitions overlapping the window that actually exist.
    pub async fn existing_in_window(
        &self,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<String>, VectorError> {
        let mut out = Vec::new();
        for name in Self::collections_for_window(start_ts, end_ts) {
            if self.backend.collection_exists(&name).await? {
                out.push(name);
            }
        }
        Ok(out)
    }

    /// Create the partition for `promoted_at` if missing; returns its name.
    pub async fn ensure_daily(&self, promoted_at: i64) -> Result<String, VectorError> {
        let name = Self::collection_name(promoted_at);
        if self
            .backend
            .ensure_collection(&name, &Self::collection_spec())
            .await?
        {
            info!(collection = %name, "created Tier-2 partition");
        }
        Ok(name)
    }

    /// Number of existing forensic partitions.
    pub async fn partition_count(&self) -> Result<usize, VectorError> {
        Ok(self
            .backend
            .list_collections()
            .await?
            .iter()
            .filter(|n| n.starts_with(FORENSIC_PREFIX))
            .count())
    }

    /// Drop partitions older than `retention_days`. Returns dropped names.
    pub async fn retention_sweep(
        &self,
        now: i64,
        retention_days: i64,
    ) -> Result<Vec<String>, VectorError> {
        let cutoff = DateTime::<Utc>::from_timestamp(now, 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .date_naive()
            - Duration::days(retention_days);

        let mut dropped = Vec::new();
        for name in self.backend.list_collections().await? {
            let Some(day) = Self::parse_collection_day(&name) else {
                continue;
            };
            if day < cutoff {
                self.backend.drop_collection(&name).await?;
                warn!(collection = %name, "dropped expired Tier-2 partition");
                dropped.push(name);
            }
        }
        Ok(dropped)
    }

    fn parse_collection_day(name: &str) -> Option<NaiveDate> {
        let rest = name.strip_prefix(FORENSIC_PREFIX)?;
        NaiveDate::parse_from_str(rest, "%Y_%m_%d").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use via_core::vector::MemoryBackend;

    #[test]
    fn collection_name_uses_utc_day() {
        // 2024-06-01T00:00:30Z
        assert_eq!(ForensicStore::collection_name(1_717_200_030), "forensic_2024_06_01");
        // One minute before midnight lands on the previous day.
        assert_eq!(ForensicStore::collection_name(1_717_199_940), "forensic_2024_05_31");
    }

    #[test]
    fn window_spanning_midnight_yields_both_days() {
        let names = ForensicStore::collections_for_window(1_717_199_940, 1_717_200_030);
        assert_eq!(
            names,
            vec!["forensic_2024_05_31".to_string(), "forensic_2024_06_01".to_string()]
        );
    }

    #[test]
    fn window_within_one_day_yields_one_partition() {
        let names = ForensicStore::collections_for_window(1_717_200_030, 1_717_200_930);
        assert_eq!(names, vec!["forensic_2024_06_01".to_string()]);
    }

    #[tokio::test]
    async fn ensure_daily_is_lazy_and_idempotent() {
        let store = ForensicStore::new(Arc::new(MemoryBackend::new()));
        let name = store.ensure_daily(1_717_200_030).await.unwrap();
        assert_eq!(name, "forensic_2024_06_01");
        let again = store.ensure_daily(1_717_200_031).await.unwrap();
        assert_eq!(again, name);
        assert_eq!(store.partition_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retention_drops_only_expired_partitions() {
        let store = ForensicStore::new(Arc::new(MemoryBackend::new()));
        let now = 1_717_200_030; // 2024-06-01
        let forty_days = 40 * 86_400;
        store.ensure_daily(now).await.unwrap();
        store.ensure_daily(now - forty_days).await.unwrap();
        assert_eq!(store.partition_count().await.unwrap(), 2);

        let dropped = store.retention_sweep(now, 30).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].contains("2024_04"));
        assert_eq!(store.partition_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retention_ignores_foreign_collections() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .ensure_collection("rhythm_monitor", &ForensicStore::collection_spec())
            .await
            .unwrap();
        let store = ForensicStore::new(backend);
        let dropped = store.retention_sweep(1_717_200_030, 30).await.unwrap();
        assert!(dropped.is_empty());
    }
}
