//! Slow backend wrapper for degraded-partition testing
//!
//! Adds a configurable delay before every call, optionally only for a single
//! collection, so tests can drive one Tier-2 partition past the query
//! deadline while the others stay healthy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    CollectionSpec, GroupedSearchRequest, Point, PointGroup, RecommendRequest, ScoredPoint,
    ScrollRequest, VectorBackend,
};
use crate::error::VectorError;

/// Delegating [`VectorBackend`] with per-call latency.
pub struct SlowBackend {
    inner: Arc<dyn VectorBackend>,
    delay: Duration,
    /// When set, only calls touching this collection are delayed.
    only_collection: Option<String>,
}

impl SlowBackend {
    pub fn new(inner: Arc<dyn VectorBackend>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            only_collection: None,
        }
    }

    /// Delay only operations on the named collection.
    pub fn for_collection(inner: Arc<dyn VectorBackend>, name: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            only_collection: Some(name.into()),
        }
    }

    async fn stall(&self, collection: &str) {
        let applies = self
            .only_collection
            .as_deref()
            .map_or(true, |only| only == collection);
        if applies {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl VectorBackend for SlowBackend {
    async fn ensure_collection(
        &self,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<bool, VectorError> {
        self.inner.ensure_collection(name, spec).await
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorError> {
        self.inner.collection_exists(name).await
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorError> {
        self.inner.list_collections().await
    }

    async fn drop_collection(&self, name: &str) -> Result<bool, VectorError> {
        self.inner.drop_collection(name).await
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), VectorError> {
        self.inner.upsert(collection, points).await
    }

    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<Point>, VectorError> {
        self.stall(collection).await;
        self.inner.retrieve(collection, ids).await
    }

    async fn delete_points(&self, collection: &str, ids: &[Uuid]) -> Result<usize, VectorError> {
        self.inner.delete_points(collection, ids).await
    }

    async fn scroll(&self, collection: &str, req: ScrollRequest) -> Result<Vec<Point>, VectorError> {
        self.stall(collection).await;
        self.inner.scroll(collection, req).await
    }

    async fn count(&self, collection: &str) -> Result<usize, VectorError> {
        self.inner.count(collection).await
    }

    async fn search_groups(
        &self,
        collection: &str,
        req: GroupedSearchRequest,
    ) -> Result<Vec<PointGroup>, VectorError> {
        self.stall(collection).await;
        self.inner.search_groups(collection, req).await
    }

    async fn recommend(
        &self,
        collection: &str,
        req: RecommendRequest,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        self.stall(collection).await;
        self.inner.recommend(collection, req).await
    }

    async fn ping(&self) -> Result<(), VectorError> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::MemoryBackend;
    use std::time::Instant;

    #[tokio::test]
    async fn delays_only_the_marked_collection() {
        let inner = Arc::new(MemoryBackend::new());
        let spec = CollectionSpec {
            dense: crate::vector::DenseConfig {
                size: 1,
                distance: crate::vector::Distance::Cosine,
                on_disk: false,
                scalar_int8: false,
            },
            sparse: false,
            payload_indices: vec![],
        };
        inner.ensure_collection("fast", &spec).await.unwrap();
        inner.ensure_collection("slow", &spec).await.unwrap();

        let backend =
            SlowBackend::for_collection(inner, "slow", Duration::from_millis(80));

        let start = Instant::now();
        backend
            .scroll("fast", ScrollRequest::default())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));

        let start = Instant::now();
        backend
            .scroll("slow", ScrollRequest::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
