//! Vector backend seam
//!
//! The engine behind both tiers is an external collaborator: anything that
//! supports collection management, upsert, filtered scroll, grouped search,
//! and recommendation queries over named dense + sparse vectors. This module
//! owns the request/response types and the `VectorBackend` trait; the
//! in-process [`MemoryBackend`] is the standalone default and the test
//! engine, and [`SlowBackend`] wraps any backend with artificial latency for
//! degraded-partition testing.

mod memory;
mod slow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use memory::MemoryBackend;
pub use slow::SlowBackend;

use crate::embed::sparse::SparseVector;
use crate::error::VectorError;

/// Distance metric for the dense vector space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
    Dot,
}

/// Dense vector storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub size: usize,
    pub distance: Distance,
    /// Keep raw vectors on disk rather than resident.
    pub on_disk: bool,
    /// Scalar INT8 quantization for the in-memory working set.
    pub scalar_int8: bool,
}

/// Layout of a collection: one named dense space, an optional BM25 sparse
/// space, and the payload fields to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub dense: DenseConfig,
    pub sparse: bool,
    pub payload_indices: Vec<String>,
}

/// A stored point: id, named vectors, JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: Uuid,
    pub dense: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse: Option<SparseVector>,
    pub payload: Value,
}

/// A single payload condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Payload field equals the given JSON scalar.
    Equals { key: String, value: Value },
    /// Integer range over a payload field; unset bounds are open.
    Range {
        key: String,
        gte: Option<i64>,
        lte: Option<i64>,
    },
}

/// Conjunction of conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub must: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(Condition::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn range(mut self, key: impl Into<String>, gte: Option<i64>, lte: Option<i64>) -> Self {
        self.must.push(Condition::Range {
            key: key.into(),
            gte,
            lte,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate against a payload object.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|cond| match cond {
            Condition::Equals { key, value } => payload.get(key) == Some(value),
            Condition::Range { key, gte, lte } => {
                let Some(v) = payload.get(key).and_then(Value::as_i64) else {
                    return false;
                };
                gte.map_or(true, |b| v >= b) && lte.map_or(true, |b| v <= b)
            }
        })
    }
}

/// Filtered scroll over a collection, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ScrollRequest {
    pub filter: Option<Filter>,
    pub limit: usize,
}

/// Grouped similarity search: best hits per distinct value of a payload key.
#[derive(Debug, Clone)]
pub struct GroupedSearchRequest {
    /// Query vector; `None` ranks purely by filter match (score 0).
    pub vector: Option<Vec<f32>>,
    pub filter: Option<Filter>,
    pub group_by: String,
    pub group_size: usize,
    pub limit: usize,
}

/// Recommendation by positive/negative example points.
#[derive(Debug, Clone)]
pub struct RecommendRequest {
    pub positive: Vec<Uuid>,
    pub negative: Vec<Uuid>,
    pub filter: Option<Filter>,
    pub limit: usize,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: Value,
}

/// One group from a grouped search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGroup {
    pub key: String,
    pub hits: Vec<ScoredPoint>,
}

/// The opaque vector engine behind both tiers.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create the collection if absent. Returns true when newly created.
    async fn ensure_collection(
        &self,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<bool, VectorError>;

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorError>;

    async fn list_collections(&self) -> Result<Vec<String>, VectorError>;

    /// Drop a collection. Returns true when it existed.
    async fn drop_collection(&self, name: &str) -> Result<bool, VectorError>;

    /// Insert or replace points by id.
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), VectorError>;

    /// Fetch points by id; missing ids are silently skipped.
    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<Point>, VectorError>;

    /// Delete points by id, returning how many existed.
    async fn delete_points(&self, collection: &str, ids: &[Uuid]) -> Result<usize, VectorError>;

    async fn scroll(&self, collection: &str, req: ScrollRequest) -> Result<Vec<Point>, VectorError>;

    async fn count(&self, collection: &str) -> Result<usize, VectorError>;

    async fn search_groups(
        &self,
        collection: &str,
        req: GroupedSearchRequest,
    ) -> Result<Vec<PointGroup>, VectorError>;

    async fn recommend(
        &self,
        collection: &str,
        req: RecommendRequest,
    ) -> Result<Vec<ScoredPoint>, VectorError>;

    /// Cheap liveness probe, used at startup.
    async fn ping(&self) -> Result<(), VectorError>;
}
