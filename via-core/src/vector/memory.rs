//! In-process vector engine
//!
//! Complete implementation of [`VectorBackend`] over process memory. It is
//! the standalone default (VECTOR_BACKEND_URL unset or `memory:`) and the
//! engine integration tests run against. Collections honor the declared
//! spec for validation; quantization flags are recorded but vectors are kept
//! at full precision.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::{
    CollectionSpec, Filter, GroupedSearchRequest, Point, PointGroup, RecommendRequest,
    ScoredPoint, ScrollRequest, VectorBackend,
};
use crate::embed::cosine_similarity;
use crate::error::VectorError;

#[derive(Default)]
struct Collection {
    spec: Option<CollectionSpec>,
    /// Insertion order; upserts replace in place.
    order: Vec<Uuid>,
    points: HashMap<Uuid, Point>,
}

impl Collection {
    fn upsert(&mut self, point: Point) {
        if !self.points.contains_key(&point.id) {
            self.order.push(point.id);
        }
        self.points.insert(point.id, point);
    }

    fn iter_in_order(&self) -> impl Iterator<Item = &Point> {
        self.order.iter().filter_map(|id| self.points.get(id))
    }
}

/// In-memory [`VectorBackend`].
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Collection) -> T,
    ) -> Result<T, VectorError> {
        let map = self.collections.read();
        let col = map
            .get(name)
            .ok_or_else(|| VectorError::CollectionNotFound(name.to_string()))?;
        Ok(f(col))
    }

    fn matches(filter: &Option<Filter>, payload: &Value) -> bool {
        filter.as_ref().map_or(true, |f| f.matches(payload))
    }
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn ensure_collection(
        &self,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<bool, VectorError> {
        let mut map = self.collections.write();
        if map.contains_key(name) {
            return Ok(false);
        }
        map.insert(
            name.to_string(),
            Collection {
                spec: Some(spec.clone()),
                ..Collection::default()
            },
        );
        Ok(true)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorError> {
        Ok(self.collections.read().contains_key(name))
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorError> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> Result<bool, VectorError> {
        Ok(self.collections.write().remove(name).is_some())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), VectorError> {
        let mut map = self.collections.write();
        let col = map
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        if let Some(spec) = &col.spec {
            for p in &points {
                if p.dense.len() != spec.dense.size {
                    return Err(VectorError::MalformedPoint(format!(
                        "dense vector has {} dims, collection expects {}",
                        p.dense.len(),
                        spec.dense.size
                    )));
                }
            }
        }
        for p in points {
            col.upsert(p);
        }
        Ok(())
    }

    async fn retrieve(&self, collection: &str, ids: &[Uuid]) -> Result<Vec<Point>, VectorError> {
        self.with_collection(collection, |col| {
            ids.iter()
                .filter_map(|id| col.points.get(id).cloned())
                .collect()
        })
    }

    async fn delete_points(&self, collection: &str, ids: &[Uuid]) -> Result<usize, VectorError> {
        let mut map = self.collections.write();
        let col = map
            .get_mut(collection)
            .ok_or_else(|| VectorError::CollectionNotFound(collection.to_string()))?;
        let mut removed = 0;
        for id in ids {
            if col.points.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            col.order.retain(|id| col.points.contains_key(id));
        }
        Ok(removed)
    }

    async fn scroll(&self, collection: &str, req: ScrollRequest) -> Result<Vec<Point>, VectorError> {
        self.with_collection(collection, |col| {
            col.iter_in_order()
                .filter(|p| Self::matches(&req.filter, &p.payload))
                .take(if req.limit == 0 { usize::MAX } else { req.limit })
                .cloned()
                .collect()
        })
    }

    async fn count(&self, collection: &str) -> Result<usize, VectorError> {
        self.with_collection(collection, |col| col.points.len())
    }

    async fn search_groups(
        &self,
        collection: &str,
        req: GroupedSearchRequest,
    ) -> Result<Vec<PointGroup>, VectorError> {
        self.with_collection(collection, |col| {
            let mut groups: HashMap<String, Vec<ScoredPoint>> = HashMap::new();
            let mut key_order: Vec<String> = Vec::new();

            for p in col.iter_in_order() {
                if !Self::matches(&req.filter, &p.payload) {
                    continue;
                }
                let Some(key) = p.payload.get(&req.group_by) else {
                    continue;
                };
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let score = req
                    .vector
                    .as_deref()
                    .map(|q| cosine_similarity(q, &p.dense))
                    .unwrap_or(0.0);
                if !groups.contains_key(&key) {
                    key_order.push(key.clone());
                }
                groups.entry(key).or_default().push(ScoredPoint {
                    id: p.id,
                    score,
                    payload: p.payload.clone(),
                });
            }

            let mut out: Vec<PointGroup> = key_order
                .into_iter()
                .map(|key| {
                    let mut hits = groups.remove(&key).unwrap_or_default();
                    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
                    hits.truncate(req.group_size.max(1));
                    PointGroup { key, hits }
                })
                .collect();

            out.sort_by(|a, b| {
                let ba = a.hits.first().map(|h| h.score).unwrap_or(f32::MIN);
                let bb = b.hits.first().map(|h| h.score).unwrap_or(f32::MIN);
                bb.total_cmp(&ba)
            });
            if req.limit > 0 {
                out.truncate(req.limit);
            }
            out
        })
    }

    async fn recommend(
        &self,
        collection: &str,
        req: RecommendRequest,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        self.with_collection(collection, |col| {
            let positives: Vec<&Point> = req
                .positive
                .iter()
                .filter_map(|id| col.points.get(id))
                .collect();
            let negatives: Vec<&Point> = req
                .negative
                .iter()
                .filter_map(|id| col.points.get(id))
                .collect();
            if positives.is_empty() {
                return Vec::new();
            }

            let mean_cos = |examples: &[&Point], p: &Point| -> f32 {
                if examples.is_empty() {
                    return 0.0;
                }
                examples
                    .iter()
                    .map(|e| cosine_similarity(&e.dense, &p.dense))
                    .sum::<f32>()
                    / examples.len() as f32
            };

            let mut hits: Vec<ScoredPoint> = col
                .iter_in_order()
                .filter(|p| !req.positive.contains(&p.id) && !req.negative.contains(&p.id))
                .filter(|p| Self::matches(&req.filter, &p.payload))
                .map(|p| ScoredPoint {
                    id: p.id,
                    score: mean_cos(&positives, p) - mean_cos(&negatives, p),
                    payload: p.payload.clone(),
                })
                .collect();

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            if req.limit > 0 {
                hits.truncate(req.limit);
            }
            hits
        })
    }

    async fn ping(&self) -> Result<(), VectorError> {
        Ok(())
    }
}
