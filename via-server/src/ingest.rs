//! Ingest coordinator
//!
//! Accepts event batches, drops exact re-ingests, and upserts into Tier-1 in
//! bounded sub-batches with retry. Events within one batch keep their input
//! order; across batches nothing is promised.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use via_core::error::{EmbedderError, ViaError};
use via_core::event::LogEvent;
use via_core::rhythm::{self, EncodedEvent};

use crate::tier1::Tier1Monitor;

/// Maximum points per Tier-1 upsert.
const UPSERT_CHUNK: usize = 256;

/// Upsert attempts before a chunk is abandoned.
const UPSERT_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubles each retry, with jitter.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Dedup cache shard count; ids are striped by their leading byte.
const DEDUP_SHARDS: usize = 16;

/// High-water mark for concurrently processed batches.
const MAX_INFLIGHT_BATCHES: usize = 64;

/// Outcome of one ingest call.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub deduped: usize,
    pub parse_failed: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Errors that abort an entire ingest call.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The inflight queue is past its high-water mark; the caller should
    /// throttle and retry.
    #[error("ingest queue past high-water mark")]
    Overloaded,

    /// The embedder queue is full; fatal for this batch.
    #[error("embedder busy")]
    EmbedderBusy,

    #[error(transparent)]
    Internal(#[from] ViaError),
}

/// Bounded FIFO dedup cache, shard-striped to keep contention off the hot
/// ingest path.
pub struct ShardedDedup {
    shards: Vec<Mutex<DedupShard>>,
    per_shard: usize,
}

#[derive(Default)]
struct DedupShard {
    set: HashSet<Uuid>,
    queue: VecDeque<Uuid>,
}

impl ShardedDedup {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / DEDUP_SHARDS).max(1);
        Self {
            shards: (0..DEDUP_SHARDS).map(|_| Mutex::new(DedupShard::default())).collect(),
            per_shard,
        }
    }

    fn shard(&self, id: &Uuid) -> &Mutex<DedupShard> {
        let idx = (id.as_bytes()[0] as usize) % DEDUP_SHARDS;
        &self.shards[idx]
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.shard(id).lock().set.contains(id)
    }

    pub fn insert(&self, id: Uuid) {
        let mut shard = self.shard(&id).lock();
        if !shard.set.insert(id) {
            return;
        }
        shard.queue.push_back(id);
        while shard.queue.len() > self.per_shard {
            if let Some(old) = shard.queue.pop_front() {
                shard.set.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().set.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The coordinator: dedup, batching, retry, back-pressure.
pub struct IngestCoordinator {
    tier1: Arc<Tier1Monitor>,
    dedup: ShardedDedup,
    inflight: Arc<Semaphore>,
}

impl IngestCoordinator {
    pub fn new(tier1: Arc<Tier1Monitor>, dedup_capacity: usize) -> Self {
        Self {
            tier1,
            dedup: ShardedDedup::new(dedup_capacity),
            inflight: Arc::new(Semaphore::new(MAX_INFLIGHT_BATCHES)),
        }
    }

    /// Ingest one batch. Events are processed in input order; malformed
    /// events and chunks that exhaust their retries are counted in
    /// `parse_failed` without failing the call.
    #[instrument(skip(self, events), fields(batch = events.len()))]
    pub async fn ingest_batch(&self, events: Vec<LogEvent>) -> Result<IngestReport, IngestError> {
        let _permit = self
            .inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| IngestError::Overloaded)?;

        let mut report = IngestReport::default();
        let mut fresh: Vec<(LogEvent, EncodedEvent)> = Vec::with_capacity(events.len());
        let mut seen_in_batch: HashSet<Uuid> = HashSet::new();

        for event in events {
            let encoded = match rhythm::encode(&event) {
                Ok(enc) => enc,
                Err(err) => {
                    debug!(%err, "dropped malformed event");
                    report.parse_failed += 1;
                    continue;
                }
            };
            if self.dedup.contains(&encoded.id) || !seen_in_batch.insert(encoded.id) {
                report.deduped += 1;
                continue;
            }
            fresh.push((event, encoded));
        }

        // Cache misses still consult Tier-1 itself so a restarted sender's
        // replayed tail is not re-upserted.
        if !fresh.is_empty() {
            let ids: Vec<Uuid> = fresh.iter().map(|(_, e)| e.id).collect();
            let existing = self.tier1.existing_ids(&ids).await.map_err(map_embedder)?;
            if !existing.is_empty() {
                fresh.retain(|(_, e)| {
                    if existing.contains(&e.id) {
                        self.dedup.insert(e.id);
                        report.deduped += 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }

        for chunk in fresh.chunks(UPSERT_CHUNK) {
            match self.upsert_with_retry(chunk).await {
                Ok(()) => {
                    report.accepted += chunk.len();
                    for (_, enc) in chunk {
                        self.dedup.insert(enc.id);
                    }
                }
                Err(IngestError::Internal(err)) => {
                    warn!(%err, lost = chunk.len(), "chunk abandoned after retries");
                    report.parse_failed += chunk.len();
                    let code = err.code().to_string();
                    if !report.warnings.contains(&code) {
                        report.warnings.push(code);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Ok(report)
    }

    async fn upsert_with_retry(
        &self,
        chunk: &[(LogEvent, EncodedEvent)],
    ) -> Result<(), IngestError> {
        let mut last_err: Option<ViaError> = None;
        for attempt in 0..UPSERT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }
            match self.tier1.index_batch(chunk).await {
                Ok(()) => return Ok(()),
                // A full embedder queue is fatal for the batch, not retryable.
                Err(ViaError::Embedder(EmbedderError::Busy)) => {
                    return Err(IngestError::EmbedderBusy);
                }
                Err(err) => {
                    debug!(attempt, %err, "Tier-1 upsert failed");
                    last_err = Some(err);
                }
            }
        }
        Err(IngestError::Internal(last_err.expect("at least one attempt ran")))
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}

fn map_embedder(err: ViaError) -> IngestError {
    match err {
        ViaError::Embedder(EmbedderError::Busy) => IngestError::EmbedderBusy,
        other => IngestError::Internal(other),
    }
}

fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_BASE.as_millis() as u64);
    base + Duration::from_millis(jitter)
}
