//! BM25 sparse vectors over original message tokens
//!
//! Tier-2 incidents carry a sparse term vector next to the dense embedding.
//! Term weights come from an IDF snapshot built over promoted representative
//! messages; the snapshot is process-wide, refreshed by the daily sweep, and
//! swapped copy-on-write so readers never block.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use super::hashing::tokenize;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Sparse vector in indices/values form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Stable 32-bit term id for a token.
pub fn term_id(token: &str) -> u32 {
    (xxh3_64(token.as_bytes()) & 0xFFFF_FFFF) as u32
}

/// Immutable IDF statistics over a document corpus.
///
/// `doc_count` and per-term document frequencies feed the standard BM25
/// weighting; an empty snapshot degrades to uniform weights.
#[derive(Debug, Clone, Default)]
pub struct IdfSnapshot {
    doc_count: u32,
    avg_doc_len: f32,
    doc_freq: HashMap<u32, u32>,
}

impl IdfSnapshot {
    /// Build a snapshot from a document corpus.
    pub fn build<'a>(docs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut doc_count = 0u32;
        let mut total_len = 0usize;
        let mut doc_freq: HashMap<u32, u32> = HashMap::new();

        for doc in docs {
            doc_count += 1;
            let mut seen: Vec<u32> = Vec::new();
            let mut len = 0usize;
            for token in tokenize(doc) {
                len += 1;
                let id = term_id(&token);
                if !seen.contains(&id) {
                    seen.push(id);
                }
            }
            total_len += len;
            for id in seen {
                *doc_freq.entry(id).or_insert(0) += 1;
            }
        }

        let avg_doc_len = if doc_count > 0 {
            total_len as f32 / doc_count as f32
        } else {
            0.0
        };

        Self {
            doc_count,
            avg_doc_len,
            doc_freq,
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    fn idf(&self, id: u32) -> f32 {
        if self.doc_count == 0 {
            return 1.0;
        }
        let df = *self.doc_freq.get(&id).unwrap_or(&0) as f32;
        let n = self.doc_count as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Encode a message into a BM25-weighted sparse vector. Variables are
    /// kept: this runs over original tokens, not the skeleton.
    pub fn encode(&self, text: &str) -> SparseVector {
        let mut tf: HashMap<u32, u32> = HashMap::new();
        let mut len = 0usize;
        for token in tokenize(text) {
            len += 1;
            *tf.entry(term_id(&token)).or_insert(0) += 1;
        }
        if tf.is_empty() {
            return SparseVector::default();
        }

        let avg = if self.avg_doc_len > 0.0 {
            self.avg_doc_len
        } else {
            len as f32
        };
        let mut entries: Vec<(u32, f32)> = tf
            .into_iter()
            .map(|(id, freq)| {
                let freq = freq as f32;
                let norm = freq * (K1 + 1.0) / (freq + K1 * (1.0 - B + B * len as f32 / avg));
                (id, self.idf(id) * norm)
            })
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);

        SparseVector {
            indices: entries.iter().map(|(id, _)| *id).collect(),
            values: entries.iter().map(|(_, w)| *w).collect(),
        }
    }
}

/// Shared holder for the current IDF snapshot.
///
/// Readers clone an `Arc` under a short read lock; the sweeper installs a
/// freshly built snapshot with a write-lock swap.
#[derive(Default)]
pub struct IdfIndex {
    current: RwLock<Arc<IdfSnapshot>>,
}

impl IdfIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IdfSnapshot> {
        self.current.read().clone()
    }

    pub fn install(&self, snapshot: IdfSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
