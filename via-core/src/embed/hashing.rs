//! Deterministic feature-hashed embeddings
//!
//! Each token contributes a pseudo-random unit direction derived from its
//! xxh3 seed; the sum over tokens is L2-normalized. Texts sharing tokens
//! share contributions, so cosine similarity tracks token overlap — the
//! closeness property the rhythm monitor relies on — while staying fully
//! deterministic across restarts and machines.

use async_trait::async_trait;
use xxhash_rust::xxh3::xxh3_64;

use super::{Embedder, EmbedderResult};

/// Feature-hashing embedder with a fixed output dimensionality.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Synchronous embedding core. The async trait method delegates here;
    /// callers inside CPU-bound paths may use this directly.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let mut seed = xxh3_64(token.as_bytes());
            for slot in acc.iter_mut() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let val = ((seed >> 32) as f32) / (u32::MAX as f32) * 2.0 - 1.0;
                *slot += val;
            }
        }

        let norm: f32 = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut acc {
                *val /= norm;
            }
        }
        acc
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Lowercased alphanumeric tokens; punctuation separates.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '<' && c != '>')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}
