//! Embedding generation for the two index tiers
//!
//! Provides the `Embedder` trait plus the deterministic in-process
//! implementation used by both tiers: a 64-D instance over skeletons for the
//! rhythm monitor and a lazily-built 384-D instance over representative
//! messages for the forensic index. Any other provider can be slotted in
//! behind the trait.

mod hashing;
pub mod sparse;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

pub use hashing::HashingEmbedder;

use crate::error::EmbedderError;

/// Result type for embedder operations
pub type EmbedderResult<T> = Result<T, EmbedderError>;

/// Trait for generating text embeddings
///
/// Embedders convert text into fixed-dimensional vectors suitable for
/// semantic similarity search. The trait is async so remote providers fit
/// behind the same seam as local ones.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>>;

    /// Generate embeddings for multiple texts
    async fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Returns the dimensionality of generated embeddings
    fn dimensions(&self) -> usize;
}

/// Compute cosine similarity between two embedding vectors
///
/// Returns a value in [-1, 1] where 1 means identical direction. A zero
/// vector compares as 0 to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Process-wide embedder handle with a bounded request queue.
///
/// At most `capacity` embeds run at once; when the queue is exhausted the
/// call fails fast with [`EmbedderError::Busy`] instead of piling up latency.
/// The promotion pipeline treats that as retryable, the ingest path as fatal
/// for the batch.
pub struct SharedEmbedder {
    inner: Arc<dyn Embedder>,
    permits: Arc<Semaphore>,
}

impl SharedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }
}

#[async_trait]
impl Embedder for SharedEmbedder {
    async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| EmbedderError::Busy)?;
        self.inner.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}
