//! Deterministic embedding provider for tests and offline use.
//!
//! Vectors are hashed bags of words: every lowercase alphanumeric token is hashed
//! with FNV into one of `dimension` buckets with a hashed sign, then the vector is
//! L2-normalized. Identical texts always produce identical vectors, and texts that
//! share words end up closer than texts that don't, which is enough to exercise
//! ranking without a real model.

use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, to_f16};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Mock embedding provider with call accounting.
#[derive(Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
    calls: AtomicUsize,
    texts_embedded: AtomicUsize,
    failing: AtomicBool,
}

impl MockEmbeddingProvider {
    /// Create a new mock provider with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of `embed_texts` calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total number of texts embedded so far
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Compute the vector for a text without touching the counters
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        let mut tokens = 0usize;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let mut hasher = FnvHasher::default();
            hasher.write(token.as_bytes());
            let hash = hasher.finish();

            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
            tokens += 1;
        }

        // Punctuation-only text still gets a stable non-zero vector
        if tokens == 0 {
            let mut hasher = FnvHasher::default();
            hasher.write(text.as_bytes());
            embedding[(hasher.finish() % self.dimension as u64) as usize] = 1.0;
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbedError::embedding_gen(std::io::Error::other(
                "mock provider configured to fail",
            )));
        }

        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(EmbeddingResult::new(
            texts
                .iter()
                .map(|t| to_f16(self.vector_for(t), true))
                .collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
