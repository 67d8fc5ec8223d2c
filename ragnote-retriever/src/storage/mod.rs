//! Durable record storage for the ragnote retriever
//!
//! The store is the source of truth for embeddings: a key→(vector, content) map that
//! survives restarts. The in-memory similarity index is rebuilt from it on cold start by
//! replaying [`RecordStore::load_all`].
//!
//! ## Key Components
//!
//! - **RecordStore**: async trait every backend implements
//! - **SqliteRecordStore**: the persistent backend, one SQLite file per base directory
//! - **EphemeralRecordStore**: no-op backend used when persistence is unavailable
//! - **EmbeddingModelMetadata**: identifies the model that produced stored vectors
//!
//! ## Generations
//!
//! ```text
//! open(base_dir, model) ─┬─ schema version differs ─┐
//!                        ├─ model id differs ───────┼─ DROP + CREATE (new generation)
//!                        └─ same ── reuse records   ┘
//! ```
//!
//! Vectors from two generations never mix: the store is destroyed instead of migrated.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use half::f16;
use ragnote_embed::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub mod ephemeral;
pub mod sqlite_store;

pub use ephemeral::EphemeralRecordStore;
pub use sqlite_store::SqliteRecordStore;

/// Blake3 hash of a record's content (32 bytes).
pub type ContentHash = [u8; 32];

/// Hash content the way the store indexes it.
pub fn content_hash(content: &str) -> ContentHash {
    *blake3::hash(content.as_bytes()).as_bytes()
}

/// A persisted embedding. Overwritten, never duplicated, when the same id changes.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f16>,
    pub content: String,
}

/// Lazy, finite stream of stored records. Calling `load_all` again starts over.
pub type RecordStream = BoxStream<'static, Result<EmbeddingRecord>>;

/// Identifies the model whose vectors live in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingModelMetadata {
    /// Name of the embedding model (e.g., "all-minilm-l6-v2")
    pub model_name: String,
    /// Provider of the embedding model (e.g., "fastembed")
    pub provider: String,
    /// Dimension of the embedding vectors
    pub dimension: usize,
    /// Whether embeddings are normalized
    pub normalized: bool,
}

impl EmbeddingModelMetadata {
    pub fn new(model_name: String, provider: String, dimension: usize) -> Self {
        Self {
            model_name,
            provider,
            dimension,
            normalized: false,
        }
    }

    /// Describe whatever model `provider` serves.
    pub fn from_provider(provider: &dyn EmbeddingProvider) -> Self {
        Self::new(
            provider.model_name().to_string(),
            provider.provider_name().to_string(),
            provider.embedding_dimension(),
        )
        .with_normalized(provider.normalized())
    }

    pub fn with_normalized(mut self, normalized: bool) -> Self {
        self.normalized = normalized;
        self
    }

    /// Create a unique identifier for this model configuration
    pub fn model_id(&self) -> String {
        let normalized_part = if self.normalized { "norm" } else { "raw" };
        format!(
            "{}:{}:{}:{}",
            self.provider, self.model_name, self.dimension, normalized_part
        )
    }
}

/// Durable id → (vector, content) map. Owned exclusively by the indexing worker.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stream every stored record in insertion order.
    fn load_all(&self) -> RecordStream;

    /// True iff a record for `id` exists with exactly this content.
    async fn has_unchanged(&self, id: &str, content: &str) -> Result<bool>;

    /// Upsert one record
    async fn put(&self, record: &EmbeddingRecord) -> Result<()> {
        self.put_batch(std::slice::from_ref(record)).await
    }

    /// Upsert several records as a single write: either all land or none do.
    async fn put_batch(&self, records: &[EmbeddingRecord]) -> Result<()>;

    /// Remove the record for `id`, returning whether one existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Number of stored records
    async fn count(&self) -> Result<usize>;

    /// Time of the most recent write, if anything is stored
    async fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Whether writes survive a restart
    fn is_persistent(&self) -> bool;
}

/// Open the persistent store under `base_dir`, degrading to an ephemeral store.
///
/// `None` means persistence is switched off. Any failure to open is reported once
/// here and never again: the returned ephemeral store accepts writes silently.
pub async fn open_record_store(
    base_dir: Option<&Path>,
    model: &EmbeddingModelMetadata,
    page_size: usize,
) -> Box<dyn RecordStore> {
    let Some(base_dir) = base_dir else {
        info!("Persistence disabled, indexing in memory only");
        return Box::new(EphemeralRecordStore::new());
    };

    match SqliteRecordStore::open(base_dir, model, page_size).await {
        Ok(store) => Box::new(store),
        Err(e) => {
            warn!(
                "Could not open record store in {}: {:#}. Continuing without persistence; \
                 the index will be rebuilt from scratch next time",
                base_dir.display(),
                e
            );
            Box::new(EphemeralRecordStore::new())
        }
    }
}
