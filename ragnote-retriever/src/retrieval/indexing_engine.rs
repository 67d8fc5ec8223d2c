//! Indexing engine: queue, batcher and replay in front of the similarity index.
//!
//! The engine owns every piece of mutable indexing state: the embedding provider handle,
//! the record store, the in-memory [`SimilarityIndex`] and the pending
//! [`IndexingQueue`]. It is driven by the background worker, which calls into it one
//! message or tick at a time, so nothing here needs locking.
//!
//! ## Pipeline Flow
//!
//! ```text
//! addDocument ─→ enqueue ─→ IndexingQueue ─(drain cycle)─→ embed batch ─→ RecordStore ─→ SimilarityIndex
//!                                                                              │
//! cold start ─────────────────────── load_all (paged replay) ─────────────────┴──→ SimilarityIndex
//! ```
//!
//! ## Drain cycle
//!
//! Each cycle pops up to `batch_size` documents. Entries whose content is already
//! stored are skipped without using a slot; an id seen twice in one cycle keeps only the
//! most recent content. Survivors are embedded in one provider call, written to the
//! store in one transaction and only then inserted into the index, so readers see
//! either the whole batch or none of it. Provider and store failures drop the batch
//! and the next cycle proceeds normally. Running out of index capacity is fatal.
//!
//! ## Replay
//!
//! Stored records are loaded one page per step. Unreadable records are logged and
//! skipped. While replay runs, a document whose stored content matches is not embedded
//! again; if its record never reaches the index, it is queued once replay ends. Outside
//! replay only the index decides whether content is unchanged.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use ragnote_embed::EmbeddingProvider;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use super::queue::IndexingQueue;
use super::similarity_index::{DEFAULT_CAPACITY, SearchHit, SimilarityIndex};
use crate::document::Document;
use crate::error::IndexError;
use crate::storage::{
    EmbeddingModelMetadata, EmbeddingRecord, RecordStore, RecordStream, SqliteRecordStore,
    open_record_store,
};

/// Configuration for the indexing engine
#[derive(Debug, Clone, PartialEq)]
pub struct IndexingEngineConfig {
    /// Maximum documents embedded per drain cycle
    pub batch_size: usize,
    /// Maximum number of documents the similarity index may hold
    pub capacity: usize,
    /// Drop search matches scoring below this cosine similarity
    pub min_score: Option<f32>,
    /// Records inserted per replay step during cold start
    pub replay_page_size: usize,
}

impl Default for IndexingEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            capacity: DEFAULT_CAPACITY,
            min_score: None,
            replay_page_size: 256,
        }
    }
}

impl IndexingEngineConfig {
    /// Set the number of documents embedded per drain cycle.
    ///
    /// Larger batches amortize provider calls but hold the worker longer per cycle.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the fixed capacity of the similarity index.
    ///
    /// Exceeding it is fatal for the engine instance, so size it for the whole
    /// collection.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Filter out search matches below `min_score`.
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_replay_page_size(mut self, page_size: usize) -> Self {
        self.replay_page_size = page_size.max(1);
        self
    }
}

/// Counters for one engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub documents_embedded: usize,
    /// Skipped because the store already held the content, or superseded in the same batch
    pub duplicates_skipped: usize,
    /// Empty-content documents rejected at enqueue
    pub documents_filtered: usize,
    pub batches_failed: usize,
    pub records_replayed: usize,
    /// Stored records replay could not load
    pub records_unreadable: usize,
    pub deletions: usize,
}

/// Point-in-time view of an engine, as printed by `ragnote stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub processing: ProcessingStats,
    pub queue_len: usize,
    pub index_len: usize,
    pub index_capacity: usize,
    pub stored_records: usize,
    pub persistent: bool,
    /// Time of the most recent store write
    pub last_updated: Option<DateTime<Utc>>,
    pub replaying: bool,
    pub fatal_error: Option<String>,
}

/// What one drain cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub embedded: usize,
    pub skipped: usize,
    pub failed: bool,
    /// Queue length after the cycle
    pub remaining: usize,
}

struct ReplayState {
    /// Only reached through `get_mut`; the mutex keeps the engine `Sync`
    stream: Mutex<RecordStream>,
    /// Ids written or deleted since replay began; their stored versions are stale
    touched: HashSet<String>,
    /// Skipped as unchanged before their stored record was loaded
    awaiting: HashMap<String, Document>,
}

/// The indexing engine. See module docs for the pipeline.
pub struct IndexingEngine {
    config: IndexingEngineConfig,
    provider: Arc<dyn EmbeddingProvider>,
    store: Box<dyn RecordStore>,
    index: SimilarityIndex,
    queue: IndexingQueue,
    stats: ProcessingStats,
    replay: Option<ReplayState>,
    fatal: Option<IndexError>,
}

impl std::fmt::Debug for IndexingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingEngine")
            .field("config", &self.config)
            .field("provider", &self.provider.provider_name())
            .field("persistent", &self.store.is_persistent())
            .field("index_len", &self.index.len())
            .field("queue_len", &self.queue.len())
            .field("replaying", &self.replay.is_some())
            .field("fatal", &self.fatal)
            .finish()
    }
}

impl IndexingEngine {
    /// Create an engine over an already-opened store.
    ///
    /// The index dimension comes from the provider. Call
    /// [`begin_replay`](Self::begin_replay) to load stored records into the index.
    pub fn new(
        config: IndexingEngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        let index = SimilarityIndex::new(provider.embedding_dimension(), config.capacity);
        info!(
            "Initializing IndexingEngine: provider {}, dimension {}, capacity {}, persistent {}",
            provider.provider_name(),
            index.dimension(),
            index.capacity(),
            store.is_persistent()
        );

        Self {
            config,
            provider,
            store,
            index,
            queue: IndexingQueue::new(),
            stats: ProcessingStats::default(),
            replay: None,
            fatal: None,
        }
    }

    /// Create an engine persisting under `base_dir`, degrading to ephemeral mode.
    ///
    /// `None` disables persistence. Opening never fails: an unusable store is reported
    /// once and replaced by an ephemeral one.
    pub async fn open(
        config: IndexingEngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        base_dir: Option<&Path>,
    ) -> Self {
        let model = EmbeddingModelMetadata::from_provider(provider.as_ref());
        let store = open_record_store(base_dir, &model, config.replay_page_size).await;
        Self::new(config, provider, store)
    }

    /// Create an engine with an in-memory SQLite store.
    ///
    /// This is primarily intended for testing. Unlike the ephemeral store, the
    /// in-memory store remembers content, so unchanged documents are still skipped.
    pub async fn new_memory(
        config: IndexingEngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let model = EmbeddingModelMetadata::from_provider(provider.as_ref());
        let store = SqliteRecordStore::open_memory(&model, config.replay_page_size).await?;
        Ok(Self::new(config, provider, Box::new(store)))
    }

    /// Queue a document for embedding. Never blocks.
    ///
    /// Returns `false` if the document was filtered out for having no content.
    pub fn enqueue(&mut self, document: Document) -> bool {
        if !document.is_indexable() {
            debug!("Ignoring empty document {}", document.id);
            self.stats.documents_filtered += 1;
            return false;
        }
        self.queue.enqueue(document);
        true
    }

    /// Remove a document from the queue, the index and the store, immediately.
    ///
    /// Returns whether the document was indexed.
    pub async fn delete_document(&mut self, id: &str) -> bool {
        self.queue.purge(id);
        let in_index = self.index.remove(id);

        let in_store = match self.store.delete(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to delete {} from the record store: {:#}", id, e);
                false
            }
        };

        if let Some(replay) = self.replay.as_mut() {
            replay.touched.insert(id.to_string());
        }

        if in_index || in_store {
            self.stats.deletions += 1;
            debug!("Deleted document {}", id);
        }
        in_index || in_store
    }

    /// Run one drain cycle. See module docs for the rules.
    ///
    /// Returns an error only when the engine has hit a fatal index error, now or in an
    /// earlier cycle. Batch-level failures are reported in the [`DrainReport`].
    pub async fn run_drain_cycle(&mut self) -> Result<DrainReport, IndexError> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }

        let mut report = DrainReport::default();
        let mut batch: Vec<Document> = Vec::with_capacity(self.config.batch_size);
        let mut positions: HashMap<String, usize> = HashMap::new();

        while batch.len() < self.config.batch_size {
            let Some(document) = self.queue.pop() else {
                break;
            };

            // A later update of the same id supersedes the earlier one in this batch
            if let Some(&position) = positions.get(&document.id) {
                batch[position] = document;
                report.skipped += 1;
                continue;
            }

            if self.is_unchanged(&document).await {
                report.skipped += 1;
                continue;
            }

            positions.insert(document.id.clone(), batch.len());
            batch.push(document);
        }

        self.stats.duplicates_skipped += report.skipped;

        if !batch.is_empty() {
            match self.index_batch(batch).await {
                Ok(count) => report.embedded = count,
                Err(BatchError::Dropped) => {
                    report.failed = true;
                    self.stats.batches_failed += 1;
                }
                Err(BatchError::Fatal(e)) => {
                    self.stats.batches_failed += 1;
                    return Err(self.halt(e));
                }
            }
        }

        report.remaining = self.queue.len();
        if report.embedded > 0 || report.skipped > 0 {
            debug!(
                "Drain cycle: embedded {}, skipped {}, {} remaining",
                report.embedded, report.skipped, report.remaining
            );
        }
        Ok(report)
    }

    async fn is_unchanged(&mut self, document: &Document) -> bool {
        if self.index.content(&document.id) == Some(document.content.as_str()) {
            return true;
        }
        // Outside replay the index holds everything the store can vouch for
        let Some(replay) = self.replay.as_mut() else {
            return false;
        };
        match self.store.has_unchanged(&document.id, &document.content).await {
            Ok(true) => {
                replay
                    .awaiting
                    .insert(document.id.clone(), document.clone());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Change check failed for {}: {:#}", document.id, e);
                false
            }
        }
    }

    async fn index_batch(&mut self, batch: Vec<Document>) -> Result<usize, BatchError> {
        let texts: Vec<String> = batch.iter().map(|doc| doc.content.clone()).collect();

        let embeddings = match self.provider.embed_texts(&texts).await {
            Ok(result) if result.len() == batch.len() => result.embeddings,
            Ok(result) => {
                warn!(
                    "Provider returned {} embeddings for {} documents, dropping batch",
                    result.len(),
                    batch.len()
                );
                return Err(BatchError::Dropped);
            }
            Err(e) => {
                warn!(
                    "Failed to embed batch of {} documents, dropping it: {}",
                    batch.len(),
                    e
                );
                return Err(BatchError::Dropped);
            }
        };

        // Nothing is written anywhere unless the index is certain to accept the batch
        self.index
            .validate_batch(&embeddings, &batch)
            .map_err(BatchError::Fatal)?;

        let records: Vec<EmbeddingRecord> = batch
            .iter()
            .zip(&embeddings)
            .map(|(doc, vector)| EmbeddingRecord {
                id: doc.id.clone(),
                vector: vector.clone(),
                content: doc.content.clone(),
            })
            .collect();

        if let Err(e) = self.store.put_batch(&records).await {
            warn!(
                "Failed to persist batch of {} documents, dropping it: {:#}",
                records.len(),
                e
            );
            return Err(BatchError::Dropped);
        }

        if let Some(replay) = self.replay.as_mut() {
            replay
                .touched
                .extend(batch.iter().map(|doc| doc.id.clone()));
        }

        let count = batch.len();
        self.index
            .add_vectors(embeddings, batch)
            .map_err(BatchError::Fatal)?;
        self.stats.documents_embedded += count;
        Ok(count)
    }

    fn halt(&mut self, e: IndexError) -> IndexError {
        error!("Similarity index is unusable, indexing halted: {}", e);
        self.replay = None;
        self.fatal = Some(e.clone());
        e
    }

    /// Start streaming stored records into the index.
    pub fn begin_replay(&mut self) {
        info!("Replaying stored records into the similarity index");
        self.replay = Some(ReplayState {
            stream: Mutex::new(self.store.load_all()),
            touched: HashSet::new(),
            awaiting: HashMap::new(),
        });
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Insert the next page of stored records. Returns how many were inserted.
    ///
    /// Records for ids written or deleted since replay began are skipped, since the
    /// live version already won.
    pub async fn replay_step(&mut self) -> usize {
        let page_size = self.config.replay_page_size;
        let dimension = self.index.dimension();
        let Some(replay) = self.replay.as_mut() else {
            return 0;
        };
        let stream = replay
            .stream
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        let mut vectors = Vec::new();
        let mut documents = Vec::new();
        let mut unreadable = 0;
        let mut finished = false;

        while documents.len() < page_size {
            match stream.next().await {
                Some(Ok(record)) => {
                    if replay.touched.contains(&record.id) || self.index.contains(&record.id) {
                        continue;
                    }
                    if record.vector.len() != dimension {
                        warn!(
                            "Skipping stored record {} with dimension {}",
                            record.id,
                            record.vector.len()
                        );
                        unreadable += 1;
                        continue;
                    }
                    vectors.push(record.vector);
                    documents.push(Document::new(record.id, record.content));
                }
                Some(Err(e)) => {
                    warn!("Skipping stored record: {:#}", e);
                    unreadable += 1;
                }
                None => {
                    finished = true;
                    break;
                }
            }
        }
        self.stats.records_unreadable += unreadable;

        let count = documents.len();
        if count > 0 {
            if let Err(e) = self.index.add_vectors(vectors, documents) {
                self.halt(e);
                return 0;
            }
            self.stats.records_replayed += count;
        }

        if finished {
            self.finish_replay();
        }
        count
    }

    fn finish_replay(&mut self) {
        let Some(replay) = self.replay.take() else {
            return;
        };

        let mut requeued = 0;
        for (id, document) in replay.awaiting {
            if !replay.touched.contains(&id) && !self.index.contains(&id) {
                self.queue.enqueue(document);
                requeued += 1;
            }
        }
        if requeued > 0 {
            warn!(
                "{} documents were never loaded from the record store, queued for embedding",
                requeued
            );
        }
        info!(
            "Replay complete: {} records in the similarity index",
            self.index.len()
        );
    }

    /// Replay every stored record. Used by tests and one-shot tools.
    pub async fn replay_all(&mut self) -> usize {
        self.begin_replay();
        let mut total = 0;
        while self.is_replaying() {
            total += self.replay_step().await;
        }
        total
    }

    /// Embed `query` and return at most `k` matches, best first.
    ///
    /// An empty index answers without calling the provider.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if let Some(fatal) = &self.fatal {
            return Err(anyhow!(fatal.clone()));
        }
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.provider.embed_text(query).await?;
        Ok(self.index.search(&vector, k, self.config.min_score)?)
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn fatal_error(&self) -> Option<&IndexError> {
        self.fatal.as_ref()
    }

    /// Gather a full statistics snapshot, including the stored record count.
    pub async fn snapshot(&self) -> EngineStats {
        let stored_records = self.store.count().await.unwrap_or_else(|e| {
            warn!("Could not count stored records: {:#}", e);
            0
        });
        let last_updated = self.store.last_updated().await.unwrap_or_else(|e| {
            warn!("Could not read last update time: {:#}", e);
            None
        });
        EngineStats {
            processing: self.stats,
            queue_len: self.queue.len(),
            index_len: self.index.len(),
            index_capacity: self.index.capacity(),
            stored_records,
            persistent: self.store.is_persistent(),
            last_updated,
            replaying: self.replay.is_some(),
            fatal_error: self.fatal.as_ref().map(|e| e.to_string()),
        }
    }
}

enum BatchError {
    /// The batch was abandoned; the engine carries on
    Dropped,
    Fatal(IndexError),
}
