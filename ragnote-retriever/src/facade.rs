//! The retrieval façade: the single entry point for callers outside the worker.
//!
//! [`Retriever`] owns the pending-query table. Each query gets a fresh correlation id,
//! is recorded as pending, sent to the worker, and resolved when a response carrying
//! the same id comes back. Responses may arrive in any order. A query that outlives its
//! timeout is removed from the table and fails with [`RetrievalError::Timeout`]; a
//! response arriving after that finds no pending entry and is discarded.

use crate::config::RetrieverConfig;
use crate::document::Document;
use crate::error::RetrievalError;
use crate::protocol::{WorkerMessage, WorkerResponse};
use crate::retrieval::indexing_engine::{DrainReport, EngineStats, IndexingEngine};
use crate::retrieval::similarity_index::SearchHit;
use crate::source::DocumentSource;
use crate::worker::{FacadeChannels, WorkerControl, WorkerHandle, channels};
use anyhow::Result;
use ragnote_embed::{EmbeddingProvider, create_provider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A query waiting for its response.
#[derive(Debug)]
struct PendingQuery {
    query: String,
    created_at: Instant,
    responder: oneshot::Sender<WorkerResponse>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingQuery>>>;

/// Handle used by the chat layer to index documents and run similarity queries.
#[derive(Debug)]
pub struct Retriever {
    to_worker: flume::Sender<String>,
    control: flume::Sender<WorkerControl>,
    pending: PendingTable,
    query_timeout: Duration,
    pump: JoinHandle<()>,
    worker: Option<WorkerHandle>,
}

impl Retriever {
    /// Build the embedding provider from `config` and start the background worker.
    pub async fn initialize(config: RetrieverConfig) -> Result<Self> {
        config.validate()?;
        let provider = create_provider(config.embedding.clone()).await?;
        Self::with_provider(config, provider).await
    }

    /// Start the background worker with an already-built provider.
    ///
    /// Returns once the record store is open. Stored records keep loading in the
    /// background, so early queries may see fewer results.
    pub async fn with_provider(
        config: RetrieverConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let (facade, worker_channels) = channels();
        let engine_config = config.engine_config();
        let base_dir = config.storage_dir();

        let worker = WorkerHandle::spawn(
            move || async move {
                Ok(IndexingEngine::open(engine_config, provider, base_dir.as_deref()).await)
            },
            config.drain_schedule(),
            worker_channels,
        )
        .await?;

        info!(
            "Retriever ready, query timeout {:?}",
            config.query_timeout()
        );
        let mut retriever = Self::from_channels(facade, config.query_timeout());
        retriever.worker = Some(worker);
        Ok(retriever)
    }

    /// Attach to an existing set of worker channels.
    ///
    /// Must be called inside a Tokio runtime; the response pump is spawned onto it.
    pub fn from_channels(channels: FacadeChannels, query_timeout: Duration) -> Self {
        let pending: PendingTable = Arc::default();
        let pump = tokio::spawn(pump_responses(channels.from_worker, pending.clone()));
        Self {
            to_worker: channels.to_worker,
            control: channels.control,
            pending,
            query_timeout,
            pump,
            worker: None,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Send a document for indexing. Never waits for the worker.
    ///
    /// Documents with no content are dropped here and `false` is returned.
    pub fn add_document(&self, document: Document) -> Result<bool, RetrievalError> {
        if !document.is_indexable() {
            debug!("Not sending empty document {}", document.id);
            return Ok(false);
        }
        self.send(&WorkerMessage::AddDocument { document })?;
        Ok(true)
    }

    /// Remove a document from the index and the store.
    pub fn delete_document(&self, id: impl Into<String>) -> Result<(), RetrievalError> {
        self.send(&WorkerMessage::DeleteDocument { id: id.into() })
    }

    /// Enqueue at most `max` documents from `source`, returning how many were sent.
    pub async fn index_all(&self, source: &dyn DocumentSource, max: usize) -> Result<usize> {
        let documents = source.documents(max).await?;
        let mut sent = 0;
        for document in documents.into_iter().take(max) {
            if self.add_document(document)? {
                sent += 1;
            }
        }
        info!("Sent {} documents for indexing", sent);
        Ok(sent)
    }

    /// Return up to `k` documents most similar to `text`, best first.
    ///
    /// An empty result is a success. Fails with [`RetrievalError::Timeout`] if the
    /// worker does not answer within the configured timeout.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, RetrievalError> {
        let id = Uuid::new_v4().to_string();
        let frame = WorkerMessage::Query {
            id: id.clone(),
            query: text.to_string(),
            num_results: k,
        }
        .to_json()?;

        let (responder, response) = oneshot::channel();
        self.pending.lock().await.insert(
            id.clone(),
            PendingQuery {
                query: text.to_string(),
                created_at: Instant::now(),
                responder,
            },
        );

        if self.to_worker.send(frame).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RetrievalError::WorkerUnavailable);
        }

        match tokio::time::timeout(self.query_timeout, response).await {
            Ok(Ok(WorkerResponse::QueryResponse { results, error, .. })) => match error {
                Some(message) => Err(RetrievalError::Worker(message)),
                None => Ok(results),
            },
            // The pump dropped the responder: the worker went away
            Ok(Err(_)) => Err(RetrievalError::WorkerUnavailable),
            Err(_) => {
                if let Some(expired) = self.pending.lock().await.remove(&id) {
                    warn!(
                        "Query {} timed out after {:?}: {:?}",
                        id, self.query_timeout, expired.query
                    );
                }
                Err(RetrievalError::Timeout {
                    after: self.query_timeout,
                })
            }
        }
    }

    /// Ask the worker to absorb everything sent so far and run one drain cycle now.
    pub async fn drain_now(&self) -> Result<DrainReport, RetrievalError> {
        let (ack, report) = oneshot::channel();
        self.control
            .send(WorkerControl::DrainNow { ack })
            .map_err(|_| RetrievalError::WorkerUnavailable)?;
        Ok(report
            .await
            .map_err(|_| RetrievalError::WorkerUnavailable)??)
    }

    /// Wait until everything sent so far is indexed and stored records are loaded.
    pub async fn flush(&self) -> Result<EngineStats, RetrievalError> {
        let (ack, stats) = oneshot::channel();
        self.control
            .send(WorkerControl::Flush { ack })
            .map_err(|_| RetrievalError::WorkerUnavailable)?;
        stats.await.map_err(|_| RetrievalError::WorkerUnavailable)
    }

    /// Number of queries still waiting for a response
    pub async fn pending_queries(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stop the worker and wait for it, returning its final statistics.
    ///
    /// Queries still pending fail with [`RetrievalError::WorkerUnavailable`].
    pub async fn shutdown(mut self) -> Option<EngineStats> {
        let _ = self.control.send(WorkerControl::Shutdown);
        let stats = match self.worker.take() {
            Some(worker) => worker.join().await,
            None => None,
        };
        self.pending.lock().await.clear();
        stats
    }

    fn send(&self, message: &WorkerMessage) -> Result<(), RetrievalError> {
        let frame = message.to_json()?;
        self.to_worker
            .send(frame)
            .map_err(|_| RetrievalError::WorkerUnavailable)
    }
}

impl Drop for Retriever {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.control.send(WorkerControl::Shutdown);
        }
        self.pump.abort();
    }
}

/// Route worker responses to their pending queries until the worker hangs up.
async fn pump_responses(from_worker: flume::Receiver<String>, pending: PendingTable) {
    while let Ok(text) = from_worker.recv_async().await {
        let response = match WorkerResponse::from_json(&text) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring malformed worker response: {}", e);
                continue;
            }
        };

        let entry = pending.lock().await.remove(response.request_id());
        match entry {
            Some(query) => {
                debug!(
                    "Query {} answered in {:?}",
                    response.request_id(),
                    query.created_at.elapsed()
                );
                // The caller may have given up between the lookup and now
                let _ = query.responder.send(response);
            }
            None => debug!(
                "Discarding response for unknown or expired query {}",
                response.request_id()
            ),
        }
    }

    debug!("Worker outbox closed, failing pending queries");
    pending.lock().await.clear();
}
