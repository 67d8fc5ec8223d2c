//! The background worker: owns the [`IndexingEngine`] on its own thread and talks to
//! the rest of the process only through channels.
//!
//! ## Channels
//!
//! - **inbox**: JSON [`WorkerMessage`] frames from the façade
//! - **outbox**: JSON [`WorkerResponse`] frames back to the façade
//! - **control**: out-of-band [`WorkerControl`] commands (drain now, flush, shutdown)
//!
//! The loop runs on a single-threaded runtime. Messages, drain ticks and replay pages
//! are interleaved one at a time, in that order of preference, so the engine never
//! sees concurrent access.

use crate::error::IndexError;
use crate::protocol::{WorkerMessage, WorkerResponse};
use crate::retrieval::indexing_engine::{DrainReport, EngineStats, IndexingEngine};
use crate::schedule::DrainSchedule;
use anyhow::{Context, Result};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Out-of-band commands. These carry reply channels, so they never go over the wire.
#[derive(Debug)]
pub enum WorkerControl {
    /// Absorb everything already sent to the inbox, then run one drain cycle
    DrainNow {
        ack: oneshot::Sender<Result<DrainReport, IndexError>>,
    },
    /// Absorb the inbox, finish replay, and drain until the queue is empty
    Flush { ack: oneshot::Sender<EngineStats> },
    /// Stop the loop
    Shutdown,
}

/// Worker ends of the three channels.
#[derive(Debug)]
pub struct WorkerChannels {
    pub inbox: flume::Receiver<String>,
    pub outbox: flume::Sender<String>,
    pub control: flume::Receiver<WorkerControl>,
}

/// Caller ends of the three channels.
#[derive(Debug, Clone)]
pub struct FacadeChannels {
    pub to_worker: flume::Sender<String>,
    pub from_worker: flume::Receiver<String>,
    pub control: flume::Sender<WorkerControl>,
}

/// Create a connected pair of channel ends.
pub fn channels() -> (FacadeChannels, WorkerChannels) {
    let (to_worker, inbox) = flume::unbounded();
    let (outbox, from_worker) = flume::unbounded();
    let (control_tx, control_rx) = flume::unbounded();
    (
        FacadeChannels {
            to_worker,
            from_worker,
            control: control_tx,
        },
        WorkerChannels {
            inbox,
            outbox,
            control: control_rx,
        },
    )
}

/// Run the worker until shutdown, or until the façade drops its channels.
///
/// Replay of stored records starts immediately; queries arriving before it completes
/// are answered from whatever has been loaded so far.
pub async fn run_worker_loop(
    mut engine: IndexingEngine,
    mut schedule: DrainSchedule,
    channels: WorkerChannels,
) -> EngineStats {
    info!("Worker started");
    engine.begin_replay();

    loop {
        let replaying = engine.is_replaying();

        tokio::select! {
            biased;

            control = channels.control.recv_async() => match control {
                Ok(WorkerControl::DrainNow { ack }) => {
                    absorb_inbox(&mut engine, &channels).await;
                    let _ = ack.send(engine.run_drain_cycle().await);
                }
                Ok(WorkerControl::Flush { ack }) => {
                    flush(&mut engine, &channels).await;
                    let _ = ack.send(engine.snapshot().await);
                }
                Ok(WorkerControl::Shutdown) => {
                    info!("Worker shutting down");
                    break;
                }
                Err(_) => {
                    info!("Control channel closed, worker stopping");
                    break;
                }
            },

            message = channels.inbox.recv_async() => match message {
                Ok(text) => handle_frame(&mut engine, &text, &channels.outbox).await,
                Err(_) => {
                    info!("Worker inbox closed, worker stopping");
                    break;
                }
            },

            _ = schedule.tick() => {
                // Fatal errors were already logged when they happened
                let _ = engine.run_drain_cycle().await;
            }

            _ = std::future::ready(()), if replaying => {
                engine.replay_step().await;
            }
        }
    }

    engine.snapshot().await
}

/// Handle one JSON frame from the inbox. Malformed frames are logged and dropped.
pub async fn handle_frame(engine: &mut IndexingEngine, text: &str, outbox: &flume::Sender<String>) {
    let message = match WorkerMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed worker message: {}", e);
            return;
        }
    };

    match message {
        WorkerMessage::AddDocument { document } => {
            engine.enqueue(document);
        }
        WorkerMessage::DeleteDocument { id } => {
            engine.delete_document(&id).await;
        }
        WorkerMessage::Query {
            id,
            query,
            num_results,
        } => {
            let response = match engine.search(&query, num_results).await {
                Ok(results) => {
                    debug!("Query {} matched {} documents", id, results.len());
                    WorkerResponse::results(id, results)
                }
                Err(e) => {
                    warn!("Query {} failed: {:#}", id, e);
                    WorkerResponse::failure(id, format!("{e:#}"))
                }
            };

            match response.to_json() {
                Ok(json) => {
                    if outbox.send(json).is_err() {
                        debug!("Response receiver is gone, dropping response");
                    }
                }
                Err(e) => warn!("Failed to encode query response: {}", e),
            }
        }
    }
}

async fn absorb_inbox(engine: &mut IndexingEngine, channels: &WorkerChannels) {
    while let Ok(text) = channels.inbox.try_recv() {
        handle_frame(engine, &text, &channels.outbox).await;
    }
}

async fn flush(engine: &mut IndexingEngine, channels: &WorkerChannels) {
    absorb_inbox(engine, channels).await;
    while engine.is_replaying() {
        engine.replay_step().await;
    }
    while engine.queue_len() > 0 {
        if engine.run_drain_cycle().await.is_err() {
            break;
        }
    }
}

/// Handle to a worker running on its own OS thread.
#[derive(Debug)]
pub struct WorkerHandle {
    thread: Option<JoinHandle<Option<EngineStats>>>,
}

impl WorkerHandle {
    /// Spawn a worker thread with its own single-threaded runtime.
    ///
    /// `build` runs on the worker thread and produces the engine, so the store is
    /// opened on the runtime that will use it. Returns once the engine is built;
    /// replay continues in the background.
    pub async fn spawn<F, Fut>(
        build: F,
        schedule: DrainSchedule,
        channels: WorkerChannels,
    ) -> Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<IndexingEngine>>,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        let thread = std::thread::Builder::new()
            .name("ragnote-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to start worker runtime: {e}")));
                        return None;
                    }
                };

                runtime.block_on(async move {
                    let engine = match build().await {
                        Ok(engine) => engine,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{e:#}")));
                            return None;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    Some(run_worker_loop(engine, schedule, channels).await)
                })
            })
            .context("failed to spawn worker thread")?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                thread: Some(thread),
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(anyhow::anyhow!("worker failed to start: {message}"))
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow::anyhow!("worker thread exited during startup"))
            }
        }
    }

    /// Wait for the worker thread to finish and return its final statistics.
    ///
    /// The loop must already have been told to stop, by a `Shutdown` control or by
    /// dropping the façade's channels.
    pub async fn join(mut self) -> Option<EngineStats> {
        let thread = self.thread.take()?;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(stats)) => stats,
            _ => {
                warn!("Worker thread panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::retrieval::indexing_engine::IndexingEngineConfig;
    use crate::retrieval::similarity_index::SearchHit;
    use crate::storage::EphemeralRecordStore;
    use ragnote_embed::MockEmbeddingProvider;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn engine(provider: &Arc<MockEmbeddingProvider>) -> IndexingEngine {
        IndexingEngine::new_memory(IndexingEngineConfig::default(), provider.clone())
            .await
            .unwrap()
    }

    fn add(id: &str, content: &str) -> String {
        WorkerMessage::AddDocument {
            document: Document::new(id, content),
        }
        .to_json()
        .unwrap()
    }

    fn query(id: &str, text: &str, k: usize) -> String {
        WorkerMessage::Query {
            id: id.into(),
            query: text.into(),
            num_results: k,
        }
        .to_json()
        .unwrap()
    }

    async fn drain_now(facade: &FacadeChannels) -> Result<DrainReport, IndexError> {
        let (ack, done) = oneshot::channel();
        facade.control.send(WorkerControl::DrainNow { ack }).unwrap();
        done.await.unwrap()
    }

    async fn next_response(facade: &FacadeChannels) -> (String, Vec<SearchHit>, Option<String>) {
        let text = facade.from_worker.recv_async().await.unwrap();
        match WorkerResponse::from_json(&text).unwrap() {
            WorkerResponse::QueryResponse { id, results, error } => (id, results, error),
        }
    }

    #[tokio::test]
    async fn test_add_drain_and_query() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let loop_task = tokio::spawn(run_worker_loop(
            engine(&provider).await,
            DrainSchedule::manual(),
            worker,
        ));

        facade.to_worker.send(add("a", "rust borrow checker notes")).unwrap();
        facade.to_worker.send(add("b", "bread baking hydration")).unwrap();
        let report = drain_now(&facade).await.unwrap();
        assert_eq!(report.embedded, 2);

        facade.to_worker.send(query("q1", "rust borrow checker notes", 1)).unwrap();
        let (id, results, error) = next_response(&facade).await;
        assert_eq!(id, "q1");
        assert!(error.is_none());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");

        facade.control.send(WorkerControl::Shutdown).unwrap();
        let stats = loop_task.await.unwrap();
        assert_eq!(stats.processing.documents_embedded, 2);
    }

    #[tokio::test]
    async fn test_delete_message() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let loop_task = tokio::spawn(run_worker_loop(
            engine(&provider).await,
            DrainSchedule::manual(),
            worker,
        ));

        facade.to_worker.send(add("a", "ephemeral thought")).unwrap();
        drain_now(&facade).await.unwrap();
        facade
            .to_worker
            .send(
                WorkerMessage::DeleteDocument { id: "a".into() }
                    .to_json()
                    .unwrap(),
            )
            .unwrap();
        facade.to_worker.send(query("q", "ephemeral thought", 5)).unwrap();

        let (_, results, error) = next_response(&facade).await;
        assert!(error.is_none());
        assert!(results.is_empty());

        drop(facade);
        let stats = loop_task.await.unwrap();
        assert_eq!(stats.processing.deletions, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_frames_are_logged_and_ignored() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let mut engine = engine(&provider).await;
        let (outbox, responses) = flume::unbounded();

        handle_frame(&mut engine, "{not json", &outbox).await;
        handle_frame(&mut engine, r#"{"type": "compactIndex"}"#, &outbox).await;

        assert!(responses.is_empty());
        assert_eq!(engine.queue_len(), 0);
        assert!(logs_contain("Ignoring malformed worker message"));
    }

    #[tokio::test]
    async fn test_malformed_messages_do_not_stop_the_loop() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let loop_task = tokio::spawn(run_worker_loop(
            engine(&provider).await,
            DrainSchedule::manual(),
            worker,
        ));

        facade.to_worker.send("{not json".to_string()).unwrap();
        facade
            .to_worker
            .send(r#"{"type": "compactIndex"}"#.to_string())
            .unwrap();
        facade.to_worker.send(query("q", "still alive", 3)).unwrap();

        let (id, results, error) = next_response(&facade).await;
        assert_eq!(id, "q");
        assert!(results.is_empty());
        assert!(error.is_none());

        facade.control.send(WorkerControl::Shutdown).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_drain() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        // No SQLite here: paused time and a blocking database thread do not mix
        let engine = IndexingEngine::new(
            IndexingEngineConfig::default(),
            provider.clone(),
            Box::new(EphemeralRecordStore::new()),
        );
        let loop_task = tokio::spawn(run_worker_loop(
            engine,
            DrainSchedule::every(Duration::from_millis(75), Duration::ZERO),
            worker,
        ));

        facade.to_worker.send(add("a", "scheduled block")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        facade.to_worker.send(query("q", "scheduled block", 1)).unwrap();
        let (_, results, _) = next_response(&facade).await;
        assert_eq!(results.len(), 1);
        assert_eq!(provider.texts_embedded(), 2);

        facade.control.send(WorkerControl::Shutdown).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_failure_becomes_error_field() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let loop_task = tokio::spawn(run_worker_loop(
            engine(&provider).await,
            DrainSchedule::manual(),
            worker,
        ));

        facade.to_worker.send(add("a", "indexed before the outage")).unwrap();
        drain_now(&facade).await.unwrap();

        provider.set_failing(true);
        facade.to_worker.send(query("q", "outage", 1)).unwrap();
        let (_, results, error) = next_response(&facade).await;
        assert!(results.is_empty());
        assert!(error.is_some());

        facade.control.send(WorkerControl::Shutdown).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_drains_everything() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let loop_task = tokio::spawn(run_worker_loop(
            engine(&provider).await,
            DrainSchedule::manual(),
            worker,
        ));

        for i in 0..35 {
            facade
                .to_worker
                .send(add(&format!("b{i}"), &format!("block {i}")))
                .unwrap();
        }
        let (ack, done) = oneshot::channel();
        facade.control.send(WorkerControl::Flush { ack }).unwrap();
        let stats = done.await.unwrap();

        assert_eq!(stats.queue_len, 0);
        assert_eq!(stats.index_len, 35);
        assert_eq!(provider.calls(), 4);

        facade.control.send(WorkerControl::Shutdown).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_during_replay_is_answered_from_loaded_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let config = IndexingEngineConfig::default().with_replay_page_size(1);
        {
            let mut engine =
                IndexingEngine::open(config.clone(), provider.clone(), Some(temp_dir.path()))
                    .await;
            for i in 0..3 {
                engine.enqueue(Document::new(format!("b{i}"), format!("stored block {i}")));
            }
            while engine.queue_len() > 0 {
                engine.run_drain_cycle().await.unwrap();
            }
        }

        let engine = IndexingEngine::open(config, provider.clone(), Some(temp_dir.path())).await;
        let (facade, worker) = channels();
        // Already waiting when the loop starts, so it is answered before any replay page
        facade.to_worker.send(query("early", "stored block 0", 3)).unwrap();
        let loop_task = tokio::spawn(run_worker_loop(engine, DrainSchedule::manual(), worker));

        let (id, results, error) = next_response(&facade).await;
        assert_eq!(id, "early");
        assert!(error.is_none());
        assert!(results.is_empty());

        let (ack, done) = oneshot::channel();
        facade.control.send(WorkerControl::Flush { ack }).unwrap();
        let stats = done.await.unwrap();
        assert!(!stats.replaying);
        assert_eq!(stats.index_len, 3);

        facade.to_worker.send(query("late", "stored block 0", 3)).unwrap();
        let (_, results, _) = next_response(&facade).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, "b0");

        facade.control.send(WorkerControl::Shutdown).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_reports_build_failure() {
        let (_facade, worker) = channels();
        let result = WorkerHandle::spawn(
            || async { Err(anyhow::anyhow!("model download failed")) },
            DrainSchedule::manual(),
            worker,
        )
        .await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("model download failed"));
    }

    #[tokio::test]
    async fn test_spawned_worker_round_trip() {
        let provider = Arc::new(MockEmbeddingProvider::new(64));
        let (facade, worker) = channels();
        let engine_provider = provider.clone();
        let handle = WorkerHandle::spawn(
            move || async move {
                IndexingEngine::new_memory(IndexingEngineConfig::default(), engine_provider).await
            },
            DrainSchedule::manual(),
            worker,
        )
        .await
        .unwrap();

        facade.to_worker.send(add("a", "cross thread block")).unwrap();
        drain_now(&facade).await.unwrap();
        facade.to_worker.send(query("q", "cross thread block", 1)).unwrap();
        let (_, results, _) = next_response(&facade).await;
        assert_eq!(results[0].id, "a");

        facade.control.send(WorkerControl::Shutdown).unwrap();
        let stats = handle.join().await.unwrap();
        assert_eq!(stats.index_len, 1);
    }
}
