//! Change feed for a notes directory.
//!
//! [`NotesWatcher`] turns filesystem events into worker messages: a changed page is
//! re-read and every block is sent as an `addDocument` (unchanged blocks are skipped by
//! the worker), while blocks that disappeared, including every block of a deleted page,
//! are sent as `deleteDocument`.

use crate::document::Document;
use crate::error::RetrievalError;
use crate::facade::Retriever;
use crate::source::NotesDirectorySource;
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One change to forward to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(Document),
    Delete(String),
}

/// Remembers which block ids each page produced last time it was read.
#[derive(Debug)]
pub struct PageTracker {
    source: NotesDirectorySource,
    known: HashMap<PathBuf, Vec<String>>,
}

impl PageTracker {
    pub fn new(source: NotesDirectorySource) -> Self {
        Self {
            source,
            known: HashMap::new(),
        }
    }

    pub fn tracked_pages(&self) -> usize {
        self.known.len()
    }

    /// Read pages in path order and return at most `max` changes.
    ///
    /// The page that reaches the cap is tracked in full, though only its first blocks
    /// are returned. Later pages are left untracked. Either way, the rest is sent when
    /// the page next changes.
    pub fn seed(&mut self, max: usize) -> Vec<Change> {
        let mut changes = Vec::new();
        for path in self.source.page_paths() {
            let room = max.saturating_sub(changes.len());
            if room == 0 {
                break;
            }
            changes.extend(self.page_changed(&path).into_iter().take(room));
        }
        changes
    }

    /// Work out what changed for a path reported by the filesystem.
    pub fn page_changed(&mut self, path: &Path) -> Vec<Change> {
        if path.is_file() {
            if !self.source.is_visible_page(path) {
                return Vec::new();
            }
            return match self.source.read_page(path) {
                Ok(documents) => self.replace_page(path, documents),
                Err(e) => {
                    warn!("Could not re-read page: {:#}", e);
                    Vec::new()
                }
            };
        }

        if path.exists() {
            return Vec::new();
        }

        // Removed: either a single page or a whole directory of them
        let removed: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|known| known.starts_with(path))
            .cloned()
            .collect();
        removed
            .into_iter()
            .flat_map(|page| self.known.remove(&page).unwrap_or_default())
            .map(Change::Delete)
            .collect()
    }

    fn replace_page(&mut self, path: &Path, documents: Vec<Document>) -> Vec<Change> {
        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let previous = self.known.insert(path.to_path_buf(), ids.clone());

        let mut changes: Vec<Change> = previous
            .unwrap_or_default()
            .into_iter()
            .filter(|old| !ids.contains(old))
            .map(Change::Delete)
            .collect();
        changes.extend(documents.into_iter().map(Change::Upsert));
        changes
    }
}

/// Forward changes to the worker.
pub fn apply(retriever: &Retriever, changes: Vec<Change>) -> Result<(), RetrievalError> {
    for change in changes {
        match change {
            Change::Upsert(document) => {
                retriever.add_document(document)?;
            }
            Change::Delete(id) => retriever.delete_document(id)?,
        }
    }
    Ok(())
}

/// Watches a notes directory and keeps the index in step with it.
pub struct NotesWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    listener: tokio::task::JoinHandle<()>,
}

impl NotesWatcher {
    /// Send an initial scan of up to `max` blocks, then follow changes.
    pub async fn start(
        source: NotesDirectorySource,
        retriever: Arc<Retriever>,
        debounce: Duration,
        max: usize,
    ) -> Result<Self> {
        let base = source.root().to_path_buf();
        let (events_tx, events_rx) = mpsc::channel::<PathBuf>(128);

        let mut tracker = PageTracker::new(source);
        let (tracker, initial) = tokio::task::spawn_blocking(move || {
            let changes = tracker.seed(max);
            (tracker, changes)
        })
        .await?;
        info!(
            "Watching {} ({} pages, {} blocks sent)",
            base.display(),
            tracker.tracked_pages(),
            initial.len()
        );
        apply(&retriever, initial)?;

        let listener = tokio::spawn(listen(events_rx, tracker, retriever));

        let mut debouncer = notify_debouncer_mini::new_debouncer(
            debounce,
            move |res: notify_debouncer_mini::DebounceEventResult| match res {
                Ok(events) => {
                    for event in events {
                        // Runs on the debouncer's own thread, not inside the runtime
                        if events_tx.blocking_send(event.path).is_err() {
                            debug!("Watch listener stopped, dropping file events");
                            return;
                        }
                    }
                }
                Err(e) => warn!("File watch error: {}", e),
            },
        )?;
        debouncer
            .watcher()
            .watch(&base, notify::RecursiveMode::Recursive)?;

        Ok(Self {
            _debouncer: debouncer,
            listener,
        })
    }

    /// Stop watching and release the listener's handle on the retriever.
    pub async fn stop(self) {
        self.listener.abort();
        let _ = self.listener.await;
    }
}

async fn listen(
    mut events_rx: mpsc::Receiver<PathBuf>,
    mut tracker: PageTracker,
    retriever: Arc<Retriever>,
) {
    while let Some(path) = events_rx.recv().await {
        let result = tokio::task::spawn_blocking(move || {
            let changes = tracker.page_changed(&path);
            (tracker, changes)
        })
        .await;
        let (returned, changes) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Page change task failed, stopping watcher: {}", e);
                return;
            }
        };
        tracker = returned;

        if changes.is_empty() {
            continue;
        }
        debug!("Forwarding {} block changes", changes.len());
        if let Err(e) = apply(&retriever, changes) {
            warn!("Stopping watcher: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerMessage;
    use crate::worker::channels;
    use tempfile::tempdir;

    fn tracker(root: &Path) -> PageTracker {
        PageTracker::new(NotesDirectorySource::new(root, vec!["md".to_string()]))
    }

    fn upsert(id: &str, content: &str) -> Change {
        Change::Upsert(Document::new(id, content))
    }

    #[test]
    fn test_seed_and_edit() {
        let dir = tempdir().unwrap();
        let page = dir.path().join("todo.md");
        std::fs::write(&page, "- buy milk\n- call bob\n- water plants\n").unwrap();

        let mut tracker = tracker(dir.path());
        assert_eq!(
            tracker.seed(100),
            vec![
                upsert("todo#0", "buy milk"),
                upsert("todo#1", "call bob"),
                upsert("todo#2", "water plants"),
            ]
        );

        std::fs::write(&page, "- buy oat milk\n").unwrap();
        assert_eq!(
            tracker.page_changed(&page),
            vec![
                Change::Delete("todo#1".into()),
                Change::Delete("todo#2".into()),
                upsert("todo#0", "buy oat milk"),
            ]
        );
    }

    #[test]
    fn test_removed_pages_and_directories() {
        let dir = tempdir().unwrap();
        let journals = dir.path().join("journals");
        std::fs::create_dir(&journals).unwrap();
        std::fs::write(journals.join("mon.md"), "- standup\n").unwrap();
        std::fs::write(journals.join("tue.md"), "- retro\n").unwrap();
        std::fs::write(dir.path().join("keep.md"), "- stays\n").unwrap();

        let mut tracker = tracker(dir.path());
        tracker.seed(100);
        assert_eq!(tracker.tracked_pages(), 3);

        std::fs::remove_dir_all(&journals).unwrap();
        let mut changes = tracker.page_changed(&journals);
        changes.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(
            changes,
            vec![
                Change::Delete("journals/mon#0".into()),
                Change::Delete("journals/tue#0".into()),
            ]
        );
        assert_eq!(tracker.tracked_pages(), 1);
    }

    #[test]
    fn test_ignores_non_pages_and_respects_seed_cap() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "- 1\n- 2\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "- 3\n").unwrap();
        std::fs::write(dir.path().join("c.txt"), "plain").unwrap();

        let mut tracker = tracker(dir.path());
        assert_eq!(tracker.seed(1), vec![upsert("a#0", "1")]);
        assert_eq!(tracker.tracked_pages(), 1);
        assert!(tracker.page_changed(&dir.path().join("c.txt")).is_empty());
        assert!(tracker.page_changed(&dir.path().join("never-existed.md")).is_empty());

        // The capped page goes out in full once it changes
        std::fs::write(dir.path().join("a.md"), "- 1\n- 2\n- 2b\n").unwrap();
        assert_eq!(tracker.page_changed(&dir.path().join("a.md")).len(), 3);
    }

    #[test]
    fn test_hidden_and_ignored_pages_are_not_followed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "private.md\n").unwrap();
        std::fs::write(dir.path().join("open.md"), "- shared\n").unwrap();

        let mut tracker = tracker(dir.path());
        assert_eq!(tracker.seed(100).len(), 1);

        // Files the initial scan skips are skipped when they change, too
        std::fs::write(dir.path().join("private.md"), "- diary\n").unwrap();
        std::fs::write(dir.path().join(".draft.md"), "- unfinished\n").unwrap();
        assert!(tracker.page_changed(&dir.path().join("private.md")).is_empty());
        assert!(tracker.page_changed(&dir.path().join(".draft.md")).is_empty());
        assert_eq!(tracker.tracked_pages(), 1);
    }

    #[tokio::test]
    async fn test_apply_sends_worker_messages() {
        let (facade, worker) = channels();
        let retriever = Retriever::from_channels(facade, Duration::from_secs(1));

        apply(
            &retriever,
            vec![upsert("p#0", "hello"), Change::Delete("p#1".into())],
        )
        .unwrap();

        let frames: Vec<WorkerMessage> = worker
            .inbox
            .drain()
            .map(|frame| WorkerMessage::from_json(&frame).unwrap())
            .collect();
        assert_eq!(
            frames,
            vec![
                WorkerMessage::AddDocument {
                    document: Document::new("p#0", "hello")
                },
                WorkerMessage::DeleteDocument { id: "p#1".into() },
            ]
        );
    }
}
