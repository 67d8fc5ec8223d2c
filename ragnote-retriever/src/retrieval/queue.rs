use crate::document::Document;
use std::collections::VecDeque;
use tracing::debug;

/// Unbounded FIFO of documents awaiting embedding.
///
/// Enqueueing never blocks and never deduplicates: repeated updates of one id sit side
/// by side until a drain cycle collapses them.
#[derive(Debug, Default)]
pub struct IndexingQueue {
    pending: VecDeque<Document>,
}

impl IndexingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to the back of the queue.
    pub fn enqueue(&mut self, document: Document) {
        self.pending.push_back(document);
    }

    /// Take the oldest pending document
    pub fn pop(&mut self) -> Option<Document> {
        self.pending.pop_front()
    }

    /// Drop every pending entry for `id`, returning how many were removed.
    pub fn purge(&mut self, id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|doc| doc.id != id);
        let removed = before - self.pending.len();
        if removed > 0 {
            debug!("Purged {} pending entries for {}", removed, id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
