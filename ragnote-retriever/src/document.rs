use serde::{Deserialize, Serialize};

/// A note block to be indexed.
///
/// `id` matches the originating block id and is stable across edits. Empty content
/// is never indexed; it stands for a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    /// Whether this document carries anything worth embedding
    pub fn is_indexable(&self) -> bool {
        !self.content.trim().is_empty()
    }
}
