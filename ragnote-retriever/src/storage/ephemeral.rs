use super::{EmbeddingRecord, RecordStore, RecordStream};
use anyhow::Result;
use async_trait::async_trait;

/// Store used when persistence is off or unavailable.
///
/// Writes are accepted and discarded, so nothing survives a restart and nothing is ever
/// reported unchanged. The similarity index still works for the lifetime of the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralRecordStore;

impl EphemeralRecordStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RecordStore for EphemeralRecordStore {
    fn load_all(&self) -> RecordStream {
        Box::pin(futures::stream::empty())
    }

    async fn has_unchanged(&self, _id: &str, _content: &str) -> Result<bool> {
        Ok(false)
    }

    async fn put_batch(&self, _records: &[EmbeddingRecord]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn count(&self) -> Result<usize> {
        Ok(0)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
