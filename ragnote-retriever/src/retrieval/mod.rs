//! In-worker indexing: the pending queue, the batcher/engine and the similarity index.

pub mod indexing_engine;
pub mod queue;
pub mod similarity_index;
