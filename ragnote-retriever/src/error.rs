//! Error kinds callers need to tell apart.
//!
//! Store and engine plumbing uses `anyhow::Result`; these enums cover the two places
//! where the kind matters: the similarity index (capacity is fatal, dimensions are a bug)
//! and the retrieval façade (a timeout is not the same as a worker failure).

use std::time::Duration;

/// Errors raised by [`SimilarityIndex`](crate::retrieval::similarity_index::SimilarityIndex).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Inserting would push the index past its fixed capacity
    #[error("similarity index capacity exceeded: capacity {capacity}, requested {requested}")]
    CapacityExceeded { capacity: usize, requested: usize },

    /// A vector does not match the dimension the index was built with
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// `add_vectors` was handed a different number of vectors and documents
    #[error("batch has {vectors} vectors for {documents} documents")]
    BatchMismatch { vectors: usize, documents: usize },
}

/// Errors returned by the [`Retriever`](crate::facade::Retriever) façade.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// No response arrived in time; the pending request has been dropped
    #[error("query timed out after {after:?}")]
    Timeout { after: Duration },

    /// The worker is gone (shut down or crashed)
    #[error("background worker is unavailable")]
    WorkerUnavailable,

    /// The worker answered with an error message
    #[error("worker reported an error: {0}")]
    Worker(String),

    /// A message could not be serialized for the worker
    #[error("failed to encode worker message: {0}")]
    Encode(#[from] serde_json::Error),

    /// A requested drain hit a fatal index error
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl RetrievalError {
    /// True for the timeout kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetrievalError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::CapacityExceeded {
            capacity: 2,
            requested: 3,
        };
        assert_eq!(
            err.to_string(),
            "similarity index capacity exceeded: capacity 2, requested 3"
        );

        let err = RetrievalError::Timeout {
            after: Duration::from_secs(10),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "query timed out after 10s");
        assert!(!RetrievalError::WorkerUnavailable.is_timeout());
    }
}
