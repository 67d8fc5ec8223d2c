//! Messages crossing the worker boundary.
//!
//! Everything sent to or from the worker is a JSON text frame with a `type`
//! discriminator, so nothing mutable is shared and an unrecognised frame can be logged
//! and dropped instead of crashing the loop.
//!
//! ```json
//! {"type": "addDocument", "document": {"id": "page#0", "content": "..."}}
//! {"type": "deleteDocument", "id": "page#0"}
//! {"type": "query", "id": "<uuid>", "query": "...", "numResults": 5}
//! {"type": "queryResponse", "id": "<uuid>", "results": [{"id": "...", "content": "...", "score": 0.83}], "error": null}
//! ```

use crate::document::Document;
use crate::retrieval::similarity_index::SearchHit;
use serde::{Deserialize, Serialize};

/// Requests handled by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    AddDocument {
        document: Document,
    },
    DeleteDocument {
        id: String,
    },
    Query {
        id: String,
        query: String,
        #[serde(rename = "numResults")]
        num_results: usize,
    },
}

/// Responses emitted by the worker, correlated by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerResponse {
    QueryResponse {
        id: String,
        results: Vec<SearchHit>,
        error: Option<String>,
    },
}

impl WorkerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl WorkerResponse {
    /// Successful query response
    pub fn results(id: String, results: Vec<SearchHit>) -> Self {
        WorkerResponse::QueryResponse {
            id,
            results,
            error: None,
        }
    }

    /// Failed query response; results are always empty
    pub fn failure(id: String, error: impl Into<String>) -> Self {
        WorkerResponse::QueryResponse {
            id,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Correlation id of the request this answers
    pub fn request_id(&self) -> &str {
        match self {
            WorkerResponse::QueryResponse { id, .. } => id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
