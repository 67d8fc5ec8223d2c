//! ragnote-retriever: background vector indexing and similarity retrieval for notes
//!
//! This crate keeps an embedding index of note blocks up to date without blocking the
//! caller, persists it across restarts, and answers top-K similarity queries with a
//! timeout. All indexing state lives on a background worker thread; callers talk to it
//! through the [`Retriever`] façade.
//!
//! ## Key Modules
//!
//! - **[`facade`]**: [`Retriever`], the entry point: add, delete, query, flush
//! - **[`worker`]**: the background worker loop and its channels
//! - **[`protocol`]**: JSON messages exchanged with the worker
//! - **[`retrieval`]**: indexing engine, queue and in-memory similarity index
//! - **[`storage`]**: record store abstraction with a SQLite implementation
//! - **[`source`]** and **[`watch`]**: bulk enumeration and change feed for a notes directory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ragnote_retriever::{Document, Retriever, RetrieverConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RetrieverConfig::default().with_base_dir("/home/me/notes");
//! let retriever = Retriever::initialize(config).await?;
//!
//! retriever.add_document(Document::new("ideas#0", "Train the model with DeepSpeed"))?;
//! retriever.flush().await?;
//!
//! for hit in retriever.query("distributed training", 5).await? {
//!     println!("{:.3} {}", hit.score, hit.content);
//! }
//! retriever.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! caller ─→ Retriever ──JSON──→ worker: IndexingQueue ─→ embed ─→ RecordStore ─→ SimilarityIndex
//!              ↑                                                                      │
//!              └──────────────────────── queryResponse ←──────── search ←─────────────┘
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod facade;
pub mod protocol;
pub mod retrieval;
pub mod schedule;
pub mod source;
pub mod storage;
pub mod watch;
pub mod worker;

pub use config::RetrieverConfig;
pub use document::Document;
pub use error::{IndexError, RetrievalError};
pub use facade::Retriever;
pub use retrieval::similarity_index::SearchHit;
pub use source::{DocumentSource, NotesDirectorySource};
