//! # ragnote-embed
//!
//! Text embedding providers for the ragnote retriever. Providers turn batches of
//! text into fixed-length half-precision vectors, in input order, and fail the
//! whole batch on any error.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ragnote_embed::{EmbedConfig, EmbeddingProvider, FastEmbedProvider};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = FastEmbedProvider::create(EmbedConfig::default()).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}",
//!          result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - [`FastEmbedProvider`]: local ONNX models through fastembed (all-MiniLM-L6-v2 by default)
//! - [`MockEmbeddingProvider`]: deterministic hashed bag-of-words vectors with call counters
//!
//! Use [`create_provider`] to build whichever one an [`EmbedConfig`] asks for.

pub mod config;
pub mod error;
pub mod mock;
pub mod provider;

pub use config::{EmbedConfig, EmbedModel};
pub use error::{EmbedError, Result};
pub use mock::MockEmbeddingProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider};

use std::sync::Arc;

/// Build and initialize the provider selected by `config`.
pub async fn create_provider(config: EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    match config.model {
        EmbedModel::Mock => Ok(Arc::new(MockEmbeddingProvider::new(config.mock_dimension))),
        _ => Ok(Arc::new(FastEmbedProvider::create(config).await?)),
    }
}
