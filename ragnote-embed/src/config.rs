//! Configuration for embedding models

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Embedding models this crate knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedModel {
    /// sentence-transformers/all-MiniLM-L6-v2, 384 dimensions
    AllMiniLmL6V2,
    /// BAAI/bge-small-en-v1.5, 384 dimensions
    BgeSmallEnV15,
    /// Deterministic hashed bag-of-words vectors, no model download
    Mock,
}

impl EmbedModel {
    /// Name used in logs and in the stored model id
    pub fn name(&self) -> &'static str {
        match self {
            EmbedModel::AllMiniLmL6V2 => "all-minilm-l6-v2",
            EmbedModel::BgeSmallEnV15 => "bge-small-en-v1.5",
            EmbedModel::Mock => "mock",
        }
    }

    /// Output dimension of the model, if fixed by the model itself
    pub fn native_dimension(&self) -> Option<usize> {
        match self {
            EmbedModel::AllMiniLmL6V2 | EmbedModel::BgeSmallEnV15 => Some(384),
            EmbedModel::Mock => None,
        }
    }
}

impl std::fmt::Display for EmbedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for EmbedModel {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "all-minilm" | "minilm" => Ok(EmbedModel::AllMiniLmL6V2),
            "bge-small-en-v1.5" | "bge-small" => Ok(EmbedModel::BgeSmallEnV15),
            "mock" => Ok(EmbedModel::Mock),
            other => Err(EmbedError::invalid_config(format!(
                "unknown embedding model '{other}'"
            ))),
        }
    }
}

/// Configuration for embedding models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Which model to load
    pub model: EmbedModel,
    /// Directory where fastembed caches downloaded model files
    pub cache_dir: Option<PathBuf>,
    /// Maximum number of texts sent to the model in one call
    pub batch_size: usize,
    /// Whether to L2-normalize embeddings
    pub normalize: bool,
    /// Vector dimension for the mock model
    pub mock_dimension: usize,
    /// Show a progress bar while fastembed downloads the model
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model: EmbedModel::AllMiniLmL6V2,
            cache_dir: None,
            batch_size: 16,
            normalize: true,
            mock_dimension: 64,
            show_download_progress: false,
        }
    }
}

impl EmbedConfig {
    /// Create a configuration for the given model with default settings
    pub fn new(model: EmbedModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Configuration for the deterministic mock model
    pub fn mock(dimension: usize) -> Self {
        Self {
            model: EmbedModel::Mock,
            mock_dimension: dimension,
            ..Self::default()
        }
    }

    /// Set the model cache directory (builder style)
    pub fn with_cache_dir<P: AsRef<Path>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: Some(cache_dir.as_ref().to_path_buf()),
            ..self
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Model name, as used in logs and the stored model id
    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Dimension of vectors this configuration will produce
    pub fn dimension(&self) -> usize {
        self.model.native_dimension().unwrap_or(self.mock_dimension)
    }

    /// Reject configurations that cannot produce embeddings
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.dimension() == 0 {
            return Err(EmbedError::invalid_config(
                "embedding dimension must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults() {
        let config = EmbedConfig::default();

        assert_eq!(config.model, EmbedModel::AllMiniLmL6V2);
        assert_eq!(config.batch_size, 16);
        assert!(config.normalize);
        assert_eq!(config.dimension(), 384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_methods() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::new(EmbedModel::BgeSmallEnV15)
            .with_cache_dir(temp_dir.path())
            .with_batch_size(64)
            .with_normalize(false);

        assert_eq!(config.batch_size, 64);
        assert!(!config.normalize);
        assert_eq!(config.cache_dir.as_deref(), Some(temp_dir.path()));
        assert_eq!(config.model_name(), "bge-small-en-v1.5");
    }

    #[test]
    fn test_mock_dimension() {
        let config = EmbedConfig::mock(32);
        assert_eq!(config.dimension(), 32);

        let config = EmbedConfig::mock(0);
        assert!(config.validate().is_err());

        let config = EmbedConfig::mock(8).with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_parsing() {
        assert_eq!(
            "all-MiniLM-L6-v2".parse::<EmbedModel>().unwrap(),
            EmbedModel::AllMiniLmL6V2
        );
        assert_eq!("bge-small".parse::<EmbedModel>().unwrap(), EmbedModel::BgeSmallEnV15);
        assert_eq!("mock".parse::<EmbedModel>().unwrap(), EmbedModel::Mock);
        assert!("word2vec".parse::<EmbedModel>().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EmbedConfig = serde_json::from_str(r#"{"model": "mock"}"#).unwrap();
        assert_eq!(config.model, EmbedModel::Mock);
        assert_eq!(config.mock_dimension, 64);
        assert_eq!(config.batch_size, 16);
    }
}
