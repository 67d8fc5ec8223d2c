//! Runtime configuration, loadable from a TOML file.
//!
//! Every field has a default, so an empty file (or no file) is a valid configuration:
//!
//! ```toml
//! [storage]
//! base_dir = "/home/me/notes"
//!
//! [batcher]
//! batch_size = 10
//! drain_interval_ms = 75
//!
//! [embedding]
//! model = "mock"
//! mock_dimension = 64
//! ```

use crate::retrieval::indexing_engine::IndexingEngineConfig;
use crate::retrieval::similarity_index::DEFAULT_CAPACITY;
use crate::schedule::DrainSchedule;
use anyhow::{Context, Result, bail};
use ragnote_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the retriever and the `ragnote` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub batcher: BatcherConfig,
    pub replay: ReplayConfig,
    pub facade: FacadeConfig,
    pub source: SourceConfig,
    pub embedding: EmbedConfig,
}

/// Where the record store lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Set to `false` to run without persistence
    pub enabled: bool,
    /// Directory holding `.ragnote.db`; defaults to the working directory
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub capacity: usize,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub drain_interval_ms: u64,
    pub drain_jitter_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Records loaded per replay step
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Upper bound on documents enqueued by one bulk enumeration run
    pub max_documents_per_run: usize,
    /// File extensions treated as note pages
    pub extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            min_score: None,
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            drain_interval_ms: 75,
            drain_jitter_ms: 0,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { page_size: 256 }
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 10_000,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_documents_per_run: 500,
            extensions: vec!["md".to_string(), "org".to_string()],
        }
    }
}

impl RetrieverConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.capacity == 0 {
            bail!("index.capacity must be greater than 0");
        }
        if self.batcher.batch_size == 0 {
            bail!("batcher.batch_size must be greater than 0");
        }
        if self.batcher.drain_interval_ms == 0 {
            bail!("batcher.drain_interval_ms must be greater than 0");
        }
        if self.replay.page_size == 0 {
            bail!("replay.page_size must be greater than 0");
        }
        if self.facade.query_timeout_ms == 0 {
            bail!("facade.query_timeout_ms must be greater than 0");
        }
        if let Some(min_score) = self.index.min_score {
            if !(-1.0..=1.0).contains(&min_score) {
                bail!("index.min_score must be within [-1, 1], got {min_score}");
            }
        }
        self.embedding.validate()?;
        Ok(())
    }

    pub fn with_base_dir<P: Into<PathBuf>>(mut self, base_dir: P) -> Self {
        self.storage.base_dir = Some(base_dir.into());
        self.storage.enabled = true;
        self
    }

    pub fn without_persistence(mut self) -> Self {
        self.storage.enabled = false;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.index.capacity = capacity;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batcher.batch_size = batch_size;
        self
    }

    /// Directory for the record store, or `None` when persistence is disabled.
    pub fn storage_dir(&self) -> Option<PathBuf> {
        if !self.storage.enabled {
            return None;
        }
        Some(
            self.storage
                .base_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
        )
    }

    pub fn engine_config(&self) -> IndexingEngineConfig {
        IndexingEngineConfig::default()
            .with_batch_size(self.batcher.batch_size)
            .with_capacity(self.index.capacity)
            .with_min_score(self.index.min_score)
            .with_replay_page_size(self.replay.page_size)
    }

    pub fn drain_schedule(&self) -> DrainSchedule {
        DrainSchedule::every(
            Duration::from_millis(self.batcher.drain_interval_ms),
            Duration::from_millis(self.batcher.drain_jitter_ms),
        )
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.facade.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleMode;
    use ragnote_embed::EmbedModel;

    #[test]
    fn test_defaults() {
        let config = RetrieverConfig::from_toml_str("").unwrap();
        assert_eq!(config, RetrieverConfig::default());
        assert_eq!(config.batcher.batch_size, 10);
        assert_eq!(config.query_timeout(), Duration::from_secs(10));
        assert_eq!(config.source.max_documents_per_run, 500);
        assert_eq!(config.storage_dir(), Some(PathBuf::from(".")));

        let engine = config.engine_config();
        assert_eq!(engine.capacity, DEFAULT_CAPACITY);
        assert_eq!(engine.replay_page_size, 256);
    }

    #[test]
    fn test_partial_file() {
        let config = RetrieverConfig::from_toml_str(
            r#"
            [storage]
            base_dir = "/tmp/notes"

            [index]
            capacity = 500
            min_score = 0.25

            [batcher]
            drain_interval_ms = 50
            drain_jitter_ms = 10

            [embedding]
            model = "mock"
            mock_dimension = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_dir(), Some(PathBuf::from("/tmp/notes")));
        assert_eq!(config.index.capacity, 500);
        assert_eq!(config.index.min_score, Some(0.25));
        assert_eq!(config.batcher.batch_size, 10);
        assert_eq!(config.embedding.model, EmbedModel::Mock);
        assert_eq!(config.embedding.dimension(), 32);
        assert_eq!(
            config.drain_schedule().mode(),
            ScheduleMode::Every {
                interval: Duration::from_millis(50),
                jitter: Duration::from_millis(10),
            }
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(RetrieverConfig::from_toml_str("[index]\ncapacity = 0").is_err());
        assert!(RetrieverConfig::from_toml_str("[batcher]\nbatch_size = 0").is_err());
        assert!(RetrieverConfig::from_toml_str("[index]\nmin_score = 3.0").is_err());
        assert!(RetrieverConfig::from_toml_str("[embedding]\nmodel = \"gpt-9\"").is_err());
    }

    #[test]
    fn test_persistence_toggle() {
        let config = RetrieverConfig::default().without_persistence();
        assert_eq!(config.storage_dir(), None);

        let config = config.with_base_dir("/data");
        assert_eq!(config.storage_dir(), Some(PathBuf::from("/data")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragnote.toml");
        std::fs::write(&path, "[facade]\nquery_timeout_ms = 250\n").unwrap();

        let config = RetrieverConfig::load(&path).unwrap();
        assert_eq!(config.query_timeout(), Duration::from_millis(250));

        assert!(RetrieverConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
