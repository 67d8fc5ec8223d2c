//! Embedding provider implementations

use crate::config::{EmbedConfig, EmbedModel};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use half::f16;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, OnceLock};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, in input order
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result; the dimension is taken from the first vector.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                actual: 0,
            })
    }

    /// Generate embeddings for multiple texts.
    ///
    /// The output has exactly one vector per input, in the same order. A failure
    /// anywhere in the batch fails the whole call.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Name of the underlying model
    fn model_name(&self) -> &str;

    /// Whether returned vectors are unit length
    fn normalized(&self) -> bool {
        true
    }
}

/// FastEmbed-based embedding provider using local ONNX models
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Option<Arc<Mutex<TextEmbedding>>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("model", &self.model.is_some())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Creates a new uninitialized provider. Call [`initialize`](Self::initialize) before use.
    pub fn new(config: EmbedConfig) -> Self {
        let dimension = config.dimension();
        Self {
            config,
            model: None,
            dimension,
        }
    }

    /// Loads the embedding model, reusing a cached instance when one exists.
    pub async fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        let fastembed_model = match self.config.model {
            EmbedModel::AllMiniLmL6V2 => EmbeddingModel::AllMiniLML6V2,
            EmbedModel::BgeSmallEnV15 => EmbeddingModel::BGESmallENV15,
            EmbedModel::Mock => {
                return Err(EmbedError::invalid_config(
                    "the mock model is served by MockEmbeddingProvider",
                ));
            }
        };

        tracing::info!(
            "Initializing FastEmbed provider for model: {}",
            self.config.model_name()
        );

        let cache_key = self.create_cache_key()?;

        let cached_data = {
            let cache = get_model_cache()
                .lock()
                .map_err(|_| EmbedError::invalid_config("model cache lock poisoned"))?;
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        if let Some((cached_model, cached_dimension)) = cached_data {
            tracing::info!("Using cached model for: {}", self.config.model_name());
            self.model = Some(cached_model);
            self.dimension = cached_dimension;
            return Ok(());
        }

        let config = self.config.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                tracing::info!("Loading embedding model: {}", config.model_name());

                let mut init_options = InitOptions::new(fastembed_model)
                    .with_show_download_progress(config.show_download_progress);
                if let Some(cache_dir) = &config.cache_dir {
                    init_options = init_options.with_cache_dir(cache_dir.clone());
                }

                let mut model = TextEmbedding::try_new(init_options)
                    .map_err(|e| EmbedError::External { source: e })?;

                // Probe the real output dimension
                let probe = model
                    .embed(vec!["dimension probe".to_string()], None)
                    .map_err(|e| EmbedError::External { source: e })?;
                let dimension = probe
                    .first()
                    .map(|emb| emb.len())
                    .unwrap_or_else(|| config.dimension());

                tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                Ok((model, dimension))
            })
            .await??;

        let model_arc = Arc::new(Mutex::new(model));
        {
            let mut cache = get_model_cache()
                .lock()
                .map_err(|_| EmbedError::invalid_config("model cache lock poisoned"))?;
            cache.insert(cache_key, (Arc::clone(&model_arc), dimension));
        }

        self.model = Some(model_arc);
        self.dimension = dimension;
        Ok(())
    }

    /// Creates and initializes a provider in one step.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        let mut provider = Self::new(config);
        provider.initialize().await?;
        Ok(provider)
    }

    /// Cache key derived from the whole configuration
    fn create_cache_key(&self) -> Result<String> {
        let config_json = serde_json::to_string(&self.config)
            .map_err(|e| EmbedError::External { source: e.into() })?;

        let mut hasher = FnvHasher::default();
        hasher.write(b"v1:");
        hasher.write(config_json.as_bytes());

        Ok(format!("v1:{:x}", hasher.finish()))
    }

    /// Clears the global model cache.
    pub fn clear_cache() {
        if let Ok(mut cache) = get_model_cache().lock() {
            cache.clear();
            tracing::info!("Model cache cleared");
        }
    }

    fn convert_to_f16(&self, embeddings: Vec<Vec<f32>>) -> Vec<Vec<f16>> {
        embeddings
            .into_iter()
            .map(|embedding| to_f16(embedding, self.config.normalize))
            .collect()
    }
}

/// Convert an f32 vector to f16, optionally L2-normalizing first
pub(crate) fn to_f16(mut embedding: Vec<f32>, normalize: bool) -> Vec<f16> {
    if normalize {
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }
    }
    embedding.into_iter().map(f16::from_f32).collect()
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let model = self.model.as_ref().ok_or_else(|| {
            EmbedError::invalid_config("Model not initialized. Call initialize() first.")
        })?;

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.config.batch_size.max(1)) {
            let chunk = chunk.to_vec();
            let model_clone = Arc::clone(model);

            let batch_embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut model_guard = model_clone
                    .lock()
                    .map_err(|_| EmbedError::invalid_config("model lock poisoned"))?;
                model_guard
                    .embed(chunk, None)
                    .map_err(|e| EmbedError::External { source: e })
            })
            .await??;

            all_embeddings.extend(self.convert_to_f16(batch_embeddings));
        }

        if all_embeddings.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                actual: all_embeddings.len(),
            });
        }

        tracing::debug!("Generated {} embeddings", all_embeddings.len());
        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn model_name(&self) -> &str {
        self.config.model_name()
    }

    fn normalized(&self) -> bool {
        self.config.normalize
    }
}
