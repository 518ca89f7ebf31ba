//! ONNX embedding models through FastEmbed.

use crate::config::{Device, EmbedConfig};
use crate::error::{EmbedError, Result};
use crate::provider::{EmbedderFactory, EmbeddingProvider, EmbeddingResult, normalize_in_place};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Loaded models keyed by `model_id`; indexing and search embedders share
/// weights when they run on the same device.
type ModelCache = Mutex<HashMap<String, Arc<Mutex<TextEmbedding>>>>;

static MODEL_CACHE: OnceLock<ModelCache> = OnceLock::new();

fn model_cache() -> &'static ModelCache {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn fastembed_model(model_id: &str) -> Result<EmbeddingModel> {
    match model_id {
        "Xenova/multilingual-e5-small" | "intfloat/multilingual-e5-small" => {
            Ok(EmbeddingModel::MultilingualE5Small)
        }
        "Xenova/multilingual-e5-base" | "intfloat/multilingual-e5-base" => {
            Ok(EmbeddingModel::MultilingualE5Base)
        }
        "Xenova/multilingual-e5-large" | "intfloat/multilingual-e5-large" => {
            Ok(EmbeddingModel::MultilingualE5Large)
        }
        other => Err(EmbedError::invalid_config(format!(
            "model '{other}' is not available through fastembed"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("model mutex poisoned")]
struct PoisonedModel;

pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Load (or reuse) the model described by `config`.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let model_kind = fastembed_model(&config.model_id)?;
        let dimension = config.resolved_dimensions();
        let cache_key = format!("{}:{}", config.model_id, config.device);

        let cached = model_cache()
            .lock()
            .map_err(|_| EmbedError::model_init(PoisonedModel))?
            .get(&cache_key)
            .cloned();

        let model = match cached {
            Some(model) => {
                tracing::debug!("Reusing cached model {}", cache_key);
                model
            }
            None => {
                tracing::info!(
                    "Loading embedding model {} ({}, {})",
                    config.model_id,
                    config.quantization,
                    config.device
                );
                let mut options = InitOptions::new(model_kind).with_show_download_progress(false);
                if let Some(dir) = &config.cache_dir {
                    options = options.with_cache_dir(dir.clone());
                }
                if config.device == Device::Gpu {
                    tracing::warn!("GPU execution is not configured for fastembed; using CPU");
                }
                let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await?
                    .map_err(|source| EmbedError::External { source })?;
                let model = Arc::new(Mutex::new(model));
                model_cache()
                    .lock()
                    .map_err(|_| EmbedError::model_init(PoisonedModel))?
                    .insert(cache_key, Arc::clone(&model));
                model
            }
        };

        Ok(Self {
            config,
            model,
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        let batch = texts.to_vec();
        let model = Arc::clone(&self.model);
        let normalize = self.config.normalize;

        let mut embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = model
                .lock()
                .map_err(|_| EmbedError::embedding_gen(PoisonedModel))?;
            guard
                .embed(batch, None)
                .map_err(|source| EmbedError::External { source })
        })
        .await??;

        if normalize {
            embeddings.iter_mut().for_each(|v| normalize_in_place(v));
        }
        if let Some(actual) = embeddings.first().map(Vec::len) {
            if actual != self.dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.dimension,
                    actual,
                });
            }
        }
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn config(&self) -> &EmbedConfig {
        &self.config
    }
}

/// Factory building [`FastEmbedProvider`]s.
#[derive(Debug, Default, Clone)]
pub struct FastEmbedFactory;

#[async_trait]
impl EmbedderFactory for FastEmbedFactory {
    async fn create(&self, config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
        Ok(Arc::new(FastEmbedProvider::create(config.clone()).await?))
    }
}
