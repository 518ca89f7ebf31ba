//! Embedder resolution and consistency.
//!
//! A database is pinned to the embedding model it was created with. Vectors
//! from a different model, quantization or width are not comparable with the
//! stored ones, so once a [`StoredEmbedderConfig`] exists it wins over
//! whatever the caller requests. Mismatches the pinned config cannot fix
//! (schema version, vector width) are reported, never corrected silently.
//!
//! Two providers are built from the resolved settings: one for indexing,
//! on the requested device, and one for queries that always runs on the CPU
//! so searches never wait behind a busy accelerator.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docseek_embed::{Device, EmbedConfig, EmbedderFactory, EmbeddingProvider, Quantization};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EmbedderSettings;
use crate::storage::{self, StorageAdapter, StoreError};

/// Config-store key holding the pinned embedder settings.
pub const EMBEDDER_CONFIG_KEY: &str = "embedder_config";

/// Version of the stored vector layout. Bumped when existing indexes must be
/// rebuilt.
pub const SCHEMA_VERSION: u32 = 1;

/// Embedder settings pinned when a database is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEmbedderConfig {
    pub model_id: String,
    pub quantization: Quantization,
    pub dimensions: usize,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

/// Where the resolved settings came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderSource {
    /// An existing database's pinned config
    Stored,
    /// The caller's request, now persisted
    Requested,
}

/// The pair of providers a search system works with.
#[derive(Clone)]
pub struct ResolvedEmbedders {
    /// Embeds chunks during indexing and OCR
    pub indexing: Arc<dyn EmbeddingProvider>,
    /// Embeds search queries; always on the CPU
    pub search: Arc<dyn EmbeddingProvider>,
    pub config: StoredEmbedderConfig,
    pub source: EmbedderSource,
}

impl std::fmt::Debug for ResolvedEmbedders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEmbedders")
            .field("indexing", &self.indexing.provider_name())
            .field("search", &self.search.provider_name())
            .field("config", &self.config)
            .field("source", &self.source)
            .finish()
    }
}

/// Read the pinned config, if the database has one.
pub async fn load_stored_config(
    storage: &dyn StorageAdapter,
) -> Result<Option<StoredEmbedderConfig>> {
    storage::get_config(storage, EMBEDDER_CONFIG_KEY)
        .await
        .context("Failed to read stored embedder config")
}

/// Build the indexing and search embedders for `storage`.
///
/// # Arguments
/// * `storage` - Initialized adapter whose config store holds the pinned settings
/// * `request` - Settings used when the database has no pinned config yet
/// * `factory` - Builds providers from an [`EmbedConfig`]
///
/// # Returns
/// Both providers and the config they were built from
///
/// # Errors
/// - Reading the config store fails
/// - The factory cannot build a provider
/// - The two providers disagree on the vector width
pub async fn resolve_embedders(
    storage: &dyn StorageAdapter,
    request: &EmbedderSettings,
    factory: &dyn EmbedderFactory,
) -> Result<ResolvedEmbedders> {
    let stored = load_stored_config(storage).await?;

    let (model_id, quantization) = match &stored {
        Some(pinned) => {
            info!(
                "Using stored embedder config: {} ({}, {} dimensions)",
                pinned.model_id, pinned.quantization, pinned.dimensions
            );
            if pinned.schema_version != SCHEMA_VERSION {
                warn!(
                    "Stored embedder schema version {} differs from current version {}; rebuild the index to upgrade",
                    pinned.schema_version, SCHEMA_VERSION
                );
            }
            if request.model_id != pinned.model_id {
                info!(
                    "Requested model {} ignored; database is pinned to {}",
                    request.model_id, pinned.model_id
                );
            }
            if request.quantization != pinned.quantization {
                info!(
                    "Requested quantization {} ignored; database is pinned to {}",
                    request.quantization, pinned.quantization
                );
            }
            (pinned.model_id.clone(), pinned.quantization)
        }
        None => (request.model_id.clone(), request.quantization),
    };

    let mut base = EmbedConfig::new(model_id.clone())
        .with_quantization(quantization)
        .with_batch_size(request.batch_size);
    if let Some(dir) = &request.cache_dir {
        base = base.with_cache_dir(dir.clone());
    }

    let indexing = factory
        .create(&base.clone().with_device(request.device))
        .await
        .with_context(|| format!("Failed to create indexing embedder for {model_id}"))?;
    let search = factory
        .create(&base.with_device(Device::Cpu))
        .await
        .with_context(|| format!("Failed to create search embedder for {model_id}"))?;

    let dimensions = indexing.embedding_dimension();
    if search.embedding_dimension() != dimensions {
        anyhow::bail!(
            "Indexing embedder produces {} dimensions but search embedder produces {}",
            dimensions,
            search.embedding_dimension()
        );
    }

    let (config, source) = match stored {
        Some(pinned) => {
            if pinned.dimensions != dimensions {
                warn!(
                    "Stored embedder config expects {} dimensions but {} produces {}; rebuild the index",
                    pinned.dimensions, pinned.model_id, dimensions
                );
            }
            (pinned, EmbedderSource::Stored)
        }
        None => {
            let config = StoredEmbedderConfig {
                model_id,
                quantization,
                dimensions,
                schema_version: SCHEMA_VERSION,
                created_at: Utc::now(),
            };
            match storage::set_config(storage, EMBEDDER_CONFIG_KEY, &config).await {
                Ok(()) => info!(
                    "Persisted new embedder config: {} ({}, {} dimensions)",
                    config.model_id, config.quantization, config.dimensions
                ),
                Err(StoreError::ReadOnly) => warn!(
                    "Storage is read-only; embedder config for {} not persisted",
                    config.model_id
                ),
                Err(e) => return Err(e).context("Failed to persist embedder config"),
            }
            (config, EmbedderSource::Requested)
        }
    };

    Ok(ResolvedEmbedders {
        indexing,
        search,
        config,
        source,
    })
}
