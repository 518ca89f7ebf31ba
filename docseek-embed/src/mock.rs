//! Deterministic embedder for tests and offline use.
//!
//! [`MockEmbedder`] hashes lower-cased word tokens into a fixed number of
//! buckets (FNV-1a) and L2-normalizes the result. Texts sharing words get
//! positive cosine similarity, identical texts get identical vectors, and
//! nothing is downloaded or loaded.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbedderFactory, EmbeddingProvider, EmbeddingResult, normalize_in_place};
use crate::text::strip_prefix;
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct MockEmbedder {
    config: EmbedConfig,
    dimension: usize,
    failure_marker: Option<String>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(config: EmbedConfig) -> Self {
        let dimension = config.resolved_dimensions();
        Self {
            config,
            dimension,
            failure_marker: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Mock with the default model settings and the given width.
    pub fn with_dimension(dimension: usize) -> Self {
        Self::new(EmbedConfig::default().with_dimensions(dimension))
    }

    /// Fail every batch containing a text that includes `marker`.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.failure_marker = Some(marker.into());
        self
    }

    /// Number of `embed_texts` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// The vector produced for `text`, without any prefix handling.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(strip_prefix(text)) {
            let mut hasher = FnvHasher::default();
            hasher.write(token.as_bytes());
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        if self.config.normalize {
            normalize_in_place(&mut vector);
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

#[derive(Debug, thiserror::Error)]
#[error("mock embedder refused text containing '{0}'")]
struct MockFailure(String);

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(marker) = &self.failure_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbedError::embedding_gen(MockFailure(marker.clone())));
            }
        }
        let embeddings = texts.iter().map(|t| self.vector_for(t)).collect();
        Ok(EmbeddingResult {
            embeddings,
            dimension: self.dimension,
        })
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> &EmbedConfig {
        &self.config
    }
}

/// Factory producing [`MockEmbedder`]s.
#[derive(Debug, Default, Clone)]
pub struct MockEmbedderFactory {
    failure_marker: Option<String>,
}

impl MockEmbedderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedders built by this factory fail on texts containing `marker`.
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            failure_marker: Some(marker.into()),
        }
    }
}

#[async_trait]
impl EmbedderFactory for MockEmbedderFactory {
    async fn create(&self, config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
        config.validate()?;
        let mut embedder = MockEmbedder::new(config.clone());
        if let Some(marker) = &self.failure_marker {
            embedder = embedder.failing_on(marker.clone());
        }
        tracing::debug!(
            model = %config.model_id,
            quantization = %config.quantization,
            device = %config.device,
            "Created mock embedder"
        );
        Ok(Arc::new(embedder))
    }
}
