//! Embedding provider trait and the factory used to build providers

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::text::{prepare_passage, prepare_query};
use async_trait::async_trait;
use std::sync::Arc;

/// Progress callback invoked after every batch with `(done, total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Result of embedding generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingResult {
    /// One vector per input text, in input order
    pub embeddings: Vec<Vec<f32>>,
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Build a result, inferring the dimension from the first vector.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for services that turn text into fixed-width vectors.
///
/// Implementors provide [`embed_texts`](EmbeddingProvider::embed_texts), which
/// embeds already prepared strings. The provided methods take care of text
/// sanitization, model-specific prefixes and batching.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed prepared texts. Returns exactly one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Width of the vectors this provider produces
    fn embedding_dimension(&self) -> usize;

    fn provider_name(&self) -> &str;

    /// The configuration this provider was built from
    fn config(&self) -> &EmbedConfig;

    /// Embed document passages in batches of `config().batch_size`.
    async fn embed_documents(
        &self,
        texts: &[String],
        progress: Option<ProgressCallback>,
    ) -> Result<EmbeddingResult> {
        let e5 = self.config().is_e5_model();
        let batch_size = self.config().batch_size.max(1);
        let total = texts.len();
        let mut embeddings = Vec::with_capacity(total);

        for batch in texts.chunks(batch_size) {
            let prepared: Vec<String> = batch.iter().map(|t| prepare_passage(t, e5)).collect();
            let result = self.embed_texts(&prepared).await?;
            if result.len() != prepared.len() {
                return Err(EmbedError::invalid_config(format!(
                    "provider returned {} vectors for {} texts",
                    result.len(),
                    prepared.len()
                )));
            }
            embeddings.extend(result.embeddings);
            if let Some(progress) = &progress {
                progress(embeddings.len(), total);
            }
        }

        tracing::debug!(
            "Embedded {} passages with {}",
            embeddings.len(),
            self.provider_name()
        );
        Ok(EmbeddingResult {
            embeddings,
            dimension: self.embedding_dimension(),
        })
    }

    /// Embed a single search query.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let prepared = vec![prepare_query(query, self.config().is_e5_model())];
        self.embed_texts(&prepared)
            .await?
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for query"))
    }
}

/// Builds providers from configurations. Lets callers swap the model runtime
/// (a real ONNX model, or [`MockEmbedderFactory`](crate::mock::MockEmbedderFactory)
/// in tests).
#[async_trait]
pub trait EmbedderFactory: Send + Sync {
    async fn create(&self, config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>>;
}

/// L2-normalize `vector` in place. Zero vectors are left untouched.
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 2);
        assert!(!result.is_empty());
        assert!(EmbeddingResult::new(vec![]).is_empty());
    }

    #[test]
    fn test_normalize_in_place() {
        let mut v = vec![3.0, 4.0];
        normalize_in_place(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize_in_place(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
