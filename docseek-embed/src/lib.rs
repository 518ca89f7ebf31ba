//! # docseek-embed
//!
//! Embedding providers for docseek: an async [`EmbeddingProvider`] trait, the
//! [`EmbedderFactory`] used to build providers from an [`EmbedConfig`], and a
//! deterministic [`MockEmbedder`] that needs no model files.
//!
//! ## Quick Start
//!
//! ```
//! use docseek_embed::{EmbedConfig, EmbeddingProvider, MockEmbedder};
//!
//! # async fn example() -> docseek_embed::Result<()> {
//! let embedder = MockEmbedder::new(EmbedConfig::default().with_dimensions(32));
//! let passages = vec!["Invoice from March".to_string()];
//! let result = embedder.embed_documents(&passages, None).await?;
//! assert_eq!(result.dimension, 32);
//!
//! let query = embedder.embed_query("march invoice").await?;
//! assert_eq!(query.len(), 32);
//! # Ok(())
//! # }
//! ```
//!
//! ## Text preparation
//!
//! Every passage and query goes through [`text::clean_text`] before it reaches
//! the model. E5 models additionally receive `passage: ` / `query: ` prefixes.
//!
//! ## Features
//!
//! - `fastembed`: [`FastEmbedProvider`] running multilingual E5 ONNX models
//!   locally.

pub mod config;
pub mod error;
#[cfg(feature = "fastembed")]
pub mod fastembed_provider;
pub mod mock;
pub mod provider;
pub mod text;

pub use config::{
    DEFAULT_MODEL_ID, Device, EmbedConfig, Quantization, known_model_dimensions,
};
pub use error::{EmbedError, Result};
#[cfg(feature = "fastembed")]
pub use fastembed_provider::{FastEmbedFactory, FastEmbedProvider};
pub use mock::{MockEmbedder, MockEmbedderFactory};
pub use provider::{EmbedderFactory, EmbeddingProvider, EmbeddingResult, ProgressCallback};

/// The factory used when the caller does not supply one: FastEmbed when the
/// `fastembed` feature is enabled, the mock embedder otherwise.
pub fn default_factory() -> std::sync::Arc<dyn EmbedderFactory> {
    #[cfg(feature = "fastembed")]
    {
        std::sync::Arc::new(FastEmbedFactory)
    }
    #[cfg(not(feature = "fastembed"))]
    {
        tracing::warn!("fastembed feature disabled; falling back to the mock embedder");
        std::sync::Arc::new(MockEmbedderFactory::new())
    }
}
