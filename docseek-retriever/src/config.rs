//! Configuration for a [`SearchSystem`](crate::search_system::SearchSystem).
//!
//! Every section has defaults, so a config file only needs to name what it
//! changes:
//!
//! ```toml
//! root_path = "/home/me/Documents"
//!
//! [storage]
//! backend = "columnar"
//!
//! [ocr]
//! enabled = true
//! languages = ["eng", "deu"]
//! ```

use anyhow::{Context, Result};
use docseek_embed::{DEFAULT_MODEL_ID, Device, EmbedConfig, Quantization};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::search::fusion::DEFAULT_RRF_K;
use crate::storage::{BackendKind, HybridWeights, StorageLocation};

/// Directory created under the indexed root when no storage path is set.
pub const DEFAULT_STORAGE_DIR: &str = ".docseek";

/// Per-directory ignore file honoured during discovery.
pub const DEFAULT_IGNORE_FILE: &str = ".docseekignore";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSystemConfig {
    /// Directory whose files are indexed
    pub root_path: PathBuf,
    pub storage: StorageConfig,
    pub indexing: IndexingConfig,
    pub embedder: EmbedderSettings,
    pub ocr: OcrConfig,
    pub search: SearchConfig,
}

impl Default for SearchSystemConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Database directory; `<root>/.docseek` when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Lower-case extensions to index. Empty means every extension a
    /// registered parser handles.
    pub allowed_extensions: Vec<String>,
    /// Files larger than this many bytes are skipped
    pub max_file_size: u64,
    /// Glob patterns; when non-empty only matching files are indexed
    pub include_patterns: Vec<String>,
    pub ignore_file_name: String,
    pub respect_gitignore: bool,
    /// Maximum chunk length in bytes
    pub chunk_size: usize,
    /// Chunks embedded per provider call
    pub embed_batch_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: Vec::new(),
            max_file_size: 100 * 1024 * 1024,
            include_patterns: Vec::new(),
            ignore_file_name: DEFAULT_IGNORE_FILE.to_string(),
            respect_gitignore: true,
            chunk_size: 1000,
            embed_batch_size: docseek_embed::config::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Requested embedding model. A database pins the settings it was created
/// with; see [`crate::embedder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    pub model_id: String,
    pub quantization: Quantization,
    pub device: Device,
    pub batch_size: usize,
    /// Model download directory
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            quantization: Quantization::default(),
            device: Device::default(),
            batch_size: docseek_embed::config::DEFAULT_BATCH_SIZE,
            cache_dir: None,
        }
    }
}

impl EmbedderSettings {
    pub fn to_embed_config(&self) -> EmbedConfig {
        let config = EmbedConfig::new(self.model_id.clone())
            .with_quantization(self.quantization)
            .with_device(self.device)
            .with_batch_size(self.batch_size);
        match &self.cache_dir {
            Some(dir) => config.with_cache_dir(dir.clone()),
            None => config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    /// Jobs processed at the same time
    pub max_concurrent: usize,
    /// Total attempts per job (at least one is always made)
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Background OCR waits until the main indexing queue is drained
    pub process_after_main_queue: bool,
    /// Tesseract language codes
    pub languages: Vec<String>,
    /// Start the background OCR loop when the system is built
    pub auto_start: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: 2,
            max_retries: 3,
            retry_delay_ms: 1000,
            process_after_main_queue: true,
            languages: vec!["eng".to_string()],
            auto_start: false,
        }
    }
}

impl OcrConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub rrf_k: f64,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let weights = HybridWeights::default();
        Self {
            rrf_k: DEFAULT_RRF_K,
            semantic_weight: weights.semantic,
            keyword_weight: weights.keyword,
            default_limit: 10,
        }
    }
}

impl SearchConfig {
    pub fn weights(&self) -> HybridWeights {
        HybridWeights {
            semantic: self.semantic_weight,
            keyword: self.keyword_weight,
        }
    }
}

impl SearchSystemConfig {
    /// Create a configuration for indexing `root_path`.
    ///
    /// # Arguments
    /// * `root_path` - Directory containing the documents to index
    ///
    /// # Returns
    /// A configuration with default settings:
    /// - SQLite storage under `<root_path>/.docseek`
    /// - the default multilingual E5 model, q8 quantization
    /// - OCR disabled
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            storage: StorageConfig::default(),
            indexing: IndexingConfig::default(),
            embedder: EmbedderSettings::default(),
            ocr: OcrConfig::default(),
            search: SearchConfig::default(),
        }
    }

    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid search system config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Select the storage backend.
    ///
    /// # Arguments
    /// * `backend` - [`BackendKind::Sqlite`] or [`BackendKind::Columnar`]
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.storage.backend = backend;
        self
    }

    /// Keep the database somewhere other than `<root>/.docseek`.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = Some(path.into());
        self
    }

    /// Request an embedding model.
    ///
    /// The request only takes effect for a new database. An existing
    /// database keeps the model and quantization it was created with.
    ///
    /// # Arguments
    /// * `model_id` - Model identifier such as `Xenova/multilingual-e5-small`
    /// * `quantization` - Weight precision of the model
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_embedder(mut self, model_id: impl Into<String>, quantization: Quantization) -> Self {
        self.embedder.model_id = model_id.into();
        self.embedder.quantization = quantization;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.embedder.device = device;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.indexing.chunk_size = chunk_size;
        self
    }

    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexing.allowed_extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.indexing.max_file_size = max_file_size;
        self
    }

    pub fn with_include_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexing.include_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable OCR of image regions.
    ///
    /// # Arguments
    /// * `enabled` - Whether parsed OCR regions are queued for recognition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_ocr(mut self, enabled: bool) -> Self {
        self.ocr.enabled = enabled;
        self
    }

    pub fn with_ocr_config(mut self, ocr: OcrConfig) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_search_config(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    /// Directory and backend of the database for this root.
    pub fn storage_location(&self) -> StorageLocation {
        StorageLocation {
            backend: self.storage.backend,
            directory: self
                .storage
                .path
                .clone()
                .unwrap_or_else(|| self.root_path.join(DEFAULT_STORAGE_DIR)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexing.chunk_size == 0 {
            anyhow::bail!("indexing.chunk_size must be at least 1");
        }
        if self.indexing.embed_batch_size == 0 {
            anyhow::bail!("indexing.embed_batch_size must be at least 1");
        }
        if self.embedder.batch_size == 0 {
            anyhow::bail!("embedder.batch_size must be at least 1");
        }
        if self.ocr.max_concurrent == 0 {
            anyhow::bail!("ocr.max_concurrent must be at least 1");
        }
        if self.search.rrf_k < 0.0 {
            anyhow::bail!("search.rrf_k must not be negative");
        }
        if self.search.semantic_weight < 0.0 || self.search.keyword_weight < 0.0 {
            anyhow::bail!("search weights must not be negative");
        }
        Ok(())
    }
}
