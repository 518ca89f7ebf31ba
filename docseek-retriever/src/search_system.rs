//! The [`SearchSystem`] orchestrator.
//!
//! Owns one storage adapter, the resolved embedders, the indexing pipeline
//! and the OCR queue manager for a single root, and exposes the operations
//! front-ends need: indexing, search, document and tag access, and
//! lifecycle control.
//!
//! ## Build sequence
//!
//! ```text
//! open adapter → initialize → recover stuck documents → resolve embedders
//!     → IndexingPipeline + OcrQueueManager → OcrNeeded forwarding → (OCR loop)
//! ```

use anyhow::{Context, Result};
use docseek_context::{Parser, ParserRegistry};
use docseek_embed::EmbedderFactory;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SearchSystemConfig;
use crate::embedder::{ResolvedEmbedders, StoredEmbedderConfig, resolve_embedders};
use crate::ocr::{OcrEvent, OcrProcessSummary, OcrProvider, OcrQueueManager, OcrQueueStatus};
use crate::pipeline::{
    FileProcessingResult, IndexingPipeline, PipelineEvent, PipelineState, SyncOptions, SyncResult,
};
use crate::storage::{
    self, Document, DocumentChunk, DocumentFilters, HybridWeights, QueuePriority, QueueStatus,
    SearchResult, StorageAdapter, StorageStats, TagCount,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

/// Per-query options. Unset values come from the `search` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: Option<usize>,
    pub filters: DocumentFilters,
    pub weights: Option<HybridWeights>,
    pub rrf_k: Option<f64>,
}

impl SearchOptions {
    pub fn keyword() -> Self {
        Self {
            mode: SearchMode::Keyword,
            ..Default::default()
        }
    }

    pub fn semantic() -> Self {
        Self {
            mode: SearchMode::Semantic,
            ..Default::default()
        }
    }

    pub fn hybrid() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filters(mut self, filters: DocumentFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_weights(mut self, weights: HybridWeights) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Result of [`SearchSystem::index_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSummary {
    pub indexed: usize,
    pub failed: usize,
    pub duration: Duration,
    pub sync: SyncResult,
}

/// Snapshot of every component's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub storage: StorageStats,
    pub queue: QueueStatus,
    pub ocr: OcrQueueStatus,
    pub pipeline: PipelineState,
    pub embedder: StoredEmbedderConfig,
}

/// Collects collaborators before [`build`](SearchSystemBuilder::build).
pub struct SearchSystemBuilder {
    config: SearchSystemConfig,
    parsers: ParserRegistry,
    ocr_provider: Option<Arc<dyn OcrProvider>>,
    embedder_factory: Option<Arc<dyn EmbedderFactory>>,
    storage: Option<Arc<dyn StorageAdapter>>,
}

impl SearchSystemBuilder {
    /// Register a parser for the extensions it declares, replacing the
    /// built-in parser for them.
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parsers.register(parser);
        self
    }

    pub fn with_ocr_provider(mut self, provider: Arc<dyn OcrProvider>) -> Self {
        self.ocr_provider = Some(provider);
        self
    }

    pub fn with_embedder_factory(mut self, factory: Arc<dyn EmbedderFactory>) -> Self {
        self.embedder_factory = Some(factory);
        self
    }

    /// Use an existing adapter instead of opening the configured backend.
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Open storage and wire every component together.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - The storage backend cannot be initialized
    /// - Embedder resolution fails
    pub async fn build(self) -> Result<SearchSystem> {
        let config = self.config;
        config.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => storage::open_adapter(&config.storage_location()),
        };
        if !storage.is_initialized() {
            storage
                .initialize()
                .await
                .context("Failed to initialize storage")?;
        }

        if storage.is_read_only() {
            debug!("Read-only storage; skipping stuck document recovery");
        } else {
            let recovered = storage
                .recover_stuck_documents()
                .await
                .context("Failed to recover stuck documents")?;
            if recovered > 0 {
                info!("Recovered {} documents left mid-pipeline", recovered);
            }
        }

        let factory = self
            .embedder_factory
            .unwrap_or_else(docseek_embed::default_factory);
        let embedders =
            resolve_embedders(storage.as_ref(), &config.embedder, factory.as_ref()).await?;

        let pipeline = IndexingPipeline::new(
            config.root_path.clone(),
            config.indexing.clone(),
            Arc::clone(&storage),
            Arc::new(self.parsers),
            Arc::clone(&embedders.indexing),
        );

        let ocr_provider = self.ocr_provider.or_else(|| default_ocr_provider(&config));
        let ocr = OcrQueueManager::new(
            config.root_path.clone(),
            config.ocr.clone(),
            config.indexing.chunk_size,
            Arc::clone(&storage),
            Arc::clone(&embedders.indexing),
            ocr_provider,
        );

        if config.ocr.enabled {
            let forward = ocr.clone();
            pipeline.add_listener(Arc::new(move |event: &PipelineEvent| {
                if let PipelineEvent::OcrNeeded {
                    document_id,
                    file_path,
                    regions,
                } = event
                {
                    forward.enqueue(document_id, file_path, regions.clone());
                }
            }));
            ocr.restore_pending().await?;
            if config.ocr.auto_start {
                ocr.start().await;
            }
        }

        info!(
            "Search system ready for {} ({} backend, {} {})",
            config.root_path.display(),
            storage.backend().as_str(),
            embedders.config.model_id,
            embedders.config.quantization
        );
        Ok(SearchSystem {
            config,
            storage,
            embedders,
            pipeline,
            ocr,
        })
    }
}

#[cfg(feature = "tesseract")]
fn default_ocr_provider(config: &SearchSystemConfig) -> Option<Arc<dyn OcrProvider>> {
    config.ocr.enabled.then(|| {
        Arc::new(crate::ocr::TesseractOcrProvider::new(&config.ocr.languages))
            as Arc<dyn OcrProvider>
    })
}

#[cfg(not(feature = "tesseract"))]
fn default_ocr_provider(config: &SearchSystemConfig) -> Option<Arc<dyn OcrProvider>> {
    if config.ocr.enabled {
        warn!("OCR enabled without a provider; OCR jobs will fail until one is supplied");
    }
    None
}

/// A searchable index over one root directory.
pub struct SearchSystem {
    config: SearchSystemConfig,
    storage: Arc<dyn StorageAdapter>,
    embedders: ResolvedEmbedders,
    pipeline: IndexingPipeline,
    ocr: OcrQueueManager,
}

impl std::fmt::Debug for SearchSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSystem")
            .field("root", &self.config.root_path)
            .field("backend", &self.storage.backend())
            .field("embedders", &self.embedders)
            .finish()
    }
}

impl SearchSystem {
    pub fn builder(config: SearchSystemConfig) -> SearchSystemBuilder {
        SearchSystemBuilder {
            config,
            parsers: ParserRegistry::with_defaults(),
            ocr_provider: None,
            embedder_factory: None,
            storage: None,
        }
    }

    pub fn config(&self) -> &SearchSystemConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn pipeline(&self) -> &IndexingPipeline {
        &self.pipeline
    }

    pub fn ocr(&self) -> &OcrQueueManager {
        &self.ocr
    }

    pub fn embedder_config(&self) -> &StoredEmbedderConfig {
        &self.embedders.config
    }

    // Indexing

    /// Sync the root with storage and index everything that changed, waiting
    /// until the queue is drained.
    ///
    /// # Arguments
    /// * `force` - Re-index every discovered file, changed or not
    pub async fn index_all(&self, force: bool) -> Result<IndexSummary> {
        let sync = self.sync(force).await?;
        self.pipeline.start().await?;
        self.pipeline.wait_for_idle().await;
        let run = self
            .pipeline
            .last_run_summary()
            .await
            .context("Indexing run finished without a summary")?;
        Ok(IndexSummary {
            indexed: run.indexed,
            failed: run.failed,
            duration: run.duration,
            sync,
        })
    }

    pub async fn sync(&self, force: bool) -> Result<SyncResult> {
        self.pipeline.sync_and_queue(SyncOptions { force }).await
    }

    pub async fn start_indexing(&self) -> Result<()> {
        self.pipeline.start().await
    }

    pub async fn stop_indexing(&self) {
        self.pipeline.stop().await
    }

    pub async fn wait_for_pipeline_idle(&self) {
        self.pipeline.wait_for_idle().await
    }

    pub async fn index_file(&self, path: impl Into<PathBuf>) -> Result<FileProcessingResult> {
        let path: PathBuf = path.into();
        self.pipeline.process_file(&path).await
    }

    pub async fn reindex_file(&self, path: impl Into<PathBuf>) -> Result<FileProcessingResult> {
        let path: PathBuf = path.into();
        self.pipeline.reindex_file(&path).await
    }

    pub async fn queue_files(&self, paths: &[PathBuf], priority: QueuePriority) -> Result<usize> {
        self.pipeline.queue_files(paths, priority).await
    }

    // Search

    /// Search indexed chunks.
    ///
    /// Semantic and hybrid queries are embedded with the search embedder.
    /// When that fails, a hybrid search degrades to keyword results.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = options.limit.unwrap_or(self.config.search.default_limit);
        let filters = &options.filters;

        let results = match options.mode {
            SearchMode::Keyword => self.storage.search_keyword(query, filters, limit).await?,
            SearchMode::Semantic => {
                let embedding = self.embed_query(query).await?;
                self.storage
                    .search_semantic(&embedding, filters, limit)
                    .await?
            }
            SearchMode::Hybrid => match self.embed_query(query).await {
                Ok(embedding) => {
                    let weights = options
                        .weights
                        .unwrap_or_else(|| self.config.search.weights());
                    let rrf_k = options.rrf_k.unwrap_or(self.config.search.rrf_k);
                    self.storage
                        .search_hybrid(query, &embedding, filters, limit, weights, rrf_k)
                        .await?
                }
                Err(e) => {
                    warn!("Query embedding failed, using keyword search: {:#}", e);
                    self.storage.search_keyword(query, filters, limit).await?
                }
            },
        };
        debug!(
            "{:?} search for '{}' returned {} results",
            options.mode,
            query,
            results.len()
        );
        Ok(results)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embedders
            .search
            .embed_query(query)
            .await
            .context("Failed to embed query")
    }

    // Documents and tags

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.storage.get_document(id).await?)
    }

    pub async fn get_document_by_path(&self, file_path: &str) -> Result<Option<Document>> {
        Ok(self.storage.get_document_by_path(file_path).await?)
    }

    pub async fn list_documents(
        &self,
        filters: &DocumentFilters,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Document>> {
        Ok(self.storage.list_documents(filters, limit, offset).await?)
    }

    pub async fn get_chunks(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        Ok(self.storage.get_chunks(document_id).await?)
    }

    pub async fn add_tags(&self, document_id: &str, tags: &[String]) -> Result<()> {
        Ok(self.storage.add_tags(document_id, tags).await?)
    }

    pub async fn remove_tags(&self, document_id: &str, tags: &[String]) -> Result<()> {
        Ok(self.storage.remove_tags(document_id, tags).await?)
    }

    pub async fn get_all_tags(&self) -> Result<Vec<TagCount>> {
        Ok(self.storage.get_all_tags().await?)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        Ok(self.storage.get_queue_status().await?)
    }

    // OCR

    pub async fn process_ocr_queue(&self) -> OcrProcessSummary {
        self.ocr.process_all().await
    }

    pub fn ocr_status(&self) -> OcrQueueStatus {
        self.ocr.status()
    }

    pub async fn start_ocr(&self) {
        self.ocr.start().await
    }

    pub async fn stop_ocr(&self) {
        self.ocr.stop().await
    }

    // Events and stats

    pub fn subscribe_pipeline(&self) -> broadcast::Receiver<PipelineEvent> {
        self.pipeline.subscribe()
    }

    pub fn subscribe_ocr(&self) -> broadcast::Receiver<OcrEvent> {
        self.ocr.subscribe()
    }

    pub async fn stats(&self) -> Result<SystemStats> {
        Ok(SystemStats {
            storage: self.storage.get_storage_stats().await?,
            queue: self.storage.get_queue_status().await?,
            ocr: self.ocr.status(),
            pipeline: self.pipeline.state(),
            embedder: self.embedders.config.clone(),
        })
    }

    // Lifecycle

    /// Release storage resources while idle. The next operation reopens them.
    pub async fn suspend(&self) -> Result<()> {
        Ok(self.storage.suspend().await?)
    }

    pub async fn resume(&self) -> Result<()> {
        Ok(self.storage.resume().await?)
    }

    pub async fn checkpoint(&self) -> Result<()> {
        Ok(self.storage.checkpoint().await?)
    }

    /// Stop background work and close storage.
    pub async fn close(&self) -> Result<()> {
        self.pipeline.stop().await;
        self.ocr.stop().await;
        self.storage.close().await?;
        info!("Search system closed for {}", self.config.root_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docseek_embed::MockEmbedderFactory;
    use tempfile::tempdir;

    async fn build(root: &std::path::Path) -> Result<SearchSystem> {
        SearchSystem::builder(SearchSystemConfig::new(root))
            .with_embedder_factory(Arc::new(MockEmbedderFactory::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn test_index_and_search_all_modes() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("rust.txt"), "Rust ownership and borrowing rules").await?;
        tokio::fs::write(dir.path().join("garden.md"), "# Garden\n\nTomatoes need sun and water").await?;

        let system = build(dir.path()).await?;
        let summary = system.index_all(false).await?;
        assert_eq!((summary.indexed, summary.failed), (2, 0));
        assert_eq!(summary.sync.added.len(), 2);

        let keyword = system.search("tomatoes", SearchOptions::keyword()).await?;
        assert_eq!(keyword[0].file_path, "garden.md");

        let semantic = system.search("ownership borrowing", SearchOptions::semantic()).await?;
        assert_eq!(semantic[0].file_path, "rust.txt");

        let hybrid = system.search("rust ownership", SearchOptions::hybrid().with_limit(1)).await?;
        assert_eq!(hybrid.len(), 1);
        assert_eq!(hybrid[0].file_path, "rust.txt");

        assert!(system.search("   ", SearchOptions::default()).await?.is_empty());

        let stats = system.stats().await?;
        assert_eq!(stats.storage.documents, 2);
        assert_eq!(stats.pipeline, PipelineState::Idle);
        system.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_lives_under_root() -> Result<()> {
        let dir = tempdir()?;
        let system = build(dir.path()).await?;
        assert!(dir.path().join(".docseek").join("docseek.db").exists());
        system.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_tags_through_system() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("invoice.txt"), "Invoice 42").await?;
        let system = build(dir.path()).await?;
        let result = system.index_file("invoice.txt").await?;

        system
            .add_tags(&result.document_id, &["finance".to_string(), "2024".to_string()])
            .await?;
        system.remove_tags(&result.document_id, &["2024".to_string()]).await?;

        let tags = system.get_all_tags().await?;
        assert_eq!(
            tags,
            vec![TagCount {
                tag: "finance".into(),
                count: 1
            }]
        );
        let doc = system.get_document(&result.document_id).await?.unwrap();
        assert_eq!(doc.tags, vec!["finance"]);
        Ok(())
    }
}
