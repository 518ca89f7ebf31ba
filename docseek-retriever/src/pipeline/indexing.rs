use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docseek_context::{ParserRegistry, TextChunker};
use docseek_embed::EmbeddingProvider;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::discovery::{self, DiscoveredFile};
use super::events::{EventBus, EventListener, PipelineEvent};
use crate::config::IndexingConfig;
use crate::ocr::OCR_REGIONS_METADATA_KEY;
use crate::storage::{
    ChunkEmbeddingUpdate, Document, DocumentFilters, DocumentStatus, DocumentUpdate, NewChunk,
    NewDocument, NewQueueItem, OcrStatus, QueueItem, QueueItemUpdate, QueuePriority,
    StorageAdapter,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Queue every discovered file, changed or not
    pub force: bool,
}

/// What a sync found and queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    /// Documents deleted because their file is gone
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub queued: usize,
}

impl SyncResult {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.removed.is_empty()
    }
}

/// Result of indexing a single file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileProcessingResult {
    pub file_path: String,
    pub document_id: String,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    /// Regions handed to OCR
    pub ocr_regions: usize,
    pub processing_time: Duration,
}

/// Outcome of the last completed consumption run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub indexed: usize,
    pub failed: usize,
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

struct Inner {
    root: PathBuf,
    config: IndexingConfig,
    storage: Arc<dyn StorageAdapter>,
    parsers: Arc<ParserRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    events: EventBus<PipelineEvent>,
    state: watch::Sender<PipelineState>,
    /// Background loop; also serializes the loop's final empty-queue check
    /// against `start`
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Queue path of the item the loop is working on
    in_flight: std::sync::Mutex<Option<QueueItem>>,
    last_run: RwLock<Option<RunSummary>>,
}

/// Discovers, queues and indexes the files under one root.
///
/// Cloning is cheap; clones share the same queue consumer and event bus.
#[derive(Clone)]
pub struct IndexingPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("root", &self.inner.root)
            .field("state", &self.state())
            .finish()
    }
}

impl IndexingPipeline {
    /// Create an idle pipeline.
    ///
    /// # Arguments
    /// * `root` - Directory whose files are indexed
    /// * `config` - Discovery, chunking and batching settings
    /// * `storage` - Initialized storage adapter
    /// * `parsers` - Parser for each supported extension
    /// * `embedder` - Provider used for chunk embeddings
    pub fn new(
        root: impl Into<PathBuf>,
        config: IndexingConfig,
        storage: Arc<dyn StorageAdapter>,
        parsers: Arc<ParserRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                config,
                storage,
                parsers,
                embedder,
                events: EventBus::new(EVENT_CAPACITY),
                state,
                worker: Mutex::new(None),
                in_flight: std::sync::Mutex::new(None),
                last_run: RwLock::new(None),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Extensions eligible for indexing: the configured allow-list, or every
    /// extension a registered parser handles.
    pub fn extensions(&self) -> HashSet<String> {
        if self.inner.config.allowed_extensions.is_empty() {
            self.inner.parsers.extensions().into_iter().collect()
        } else {
            self.inner
                .config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        }
    }

    pub fn add_listener(&self, listener: EventListener<PipelineEvent>) {
        self.inner.events.add_listener(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.borrow()
    }

    /// Resolves once the pipeline is idle (immediately if it already is).
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|s| *s == PipelineState::Idle).await;
    }

    pub async fn last_run_summary(&self) -> Option<RunSummary> {
        self.inner.last_run.read().await.clone()
    }

    /// Walk the root and list indexable files, sorted by path.
    pub async fn discover_files(&self) -> Result<Vec<DiscoveredFile>> {
        let root = self.inner.root.clone();
        let config = self.inner.config.clone();
        let extensions = self.extensions();
        tokio::task::spawn_blocking(move || discovery::discover_files(&root, &config, &extensions))
            .await
            .context("Discovery task panicked")?
    }

    /// Compare the files on disk with stored documents and queue the
    /// differences.
    ///
    /// New and modified files (by blake3 hash) are queued with the tier of
    /// their extension; with `force` every discovered file is. Documents whose
    /// file no longer exists are deleted.
    ///
    /// # Returns
    /// The paths added, modified and removed, and how many were queued
    pub async fn sync_and_queue(&self, options: SyncOptions) -> Result<SyncResult> {
        let storage = &self.inner.storage;
        let files = self.discover_files().await?;
        let mut known: HashMap<String, Document> = storage
            .list_documents(&DocumentFilters::default(), None, 0)
            .await?
            .into_iter()
            .map(|doc| (doc.file_path.clone(), doc))
            .collect();

        let mut result = SyncResult::default();
        let mut to_queue = Vec::new();
        for file in &files {
            let stored = known.remove(&file.relative_path);
            let bytes = match tokio::fs::read(&file.absolute_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read {}: {}", file.absolute_path.display(), e);
                    continue;
                }
            };
            let hash = blake3::hash(&bytes).to_hex().to_string();

            let changed = match stored {
                None => {
                    result.added.push(file.relative_path.clone());
                    true
                }
                Some(doc) if doc.file_hash != hash => {
                    result.modified.push(file.relative_path.clone());
                    true
                }
                Some(_) => {
                    result.unchanged += 1;
                    false
                }
            };
            if changed || options.force {
                to_queue.push(NewQueueItem::new(
                    file.relative_path.clone(),
                    QueuePriority::for_extension(&file.extension),
                    file.size,
                ));
            }
        }

        // Whatever is left was not discovered this time
        for (path, doc) in known {
            if tokio::fs::try_exists(self.inner.root.join(&path))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            storage.delete_document(&doc.id).await?;
            debug!("Removed document for deleted file {}", path);
            result.removed.push(path);
        }
        result.removed.sort();

        if !to_queue.is_empty() {
            result.queued = storage.enqueue_items(to_queue).await?;
        }
        info!(
            "Sync: {} added, {} modified, {} removed, {} unchanged, {} queued",
            result.added.len(),
            result.modified.len(),
            result.removed.len(),
            result.unchanged,
            result.queued
        );
        Ok(result)
    }

    /// Queue files for indexing with an explicit priority.
    ///
    /// # Arguments
    /// * `paths` - Absolute paths under the root, or paths relative to it
    /// * `priority` - Tier the items are queued with
    ///
    /// # Returns
    /// How many items were queued
    pub async fn queue_files(&self, paths: &[PathBuf], priority: QueuePriority) -> Result<usize> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let relative = self.relative(path)?;
            let size = tokio::fs::metadata(self.inner.root.join(&relative))
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            items.push(NewQueueItem::new(relative, priority, size));
        }
        Ok(self.inner.storage.enqueue_items(items).await?)
    }

    /// Start consuming the queue in the background. Does nothing if the
    /// pipeline is already running.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        if self.state() == PipelineState::Running {
            debug!("Indexing pipeline already running");
            return Ok(());
        }
        if !self.inner.storage.is_initialized() {
            anyhow::bail!("Cannot start indexing: storage is not initialized");
        }

        self.inner.state.send_replace(PipelineState::Running);
        let pipeline = self.clone();
        *worker = Some(tokio::spawn(async move { pipeline.run().await }));
        info!("Indexing pipeline started for {}", self.inner.root.display());
        Ok(())
    }

    /// Abort the background loop. Safe in any state.
    ///
    /// A document being processed keeps its in-flight status and is picked
    /// up by `recover_stuck_documents` on the next startup; its queue item is
    /// reset to pending at its original priority.
    pub async fn stop(&self) {
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Indexing pipeline stopped");
        }

        let interrupted = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(item) = interrupted {
            let requeued = NewQueueItem::new(item.file_path.clone(), item.priority, item.file_size);
            if let Err(e) = self.inner.storage.enqueue_item(requeued).await {
                warn!("Failed to requeue interrupted item {}: {}", item.file_path, e);
            }
        }
        self.inner.state.send_replace(PipelineState::Idle);
    }

    async fn run(&self) {
        let started = Instant::now();
        let mut total = match self.inner.storage.get_queue_status().await {
            Ok(status) => status.pending,
            Err(e) => {
                warn!("Failed to read queue status: {}", e);
                0
            }
        };
        self.inner
            .events
            .emit(PipelineEvent::Started { file_count: total });

        let (mut current, mut indexed, mut failed) = (0, 0, 0);
        loop {
            let item = match self.dequeue().await {
                Some(item) => item,
                None => {
                    // Final check under the worker lock: a concurrent `start`
                    // either sees this loop running or finds it idle.
                    let _worker = self.inner.worker.lock().await;
                    match self.dequeue().await {
                        Some(item) => item,
                        None => {
                            let summary = RunSummary {
                                indexed,
                                failed,
                                duration: started.elapsed(),
                                finished_at: Utc::now(),
                            };
                            info!(
                                "Indexing run finished: {} indexed, {} failed in {:?}",
                                indexed, failed, summary.duration
                            );
                            *self.inner.last_run.write().await = Some(summary.clone());
                            self.inner.events.emit(PipelineEvent::Completed {
                                indexed,
                                failed,
                                duration: summary.duration,
                            });
                            self.inner.state.send_replace(PipelineState::Idle);
                            return;
                        }
                    }
                }
            };

            current += 1;
            total = total.max(current);
            self.set_in_flight(Some(item.clone()));
            self.inner.events.emit(PipelineEvent::Progress {
                current,
                total,
                file_path: item.file_path.clone(),
            });

            let update = match self.index_path(&item.file_path).await {
                Ok(_) => {
                    indexed += 1;
                    QueueItemUpdate::completed()
                }
                Err(e) => {
                    failed += 1;
                    QueueItemUpdate::failed(format!("{e:#}"))
                }
            };
            if let Err(e) = self.inner.storage.update_queue_item(item.id, update).await {
                warn!("Failed to update queue item {}: {}", item.file_path, e);
            }
            self.set_in_flight(None);
        }
    }

    async fn dequeue(&self) -> Option<QueueItem> {
        match self.inner.storage.dequeue_item().await {
            Ok(item) => item,
            Err(e) => {
                error!("Failed to dequeue: {}", e);
                None
            }
        }
    }

    fn set_in_flight(&self, item: Option<QueueItem>) {
        *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = item;
    }

    /// Index one file right away, outside the queue.
    ///
    /// # Arguments
    /// * `path` - Absolute path under the root, or a path relative to it
    pub async fn process_file(&self, path: &Path) -> Result<FileProcessingResult> {
        let relative = self.relative(path)?;
        self.index_path(&relative).await
    }

    /// Drop a file's chunks and index it again.
    pub async fn reindex_file(&self, path: &Path) -> Result<FileProcessingResult> {
        let relative = self.relative(path)?;
        if let Some(doc) = self.inner.storage.get_document_by_path(&relative).await? {
            let removed = self.inner.storage.delete_chunks(&doc.id).await?;
            self.inner
                .storage
                .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Pending))
                .await?;
            debug!("Cleared {} chunks of {} for reindex", removed, relative);
        }
        self.index_path(&relative).await
    }

    fn relative(&self, path: &Path) -> Result<String> {
        if path.is_absolute() {
            discovery::relative_path(&self.inner.root, path).with_context(|| {
                format!(
                    "{} is not under the index root {}",
                    path.display(),
                    self.inner.root.display()
                )
            })
        } else {
            Ok(path
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"))
        }
    }

    /// Run the per-file flow and record a failure on the document.
    async fn index_path(&self, relative: &str) -> Result<FileProcessingResult> {
        match self.index_document(relative).await {
            Ok(result) => {
                self.inner.events.emit(PipelineEvent::DocumentIndexed {
                    document_id: result.document_id.clone(),
                    file_path: result.file_path.clone(),
                    chunk_count: result.chunks_created,
                });
                Ok(result)
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!("Failed to index {}: {}", relative, message);
                match self.inner.storage.get_document_by_path(relative).await {
                    Ok(Some(doc)) => {
                        if let Err(update_err) = self
                            .inner
                            .storage
                            .update_document(&doc.id, DocumentUpdate::failed(message.clone()))
                            .await
                        {
                            warn!("Failed to mark {} as failed: {}", relative, update_err);
                        }
                    }
                    Ok(None) => {}
                    Err(lookup_err) => warn!("Failed to look up {}: {}", relative, lookup_err),
                }
                self.inner.events.emit(PipelineEvent::DocumentFailed {
                    file_path: relative.to_string(),
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn index_document(&self, relative: &str) -> Result<FileProcessingResult> {
        let start_time = Instant::now();
        let storage = &self.inner.storage;
        let absolute = self.inner.root.join(relative);
        debug!("Processing file: {}", relative);

        let metadata = tokio::fs::metadata(&absolute)
            .await
            .with_context(|| format!("Failed to stat {}", absolute.display()))?;
        let bytes = tokio::fs::read(&absolute)
            .await
            .with_context(|| format!("Failed to read {}", absolute.display()))?;
        let file_hash = blake3::hash(&bytes).to_hex().to_string();
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let doc = match storage.get_document_by_path(relative).await? {
            Some(existing) => {
                storage
                    .update_document(
                        &existing.id,
                        DocumentUpdate {
                            file_size: Some(metadata.len()),
                            file_hash: Some(file_hash),
                            file_modified_at: Some(modified_at),
                            status: Some(DocumentStatus::Parsing),
                            error_message: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            None => {
                let mut new_doc =
                    NewDocument::for_path(relative, metadata.len(), file_hash, modified_at);
                new_doc.status = DocumentStatus::Parsing;
                storage.create_document(new_doc).await?
            }
        };
        storage.delete_chunks(&doc.id).await?;

        let parsers = Arc::clone(&self.inner.parsers);
        let parse_path = absolute.clone();
        let parsed = tokio::task::spawn_blocking(move || parsers.parse(&parse_path, &bytes))
            .await
            .context("Parser task panicked")??;

        let ocr_regions = parsed.ocr_regions.clone();
        let mut metadata = parsed.metadata.clone();
        let ocr_status = if ocr_regions.is_empty() {
            OcrStatus::NotNeeded
        } else {
            metadata.insert(
                OCR_REGIONS_METADATA_KEY.to_string(),
                serde_json::to_value(&ocr_regions)?,
            );
            OcrStatus::Pending
        };
        storage
            .update_document(
                &doc.id,
                DocumentUpdate {
                    status: Some(DocumentStatus::Chunking),
                    title: Some(parsed.title.clone()),
                    author: Some(parsed.author.clone()),
                    language: Some(parsed.language.clone()),
                    page_count: Some(parsed.page_count),
                    ocr_status: Some(ocr_status),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        let chunker = TextChunker::for_path(&absolute, self.inner.config.chunk_size)?;
        let pages = parsed.page_map();
        let new_chunks: Vec<NewChunk> = chunker
            .chunk(&parsed.text)
            .into_iter()
            .filter(|chunk| !chunk.is_blank())
            .enumerate()
            .map(|(index, chunk)| NewChunk {
                chunk_index: index as u32,
                start_offset: chunk.start as u64,
                end_offset: chunk.end as u64,
                page: pages.as_ref().map(|pages| pages.page_of(chunk.start)),
                section: chunk.section.clone(),
                token_count: Some(chunk.token_estimate() as u32),
                text: chunk.text,
            })
            .collect();
        let chunks = storage.create_chunks(&doc.id, new_chunks).await?;

        storage
            .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Embedding))
            .await?;
        let mut embeddings_generated = 0;
        for batch in chunks.chunks(self.inner.config.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let result = self.inner.embedder.embed_documents(&texts, None).await?;
            anyhow::ensure!(
                result.embeddings.len() == batch.len(),
                "Embedder returned {} vectors for {} chunks",
                result.embeddings.len(),
                batch.len()
            );
            let updates: Vec<ChunkEmbeddingUpdate> = batch
                .iter()
                .zip(result.embeddings)
                .map(|(chunk, embedding)| ChunkEmbeddingUpdate {
                    chunk_id: chunk.id.clone(),
                    embedding,
                })
                .collect();
            embeddings_generated += storage.update_chunk_embeddings(updates).await?;
        }

        storage
            .update_document(
                &doc.id,
                DocumentUpdate {
                    status: Some(DocumentStatus::Indexed),
                    indexed_at: Some(Some(Utc::now())),
                    error_message: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        if !ocr_regions.is_empty() {
            self.inner.events.emit(PipelineEvent::OcrNeeded {
                document_id: doc.id.clone(),
                file_path: relative.to_string(),
                regions: ocr_regions.clone(),
            });
        }

        debug!(
            "Indexed {} ({} chunks, {} embeddings)",
            relative,
            chunks.len(),
            embeddings_generated
        );
        Ok(FileProcessingResult {
            file_path: relative.to_string(),
            document_id: doc.id,
            chunks_created: chunks.len(),
            embeddings_generated,
            ocr_regions: ocr_regions.len(),
            processing_time: start_time.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite_store::SqliteStore;
    use crate::storage::QueueItemStatus;
    use async_trait::async_trait;
    use docseek_context::{ParseError, ParsedDocument, Parser};
    use docseek_embed::{EmbedConfig, EmbeddingResult, MockEmbedder, ProgressCallback};
    use tempfile::{TempDir, tempdir};

    /// Splits a `.pdf` file into pages at form feeds.
    struct PagedParser;

    impl Parser for PagedParser {
        fn name(&self) -> &'static str {
            "paged"
        }

        fn extensions(&self) -> &[&'static str] {
            &["pdf"]
        }

        fn parse(&self, _path: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
            let mut parsed = ParsedDocument::from_text(String::from_utf8_lossy(bytes));
            parsed.page_count = Some(parsed.text.matches('\u{c}').count() as u32 + 1);
            Ok(parsed)
        }
    }

    /// Drops the last vector of every call.
    struct ShortEmbedder(MockEmbedder);

    #[async_trait]
    impl EmbeddingProvider for ShortEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> docseek_embed::Result<EmbeddingResult> {
            self.0.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.0.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "short"
        }

        fn config(&self) -> &EmbedConfig {
            self.0.config()
        }

        async fn embed_documents(
            &self,
            texts: &[String],
            _progress: Option<ProgressCallback>,
        ) -> docseek_embed::Result<EmbeddingResult> {
            let mut result = self.0.embed_texts(texts).await?;
            result.embeddings.pop();
            Ok(result)
        }
    }

    struct Fixture {
        root: TempDir,
        _db: TempDir,
        storage: Arc<dyn StorageAdapter>,
        pipeline: IndexingPipeline,
    }

    async fn fixture_with(embedder: MockEmbedder) -> Result<Fixture> {
        fixture_from(ParserRegistry::with_defaults(), Arc::new(embedder)).await
    }

    async fn fixture_from(
        parsers: ParserRegistry,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Fixture> {
        let root = tempdir()?;
        let db = tempdir()?;
        let store = SqliteStore::new(db.path());
        store.initialize().await?;
        let storage: Arc<dyn StorageAdapter> = Arc::new(store);
        let pipeline = IndexingPipeline::new(
            root.path(),
            IndexingConfig {
                chunk_size: 200,
                ..Default::default()
            },
            Arc::clone(&storage),
            Arc::new(parsers),
            embedder,
        );
        Ok(Fixture {
            root,
            _db: db,
            storage,
            pipeline,
        })
    }

    async fn fixture() -> Result<Fixture> {
        fixture_with(MockEmbedder::with_dimension(16)).await
    }

    #[tokio::test]
    async fn test_process_file_indexes_and_embeds() -> Result<()> {
        let f = fixture().await?;
        let text = "Quarterly revenue grew.\n\n".repeat(20);
        tokio::fs::write(f.root.path().join("report.txt"), &text).await?;

        let result = f.pipeline.process_file(Path::new("report.txt")).await?;
        assert!(result.chunks_created > 1);
        assert_eq!(result.embeddings_generated, result.chunks_created);
        assert_eq!(result.ocr_regions, 0);

        let doc = f.storage.get_document_by_path("report.txt").await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert!(doc.indexed_at.is_some());
        assert_eq!(doc.title.as_deref(), Some("Quarterly revenue grew."));

        let chunks = f.storage.get_chunks(&doc.id).await?;
        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].chunk_index as usize, i);
            assert!(pair[0].end_offset <= pair[1].start_offset);
        }
        assert!(chunks.iter().all(|c| c.embedding.as_ref().is_some_and(|e| e.len() == 16)));
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_failure_marks_document_failed() -> Result<()> {
        let f = fixture_with(MockEmbedder::new(EmbedConfig::default().with_dimensions(8)).failing_on("poison"))
            .await?;
        tokio::fs::write(f.root.path().join("bad.txt"), "this chunk is poison").await?;
        let mut events = f.pipeline.subscribe();

        assert!(f.pipeline.process_file(Path::new("bad.txt")).await.is_err());

        let doc = f.storage.get_document_by_path("bad.txt").await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error_message.unwrap().contains("poison"));
        assert!(matches!(
            events.recv().await?,
            PipelineEvent::DocumentFailed { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_short_embedding_result_fails_document() -> Result<()> {
        let embedder = ShortEmbedder(MockEmbedder::with_dimension(8));
        let f = fixture_from(ParserRegistry::with_defaults(), Arc::new(embedder)).await?;
        tokio::fs::write(f.root.path().join("notes.txt"), "Quarterly revenue grew.\n\n".repeat(20))
            .await?;

        let err = f.pipeline.process_file(Path::new("notes.txt")).await.unwrap_err();
        assert!(format!("{err:#}").contains("vectors for"));

        let doc = f.storage.get_document_by_path("notes.txt").await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error_message.unwrap().contains("vectors for"));
        Ok(())
    }

    #[tokio::test]
    async fn test_chunks_carry_page_numbers() -> Result<()> {
        let mut parsers = ParserRegistry::with_defaults();
        parsers.register(Arc::new(PagedParser));
        let f = fixture_from(parsers, Arc::new(MockEmbedder::with_dimension(8))).await?;
        let page = "Invoice line item for consulting work.\n\n".repeat(8);
        let text = format!("{page}\u{c}{page}\u{c}{page}");
        tokio::fs::write(f.root.path().join("invoice.pdf"), &text).await?;
        tokio::fs::write(f.root.path().join("plain.txt"), "no pages here").await?;

        let result = f.pipeline.process_file(Path::new("invoice.pdf")).await?;
        let doc = f.storage.get_document(&result.document_id).await?.unwrap();
        assert_eq!(doc.page_count, Some(3));

        let chunks = f.storage.get_chunks(&result.document_id).await?;
        assert!(chunks.len() >= 3);
        let first_break = page.len() as u64;
        for chunk in &chunks {
            let page = chunk.page.unwrap();
            assert!((1..=3).contains(&page));
            if chunk.start_offset < first_break {
                assert_eq!(page, 1);
            }
        }
        assert_eq!(chunks.last().unwrap().page, Some(3));
        assert!(chunks.windows(2).all(|w| w[0].page <= w[1].page));

        let plain = f.pipeline.process_file(Path::new("plain.txt")).await?;
        let chunks = f.storage.get_chunks(&plain.document_id).await?;
        assert!(chunks.iter().all(|c| c.page.is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn test_image_is_flagged_for_ocr() -> Result<()> {
        let f = fixture().await?;
        tokio::fs::write(f.root.path().join("scan.png"), [0x89, b'P', b'N', b'G']).await?;
        let mut events = f.pipeline.subscribe();

        let result = f.pipeline.process_file(&f.root.path().join("scan.png")).await?;
        assert_eq!(result.chunks_created, 0);
        assert_eq!(result.ocr_regions, 1);

        let doc = f.storage.get_document_by_path("scan.png").await?.unwrap();
        assert_eq!(doc.ocr_status, OcrStatus::Pending);
        assert_eq!(doc.status, DocumentStatus::Indexed);
        match events.recv().await? {
            PipelineEvent::OcrNeeded { file_path, regions, .. } => {
                assert_eq!(file_path, "scan.png");
                assert_eq!(regions.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_detects_changes_and_is_idempotent() -> Result<()> {
        let f = fixture().await?;
        tokio::fs::write(f.root.path().join("a.txt"), "alpha").await?;
        tokio::fs::write(f.root.path().join("b.md"), "# Beta").await?;

        let first = f.pipeline.sync_and_queue(SyncOptions::default()).await?;
        assert_eq!(first.added, vec!["a.txt", "b.md"]);
        assert_eq!(first.queued, 2);

        f.pipeline.start().await?;
        f.pipeline.wait_for_idle().await;
        let summary = f.pipeline.last_run_summary().await.unwrap();
        assert_eq!((summary.indexed, summary.failed), (2, 0));

        let second = f.pipeline.sync_and_queue(SyncOptions::default()).await?;
        assert!(!second.has_changes());
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.queued, 0);

        tokio::fs::write(f.root.path().join("a.txt"), "alpha, revised").await?;
        tokio::fs::remove_file(f.root.path().join("b.md")).await?;
        let third = f.pipeline.sync_and_queue(SyncOptions::default()).await?;
        assert_eq!(third.modified, vec!["a.txt"]);
        assert_eq!(third.removed, vec!["b.md"]);
        assert!(f.storage.get_document_by_path("b.md").await?.is_none());

        let forced = f.pipeline.sync_and_queue(SyncOptions { force: true }).await?;
        assert_eq!(forced.queued, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_continues_after_failure() -> Result<()> {
        let f = fixture().await?;
        tokio::fs::write(f.root.path().join("good.txt"), "fine text").await?;
        tokio::fs::write(f.root.path().join("binary.txt"), [0u8, 159, 146, 150]).await?;
        let mut events = f.pipeline.subscribe();

        f.pipeline.sync_and_queue(SyncOptions::default()).await?;
        f.pipeline.start().await?;
        f.pipeline.wait_for_idle().await;

        let summary = f.pipeline.last_run_summary().await.unwrap();
        assert_eq!((summary.indexed, summary.failed), (1, 1));
        let status = f.storage.get_queue_status().await?;
        assert_eq!((status.completed, status.failed, status.pending), (1, 1, 0));
        let failed = f.storage.get_queue_item("binary.txt").await?.unwrap();
        assert_eq!(failed.status, QueueItemStatus::Failed);
        assert!(failed.last_error.is_some());

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::Started { file_count } => {
                    assert_eq!(file_count, 2);
                    saw_started = true;
                }
                PipelineEvent::Completed { indexed, failed, .. } => {
                    assert_eq!((indexed, failed), (1, 1));
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_stop_are_safe_in_any_state() -> Result<()> {
        let f = fixture().await?;
        f.pipeline.stop().await;
        assert_eq!(f.pipeline.state(), PipelineState::Idle);

        f.pipeline.start().await?;
        f.pipeline.start().await?;
        f.pipeline.wait_for_idle().await;
        f.pipeline.stop().await;
        assert_eq!(f.pipeline.state(), PipelineState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_requeues_interrupted_item_with_its_priority() -> Result<()> {
        let f = fixture().await?;
        tokio::fs::write(f.root.path().join("urgent.txt"), "now").await?;
        f.pipeline
            .queue_files(&[PathBuf::from("urgent.txt")], QueuePriority::High)
            .await?;
        let item = f.storage.dequeue_item().await?.unwrap();
        assert_eq!(item.status, QueueItemStatus::Processing);

        f.pipeline.set_in_flight(Some(item));
        f.pipeline.stop().await;

        let requeued = f.storage.get_queue_item("urgent.txt").await?.unwrap();
        assert_eq!(requeued.status, QueueItemStatus::Pending);
        assert_eq!(requeued.priority, QueuePriority::High);
        assert_eq!(requeued.file_size, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_reindex_replaces_chunks() -> Result<()> {
        let f = fixture().await?;
        let path = f.root.path().join("notes.txt");
        tokio::fs::write(&path, "first version").await?;
        let first = f.pipeline.process_file(&path).await?;

        tokio::fs::write(&path, "second version of the notes").await?;
        let second = f.pipeline.reindex_file(&path).await?;
        assert_eq!(first.document_id, second.document_id);

        let chunks = f.storage.get_chunks(&second.document_id).await?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "second version of the notes");
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_files_uses_priority() -> Result<()> {
        let f = fixture().await?;
        tokio::fs::write(f.root.path().join("urgent.txt"), "now").await?;
        let queued = f
            .pipeline
            .queue_files(&[PathBuf::from("urgent.txt")], QueuePriority::High)
            .await?;
        assert_eq!(queued, 1);
        let item = f.storage.get_queue_item("urgent.txt").await?.unwrap();
        assert_eq!(item.priority, QueuePriority::High);
        assert_eq!(item.file_size, 3);

        assert!(
            f.pipeline
                .queue_files(&[PathBuf::from("/elsewhere/x.txt")], QueuePriority::High)
                .await
                .is_err()
        );
        Ok(())
    }
}
