//! In-memory OCR job queue with bounded concurrency.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docseek_context::OcrRegion;
use docseek_context::text::{PLAIN_DELIMITERS, TextChunker};
use docseek_embed::EmbeddingProvider;
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::provider::OcrProvider;
use super::{OCR_REGIONS_METADATA_KEY, OCR_SECTION};
use crate::config::OcrConfig;
use crate::pipeline::EventBus;
use crate::storage::{
    ChunkEmbeddingUpdate, DocumentFilters, DocumentUpdate, NewChunk, OcrStatus, StorageAdapter,
};

const EVENT_CAPACITY: usize = 256;

/// How often the background loop checks whether the main queue drained.
const MAIN_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// OCR work for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrJob {
    pub document_id: String,
    pub file_path: String,
    pub regions: Vec<OcrRegion>,
    pub status: OcrJobStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OcrQueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Whether the background loop is active
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OcrProcessSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OcrEvent {
    JobCompleted {
        document_id: String,
        file_path: String,
        chunks_added: usize,
    },
    JobFailed {
        document_id: String,
        file_path: String,
        error: String,
        attempts: u32,
    },
}

struct Inner {
    root: PathBuf,
    config: OcrConfig,
    chunk_size: usize,
    storage: Arc<dyn StorageAdapter>,
    embedder: Arc<dyn EmbeddingProvider>,
    provider: Option<Arc<dyn OcrProvider>>,
    /// Jobs by document id
    jobs: std::sync::Mutex<BTreeMap<String, OcrJob>>,
    events: EventBus<OcrEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    wake: Notify,
}

/// Queue of OCR jobs, drained on demand or by a background loop.
#[derive(Clone)]
pub struct OcrQueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OcrQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrQueueManager")
            .field("root", &self.inner.root)
            .field("provider", &self.inner.provider.as_ref().map(|p| p.name().to_string()))
            .field("status", &self.status())
            .finish()
    }
}

impl OcrQueueManager {
    /// Create a stopped manager.
    ///
    /// # Arguments
    /// * `root` - Indexed root that job paths are relative to
    /// * `config` - Concurrency, retry and scheduling settings
    /// * `chunk_size` - Maximum length of OCR chunks in bytes
    /// * `storage` - Adapter holding the documents
    /// * `embedder` - The indexing embedder
    /// * `provider` - Recognition backend; without one every job fails
    pub fn new(
        root: impl Into<PathBuf>,
        config: OcrConfig,
        chunk_size: usize,
        storage: Arc<dyn StorageAdapter>,
        embedder: Arc<dyn EmbeddingProvider>,
        provider: Option<Arc<dyn OcrProvider>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                config,
                chunk_size,
                storage,
                embedder,
                provider,
                jobs: std::sync::Mutex::new(BTreeMap::new()),
                events: EventBus::new(EVENT_CAPACITY),
                worker: Mutex::new(None),
                running: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OcrEvent> {
        self.inner.events.subscribe()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, OcrJob>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or refresh the job of a document.
    ///
    /// A pending or processing job keeps its state and takes the new
    /// regions; a finished job is reset to pending.
    pub fn enqueue(&self, document_id: &str, file_path: &str, regions: Vec<OcrRegion>) {
        let now = Utc::now();
        {
            let mut jobs = self.jobs();
            match jobs.get_mut(document_id) {
                Some(job) => {
                    job.regions = regions;
                    job.file_path = file_path.to_string();
                    job.updated_at = now;
                    if matches!(job.status, OcrJobStatus::Completed | OcrJobStatus::Failed) {
                        job.status = OcrJobStatus::Pending;
                        job.attempts = 0;
                        job.last_error = None;
                    }
                }
                None => {
                    jobs.insert(
                        document_id.to_string(),
                        OcrJob {
                            document_id: document_id.to_string(),
                            file_path: file_path.to_string(),
                            regions,
                            status: OcrJobStatus::Pending,
                            attempts: 0,
                            max_retries: self.inner.config.max_retries,
                            last_error: None,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        debug!("Queued OCR for {}", file_path);
        self.inner.wake.notify_one();
    }

    /// Re-create jobs for documents left with `ocr_status = pending`, using
    /// the regions recorded in their metadata. Returns how many were queued.
    pub async fn restore_pending(&self) -> Result<usize> {
        let documents = self
            .inner
            .storage
            .list_documents(&DocumentFilters::default(), None, 0)
            .await?;
        let mut restored = 0;
        for doc in documents {
            if doc.ocr_status != OcrStatus::Pending {
                continue;
            }
            let Some(value) = doc.metadata.get(OCR_REGIONS_METADATA_KEY) else {
                continue;
            };
            match serde_json::from_value::<Vec<OcrRegion>>(value.clone()) {
                Ok(regions) if !regions.is_empty() => {
                    self.enqueue(&doc.id, &doc.file_path, regions);
                    restored += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable OCR regions of {}: {}", doc.file_path, e),
            }
        }
        if restored > 0 {
            info!("Restored {} pending OCR jobs", restored);
        }
        Ok(restored)
    }

    pub fn job(&self, document_id: &str) -> Option<OcrJob> {
        self.jobs().get(document_id).cloned()
    }

    pub fn status(&self) -> OcrQueueStatus {
        let mut status = OcrQueueStatus {
            running: self.inner.running.load(Ordering::Acquire),
            ..Default::default()
        };
        for job in self.jobs().values() {
            match job.status {
                OcrJobStatus::Pending => status.pending += 1,
                OcrJobStatus::Processing => status.processing += 1,
                OcrJobStatus::Completed => status.completed += 1,
                OcrJobStatus::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Mark every pending job processing and return them.
    fn claim_pending(&self) -> Vec<OcrJob> {
        let now = Utc::now();
        self.jobs()
            .values_mut()
            .filter(|job| job.status == OcrJobStatus::Pending)
            .map(|job| {
                job.status = OcrJobStatus::Processing;
                job.updated_at = now;
                job.clone()
            })
            .collect()
    }

    /// Drain the queue now, `max_concurrent` jobs at a time.
    pub async fn process_all(&self) -> OcrProcessSummary {
        let mut summary = OcrProcessSummary::default();
        loop {
            let batch = self.claim_pending();
            if batch.is_empty() {
                break;
            }
            let outcomes: Vec<bool> = futures::stream::iter(batch)
                .map(|job| self.run_job(job))
                .buffer_unordered(self.inner.config.max_concurrent.max(1))
                .collect()
                .await;
            for succeeded in outcomes {
                summary.processed += 1;
                if succeeded {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
        if summary.processed > 0 {
            info!(
                "OCR processed {} jobs: {} succeeded, {} failed",
                summary.processed, summary.succeeded, summary.failed
            );
        }
        summary
    }

    /// Start the background loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.clone();
        *worker = Some(tokio::spawn(async move { manager.run_loop().await }));
        info!("OCR queue started");
    }

    /// Stop the background loop. Interrupted jobs go back to pending.
    pub async fn stop(&self) {
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("OCR queue stopped");
        }
        self.inner.running.store(false, Ordering::Release);
        for job in self.jobs().values_mut() {
            if job.status == OcrJobStatus::Processing {
                job.status = OcrJobStatus::Pending;
            }
        }
    }

    async fn run_loop(&self) {
        loop {
            if self.inner.config.process_after_main_queue {
                self.wait_for_main_queue().await;
            }
            let summary = self.process_all().await;
            if summary.processed == 0 {
                self.inner.wake.notified().await;
            }
        }
    }

    async fn wait_for_main_queue(&self) {
        loop {
            match self.inner.storage.get_queue_status().await {
                Ok(status) if status.pending + status.processing == 0 => return,
                Ok(_) => {}
                Err(e) => warn!("Failed to read main queue status: {}", e),
            }
            tokio::time::sleep(MAIN_QUEUE_POLL_INTERVAL).await;
        }
    }

    /// Run a claimed job to completion or exhaustion. Returns whether it
    /// succeeded.
    async fn run_job(&self, job: OcrJob) -> bool {
        let max_attempts = job.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.update_job(&job.document_id, |j| j.attempts = attempt);
            match self.recognize_and_store(&job).await {
                Ok(chunks_added) => {
                    self.update_job(&job.document_id, |j| {
                        j.status = OcrJobStatus::Completed;
                        j.last_error = None;
                    });
                    debug!(
                        "OCR of {} added {} chunks",
                        job.file_path, chunks_added
                    );
                    self.inner.events.emit(OcrEvent::JobCompleted {
                        document_id: job.document_id.clone(),
                        file_path: job.file_path.clone(),
                        chunks_added,
                    });
                    return true;
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(
                        "OCR attempt {}/{} for {} failed: {}",
                        attempt, max_attempts, job.file_path, last_error
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.inner.config.retry_delay()).await;
                    }
                }
            }
        }

        self.update_job(&job.document_id, |j| {
            j.status = OcrJobStatus::Failed;
            j.last_error = Some(last_error.clone());
        });
        if let Err(e) = self
            .inner
            .storage
            .update_document(&job.document_id, DocumentUpdate::ocr_status(OcrStatus::Failed))
            .await
        {
            warn!("Failed to record OCR failure of {}: {}", job.file_path, e);
        }
        self.inner.events.emit(OcrEvent::JobFailed {
            document_id: job.document_id.clone(),
            file_path: job.file_path.clone(),
            error: last_error,
            attempts: max_attempts,
        });
        false
    }

    fn update_job(&self, document_id: &str, f: impl FnOnce(&mut OcrJob)) {
        if let Some(job) = self.jobs().get_mut(document_id) {
            f(job);
            job.updated_at = Utc::now();
        }
    }

    /// Recognize every region and append the text as chunks. Nothing is
    /// written until recognition and embedding have succeeded. OCR chunks
    /// from an earlier run are replaced, and a failed write leaves none behind.
    async fn recognize_and_store(&self, job: &OcrJob) -> Result<usize> {
        let provider = self
            .inner
            .provider
            .as_ref()
            .context("No OCR provider configured")?;
        let storage = &self.inner.storage;
        if storage.get_document(&job.document_id).await?.is_none() {
            anyhow::bail!("Document {} no longer exists", job.file_path);
        }

        let absolute = self.inner.root.join(&job.file_path);
        let mut texts = Vec::with_capacity(job.regions.len());
        for region in &job.regions {
            let text = provider
                .recognize(&absolute, region)
                .await
                .with_context(|| format!("{} failed on {}", provider.name(), job.file_path))?;
            texts.push((region.page, text));
        }

        let existing: Vec<_> = storage
            .get_chunks(&job.document_id)
            .await?
            .into_iter()
            .filter(|c| c.section.as_deref() != Some(OCR_SECTION))
            .collect();
        let mut next_index = existing.last().map_or(0, |c| c.chunk_index + 1);
        let mut next_offset = existing.iter().map(|c| c.end_offset).max().unwrap_or(0);

        let chunker = TextChunker::new(PLAIN_DELIMITERS, self.inner.chunk_size)?;
        let mut new_chunks = Vec::new();
        for (page, text) in &texts {
            for chunk in chunker.chunk(text) {
                if chunk.is_blank() {
                    continue;
                }
                new_chunks.push(NewChunk {
                    chunk_index: next_index,
                    start_offset: next_offset + chunk.start as u64,
                    end_offset: next_offset + chunk.end as u64,
                    page: *page,
                    section: Some(OCR_SECTION.to_string()),
                    token_count: Some(chunk.token_estimate() as u32),
                    text: chunk.text,
                });
                next_index += 1;
            }
            next_offset += text.len() as u64;
        }

        let chunks_added = new_chunks.len();
        let embeddings = if chunks_added > 0 {
            let passages: Vec<String> = new_chunks.iter().map(|c| c.text.clone()).collect();
            let embedded = self.inner.embedder.embed_documents(&passages, None).await?;
            anyhow::ensure!(
                embedded.embeddings.len() == chunks_added,
                "Embedder returned {} vectors for {} OCR chunks",
                embedded.embeddings.len(),
                chunks_added
            );
            embedded.embeddings
        } else {
            Vec::new()
        };

        let stale = storage
            .delete_section_chunks(&job.document_id, OCR_SECTION)
            .await?;
        if stale > 0 {
            debug!("Replacing {} earlier OCR chunks of {}", stale, job.file_path);
        }
        if chunks_added > 0 {
            let created = storage.create_chunks(&job.document_id, new_chunks).await?;
            let updates = created
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| ChunkEmbeddingUpdate {
                    chunk_id: chunk.id.clone(),
                    embedding,
                })
                .collect();
            if let Err(e) = storage.update_chunk_embeddings(updates).await {
                if let Err(cleanup) = storage
                    .delete_section_chunks(&job.document_id, OCR_SECTION)
                    .await
                {
                    warn!("Failed to remove OCR chunks of {}: {}", job.file_path, cleanup);
                }
                return Err(e.into());
            }
        }

        storage
            .update_document(&job.document_id, DocumentUpdate::ocr_status(OcrStatus::Completed))
            .await?;
        Ok(chunks_added)
    }
}
