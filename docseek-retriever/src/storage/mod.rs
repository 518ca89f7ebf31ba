//! Storage abstraction for docseek.
//!
//! One [`StorageAdapter`] contract covers persistence and search primitives
//! over documents, chunks, tags, the indexing queue and a small config
//! key-value store. Two interchangeable backends implement it:
//!
//! - [`sqlite_store::SqliteStore`]: relational tables in an embedded SQLite
//!   database with an FTS5 index for keyword search.
//! - [`columnar_store::ColumnarStore`]: a struct-of-arrays chunk table with a
//!   flat vector column, persisted as snapshot files.
//!
//! The backend is picked once, at construction, through [`open_adapter`].
//!
//! ## Search degradation
//!
//! Keyword and semantic searches never surface backend failures. When the
//! native query path fails the backend falls back to a brute-force scan
//! (substring match for keyword, linear cosine scan for semantic), and when
//! that fails as well the result is empty. Only usage errors such as
//! [`StoreError::NotInitialized`] are returned.
//!
//! ## Architecture
//!
//! ```text
//! SearchSystem / IndexingPipeline / OcrQueueManager
//!                     │
//!              dyn StorageAdapter ── search::fusion (hybrid RRF)
//!               ┌─────┴──────┐
//!          SqliteStore   ColumnarStore
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod columnar_store;
pub mod queue;
pub mod reconnect;
pub mod sqlite_store;
pub mod vector;

pub use crate::error::{StoreError, StoreResult};
pub use queue::{
    NewQueueItem, QueueItem, QueueItemStatus, QueueItemUpdate, QueuePriority, QueueStatus,
};

/// Generated document identifier (UUID v4 string).
pub type DocumentId = String;

/// Generated chunk identifier (UUID v4 string).
pub type ChunkId = String;

/// Free-form document metadata.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle of a document through the indexing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Parsing,
    Chunking,
    Embedding,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 6] = [
        DocumentStatus::Pending,
        DocumentStatus::Parsing,
        DocumentStatus::Chunking,
        DocumentStatus::Embedding,
        DocumentStatus::Indexed,
        DocumentStatus::Failed,
    ];

    /// Statuses a document is only in while a worker is processing it.
    pub const IN_FLIGHT: [DocumentStatus; 3] = [
        DocumentStatus::Parsing,
        DocumentStatus::Chunking,
        DocumentStatus::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// `indexed` or `failed`: the pipeline is done with the document.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed | DocumentStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    #[default]
    NotNeeded,
    Pending,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::NotNeeded => "not_needed",
            OcrStatus::Pending => "pending",
            OcrStatus::Completed => "completed",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_needed" => Some(Self::NotNeeded),
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A file known to the index. Exactly one per `file_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    /// Path relative to the indexed root, `/`-separated
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size: u64,
    /// blake3 hex digest of the file bytes
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<u32>,
    pub status: DocumentStatus,
    pub ocr_status: OcrStatus,
    pub file_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub indexed_at: Option<DateTime<Utc>>,
    /// Reason of the last failure, cleared on success
    pub error_message: Option<String>,
    pub metadata: Metadata,
    pub tags: Vec<String>,
}

/// Fields supplied when a document is first created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size: u64,
    pub file_hash: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<u32>,
    pub status: DocumentStatus,
    pub ocr_status: OcrStatus,
    pub file_modified_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl NewDocument {
    /// A pending document for `file_path`, with name, extension and mime type
    /// derived from the path.
    pub fn for_path(
        file_path: impl Into<String>,
        file_size: u64,
        file_hash: impl Into<String>,
        file_modified_at: DateTime<Utc>,
    ) -> Self {
        let file_path = file_path.into();
        let path = Path::new(&file_path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());
        let file_extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string());

        Self {
            file_path,
            file_name,
            file_extension,
            file_size,
            file_hash: file_hash.into(),
            mime_type,
            title: None,
            author: None,
            language: None,
            page_count: None,
            status: DocumentStatus::Pending,
            ocr_status: OcrStatus::NotNeeded,
            file_modified_at,
            metadata: Metadata::new(),
        }
    }

    /// Materialize the record with a fresh id and timestamps.
    pub fn into_document(self, id: DocumentId, now: DateTime<Utc>) -> Document {
        Document {
            id,
            file_path: self.file_path,
            file_name: self.file_name,
            file_extension: self.file_extension,
            file_size: self.file_size,
            file_hash: self.file_hash,
            mime_type: self.mime_type,
            title: self.title,
            author: self.author,
            language: self.language,
            page_count: self.page_count,
            status: self.status,
            ocr_status: self.ocr_status,
            file_modified_at: self.file_modified_at,
            created_at: now,
            updated_at: now,
            indexed_at: None,
            error_message: None,
            metadata: self.metadata,
            tags: Vec::new(),
        }
    }
}

/// Partial document update. Double options (`Some(None)`) clear a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub file_size: Option<u64>,
    pub file_hash: Option<String>,
    pub mime_type: Option<Option<String>>,
    pub title: Option<Option<String>>,
    pub author: Option<Option<String>>,
    pub language: Option<Option<String>>,
    pub page_count: Option<Option<u32>>,
    pub status: Option<DocumentStatus>,
    pub ocr_status: Option<OcrStatus>,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    /// Replaces the whole metadata map
    pub metadata: Option<Metadata>,
}

impl DocumentUpdate {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(DocumentStatus::Failed),
            error_message: Some(Some(error.into())),
            ..Default::default()
        }
    }

    pub fn ocr_status(ocr_status: OcrStatus) -> Self {
        Self {
            ocr_status: Some(ocr_status),
            ..Default::default()
        }
    }

    /// Apply the update to an in-memory record.
    pub fn apply_to(self, doc: &mut Document, now: DateTime<Utc>) {
        if let Some(v) = self.file_size {
            doc.file_size = v;
        }
        if let Some(v) = self.file_hash {
            doc.file_hash = v;
        }
        if let Some(v) = self.mime_type {
            doc.mime_type = v;
        }
        if let Some(v) = self.title {
            doc.title = v;
        }
        if let Some(v) = self.author {
            doc.author = v;
        }
        if let Some(v) = self.language {
            doc.language = v;
        }
        if let Some(v) = self.page_count {
            doc.page_count = v;
        }
        if let Some(v) = self.status {
            doc.status = v;
        }
        if let Some(v) = self.ocr_status {
            doc.ocr_status = v;
        }
        if let Some(v) = self.file_modified_at {
            doc.file_modified_at = v;
        }
        if let Some(v) = self.indexed_at {
            doc.indexed_at = v;
        }
        if let Some(v) = self.error_message {
            doc.error_message = v;
        }
        if let Some(v) = self.metadata {
            doc.metadata = v;
        }
        doc.updated_at = now;
    }
}

/// Filters accepted by document listing and all search operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilters {
    /// Substring of the document path
    pub folder: Option<String>,
    /// File extension without the dot
    pub extension: Option<String>,
    pub status: Option<DocumentStatus>,
    /// Inclusive lower bound on the file modification time
    pub modified_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the file modification time
    pub modified_before: Option<DateTime<Utc>>,
    pub language: Option<String>,
}

impl DocumentFilters {
    pub fn with_status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(folder) = &self.folder {
            if !doc.file_path.contains(folder.as_str()) {
                return false;
            }
        }
        if let Some(extension) = &self.extension {
            let wanted = extension.trim_start_matches('.');
            if !doc.file_extension.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if doc.status != status {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if doc.file_modified_at < after {
                return false;
            }
        }
        if let Some(before) = self.modified_before {
            if doc.file_modified_at > before {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if doc.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Chunk contents supplied to [`StorageAdapter::create_chunks`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_index: u32,
    pub text: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub token_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: u32,
    pub text: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub token_count: Option<u32>,
    /// `None` until the embedding phase writes the vector
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEmbeddingUpdate {
    pub chunk_id: ChunkId,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Keyword,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub text: String,
    pub page: Option<u32>,
    pub section: Option<String>,
    /// Higher is better. Keyword and semantic scores are not comparable;
    /// hybrid scores are fused RRF values.
    pub score: f64,
    pub match_type: MatchType,
}

/// Weights of the two ranked lists fused by hybrid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub semantic: f64,
    pub keyword: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.5,
        }
    }
}

/// Row counts reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub documents: usize,
    pub staged_documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub queue_items: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Columnar,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Columnar => "columnar",
        }
    }
}

/// Persistence and search primitives shared by every backend.
///
/// All operations other than [`initialize`](StorageAdapter::initialize) fail
/// with [`StoreError::NotInitialized`] before initialization and after
/// [`close`](StorageAdapter::close). Mutations fail with
/// [`StoreError::ReadOnly`] while the adapter is read-only. A suspended
/// adapter resumes transparently on its next operation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Open the backend and create missing tables or files.
    async fn initialize(&self) -> StoreResult<()>;

    /// Flush and release everything. The adapter can be initialized again.
    async fn close(&self) -> StoreResult<()>;

    /// Make all committed writes durable.
    async fn checkpoint(&self) -> StoreResult<()>;

    /// Reclaim space left by deleted rows.
    async fn vacuum(&self) -> StoreResult<()>;

    /// Release native resources while keeping the logical session.
    async fn suspend(&self) -> StoreResult<()>;

    async fn resume(&self) -> StoreResult<()>;

    /// Close and reopen the backend. Concurrent callers share one reconnect.
    async fn reconnect(&self) -> StoreResult<()>;

    fn set_read_only(&self, read_only: bool);

    fn is_read_only(&self) -> bool;

    fn is_initialized(&self) -> bool;

    // Documents

    async fn create_document(&self, document: NewDocument) -> StoreResult<Document>;

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>>;

    async fn get_document_by_path(&self, file_path: &str) -> StoreResult<Option<Document>>;

    /// Fails with [`StoreError::NotFound`] when the document does not exist.
    async fn update_document(&self, id: &str, update: DocumentUpdate) -> StoreResult<Document>;

    /// Delete a document with its chunks, tags and queue entry. Returns
    /// whether it existed.
    async fn delete_document(&self, id: &str) -> StoreResult<bool>;

    /// Documents matching `filters`, ordered by path.
    async fn list_documents(
        &self,
        filters: &DocumentFilters,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Document>>;

    async fn count_documents(&self, filters: &DocumentFilters) -> StoreResult<usize>;

    // Chunks

    /// Append chunks to a document. Returned records have no embedding yet.
    async fn create_chunks(
        &self,
        document_id: &str,
        chunks: Vec<NewChunk>,
    ) -> StoreResult<Vec<DocumentChunk>>;

    /// Write vectors for existing chunks. Returns how many were updated.
    async fn update_chunk_embeddings(&self, updates: Vec<ChunkEmbeddingUpdate>)
    -> StoreResult<usize>;

    /// Chunks of a document ordered by `chunk_index`.
    async fn get_chunks(&self, document_id: &str) -> StoreResult<Vec<DocumentChunk>>;

    async fn delete_chunks(&self, document_id: &str) -> StoreResult<usize>;

    /// Delete only the chunks of a document tagged with `section`.
    async fn delete_section_chunks(&self, document_id: &str, section: &str)
    -> StoreResult<usize>;

    // Tags

    async fn add_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()>;

    async fn remove_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()>;

    async fn get_document_tags(&self, document_id: &str) -> StoreResult<Vec<String>>;

    /// Every tag with its document count, most used first.
    async fn get_all_tags(&self) -> StoreResult<Vec<TagCount>>;

    // Queue

    /// Insert or reset the entry for `item.file_path`.
    async fn enqueue_item(&self, item: NewQueueItem) -> StoreResult<QueueItem>;

    async fn enqueue_items(&self, items: Vec<NewQueueItem>) -> StoreResult<usize>;

    /// Atomically claim the next pending item: it becomes `processing` and its
    /// attempt count is incremented.
    async fn dequeue_item(&self) -> StoreResult<Option<QueueItem>>;

    async fn update_queue_item(&self, id: i64, update: QueueItemUpdate) -> StoreResult<QueueItem>;

    async fn get_queue_item(&self, file_path: &str) -> StoreResult<Option<QueueItem>>;

    async fn get_queue_status(&self) -> StoreResult<QueueStatus>;

    async fn clear_completed_queue_items(&self) -> StoreResult<usize>;

    // Search

    async fn search_keyword(
        &self,
        query: &str,
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>>;

    async fn search_semantic(
        &self,
        embedding: &[f32],
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>>;

    /// Fused keyword and semantic search. Backends without a native combined
    /// query use application-level Reciprocal Rank Fusion.
    async fn search_hybrid(
        &self,
        query: &str,
        embedding: &[f32],
        filters: &DocumentFilters,
        limit: usize,
        weights: HybridWeights,
        rrf_k: f64,
    ) -> StoreResult<Vec<SearchResult>> {
        crate::search::fusion::hybrid_search(self, query, embedding, filters, limit, weights, rrf_k)
            .await
    }

    // Config

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    async fn set_config_value(&self, key: &str, value: serde_json::Value) -> StoreResult<()>;

    // Recovery and stats

    /// Reset documents left mid-pipeline by an unclean shutdown: their
    /// chunks are deleted, their status becomes `pending` and their path is
    /// queued again. Returns how many documents were recovered.
    async fn recover_stuck_documents(&self) -> StoreResult<usize> {
        let mut recovered = 0;
        for status in DocumentStatus::IN_FLIGHT {
            let stuck = self
                .list_documents(&DocumentFilters::with_status(status), None, 0)
                .await?;
            for doc in stuck {
                let removed = self.delete_chunks(&doc.id).await?;
                self.update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Pending))
                    .await?;
                self.enqueue_item(NewQueueItem::for_path(doc.file_path.clone(), doc.file_size))
                    .await?;
                tracing::info!(
                    "Recovered stuck document {} (was {}, removed {} chunks)",
                    doc.file_path,
                    status.as_str(),
                    removed
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn get_storage_stats(&self) -> StoreResult<StorageStats>;
}

/// Read a typed value from the config store.
pub async fn get_config<T: DeserializeOwned>(
    store: &dyn StorageAdapter,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get_config_value(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Write a typed value to the config store.
pub async fn set_config<T: Serialize + Sync>(
    store: &dyn StorageAdapter,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    store
        .set_config_value(key, serde_json::to_value(value)?)
        .await
}

/// Where a backend keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub backend: BackendKind,
    /// Database directory, one per indexed root
    pub directory: PathBuf,
}

/// Build the adapter for `location`. The adapter still needs
/// [`StorageAdapter::initialize`].
pub fn open_adapter(location: &StorageLocation) -> Arc<dyn StorageAdapter> {
    match location.backend {
        BackendKind::Sqlite => Arc::new(sqlite_store::SqliteStore::new(&location.directory)),
        BackendKind::Columnar => Arc::new(columnar_store::ColumnarStore::new(&location.directory)),
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
