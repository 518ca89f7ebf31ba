//! Columnar backend.
//!
//! Chunks are held as a struct-of-arrays table: one `Vec` per column plus a
//! flat `f32` vector column of `rows * dimension` values. Columns needed for
//! filtering (path, name, extension, status, language, modification time)
//! are copied from the owning document onto every chunk row so searches never
//! join against the document records.
//!
//! A document created before its first chunk is kept in a staging map. The
//! first [`create_chunks`](StorageAdapter::create_chunks) batch promotes it,
//! as does reaching `indexed` or `failed` without chunks; every read merges
//! both maps. Staged documents are never written to disk.
//!
//! On disk the table is two files in the storage directory: `table.json`
//! (documents, chunk columns, queue, config) and `vectors.bin` (the vector
//! column as little-endian `f32`). They are rewritten after every write that
//! touches materialized documents, chunks, tags or config, and on
//! `checkpoint`, `suspend` and `close`. Queue changes are written with the
//! next snapshot.

use super::reconnect::{ReconnectGate, ReconnectOutcome};
use super::vector::{blob_to_vec, cosine_similarity, vec_to_blob};
use super::{
    BackendKind, ChunkEmbeddingUpdate, Document, DocumentChunk, DocumentFilters, DocumentStatus,
    DocumentUpdate, MatchType, NewChunk, NewDocument, NewQueueItem, QueueItem, QueueItemStatus,
    QueueItemUpdate, QueueStatus, SearchResult, StorageAdapter, StorageStats, StoreError,
    StoreResult, TagCount, new_id,
};
use crate::search;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

pub const TABLE_FILE: &str = "table.json";
pub const VECTORS_FILE: &str = "vectors.bin";

const SNAPSHOT_VERSION: u32 = 1;

/// Chunk rows, one `Vec` per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChunkColumns {
    id: Vec<String>,
    document_id: Vec<String>,
    chunk_index: Vec<u32>,
    text: Vec<String>,
    start_offset: Vec<u64>,
    end_offset: Vec<u64>,
    page: Vec<Option<u32>>,
    section: Vec<Option<String>>,
    token_count: Vec<Option<u32>>,
    has_embedding: Vec<bool>,
    created_at: Vec<DateTime<Utc>>,
    // Denormalized from the owning document
    file_path: Vec<String>,
    file_name: Vec<String>,
    file_extension: Vec<String>,
    status: Vec<DocumentStatus>,
    language: Vec<Option<String>>,
    file_modified_at: Vec<DateTime<Utc>>,
}

impl ChunkColumns {
    fn len(&self) -> usize {
        self.id.len()
    }

    fn push(&mut self, doc: &Document, chunk: &DocumentChunk) {
        self.id.push(chunk.id.clone());
        self.document_id.push(chunk.document_id.clone());
        self.chunk_index.push(chunk.chunk_index);
        self.text.push(chunk.text.clone());
        self.start_offset.push(chunk.start_offset);
        self.end_offset.push(chunk.end_offset);
        self.page.push(chunk.page);
        self.section.push(chunk.section.clone());
        self.token_count.push(chunk.token_count);
        self.has_embedding.push(false);
        self.created_at.push(chunk.created_at);
        self.file_path.push(doc.file_path.clone());
        self.file_name.push(doc.file_name.clone());
        self.file_extension.push(doc.file_extension.clone());
        self.status.push(doc.status);
        self.language.push(doc.language.clone());
        self.file_modified_at.push(doc.file_modified_at);
    }

    /// Keep only rows where `keep[row]` is true.
    fn retain_rows(&mut self, keep: &[bool]) {
        fn retain<T>(column: &mut Vec<T>, keep: &[bool]) {
            let mut row = 0;
            column.retain(|_| {
                let kept = keep[row];
                row += 1;
                kept
            });
        }
        retain(&mut self.id, keep);
        retain(&mut self.document_id, keep);
        retain(&mut self.chunk_index, keep);
        retain(&mut self.text, keep);
        retain(&mut self.start_offset, keep);
        retain(&mut self.end_offset, keep);
        retain(&mut self.page, keep);
        retain(&mut self.section, keep);
        retain(&mut self.token_count, keep);
        retain(&mut self.has_embedding, keep);
        retain(&mut self.created_at, keep);
        retain(&mut self.file_path, keep);
        retain(&mut self.file_name, keep);
        retain(&mut self.file_extension, keep);
        retain(&mut self.status, keep);
        retain(&mut self.language, keep);
        retain(&mut self.file_modified_at, keep);
    }

    fn is_consistent(&self) -> bool {
        let n = self.len();
        [
            self.document_id.len(),
            self.chunk_index.len(),
            self.text.len(),
            self.start_offset.len(),
            self.end_offset.len(),
            self.page.len(),
            self.section.len(),
            self.token_count.len(),
            self.has_embedding.len(),
            self.created_at.len(),
            self.file_path.len(),
            self.file_name.len(),
            self.file_extension.len(),
            self.status.len(),
            self.language.len(),
            self.file_modified_at.len(),
        ]
        .iter()
        .all(|&len| len == n)
    }

    fn matches(&self, row: usize, filters: &DocumentFilters) -> bool {
        if let Some(folder) = &filters.folder {
            if !self.file_path[row].contains(folder.as_str()) {
                return false;
            }
        }
        if let Some(extension) = &filters.extension {
            if !self.file_extension[row].eq_ignore_ascii_case(extension.trim_start_matches('.')) {
                return false;
            }
        }
        if let Some(status) = filters.status {
            if self.status[row] != status {
                return false;
            }
        }
        if let Some(after) = filters.modified_after {
            if self.file_modified_at[row] < after {
                return false;
            }
        }
        if let Some(before) = filters.modified_before {
            if self.file_modified_at[row] > before {
                return false;
            }
        }
        if let Some(language) = &filters.language {
            if self.language[row].as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Everything in `table.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: Option<usize>,
    documents: Vec<Document>,
    chunks: ChunkColumns,
    queue: Vec<QueueItem>,
    next_queue_id: i64,
    config: BTreeMap<String, serde_json::Value>,
}

/// In-memory state of an open store.
#[derive(Debug, Default)]
struct Table {
    dimension: Option<usize>,
    documents: BTreeMap<String, Document>,
    staged: BTreeMap<String, Document>,
    chunks: ChunkColumns,
    vectors: Vec<f32>,
    /// term -> chunk row -> term frequency
    keywords: HashMap<String, HashMap<usize, u32>>,
    queue: BTreeMap<i64, QueueItem>,
    next_queue_id: i64,
    config: BTreeMap<String, serde_json::Value>,
}

impl Table {
    async fn load(directory: &Path) -> StoreResult<Self> {
        let table_path = directory.join(TABLE_FILE);
        if !tokio::fs::try_exists(&table_path).await? {
            return Ok(Self {
                next_queue_id: 1,
                ..Default::default()
            });
        }

        let bytes = tokio::fs::read(&table_path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::initialization(table_path.display(), e))?;
        if snapshot.version != SNAPSHOT_VERSION || !snapshot.chunks.is_consistent() {
            return Err(StoreError::initialization(
                table_path.display(),
                "unsupported or damaged table snapshot",
            ));
        }

        let vectors_path = directory.join(VECTORS_FILE);
        let vectors = if tokio::fs::try_exists(&vectors_path).await? {
            blob_to_vec(&tokio::fs::read(&vectors_path).await?)
        } else {
            Vec::new()
        };
        let expected = snapshot.dimension.unwrap_or(0) * snapshot.chunks.len();
        if vectors.len() != expected {
            return Err(StoreError::initialization(
                vectors_path.display(),
                format!("expected {expected} vector values, found {}", vectors.len()),
            ));
        }

        let mut table = Self {
            dimension: snapshot.dimension,
            documents: snapshot
                .documents
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            staged: BTreeMap::new(),
            chunks: snapshot.chunks,
            vectors,
            keywords: HashMap::new(),
            queue: snapshot.queue.into_iter().map(|q| (q.id, q)).collect(),
            next_queue_id: snapshot.next_queue_id.max(1),
            config: snapshot.config,
        };
        table.rebuild_keywords();
        Ok(table)
    }

    async fn persist(&self, directory: &Path) -> StoreResult<()> {
        tokio::fs::create_dir_all(directory).await?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            dimension: self.dimension,
            documents: self.documents.values().cloned().collect(),
            chunks: self.chunks.clone(),
            queue: self.queue.values().cloned().collect(),
            next_queue_id: self.next_queue_id,
            config: self.config.clone(),
        };

        write_atomic(&directory.join(VECTORS_FILE), &vec_to_blob(&self.vectors)).await?;
        write_atomic(&directory.join(TABLE_FILE), &serde_json::to_vec(&snapshot)?).await?;
        Ok(())
    }

    fn document(&self, id: &str) -> Option<&Document> {
        self.documents.get(id).or_else(|| self.staged.get(id))
    }

    fn document_mut(&mut self, id: &str) -> Option<&mut Document> {
        match self.documents.get_mut(id) {
            Some(doc) => Some(doc),
            None => self.staged.get_mut(id),
        }
    }

    fn all_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().chain(self.staged.values())
    }

    fn rows_of(&self, document_id: &str) -> Vec<usize> {
        let mut rows: Vec<usize> = (0..self.chunks.len())
            .filter(|&row| self.chunks.document_id[row] == document_id)
            .collect();
        rows.sort_by_key(|&row| self.chunks.chunk_index[row]);
        rows
    }

    fn vector(&self, row: usize) -> Option<&[f32]> {
        let dim = self.dimension?;
        if !self.chunks.has_embedding[row] {
            return None;
        }
        self.vectors.get(row * dim..(row + 1) * dim)
    }

    fn chunk_at(&self, row: usize) -> DocumentChunk {
        DocumentChunk {
            id: self.chunks.id[row].clone(),
            document_id: self.chunks.document_id[row].clone(),
            chunk_index: self.chunks.chunk_index[row],
            text: self.chunks.text[row].clone(),
            start_offset: self.chunks.start_offset[row],
            end_offset: self.chunks.end_offset[row],
            page: self.chunks.page[row],
            section: self.chunks.section[row].clone(),
            token_count: self.chunks.token_count[row],
            embedding: self.vector(row).map(<[f32]>::to_vec),
            created_at: self.chunks.created_at[row],
        }
    }

    fn result_at(&self, row: usize, score: f64, match_type: MatchType) -> SearchResult {
        SearchResult {
            chunk_id: self.chunks.id[row].clone(),
            document_id: self.chunks.document_id[row].clone(),
            file_path: self.chunks.file_path[row].clone(),
            file_name: self.chunks.file_name[row].clone(),
            chunk_index: self.chunks.chunk_index[row],
            text: self.chunks.text[row].clone(),
            page: self.chunks.page[row],
            section: self.chunks.section[row].clone(),
            score,
            match_type,
        }
    }

    /// Remove rows selected by `remove` from every column. Returns how many.
    fn remove_rows(&mut self, remove: impl Fn(usize) -> bool) -> usize {
        let keep: Vec<bool> = (0..self.chunks.len()).map(|row| !remove(row)).collect();
        let removed = keep.iter().filter(|k| !**k).count();
        if removed == 0 {
            return 0;
        }
        if let Some(dim) = self.dimension {
            let mut vectors = Vec::with_capacity((keep.len() - removed) * dim);
            for (row, kept) in keep.iter().enumerate() {
                if *kept {
                    vectors.extend_from_slice(&self.vectors[row * dim..(row + 1) * dim]);
                }
            }
            self.vectors = vectors;
        }
        self.chunks.retain_rows(&keep);
        self.rebuild_keywords();
        removed
    }

    fn index_row(&mut self, row: usize) {
        let lowered = self.chunks.text[row].to_lowercase();
        for term in search::keyword_terms(&lowered) {
            let count = lowered.matches(term.as_str()).count();
            self.keywords
                .entry(term)
                .or_default()
                .insert(row, count.max(1) as u32);
        }
    }

    fn rebuild_keywords(&mut self) {
        self.keywords.clear();
        for row in 0..self.chunks.len() {
            self.index_row(row);
        }
    }

    /// Copy the filterable document fields onto the document's chunk rows.
    fn refresh_denormalized(&mut self, doc: &Document) {
        for row in 0..self.chunks.len() {
            if self.chunks.document_id[row] == doc.id {
                self.chunks.file_path[row] = doc.file_path.clone();
                self.chunks.file_name[row] = doc.file_name.clone();
                self.chunks.file_extension[row] = doc.file_extension.clone();
                self.chunks.status[row] = doc.status;
                self.chunks.language[row] = doc.language.clone();
                self.chunks.file_modified_at[row] = doc.file_modified_at;
            }
        }
    }

    fn keyword_rows(
        &self,
        terms: &[String],
        filters: &DocumentFilters,
        limit: usize,
    ) -> Vec<SearchResult> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        for term in terms {
            if let Some(postings) = self.keywords.get(term) {
                for (&row, &tf) in postings {
                    *scores.entry(row).or_default() += f64::from(tf);
                }
            }
        }
        let results = scores
            .into_iter()
            .filter(|(row, _)| self.chunks.matches(*row, filters))
            .map(|(row, score)| self.result_at(row, score, MatchType::Keyword))
            .collect();
        search::rank_top(results, limit)
    }

    fn vector_rows(
        &self,
        embedding: &[f32],
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let Some(dim) = self.dimension else {
            return Ok(Vec::new());
        };
        if dim != embedding.len() {
            return Err(StoreError::DimensionMismatch {
                expected: dim,
                actual: embedding.len(),
            });
        }
        let results = (0..self.chunks.len())
            .filter(|&row| self.chunks.has_embedding[row] && self.chunks.matches(row, filters))
            .filter_map(|row| {
                self.vector(row).map(|v| {
                    let score = cosine_similarity(embedding, v) as f64;
                    self.result_at(row, score, MatchType::Semantic)
                })
            })
            .collect();
        Ok(search::rank_top(results, limit))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Columnar [`StorageAdapter`] persisted as snapshot files.
pub struct ColumnarStore {
    directory: PathBuf,
    state: RwLock<Option<Table>>,
    /// Staged documents held while the table is unloaded
    parked: Mutex<BTreeMap<String, Document>>,
    initialized: AtomicBool,
    suspended: AtomicBool,
    read_only: AtomicBool,
    reconnect_gate: ReconnectGate,
}

impl ColumnarStore {
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            state: RwLock::new(None),
            parked: Mutex::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            reconnect_gate: ReconnectGate::new(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Number of documents waiting for their first chunk.
    pub async fn staged_count(&self) -> StoreResult<usize> {
        self.with_table(|t| Ok(t.staged.len())).await
    }

    async fn loaded<'a>(&self, state: &'a mut Option<Table>) -> StoreResult<&'a mut Table> {
        if state.is_none() {
            if !self.is_initialized() {
                return Err(StoreError::NotInitialized);
            }
            let mut table = Table::load(&self.directory).await?;
            table.staged = std::mem::take(&mut *self.parked.lock().await);
            *state = Some(table);
            self.suspended.store(false, Ordering::Release);
            tracing::debug!("Reloaded columnar table from {}", self.directory.display());
        }
        state.as_mut().ok_or(StoreError::NotInitialized)
    }

    async fn with_table<R>(&self, f: impl FnOnce(&Table) -> StoreResult<R>) -> StoreResult<R> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        {
            let state = self.state.read().await;
            if let Some(table) = state.as_ref() {
                return f(table);
            }
        }
        let mut state = self.state.write().await;
        let table = self.loaded(&mut state).await?;
        f(table)
    }

    async fn with_table_mut<R>(
        &self,
        f: impl FnOnce(&mut Table) -> StoreResult<R>,
    ) -> StoreResult<R> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.write().await;
        let table = self.loaded(&mut state).await?;
        f(table)
    }

    /// [`with_table_mut`](Self::with_table_mut) that writes the snapshot
    /// before returning when `f` reports durable changes.
    async fn with_table_durable<R>(
        &self,
        f: impl FnOnce(&mut Table) -> StoreResult<(R, bool)>,
    ) -> StoreResult<R> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.write().await;
        let table = self.loaded(&mut state).await?;
        let (result, durable) = f(table)?;
        if durable {
            table.persist(&self.directory).await?;
        }
        Ok(result)
    }

    async fn flush(&self) -> StoreResult<()> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let state = self.state.read().await;
        if let Some(table) = state.as_ref() {
            table.persist(&self.directory).await?;
            if !table.staged.is_empty() {
                tracing::debug!(
                    "{} staged documents not written (no chunks yet)",
                    table.staged.len()
                );
            }
        }
        Ok(())
    }
}

fn enqueue_in(table: &mut Table, item: NewQueueItem, now: DateTime<Utc>) -> QueueItem {
    if let Some(existing) = table
        .queue
        .values_mut()
        .find(|q| q.file_path == item.file_path)
    {
        existing.priority = item.priority;
        existing.file_size = item.file_size;
        existing.status = QueueItemStatus::Pending;
        existing.attempts = 0;
        existing.last_error = None;
        existing.updated_at = now;
        return existing.clone();
    }

    let id = table.next_queue_id;
    table.next_queue_id += 1;
    let queued = QueueItem {
        id,
        file_path: item.file_path,
        priority: item.priority,
        file_size: item.file_size,
        status: QueueItemStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    table.queue.insert(id, queued.clone());
    queued
}

#[async_trait]
impl StorageAdapter for ColumnarStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Columnar
    }

    async fn initialize(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if self.is_initialized() && state.is_some() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StoreError::initialization(self.directory.display(), e))?;
        *state = Some(Table::load(&self.directory).await?);
        self.suspended.store(false, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::info!("Opened columnar store at {}", self.directory.display());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(table) = state.as_ref() {
            table.persist(&self.directory).await?;
        }
        if let Some(table) = state.take() {
            if !table.staged.is_empty() {
                tracing::debug!(
                    "Dropping {} staged documents without chunks",
                    table.staged.len()
                );
            }
            tracing::info!("Closed columnar store at {}", self.directory.display());
        }
        self.parked.lock().await.clear();
        self.initialized.store(false, Ordering::Release);
        self.suspended.store(false, Ordering::Release);
        Ok(())
    }

    async fn checkpoint(&self) -> StoreResult<()> {
        self.flush().await
    }

    async fn vacuum(&self) -> StoreResult<()> {
        self.with_table_mut(|table| {
            table.vectors.shrink_to_fit();
            table.keywords.shrink_to_fit();
            Ok(())
        })
        .await?;
        self.flush().await
    }

    async fn suspend(&self) -> StoreResult<()> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let mut state = self.state.write().await;
        if let Some(table) = state.as_ref() {
            table.persist(&self.directory).await?;
        }
        if let Some(table) = state.take() {
            *self.parked.lock().await = table.staged;
            self.suspended.store(true, Ordering::Release);
            tracing::info!("Suspended columnar store");
        }
        Ok(())
    }

    async fn resume(&self) -> StoreResult<()> {
        self.with_table(|_| Ok(())).await
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let outcome = self
            .reconnect_gate
            .run(|| async {
                let mut state = self.state.write().await;
                if !self.is_initialized() {
                    return Err(StoreError::NotInitialized);
                }
                if let Some(table) = state.as_ref() {
                    table.persist(&self.directory).await?;
                }
                if let Some(table) = state.take() {
                    *self.parked.lock().await = table.staged;
                }
                self.loaded(&mut state).await?;
                self.suspended.store(false, Ordering::Release);
                Ok(())
            })
            .await?;
        if outcome == ReconnectOutcome::Performed {
            tracing::info!("Reloaded columnar store");
        }
        Ok(())
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn create_document(&self, document: NewDocument) -> StoreResult<Document> {
        self.with_table_mut(|table| {
            if table
                .all_documents()
                .any(|d| d.file_path == document.file_path)
            {
                return Err(StoreError::AlreadyExists {
                    entity: "document",
                    id: document.file_path,
                });
            }
            let doc = document.into_document(new_id(), Utc::now());
            table.staged.insert(doc.id.clone(), doc.clone());
            tracing::debug!("Staged document {} ({})", doc.file_path, doc.id);
            Ok(doc)
        })
        .await
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        self.with_table(|table| Ok(table.document(id).cloned()))
            .await
    }

    async fn get_document_by_path(&self, file_path: &str) -> StoreResult<Option<Document>> {
        self.with_table(|table| {
            Ok(table
                .all_documents()
                .find(|d| d.file_path == file_path)
                .cloned())
        })
        .await
    }

    async fn update_document(&self, id: &str, update: DocumentUpdate) -> StoreResult<Document> {
        self.with_table_durable(|table| {
            let doc = table
                .document_mut(id)
                .ok_or_else(|| StoreError::not_found("document", id))?;
            update.apply_to(doc, Utc::now());
            let doc = doc.clone();
            if doc.status.is_terminal() {
                if let Some(staged) = table.staged.remove(id) {
                    tracing::debug!(
                        "Materialized {} document {} without chunks",
                        doc.status.as_str(),
                        doc.file_path
                    );
                    table.documents.insert(staged.id.clone(), staged);
                }
            }
            let materialized = table.documents.contains_key(id);
            if materialized {
                table.refresh_denormalized(&doc);
            }
            Ok((doc, materialized))
        })
        .await
    }

    async fn delete_document(&self, id: &str) -> StoreResult<bool> {
        self.with_table_durable(|table| {
            let materialized = table.documents.contains_key(id);
            let removed = table
                .documents
                .remove(id)
                .or_else(|| table.staged.remove(id));
            let Some(doc) = removed else {
                return Ok((false, false));
            };
            let doc_id = doc.id.clone();
            let ids = table.chunks.document_id.clone();
            table.remove_rows(|row| ids[row] == doc_id);
            table.queue.retain(|_, q| q.file_path != doc.file_path);
            tracing::debug!("Deleted document {} ({})", doc.file_path, doc.id);
            Ok((true, materialized))
        })
        .await
    }

    async fn list_documents(
        &self,
        filters: &DocumentFilters,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Document>> {
        self.with_table(|table| {
            let mut docs: Vec<&Document> =
                table.all_documents().filter(|d| filters.matches(d)).collect();
            docs.sort_by(|a, b| a.file_path.cmp(&b.file_path));
            Ok(docs
                .into_iter()
                .skip(offset)
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        })
        .await
    }

    async fn count_documents(&self, filters: &DocumentFilters) -> StoreResult<usize> {
        self.with_table(|table| Ok(table.all_documents().filter(|d| filters.matches(d)).count()))
            .await
    }

    async fn create_chunks(
        &self,
        document_id: &str,
        chunks: Vec<NewChunk>,
    ) -> StoreResult<Vec<DocumentChunk>> {
        self.with_table_durable(|table| {
            if chunks.is_empty() {
                return if table.document(document_id).is_some() {
                    Ok((Vec::new(), false))
                } else {
                    Err(StoreError::not_found("document", document_id))
                };
            }
            if let Some(doc) = table.staged.remove(document_id) {
                tracing::debug!("Materialized staged document {}", doc.file_path);
                table.documents.insert(doc.id.clone(), doc);
            }
            let doc = table
                .documents
                .get(document_id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("document", document_id))?;

            let now = Utc::now();
            let mut created = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let record = DocumentChunk {
                    id: new_id(),
                    document_id: doc.id.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    page: chunk.page,
                    section: chunk.section,
                    token_count: chunk.token_count,
                    embedding: None,
                    created_at: now,
                };
                table.chunks.push(&doc, &record);
                if let Some(dim) = table.dimension {
                    table.vectors.extend(std::iter::repeat_n(0.0, dim));
                }
                let row = table.chunks.len() - 1;
                table.index_row(row);
                created.push(record);
            }
            Ok((created, true))
        })
        .await
    }

    async fn update_chunk_embeddings(
        &self,
        updates: Vec<ChunkEmbeddingUpdate>,
    ) -> StoreResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.with_table_durable(|table| {
            let dim = table.dimension.unwrap_or(updates[0].embedding.len());
            if let Some(bad) = updates.iter().find(|u| u.embedding.len() != dim) {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    actual: bad.embedding.len(),
                });
            }
            if table.dimension.is_none() {
                table.dimension = Some(dim);
                table.vectors = vec![0.0; table.chunks.len() * dim];
            }

            let rows: HashMap<&str, usize> = table
                .chunks
                .id
                .iter()
                .enumerate()
                .map(|(row, id)| (id.as_str(), row))
                .collect();
            let targets: Vec<(usize, &ChunkEmbeddingUpdate)> = updates
                .iter()
                .filter_map(|u| rows.get(u.chunk_id.as_str()).map(|&row| (row, u)))
                .collect();
            for (row, update) in &targets {
                table.vectors[row * dim..(row + 1) * dim].copy_from_slice(&update.embedding);
                table.chunks.has_embedding[*row] = true;
            }
            Ok((targets.len(), !targets.is_empty()))
        })
        .await
    }

    async fn get_chunks(&self, document_id: &str) -> StoreResult<Vec<DocumentChunk>> {
        self.with_table(|table| {
            Ok(table
                .rows_of(document_id)
                .into_iter()
                .map(|row| table.chunk_at(row))
                .collect())
        })
        .await
    }

    async fn delete_chunks(&self, document_id: &str) -> StoreResult<usize> {
        self.with_table_durable(|table| {
            let ids = table.chunks.document_id.clone();
            let removed = table.remove_rows(|row| ids[row] == document_id);
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn delete_section_chunks(
        &self,
        document_id: &str,
        section: &str,
    ) -> StoreResult<usize> {
        self.with_table_durable(|table| {
            let ids = table.chunks.document_id.clone();
            let sections = table.chunks.section.clone();
            let removed = table.remove_rows(|row| {
                ids[row] == document_id && sections[row].as_deref() == Some(section)
            });
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn add_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()> {
        self.with_table_durable(|table| {
            let doc = table
                .document_mut(document_id)
                .ok_or_else(|| StoreError::not_found("document", document_id))?;
            for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
                if !doc.tags.iter().any(|t| t == tag) {
                    doc.tags.push(tag.to_string());
                }
            }
            doc.tags.sort();
            Ok(((), table.documents.contains_key(document_id)))
        })
        .await
    }

    async fn remove_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()> {
        self.with_table_durable(|table| {
            if let Some(doc) = table.document_mut(document_id) {
                doc.tags.retain(|t| !tags.iter().any(|r| r.trim() == t));
            }
            Ok(((), table.documents.contains_key(document_id)))
        })
        .await
    }

    async fn get_document_tags(&self, document_id: &str) -> StoreResult<Vec<String>> {
        self.with_table(|table| {
            Ok(table
                .document(document_id)
                .map(|d| d.tags.clone())
                .unwrap_or_default())
        })
        .await
    }

    async fn get_all_tags(&self) -> StoreResult<Vec<TagCount>> {
        self.with_table(|table| {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for doc in table.all_documents() {
                for tag in &doc.tags {
                    *counts.entry(tag.as_str()).or_default() += 1;
                }
            }
            let mut tags: Vec<TagCount> = counts
                .into_iter()
                .map(|(tag, count)| TagCount {
                    tag: tag.to_string(),
                    count,
                })
                .collect();
            tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
            Ok(tags)
        })
        .await
    }

    async fn enqueue_item(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        self.with_table_mut(|table| Ok(enqueue_in(table, item, Utc::now())))
            .await
    }

    async fn enqueue_items(&self, items: Vec<NewQueueItem>) -> StoreResult<usize> {
        self.with_table_mut(|table| {
            let now = Utc::now();
            let count = items.len();
            for item in items {
                enqueue_in(table, item, now);
            }
            Ok(count)
        })
        .await
    }

    async fn dequeue_item(&self) -> StoreResult<Option<QueueItem>> {
        self.with_table_mut(|table| {
            let next = table
                .queue
                .values()
                .filter(|q| q.status == QueueItemStatus::Pending)
                .min_by_key(|q| q.rank())
                .map(|q| q.id);
            Ok(next.and_then(|id| table.queue.get_mut(&id)).map(|item| {
                item.status = QueueItemStatus::Processing;
                item.attempts += 1;
                item.updated_at = Utc::now();
                item.clone()
            }))
        })
        .await
    }

    async fn update_queue_item(&self, id: i64, update: QueueItemUpdate) -> StoreResult<QueueItem> {
        self.with_table_mut(|table| {
            let item = table
                .queue
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("queue item", id.to_string()))?;
            if let Some(status) = update.status {
                item.status = status;
            }
            if let Some(priority) = update.priority {
                item.priority = priority;
            }
            if let Some(attempts) = update.attempts {
                item.attempts = attempts;
            }
            if let Some(last_error) = update.last_error {
                item.last_error = last_error;
            }
            item.updated_at = Utc::now();
            Ok(item.clone())
        })
        .await
    }

    async fn get_queue_item(&self, file_path: &str) -> StoreResult<Option<QueueItem>> {
        self.with_table(|table| {
            Ok(table
                .queue
                .values()
                .find(|q| q.file_path == file_path)
                .cloned())
        })
        .await
    }

    async fn get_queue_status(&self) -> StoreResult<QueueStatus> {
        self.with_table(|table| {
            let mut status = QueueStatus::default();
            for item in table.queue.values() {
                match item.status {
                    QueueItemStatus::Pending => {
                        status.pending += 1;
                        *status.pending_by_priority.entry(item.priority).or_default() += 1;
                    }
                    QueueItemStatus::Processing => status.processing += 1,
                    QueueItemStatus::Completed => status.completed += 1,
                    QueueItemStatus::Failed => status.failed += 1,
                }
            }
            Ok(status)
        })
        .await
    }

    async fn clear_completed_queue_items(&self) -> StoreResult<usize> {
        self.with_table_mut(|table| {
            let before = table.queue.len();
            table
                .queue
                .retain(|_, q| q.status != QueueItemStatus::Completed);
            Ok(before - table.queue.len())
        })
        .await
    }

    async fn search_keyword(
        &self,
        query: &str,
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let terms = search::keyword_terms(query);
        let native = self
            .with_table(|table| Ok(table.keyword_rows(&terms, filters, limit)))
            .await?;
        if limit == 0 || !native.is_empty() {
            return Ok(native);
        }
        // No indexed term matched; substring matches may still exist.
        Ok(search::degrade(
            "keyword",
            search::brute_force_keyword(self, query, filters, limit).await,
        ))
    }

    async fn search_semantic(
        &self,
        embedding: &[f32],
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let native = self
            .with_table(|table| Ok(table.vector_rows(embedding, filters, limit)))
            .await?;
        match native {
            Ok(results) => Ok(results),
            Err(e) => {
                tracing::warn!("Vector scan failed, falling back to chunk scan: {}", e);
                Ok(search::degrade(
                    "semantic",
                    search::brute_force_semantic(self, embedding, filters, limit).await,
                ))
            }
        }
    }

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.with_table(|table| Ok(table.config.get(key).cloned()))
            .await
    }

    async fn set_config_value(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        self.with_table_durable(|table| {
            table.config.insert(key.to_string(), value);
            Ok(((), true))
        })
        .await
    }

    async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
        self.with_table(|table| {
            Ok(StorageStats {
                documents: table.documents.len() + table.staged.len(),
                staged_documents: table.staged.len(),
                chunks: table.chunks.len(),
                embedded_chunks: table.chunks.has_embedding.iter().filter(|e| **e).count(),
                queue_items: table.queue.len(),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> ColumnarStore {
        let store = ColumnarStore::new(dir);
        store.initialize().await.unwrap();
        store
    }

    fn chunk(index: u32, text: &str) -> NewChunk {
        NewChunk {
            chunk_index: index,
            text: text.to_string(),
            start_offset: u64::from(index) * 100,
            end_offset: u64::from(index) * 100 + text.len() as u64,
            page: None,
            section: None,
            token_count: None,
        }
    }

    #[tokio::test]
    async fn test_document_is_staged_until_first_chunk() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 3, "h", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.staged_count().await.unwrap(), 1);
        assert!(store.get_document(&doc.id).await.unwrap().is_some());
        assert_eq!(
            store
                .list_documents(&DocumentFilters::default(), None, 0)
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .create_chunks(&doc.id, vec![chunk(0, "hello")])
            .await
            .unwrap();
        assert_eq!(store.staged_count().await.unwrap(), 0);
        assert_eq!(store.count_documents(&DocumentFilters::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_finished_documents() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            let kept = store
                .create_document(NewDocument::for_path("kept.txt", 3, "h", Utc::now()))
                .await
                .unwrap();
            let chunks = store
                .create_chunks(&kept.id, vec![chunk(0, "alpha"), chunk(1, "beta")])
                .await
                .unwrap();
            store
                .update_chunk_embeddings(vec![ChunkEmbeddingUpdate {
                    chunk_id: chunks[1].id.clone(),
                    embedding: vec![0.6, 0.8],
                }])
                .await
                .unwrap();
            store
                .create_document(NewDocument::for_path("staged.txt", 3, "h", Utc::now()))
                .await
                .unwrap();
            let bad = store
                .create_document(NewDocument::for_path("bad.txt", 3, "h", Utc::now()))
                .await
                .unwrap();
            store
                .update_document(&bad.id, DocumentUpdate::failed("unreadable"))
                .await
                .unwrap();
            assert_eq!(store.staged_count().await.unwrap(), 1);
            store.close().await.unwrap();
        }

        assert!(dir.path().join(TABLE_FILE).exists());
        assert!(dir.path().join(VECTORS_FILE).exists());

        let store = open_store(dir.path()).await;
        assert!(store.get_document_by_path("staged.txt").await.unwrap().is_none());
        let bad = store.get_document_by_path("bad.txt").await.unwrap().unwrap();
        assert_eq!(bad.status, DocumentStatus::Failed);
        assert_eq!(bad.error_message.as_deref(), Some("unreadable"));
        assert!(store.get_chunks(&bad.id).await.unwrap().is_empty());
        let kept = store.get_document_by_path("kept.txt").await.unwrap().unwrap();
        let chunks = store.get_chunks(&kept.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].embedding, None);
        assert_eq!(chunks[1].embedding, Some(vec![0.6, 0.8]));
    }

    #[tokio::test]
    async fn test_chunks_are_on_disk_without_close() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            let doc = store
                .create_document(NewDocument::for_path("a.txt", 3, "h", Utc::now()))
                .await
                .unwrap();
            let chunks = store
                .create_chunks(&doc.id, vec![chunk(0, "hello")])
                .await
                .unwrap();
            store
                .update_chunk_embeddings(vec![ChunkEmbeddingUpdate {
                    chunk_id: chunks[0].id.clone(),
                    embedding: vec![1.0, 0.0],
                }])
                .await
                .unwrap();
            store
                .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Embedding))
                .await
                .unwrap();
            // dropped without checkpoint or close
        }

        let store = open_store(dir.path()).await;
        let doc = store.get_document_by_path("a.txt").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Embedding);
        let chunks = store.get_chunks(&doc.id).await.unwrap();
        assert_eq!(chunks[0].embedding, Some(vec![1.0, 0.0]));

        assert_eq!(store.recover_stuck_documents().await.unwrap(), 1);
        assert!(store.get_chunks(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inverted_index_and_substring_fallback() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 3, "h", Utc::now()))
            .await
            .unwrap();
        store
            .create_chunks(
                &doc.id,
                vec![chunk(0, "parsing tokens quickly"), chunk(1, "tokens tokens")],
            )
            .await
            .unwrap();

        let results = store
            .search_keyword("tokens", &DocumentFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_index, 1);

        // "pars" is not an indexed term; the substring scan still finds it.
        let partial = store
            .search_keyword("pars", &DocumentFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_filters_use_denormalized_columns() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = store
            .create_document(NewDocument::for_path("docs/a.md", 3, "h", Utc::now()))
            .await
            .unwrap();
        store
            .create_chunks(&doc.id, vec![chunk(0, "status filter")])
            .await
            .unwrap();
        store
            .update_document(&doc.id, DocumentUpdate::status(DocumentStatus::Indexed))
            .await
            .unwrap();

        let indexed = store
            .search_keyword("filter", &DocumentFilters::with_status(DocumentStatus::Indexed), 5)
            .await
            .unwrap();
        assert_eq!(indexed.len(), 1);
        let pending = store
            .search_keyword("filter", &DocumentFilters::with_status(DocumentStatus::Pending), 5)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_suspend_drops_table_and_reloads() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 3, "h", Utc::now()))
            .await
            .unwrap();
        store
            .create_chunks(&doc.id, vec![chunk(0, "kept across suspend")])
            .await
            .unwrap();

        store.suspend().await.unwrap();
        assert!(store.is_suspended());
        assert!(store.state.read().await.is_none());

        let chunks = store.get_chunks(&doc.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!store.is_suspended());
    }

    #[tokio::test]
    async fn test_damaged_vectors_fail_initialization() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            let doc = store
                .create_document(NewDocument::for_path("a.txt", 3, "h", Utc::now()))
                .await
                .unwrap();
            let chunks = store
                .create_chunks(&doc.id, vec![chunk(0, "x")])
                .await
                .unwrap();
            store
                .update_chunk_embeddings(vec![ChunkEmbeddingUpdate {
                    chunk_id: chunks[0].id.clone(),
                    embedding: vec![1.0, 0.0, 0.0],
                }])
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        std::fs::write(dir.path().join(VECTORS_FILE), [0u8; 4]).unwrap();

        let store = ColumnarStore::new(dir.path());
        let err = store.initialize().await.unwrap_err();
        assert!(matches!(err, StoreError::Initialization { .. }));
    }
}
