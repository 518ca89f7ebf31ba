//! SQLite backend.
//!
//! Documents, chunks, tags, the indexing queue and the config store live in
//! one database file, `docseek.db`, inside the storage directory. Keyword
//! search goes through an FTS5 table kept in step with `chunks`; semantic
//! search scans the stored vectors and ranks them by cosine similarity.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE documents (
//!     id TEXT PRIMARY KEY,             -- UUID v4
//!     file_path TEXT NOT NULL UNIQUE,  -- relative to the indexed root
//!     ...                              -- file and descriptive metadata
//!     status TEXT NOT NULL,
//!     ocr_status TEXT NOT NULL,
//!     metadata TEXT NOT NULL           -- JSON object
//! );
//! CREATE TABLE document_tags (document_id, tag);  -- cascades with documents
//! CREATE TABLE chunks (
//!     id TEXT PRIMARY KEY,
//!     document_id TEXT REFERENCES documents(id) ON DELETE CASCADE,
//!     chunk_index INTEGER,             -- unique per document
//!     text TEXT,
//!     embedding BLOB                   -- little-endian f32, NULL until embedded
//! );
//! CREATE VIRTUAL TABLE chunks_fts USING fts5(chunk_id UNINDEXED, text);
//! CREATE TABLE queue (id, file_path UNIQUE, priority, file_size, status, attempts, ...);
//! CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT);  -- JSON values
//! ```
//!
//! Timestamps are stored as Unix milliseconds.
//!
//! ## SQLite Optimizations
//!
//! - **WAL mode** with `synchronous = NORMAL`
//! - **Large page size** (64KB) for embedding blobs
//! - **Auto-vacuum** and **foreign keys** on
//! - One pooled connection: the store is single-writer

use super::reconnect::{ReconnectGate, ReconnectOutcome};
use super::vector::{blob_to_vec, cosine_similarity, vec_to_blob};
use super::{
    BackendKind, ChunkEmbeddingUpdate, Document, DocumentChunk, DocumentFilters, DocumentStatus,
    DocumentUpdate, MatchType, Metadata, NewChunk, NewDocument, NewQueueItem, OcrStatus,
    QueueItem, QueueItemStatus, QueueItemUpdate, QueuePriority, QueueStatus, SearchResult,
    StorageAdapter, StorageStats, StoreError, StoreResult, TagCount, new_id,
};
use crate::search;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// File name of the database inside the storage directory.
pub const DATABASE_FILE: &str = "docseek.db";

const DOCUMENT_SELECT: &str = r#"
    SELECT d.id, d.file_path, d.file_name, d.file_extension, d.file_size, d.file_hash,
           d.mime_type, d.title, d.author, d.language, d.page_count, d.status, d.ocr_status,
           d.file_modified_at, d.created_at, d.updated_at, d.indexed_at, d.error_message,
           d.metadata,
           (SELECT group_concat(t.tag, char(31)) FROM document_tags t
             WHERE t.document_id = d.id) AS tags
    FROM documents d
"#;

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.chunk_index, c.text, c.start_offset, \
     c.end_offset, c.page, c.section, c.token_count, c.embedding, c.created_at";

const QUEUE_COLUMNS: &str =
    "id, file_path, priority, file_size, status, attempts, last_error, created_at, updated_at";

/// SQLite-backed [`StorageAdapter`].
pub struct SqliteStore {
    directory: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
    initialized: AtomicBool,
    suspended: AtomicBool,
    read_only: AtomicBool,
    reconnect_gate: ReconnectGate,
}

impl SqliteStore {
    /// Store keeping its database in `directory`. Nothing is opened until
    /// [`StorageAdapter::initialize`].
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            pool: RwLock::new(None),
            initialized: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            reconnect_gate: ReconnectGate::new(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.directory.join(DATABASE_FILE)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Connection pool, reopened first if the store is suspended.
    pub async fn pool(&self) -> StoreResult<SqlitePool> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let pool = self.connect().await?;
        *guard = Some(pool.clone());
        self.suspended.store(false, Ordering::Release);
        tracing::debug!("Resumed suspended SQLite store at {}", self.directory.display());
        Ok(pool)
    }

    async fn write_pool(&self) -> StoreResult<SqlitePool> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        self.pool().await
    }

    async fn connect(&self) -> StoreResult<SqlitePool> {
        let db_path = self.database_path();
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StoreError::initialization(self.directory.display(), e))?;

        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&db_path)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .busy_timeout(std::time::Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true)
                    .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
                    .page_size(1 << 16)
                    .optimize_on_close(true, 1 << 10),
            )
            .await
            .map_err(|e| StoreError::initialization(db_path.display(), e))
    }

    async fn create_tables(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL UNIQUE,
                file_name TEXT NOT NULL,
                file_extension TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                file_hash TEXT NOT NULL,
                mime_type TEXT,
                title TEXT,
                author TEXT,
                language TEXT,
                page_count INTEGER,
                status TEXT NOT NULL,
                ocr_status TEXT NOT NULL,
                file_modified_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                indexed_at INTEGER,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_tags (
                document_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (document_id, tag),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                page INTEGER,
                section TEXT,
                token_count INTEGER,
                embedding BLOB,
                created_at INTEGER NOT NULL,
                CONSTRAINT unique_chunk UNIQUE(document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL UNIQUE,
                priority INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_pending \
             ON queue(status, priority, file_size, created_at, id)",
        )
        .execute(pool)
        .await?;

        // Keyword search degrades to a substring scan without it.
        if let Err(e) = sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(chunk_id UNINDEXED, text)",
        )
        .execute(pool)
        .await
        {
            tracing::warn!("Full-text index unavailable, keyword search will scan: {}", e);
        }

        Ok(())
    }

    async fn fetch_document(pool: &SqlitePool, id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query(&format!("{DOCUMENT_SELECT} WHERE d.id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn fetch_queue_item(pool: &SqlitePool, id: i64) -> StoreResult<Option<QueueItem>> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM queue WHERE id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn fts_search(
        &self,
        pool: &SqlitePool,
        terms: &[String],
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let expression = terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.id, c.document_id, d.file_path, d.file_name, c.chunk_index, c.text,
                   c.page, c.section, -bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE chunks_fts MATCH "#,
        );
        qb.push_bind(expression);
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY score DESC, c.id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(pool).await?;
        rows.iter()
            .map(|row| {
                Ok(SearchResult {
                    chunk_id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    file_path: row.try_get("file_path")?,
                    file_name: row.try_get("file_name")?,
                    chunk_index: row.try_get::<i64, _>("chunk_index")? as u32,
                    text: row.try_get("text")?,
                    page: row.try_get::<Option<i64>, _>("page")?.map(|p| p as u32),
                    section: row.try_get("section")?,
                    score: row.try_get("score")?,
                    match_type: MatchType::Keyword,
                })
            })
            .collect()
    }

    async fn vector_scan(
        &self,
        pool: &SqlitePool,
        embedding: &[f32],
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CHUNK_COLUMNS}, d.file_path, d.file_name FROM chunks c \
             JOIN documents d ON d.id = c.document_id WHERE c.embedding IS NOT NULL"
        ));
        push_filters(&mut qb, filters);

        let rows = qb.build().fetch_all(pool).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(row)?;
            let Some(vector) = chunk.embedding.as_deref() else {
                continue;
            };
            results.push(SearchResult {
                score: cosine_similarity(embedding, vector) as f64,
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                file_path: row.try_get("file_path")?,
                file_name: row.try_get("file_name")?,
                chunk_index: chunk.chunk_index,
                text: chunk.text,
                page: chunk.page,
                section: chunk.section,
                match_type: MatchType::Semantic,
            });
        }
        Ok(search::rank_top(results, limit))
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn initialize(&self) -> StoreResult<()> {
        let mut guard = self.pool.write().await;
        if self.is_initialized() && guard.is_some() {
            return Ok(());
        }
        let pool = self.connect().await?;
        Self::create_tables(&pool).await.map_err(|e| {
            StoreError::initialization(self.database_path().display(), e)
        })?;
        *guard = Some(pool);
        self.suspended.store(false, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::info!("Opened SQLite store at {}", self.database_path().display());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut guard = self.pool.write().await;
        self.initialized.store(false, Ordering::Release);
        self.suspended.store(false, Ordering::Release);
        if let Some(pool) = guard.take() {
            pool.close().await;
            tracing::info!("Closed SQLite store at {}", self.database_path().display());
        }
        Ok(())
    }

    async fn checkpoint(&self) -> StoreResult<()> {
        let pool = self.pool().await?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn vacuum(&self) -> StoreResult<()> {
        let pool = self.write_pool().await?;
        sqlx::query("VACUUM").execute(&pool).await?;
        if let Err(e) = sqlx::query("INSERT INTO chunks_fts(chunks_fts) VALUES('optimize')")
            .execute(&pool)
            .await
        {
            tracing::warn!("Could not optimize full-text index: {}", e);
        }
        Ok(())
    }

    async fn suspend(&self) -> StoreResult<()> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await?;
            // In-flight queries keep their handle; the connection closes
            // once the last one is dropped.
            guard.take();
            self.suspended.store(true, Ordering::Release);
            tracing::info!("Suspended SQLite store");
        }
        Ok(())
    }

    async fn resume(&self) -> StoreResult<()> {
        self.pool().await.map(|_| ())
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let outcome = self
            .reconnect_gate
            .run(|| async {
                let mut guard = self.pool.write().await;
                if !self.is_initialized() {
                    return Err(StoreError::NotInitialized);
                }
                if let Some(old) = guard.take() {
                    old.close().await;
                }
                *guard = Some(self.connect().await?);
                self.suspended.store(false, Ordering::Release);
                Ok(())
            })
            .await?;
        if outcome == ReconnectOutcome::Performed {
            tracing::info!("Reconnected SQLite store");
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
        let pool = self.write_pool().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE file_path = ?1")
                .bind(&document.file_path)
                .fetch_optional(&pool)
                .await?;
        if existing.is_some() {
            return Err(StoreError::AlreadyExists {
                entity: "document",
                id: document.file_path,
            });
        }

        let doc = document.into_document(new_id(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, file_path, file_name, file_extension, file_size, file_hash, mime_type,
                title, author, language, page_count, status, ocr_status, file_modified_at,
                created_at, updated_at, indexed_at, error_message, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.file_path)
        .bind(&doc.file_name)
        .bind(&doc.file_extension)
        .bind(doc.file_size as i64)
        .bind(&doc.file_hash)
        .bind(&doc.mime_type)
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(&doc.language)
        .bind(doc.page_count.map(i64::from))
        .bind(doc.status.as_str())
        .bind(doc.ocr_status.as_str())
        .bind(to_millis(doc.file_modified_at))
        .bind(to_millis(doc.created_at))
        .bind(to_millis(doc.updated_at))
        .bind(doc.indexed_at.map(to_millis))
        .bind(&doc.error_message)
        .bind(serde_json::to_string(&doc.metadata)?)
        .execute(&pool)
        .await?;

        tracing::debug!("Created document {} ({})", doc.file_path, doc.id);
        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        let pool = self.pool().await?;
        Self::fetch_document(&pool, id).await
    }

    async fn get_document_by_path(&self, file_path: &str) -> StoreResult<Option<Document>> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!("{DOCUMENT_SELECT} WHERE d.file_path = ?1"))
            .bind(file_path)
            .fetch_optional(&pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, id: &str, update: DocumentUpdate) -> StoreResult<Document> {
        let pool = self.write_pool().await?;
        let mut doc = Self::fetch_document(&pool, id)
            .await?
            .ok_or_else(|| StoreError::not_found("document", id))?;
        update.apply_to(&mut doc, Utc::now());

        sqlx::query(
            r#"
            UPDATE documents SET
                file_size = ?2, file_hash = ?3, mime_type = ?4, title = ?5, author = ?6,
                language = ?7, page_count = ?8, status = ?9, ocr_status = ?10,
                file_modified_at = ?11, updated_at = ?12, indexed_at = ?13,
                error_message = ?14, metadata = ?15
            WHERE id = ?1
            "#,
        )
        .bind(&doc.id)
        .bind(doc.file_size as i64)
        .bind(&doc.file_hash)
        .bind(&doc.mime_type)
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(&doc.language)
        .bind(doc.page_count.map(i64::from))
        .bind(doc.status.as_str())
        .bind(doc.ocr_status.as_str())
        .bind(to_millis(doc.file_modified_at))
        .bind(to_millis(doc.updated_at))
        .bind(doc.indexed_at.map(to_millis))
        .bind(&doc.error_message)
        .bind(serde_json::to_string(&doc.metadata)?)
        .execute(&pool)
        .await?;

        Ok(doc)
    }

    async fn delete_document(&self, id: &str) -> StoreResult<bool> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;

        let file_path: Option<String> =
            sqlx::query_scalar("SELECT file_path FROM documents WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(file_path) = file_path else {
            return Ok(false);
        };

        if let Err(e) = sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        {
            tracing::warn!("Could not remove full-text rows of document {}: {}", id, e);
        }
        sqlx::query("DELETE FROM queue WHERE file_path = ?1")
            .bind(&file_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!("Deleted document {} ({})", file_path, id);
        Ok(true)
    }

    async fn list_documents(
        &self,
        filters: &DocumentFilters,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<Document>> {
        let pool = self.pool().await?;
        let mut qb = QueryBuilder::<Sqlite>::new(DOCUMENT_SELECT);
        qb.push(" WHERE 1 = 1");
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY d.file_path");
        match limit {
            Some(limit) => {
                qb.push(" LIMIT ").push_bind(limit as i64);
                qb.push(" OFFSET ").push_bind(offset as i64);
            }
            None if offset > 0 => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(offset as i64);
            }
            None => {}
        }

        let rows = qb.build().fetch_all(&pool).await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn count_documents(&self, filters: &DocumentFilters) -> StoreResult<usize> {
        let pool = self.pool().await?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM documents d WHERE 1 = 1");
        push_filters(&mut qb, filters);
        let count = qb.build_query_scalar::<i64>().fetch_one(&pool).await?;
        Ok(count as usize)
    }

    async fn create_chunks(
        &self,
        document_id: &str,
        chunks: Vec<NewChunk>,
    ) -> StoreResult<Vec<DocumentChunk>> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?1")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("document", document_id));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let record = DocumentChunk {
                id: new_id(),
                document_id: document_id.to_string(),
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

            sqlx::query(
                r#"
                INSERT INTO chunks (
                    id, document_id, chunk_index, text, start_offset, end_offset,
                    page, section, token_count, embedding, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)
                "#,
            )
            .bind(&record.id)
            .bind(&record.document_id)
            .bind(i64::from(record.chunk_index))
            .bind(&record.text)
            .bind(record.start_offset as i64)
            .bind(record.end_offset as i64)
            .bind(record.page.map(i64::from))
            .bind(&record.section)
            .bind(record.token_count.map(i64::from))
            .bind(to_millis(record.created_at))
            .execute(&mut *tx)
            .await?;

            // Chunk and full-text rows commit together.
            sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?1, ?2)")
                .bind(&record.id)
                .bind(&record.text)
                .execute(&mut *tx)
                .await?;
            created.push(record);
        }
        tx.commit().await?;

        Ok(created)
    }

    async fn update_chunk_embeddings(
        &self,
        updates: Vec<ChunkEmbeddingUpdate>,
    ) -> StoreResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let pool = self.write_pool().await?;

        let stored_bytes: Option<i64> = sqlx::query_scalar(
            "SELECT length(embedding) FROM chunks WHERE embedding IS NOT NULL LIMIT 1",
        )
        .fetch_optional(&pool)
        .await?;
        let expected = stored_bytes
            .map(|bytes| bytes as usize / std::mem::size_of::<f32>())
            .unwrap_or(updates[0].embedding.len());
        if let Some(bad) = updates.iter().find(|u| u.embedding.len() != expected) {
            return Err(StoreError::DimensionMismatch {
                expected,
                actual: bad.embedding.len(),
            });
        }

        let mut tx = pool.begin().await?;
        let mut updated = 0;
        for update in &updates {
            let result = sqlx::query("UPDATE chunks SET embedding = ?1 WHERE id = ?2")
                .bind(vec_to_blob(&update.embedding))
                .bind(&update.chunk_id)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn get_chunks(&self, document_id: &str) -> StoreResult<Vec<DocumentChunk>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.document_id = ?1 ORDER BY c.chunk_index"
        ))
        .bind(document_id)
        .fetch_all(&pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn delete_chunks(&self, document_id: &str) -> StoreResult<usize> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;
        if let Err(e) = sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?1)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await
        {
            tracing::warn!(
                "Could not remove full-text rows of document {}: {}",
                document_id,
                e
            );
        }
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_section_chunks(
        &self,
        document_id: &str,
        section: &str,
    ) -> StoreResult<usize> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;
        if let Err(e) = sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE document_id = ?1 AND section = ?2)",
        )
        .bind(document_id)
        .bind(section)
        .execute(&mut *tx)
        .await
        {
            tracing::warn!(
                "Could not remove full-text rows of {} section of {}: {}",
                section,
                document_id,
                e
            );
        }
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1 AND section = ?2")
            .bind(document_id)
            .bind(section)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() as usize)
    }

    async fn add_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?1")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found("document", document_id));
        }
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag) VALUES (?1, ?2)")
                .bind(document_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_tags(&self, document_id: &str, tags: &[String]) -> StoreResult<()> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;
        for tag in tags {
            sqlx::query("DELETE FROM document_tags WHERE document_id = ?1 AND tag = ?2")
                .bind(document_id)
                .bind(tag.trim())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_document_tags(&self, document_id: &str) -> StoreResult<Vec<String>> {
        let pool = self.pool().await?;
        let tags = sqlx::query_scalar(
            "SELECT tag FROM document_tags WHERE document_id = ?1 ORDER BY tag",
        )
        .bind(document_id)
        .fetch_all(&pool)
        .await?;
        Ok(tags)
    }

    async fn get_all_tags(&self) -> StoreResult<Vec<TagCount>> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT tag, COUNT(*) AS count FROM document_tags GROUP BY tag ORDER BY count DESC, tag",
        )
        .fetch_all(&pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TagCount {
                    tag: row.try_get("tag")?,
                    count: row.try_get::<i64, _>("count")? as usize,
                })
            })
            .collect()
    }

    async fn enqueue_item(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        let pool = self.write_pool().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO queue (file_path, priority, file_size, status, attempts, last_error,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?4)
            ON CONFLICT(file_path) DO UPDATE SET
                priority = excluded.priority,
                file_size = excluded.file_size,
                status = 'pending',
                attempts = 0,
                last_error = NULL,
                updated_at = excluded.updated_at
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(&item.file_path)
        .bind(item.priority.rank())
        .bind(item.file_size as i64)
        .bind(to_millis(Utc::now()))
        .fetch_one(&pool)
        .await?;
        queue_item_from_row(&row)
    }

    async fn enqueue_items(&self, items: Vec<NewQueueItem>) -> StoreResult<usize> {
        let pool = self.write_pool().await?;
        let mut tx = pool.begin().await?;
        let now = to_millis(Utc::now());
        for item in &items {
            sqlx::query(
                r#"
                INSERT INTO queue (file_path, priority, file_size, status, attempts, last_error,
                                   created_at, updated_at)
                VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?4)
                ON CONFLICT(file_path) DO UPDATE SET
                    priority = excluded.priority,
                    file_size = excluded.file_size,
                    status = 'pending',
                    attempts = 0,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&item.file_path)
            .bind(item.priority.rank())
            .bind(item.file_size as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(items.len())
    }

    async fn dequeue_item(&self) -> StoreResult<Option<QueueItem>> {
        let pool = self.write_pool().await?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE queue SET status = 'processing', attempts = attempts + 1, updated_at = ?1
            WHERE id = (
                SELECT id FROM queue WHERE status = 'pending'
                ORDER BY priority, file_size, created_at, id
                LIMIT 1
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(to_millis(Utc::now()))
        .fetch_optional(&pool)
        .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn update_queue_item(&self, id: i64, update: QueueItemUpdate) -> StoreResult<QueueItem> {
        let pool = self.write_pool().await?;
        let mut item = Self::fetch_queue_item(&pool, id)
            .await?
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

        sqlx::query(
            "UPDATE queue SET status = ?2, priority = ?3, attempts = ?4, last_error = ?5, \
             updated_at = ?6 WHERE id = ?1",
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(item.priority.rank())
        .bind(i64::from(item.attempts))
        .bind(&item.last_error)
        .bind(to_millis(item.updated_at))
        .execute(&pool)
        .await?;
        Ok(item)
    }

    async fn get_queue_item(&self, file_path: &str) -> StoreResult<Option<QueueItem>> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue WHERE file_path = ?1"
        ))
        .bind(file_path)
        .fetch_optional(&pool)
        .await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn get_queue_status(&self) -> StoreResult<QueueStatus> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT status, priority, COUNT(*) AS count FROM queue GROUP BY status, priority",
        )
        .fetch_all(&pool)
        .await?;

        let mut status = QueueStatus::default();
        for row in &rows {
            let state: String = row.try_get("status")?;
            let priority: i64 = row.try_get("priority")?;
            let count = row.try_get::<i64, _>("count")? as usize;
            match QueueItemStatus::parse(&state) {
                Some(QueueItemStatus::Pending) => {
                    status.pending += count;
                    let tier = QueuePriority::from_rank(priority).unwrap_or_default();
                    *status.pending_by_priority.entry(tier).or_default() += count;
                }
                Some(QueueItemStatus::Processing) => status.processing += count,
                Some(QueueItemStatus::Completed) => status.completed += count,
                Some(QueueItemStatus::Failed) => status.failed += count,
                None => return Err(corrupt("queue status", &state)),
            }
        }
        Ok(status)
    }

    async fn clear_completed_queue_items(&self) -> StoreResult<usize> {
        let pool = self.write_pool().await?;
        let result = sqlx::query("DELETE FROM queue WHERE status = 'completed'")
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn search_keyword(
        &self,
        query: &str,
        filters: &DocumentFilters,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let pool = self.pool().await?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let terms = search::keyword_terms(query);
        if !terms.is_empty() {
            match self.fts_search(&pool, &terms, filters, limit).await {
                Ok(results) => return Ok(results),
                Err(e) => {
                    tracing::warn!("Full-text search failed, falling back to substring scan: {}", e)
                }
            }
        }
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
        let pool = self.pool().await?;
        if limit == 0 || embedding.is_empty() {
            return Ok(Vec::new());
        }

        match self.vector_scan(&pool, embedding, filters, limit).await {
            Ok(results) => Ok(results),
            Err(e) => {
                tracing::warn!("Vector query failed, falling back to chunk scan: {}", e);
                Ok(search::degrade(
                    "semantic",
                    search::brute_force_semantic(self, embedding, filters, limit).await,
                ))
            }
        }
    }

    async fn get_config_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    async fn set_config_value(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        let pool = self.write_pool().await?;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn get_storage_stats(&self) -> StoreResult<StorageStats> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents) AS documents,
                (SELECT COUNT(*) FROM chunks) AS chunks,
                (SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL) AS embedded_chunks,
                (SELECT COUNT(*) FROM queue) AS queue_items
            "#,
        )
        .fetch_one(&pool)
        .await?;
        Ok(StorageStats {
            documents: row.try_get::<i64, _>("documents")? as usize,
            staged_documents: 0,
            chunks: row.try_get::<i64, _>("chunks")? as usize,
            embedded_chunks: row.try_get::<i64, _>("embedded_chunks")? as usize,
            queue_items: row.try_get::<i64, _>("queue_items")? as usize,
        })
    }
}

/// Append `AND` clauses for `filters` on the `documents d` alias.
fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &DocumentFilters) {
    if let Some(folder) = &filters.folder {
        qb.push(" AND instr(d.file_path, ")
            .push_bind(folder.clone())
            .push(") > 0");
    }
    if let Some(extension) = &filters.extension {
        qb.push(" AND lower(d.file_extension) = ")
            .push_bind(extension.trim_start_matches('.').to_ascii_lowercase());
    }
    if let Some(status) = filters.status {
        qb.push(" AND d.status = ").push_bind(status.as_str());
    }
    if let Some(after) = filters.modified_after {
        qb.push(" AND d.file_modified_at >= ")
            .push_bind(to_millis(after));
    }
    if let Some(before) = filters.modified_before {
        qb.push(" AND d.file_modified_at <= ")
            .push_bind(to_millis(before));
    }
    if let Some(language) = &filters.language {
        qb.push(" AND d.language = ").push_bind(language.clone());
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Other(anyhow::anyhow!("unrecognized {what} '{value}' in database"))
}

fn document_from_row(row: &SqliteRow) -> StoreResult<Document> {
    let status: String = row.try_get("status")?;
    let ocr_status: String = row.try_get("ocr_status")?;
    let metadata: String = row.try_get("metadata")?;
    let tags: Option<String> = row.try_get("tags")?;
    let mut tags: Vec<String> = tags
        .map(|t| {
            t.split('\u{1f}')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    tags.sort();

    Ok(Document {
        id: row.try_get("id")?,
        file_path: row.try_get("file_path")?,
        file_name: row.try_get("file_name")?,
        file_extension: row.try_get("file_extension")?,
        file_size: row.try_get::<i64, _>("file_size")? as u64,
        file_hash: row.try_get("file_hash")?,
        mime_type: row.try_get("mime_type")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        language: row.try_get("language")?,
        page_count: row.try_get::<Option<i64>, _>("page_count")?.map(|p| p as u32),
        status: DocumentStatus::parse(&status).ok_or_else(|| corrupt("document status", &status))?,
        ocr_status: OcrStatus::parse(&ocr_status)
            .ok_or_else(|| corrupt("OCR status", &ocr_status))?,
        file_modified_at: from_millis(row.try_get("file_modified_at")?),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        indexed_at: row.try_get::<Option<i64>, _>("indexed_at")?.map(from_millis),
        error_message: row.try_get("error_message")?,
        metadata: serde_json::from_str::<Metadata>(&metadata)?,
        tags,
    })
}

fn chunk_from_row(row: &SqliteRow) -> StoreResult<DocumentChunk> {
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(DocumentChunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: row.try_get::<i64, _>("chunk_index")? as u32,
        text: row.try_get("text")?,
        start_offset: row.try_get::<i64, _>("start_offset")? as u64,
        end_offset: row.try_get::<i64, _>("end_offset")? as u64,
        page: row.try_get::<Option<i64>, _>("page")?.map(|p| p as u32),
        section: row.try_get("section")?,
        token_count: row.try_get::<Option<i64>, _>("token_count")?.map(|t| t as u32),
        embedding: embedding.map(|bytes| blob_to_vec(&bytes)),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn queue_item_from_row(row: &SqliteRow) -> StoreResult<QueueItem> {
    let status: String = row.try_get("status")?;
    let priority: i64 = row.try_get("priority")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        file_path: row.try_get("file_path")?,
        priority: QueuePriority::from_rank(priority)
            .ok_or_else(|| corrupt("queue priority", &priority.to_string()))?,
        file_size: row.try_get::<i64, _>("file_size")? as u64,
        status: QueueItemStatus::parse(&status).ok_or_else(|| corrupt("queue status", &status))?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> SqliteStore {
        let store = SqliteStore::new(dir);
        store.initialize().await.unwrap();
        store
    }

    async fn document_with_chunks(store: &SqliteStore, path: &str, texts: &[&str]) -> Document {
        let doc = store
            .create_document(NewDocument::for_path(path, 100, "hash", Utc::now()))
            .await
            .unwrap();
        let mut offset = 0u64;
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let start = offset;
                offset += text.len() as u64;
                NewChunk {
                    chunk_index: i as u32,
                    text: text.to_string(),
                    start_offset: start,
                    end_offset: offset,
                    page: None,
                    section: None,
                    token_count: None,
                }
            })
            .collect();
        store.create_chunks(&doc.id, chunks).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn test_database_file_created() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        assert!(store.database_path().exists());
        assert_eq!(store.backend(), BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn test_full_text_search_ranks_matches() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        document_with_chunks(
            &store,
            "notes/rust.md",
            &["ownership and borrowing in rust", "unrelated gardening tips"],
        )
        .await;
        document_with_chunks(&store, "notes/go.md", &["goroutines and channels"]).await;

        let results = store
            .search_keyword("borrowing", &DocumentFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_path, "notes/rust.md");
        assert_eq!(results[0].match_type, MatchType::Keyword);
        assert!(results[0].score > 0.0);

        let filtered = store
            .search_keyword(
                "channels",
                &DocumentFilters {
                    folder: Some("rust".into()),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_without_fts_table_scans() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        document_with_chunks(&store, "a.txt", &["the quick brown fox"]).await;

        let pool = store.pool().await.unwrap();
        sqlx::query("DROP TABLE chunks_fts")
            .execute(&pool)
            .await
            .unwrap();

        let results = store
            .search_keyword("QUICK", &DocumentFilters::default(), 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "the quick brown fox");
    }

    #[tokio::test]
    async fn test_full_text_failure_rolls_back_chunks() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = store
            .create_document(NewDocument::for_path("a.txt", 10, "hash", Utc::now()))
            .await
            .unwrap();

        let pool = store.pool().await.unwrap();
        sqlx::query("DROP TABLE chunks_fts")
            .execute(&pool)
            .await
            .unwrap();

        let chunk = NewChunk {
            chunk_index: 0,
            text: "never half written".to_string(),
            start_offset: 0,
            end_offset: 18,
            page: None,
            section: None,
            token_count: None,
        };
        assert!(store.create_chunks(&doc.id, vec![chunk]).await.is_err());
        assert!(store.get_chunks(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_keeps_creation_time_and_resets_state() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let first = store
            .enqueue_item(NewQueueItem::for_path("a.txt", 10))
            .await
            .unwrap();
        let claimed = store.dequeue_item().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        store
            .update_queue_item(claimed.id, QueueItemUpdate::failed("parse error"))
            .await
            .unwrap();

        let again = store
            .enqueue_item(NewQueueItem::for_path("a.txt", 12))
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(again.status, QueueItemStatus::Pending);
        assert_eq!(again.attempts, 0);
        assert_eq!(again.last_error, None);
        assert_eq!(again.file_size, 12);
    }

    #[tokio::test]
    async fn test_embedding_dimension_is_enforced() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = document_with_chunks(&store, "a.txt", &["one", "two"]).await;
        let chunks = store.get_chunks(&doc.id).await.unwrap();

        store
            .update_chunk_embeddings(vec![ChunkEmbeddingUpdate {
                chunk_id: chunks[0].id.clone(),
                embedding: vec![1.0, 0.0, 0.0],
            }])
            .await
            .unwrap();
        let err = store
            .update_chunk_embeddings(vec![ChunkEmbeddingUpdate {
                chunk_id: chunks[1].id.clone(),
                embedding: vec![1.0, 0.0],
            }])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_suspend_releases_pool_and_resumes_on_use() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        document_with_chunks(&store, "a.txt", &["hello"]).await;

        store.suspend().await.unwrap();
        assert!(store.is_suspended());
        assert!(store.pool.read().await.is_none());

        let doc = store.get_document_by_path("a.txt").await.unwrap();
        assert!(doc.is_some());
        assert!(!store.is_suspended());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            document_with_chunks(&store, "keep.txt", &["persisted text"]).await;
            store.close().await.unwrap();
        }
        let store = open_store(dir.path()).await;
        let doc = store.get_document_by_path("keep.txt").await.unwrap().unwrap();
        assert_eq!(store.get_chunks(&doc.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let doc = document_with_chunks(&store, "gone.txt", &["alpha", "beta"]).await;
        store
            .add_tags(&doc.id, &["x".to_string()])
            .await
            .unwrap();
        store
            .enqueue_item(NewQueueItem::for_path("gone.txt", 5))
            .await
            .unwrap();

        assert!(store.delete_document(&doc.id).await.unwrap());
        assert!(!store.delete_document(&doc.id).await.unwrap());
        assert!(store.get_chunks(&doc.id).await.unwrap().is_empty());
        assert!(store.get_all_tags().await.unwrap().is_empty());
        assert!(store.get_queue_item("gone.txt").await.unwrap().is_none());
        let results = store
            .search_keyword("alpha", &DocumentFilters::default(), 5)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
