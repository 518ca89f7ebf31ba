//! docseek-retriever: local document indexing and hybrid search
//!
//! Indexes the documents under one root directory into an embedded store and
//! answers keyword, semantic and hybrid queries over their chunks. Files
//! whose content needs text recognition are handed to a separate OCR queue.
//!
//! ## Key Modules
//!
//! - **[`search_system`]**: The [`SearchSystem`] orchestrator tying everything together
//! - **[`storage`]**: The [`StorageAdapter`] contract with SQLite and columnar backends
//! - **[`pipeline`]**: Discovery, change detection and the indexing queue worker
//! - **[`ocr`]**: The OCR job queue and recognition providers
//! - **[`search`]**: Brute-force scoring and Reciprocal Rank Fusion
//! - **[`embedder`]**: Pinning the embedding model to the database
//! - **[`config`]**: TOML-loadable [`SearchSystemConfig`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docseek_retriever::{SearchOptions, SearchSystem, SearchSystemConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let system = SearchSystem::builder(SearchSystemConfig::new("/home/me/papers"))
//!     .build()
//!     .await?;
//! let summary = system.index_all(false).await?;
//! println!("indexed {} files", summary.indexed);
//!
//! for hit in system.search("tax return 2023", SearchOptions::hybrid()).await? {
//!     println!("{:.3} {} #{}", hit.score, hit.file_path, hit.chunk_index);
//! }
//! system.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Root dir → Discovery → Sync → Queue → Parse → Chunk → Embed → Storage
//!                                          ↓                      ↑
//!                                     OcrNeeded → OCR queue ──────┘
//!                                                                 ↓
//!                                         SearchSystem::search ← Keyword / Semantic / RRF
//! ```

pub mod config;
pub mod embedder;
pub mod error;
pub mod ocr;
pub mod pipeline;
pub mod search;
pub mod search_system;
pub mod storage;

pub use config::SearchSystemConfig;
pub use error::{StoreError, StoreResult};
pub use search_system::{
    IndexSummary, SearchMode, SearchOptions, SearchSystem, SearchSystemBuilder, SystemStats,
};
pub use storage::{
    BackendKind, Document, DocumentChunk, DocumentFilters, DocumentStatus, MatchType, OcrStatus,
    SearchResult, StorageAdapter,
};
