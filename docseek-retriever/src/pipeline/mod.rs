//! Indexing pipeline: from files on disk to embedded chunks.
//!
//! ## Key Components
//!
//! - **[`IndexingPipeline`]**: syncs the root with storage, queues changed
//!   files and consumes the queue in a background task
//! - **[`discovery`]**: ignore-aware directory walk
//! - **[`events`]**: [`PipelineEvent`] and the [`EventBus`] that delivers it
//!
//! ## Pipeline Flow
//!
//! ```text
//! discover_files → sync_and_queue → queue (by priority tier)
//!                                       ↓
//!   parse (blocking) → chunk → embed in batches → indexed
//!          ↓
//!   OCR regions → OcrNeeded event → OcrQueueManager
//! ```
//!
//! A file moves its document through `parsing`, `chunking` and `embedding`
//! to `indexed`. Any failure marks the document `failed` with the reason and
//! the loop moves on to the next item.

pub mod discovery;
pub mod events;
mod indexing;

pub use discovery::{DiscoveredFile, discover_files};
pub use events::{EventBus, EventListener, PipelineEvent};
pub use indexing::{
    FileProcessingResult, IndexingPipeline, PipelineState, RunSummary, SyncOptions, SyncResult,
};
