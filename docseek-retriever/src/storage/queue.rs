//! Queue records and the priority rules every backend dequeues by.
//!
//! Items are ordered by priority tier first, then by file size (smaller
//! first), then by age (older first), then by insertion sequence.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Priority tiers, highest first. Cheap, reliably parseable formats go
/// before formats that are slow or likely to need OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    /// Explicit caller requests (on-demand reindex)
    High = 0,
    /// Plain text and source code
    Text = 1,
    /// Markup and structured documents
    Markup = 2,
    Pdf = 3,
    Image = 4,
    /// Formats that only yield text through OCR
    OcrOnly = 5,
}

impl Default for QueuePriority {
    fn default() -> Self {
        Self::Text
    }
}

impl QueuePriority {
    pub const ALL: [QueuePriority; 6] = [
        QueuePriority::High,
        QueuePriority::Text,
        QueuePriority::Markup,
        QueuePriority::Pdf,
        QueuePriority::Image,
        QueuePriority::OcrOnly,
    ];

    /// Tier for a file extension (without the dot, any case).
    pub fn for_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "txt" | "text" | "log" | "csv" | "tsv" | "json" | "yaml" | "yml" | "toml" | "ini"
            | "sql" | "rs" | "py" | "js" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "cpp"
            | "h" | "hpp" | "cs" | "rb" | "php" | "swift" | "kt" | "scala" | "sh" => Self::Text,
            "md" | "markdown" | "mdx" | "rst" | "org" | "adoc" | "tex" | "html" | "htm" | "xml"
            | "docx" | "odt" | "rtf" | "epub" => Self::Markup,
            "pdf" => Self::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => Self::Image,
            "tif" | "tiff" | "heic" => Self::OcrOnly,
            _ => Self::Markup,
        }
    }

    /// Numeric rank; lower is dequeued first.
    pub fn rank(self) -> i64 {
        self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.rank() == rank)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::High => "high",
            QueuePriority::Text => "text",
            QueuePriority::Markup => "markup",
            QueuePriority::Pdf => "pdf",
            QueuePriority::Image => "image",
            QueuePriority::OcrOnly => "ocr_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub file_path: String,
    pub priority: QueuePriority,
    pub file_size: u64,
    pub status: QueueItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Sort key implementing the dequeue order.
    pub fn rank(&self) -> QueueRank {
        QueueRank {
            priority: self.priority,
            file_size: self.file_size,
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Request to add (or reset) the queue entry for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueItem {
    pub file_path: String,
    pub priority: QueuePriority,
    pub file_size: u64,
}

impl NewQueueItem {
    pub fn new(file_path: impl Into<String>, priority: QueuePriority, file_size: u64) -> Self {
        Self {
            file_path: file_path.into(),
            priority,
            file_size,
        }
    }

    /// Entry whose tier follows from the file extension.
    pub fn for_path(file_path: impl Into<String>, file_size: u64) -> Self {
        let file_path = file_path.into();
        let extension = std::path::Path::new(&file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        Self::new(file_path, QueuePriority::for_extension(&extension), file_size)
    }
}

/// Partial update of a queue item. `last_error: Some(None)` clears the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueItemUpdate {
    pub status: Option<QueueItemStatus>,
    pub priority: Option<QueuePriority>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
}

impl QueueItemUpdate {
    pub fn completed() -> Self {
        Self {
            status: Some(QueueItemStatus::Completed),
            last_error: Some(None),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(QueueItemStatus::Failed),
            last_error: Some(Some(error.into())),
            ..Default::default()
        }
    }
}

/// Counts by status, and pending counts by tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending_by_priority: BTreeMap<QueuePriority, usize>,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    /// True when nothing is waiting or being processed.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Dequeue ordering key. `Ordering::Less` means "dequeued first".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRank {
    priority: QueuePriority,
    file_size: u64,
    created_at: DateTime<Utc>,
    id: i64,
}

impl Ord for QueueRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.file_size.cmp(&other.file_size))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
