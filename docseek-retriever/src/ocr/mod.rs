//! OCR processing, independent of the main indexing queue.
//!
//! Parsing marks a document `ocr_status = pending` when it finds regions
//! (scanned pages, images) that hold no extractable text. The
//! [`OcrQueueManager`] recognizes those regions with an [`OcrProvider`],
//! then chunks, embeds and appends the text to the document's existing
//! chunks with section `"ocr"`.

pub mod provider;
pub mod queue;

pub use provider::{OcrProvider, tesseract_languages};
#[cfg(feature = "tesseract")]
pub use provider::TesseractOcrProvider;
pub use queue::{
    OcrEvent, OcrJob, OcrJobStatus, OcrProcessSummary, OcrQueueManager, OcrQueueStatus,
};

/// Document metadata key holding the OCR regions found at parse time, so
/// pending jobs can be restored after a restart.
pub const OCR_REGIONS_METADATA_KEY: &str = "ocr_regions";

/// Section label of chunks produced by OCR.
pub const OCR_SECTION: &str = "ocr";
