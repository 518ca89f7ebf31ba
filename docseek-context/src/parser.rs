//! Parser contract and extension registry.
//!
//! A [`Parser`] turns raw file bytes into a [`ParsedDocument`]: extracted text,
//! optional descriptive metadata, and the list of regions (pages or whole
//! images) whose text could only be recovered through OCR. Parsers are
//! synchronous; callers that run them from async code should move them onto
//! a blocking thread.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser registered for extension '{extension}'")]
    Unsupported { extension: String },

    #[error("file {path} does not look like text")]
    Binary { path: String },

    #[error("failed to parse {path}: {message}")]
    Failed { path: String, message: String },
}

/// A region of a file whose text must be recovered with OCR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrRegion {
    /// 1-based page number; `None` means the whole file (a single image).
    pub page: Option<u32>,
    pub label: Option<String>,
}

impl OcrRegion {
    pub fn whole_file() -> Self {
        Self {
            page: None,
            label: None,
        }
    }

    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            label: None,
        }
    }
}

/// Output of a parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<u32>,
    /// Byte offsets into `text` where pages 2..=N begin. When empty, form
    /// feeds in `text` mark page boundaries.
    #[serde(default)]
    pub page_breaks: Vec<usize>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub ocr_regions: Vec<OcrRegion>,
}

/// Maps byte offsets of a parsed text to 1-based page numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMap {
    starts: Vec<usize>,
    page_count: u32,
}

impl PageMap {
    pub fn page_of(&self, offset: usize) -> u32 {
        let page = self.starts.partition_point(|start| *start <= offset) as u32 + 1;
        page.min(self.page_count)
    }
}

impl ParsedDocument {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn needs_ocr(&self) -> bool {
        !self.ocr_regions.is_empty()
    }

    /// `None` when the page count is unknown, or when a multi-page text
    /// carries no page boundaries.
    pub fn page_map(&self) -> Option<PageMap> {
        let page_count = self.page_count.filter(|count| *count > 0)?;
        if page_count == 1 {
            return Some(PageMap {
                starts: Vec::new(),
                page_count,
            });
        }
        let mut starts = if self.page_breaks.is_empty() {
            self.text
                .match_indices('\u{c}')
                .map(|(index, _)| index + 1)
                .collect()
        } else {
            self.page_breaks.clone()
        };
        if starts.is_empty() {
            return None;
        }
        starts.sort_unstable();
        Some(PageMap { starts, page_count })
    }
}

pub trait Parser: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Lower-case extensions (without the dot) this parser handles.
    fn extensions(&self) -> &[&'static str];

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError>;
}

/// Text-like formats: prose, markup, source code and structured data.
#[derive(Debug, Default, Clone)]
pub struct PlainTextParser;

impl PlainTextParser {
    pub const EXTENSIONS: &'static [&'static str] = &[
        "txt", "text", "log", "md", "markdown", "mdx", "rst", "org", "adoc", "tex", "csv", "tsv",
        "json", "yaml", "yml", "toml", "ini", "xml", "html", "htm", "rs", "py", "js", "ts", "jsx",
        "tsx", "go", "java", "c", "cpp", "h", "hpp", "cs", "rb", "php", "swift", "kt", "scala",
        "sh", "sql",
    ];
}

impl Parser for PlainTextParser {
    fn name(&self) -> &'static str {
        "plain-text"
    }

    fn extensions(&self) -> &[&'static str] {
        Self::EXTENSIONS
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
        // NUL bytes in the first block are a reliable sign of a binary file.
        let head = &bytes[..bytes.len().min(8192)];
        if head.contains(&0) {
            return Err(ParseError::Binary {
                path: path.display().to_string(),
            });
        }

        let text = String::from_utf8_lossy(bytes).into_owned();
        let title = extract_title(path, &text);
        let mut parsed = ParsedDocument::from_text(text);
        parsed.title = title;
        Ok(parsed)
    }
}

/// Raster images. They carry no extractable text; the whole file is handed
/// to OCR.
#[derive(Debug, Default, Clone)]
pub struct ImageParser;

impl ImageParser {
    pub const EXTENSIONS: &'static [&'static str] =
        &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp"];
}

impl Parser for ImageParser {
    fn name(&self) -> &'static str {
        "image"
    }

    fn extensions(&self) -> &[&'static str] {
        Self::EXTENSIONS
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
        if bytes.is_empty() {
            return Err(ParseError::Failed {
                path: path.display().to_string(),
                message: "empty image file".to_string(),
            });
        }
        let mut parsed = ParsedDocument {
            page_count: Some(1),
            ocr_regions: vec![OcrRegion::whole_file()],
            ..Default::default()
        };
        parsed.metadata.insert(
            "byte_length".to_string(),
            serde_json::Value::from(bytes.len() as u64),
        );
        Ok(parsed)
    }
}

fn extract_title(path: &Path, text: &str) -> Option<String> {
    let is_markdown = matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("md" | "markdown" | "mdx")
    );
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty())?;

    if is_markdown {
        let heading = first_line.trim_start_matches('#');
        if heading.len() < first_line.len() {
            let heading = heading.trim();
            return (!heading.is_empty()).then(|| heading.to_string());
        }
        return None;
    }

    let title: String = first_line.chars().take(120).collect();
    Some(title)
}

/// Maps lower-case file extensions to parsers.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut extensions: Vec<_> = self.parsers.keys().collect();
        extensions.sort();
        f.debug_struct("ParserRegistry")
            .field("extensions", &extensions)
            .finish()
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in text and image parsers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextParser));
        registry.register(Arc::new(ImageParser));
        registry
    }

    /// Register `parser` for every extension it declares, replacing any
    /// previous parser for those extensions.
    pub fn register(&mut self, parser: Arc<dyn Parser>) {
        for extension in parser.extensions() {
            self.parsers
                .insert(extension.to_ascii_lowercase(), Arc::clone(&parser));
        }
    }

    /// Register `parser` for a single extension.
    pub fn register_for(&mut self, extension: &str, parser: Arc<dyn Parser>) {
        self.parsers.insert(normalize(extension), parser);
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn Parser>> {
        self.parsers.get(&normalize(extension)).cloned()
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.parsers.contains_key(&normalize(extension))
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.parsers.keys().cloned().collect();
        extensions.sort();
        extensions
    }

    /// Parse `bytes` with the parser registered for the extension of `path`.
    pub fn parse(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let parser = self.get(extension).ok_or_else(|| ParseError::Unsupported {
            extension: extension.to_string(),
        })?;
        parser.parse(path, bytes)
    }
}

fn normalize(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_map_from_form_feeds() {
        let mut parsed = ParsedDocument::from_text("one\u{c}two\u{c}three");
        assert_eq!(parsed.page_map(), None);

        parsed.page_count = Some(3);
        let pages = parsed.page_map().unwrap();
        assert_eq!(pages.page_of(0), 1);
        assert_eq!(pages.page_of(4), 2);
        assert_eq!(pages.page_of(8), 3);
        assert_eq!(pages.page_of(500), 3);
    }

    #[test]
    fn test_page_map_prefers_explicit_breaks() {
        let mut parsed = ParsedDocument::from_text("aaaa\u{c}bbbbcccc");
        parsed.page_count = Some(2);
        parsed.page_breaks = vec![9];
        let pages = parsed.page_map().unwrap();
        assert_eq!(pages.page_of(6), 1);
        assert_eq!(pages.page_of(9), 2);

        parsed.page_breaks.clear();
        parsed.text = "no boundaries".to_string();
        assert_eq!(parsed.page_map(), None);

        parsed.page_count = Some(1);
        assert_eq!(parsed.page_map().unwrap().page_of(7), 1);
    }

    #[test]
    fn test_plain_text_title_and_text() {
        let parsed = PlainTextParser
            .parse(Path::new("notes/todo.txt"), b"\n  Groceries  \nmilk\neggs\n")
            .unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Groceries"));
        assert!(parsed.text.contains("milk"));
        assert!(!parsed.needs_ocr());
    }

    #[test]
    fn test_markdown_title_comes_from_heading() {
        let parsed = PlainTextParser
            .parse(Path::new("README.md"), b"## Project Atlas\n\nBody")
            .unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Project Atlas"));

        let untitled = PlainTextParser
            .parse(Path::new("notes.md"), b"Just a paragraph")
            .unwrap();
        assert_eq!(untitled.title, None);
    }

    #[test]
    fn test_binary_content_is_rejected() {
        let err = PlainTextParser
            .parse(Path::new("blob.txt"), &[0x50, 0x00, 0x01])
            .unwrap_err();
        assert!(matches!(err, ParseError::Binary { .. }));
    }

    #[test]
    fn test_image_requests_whole_file_ocr() {
        let parsed = ImageParser
            .parse(Path::new("scan.png"), &[0x89, b'P', b'N', b'G'])
            .unwrap();
        assert!(parsed.text.is_empty());
        assert_eq!(parsed.ocr_regions, vec![OcrRegion::whole_file()]);
    }

    #[test]
    fn test_registry_dispatch_and_override() {
        struct Upper;
        impl Parser for Upper {
            fn name(&self) -> &'static str {
                "upper"
            }
            fn extensions(&self) -> &[&'static str] {
                &["txt"]
            }
            fn parse(&self, _: &Path, bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
                Ok(ParsedDocument::from_text(
                    String::from_utf8_lossy(bytes).to_uppercase(),
                ))
            }
        }

        let mut registry = ParserRegistry::with_defaults();
        assert!(registry.supports(".PNG"));
        assert!(!registry.supports("pdf"));

        registry.register(Arc::new(Upper));
        let parsed = registry.parse(Path::new("a.TXT"), b"hello").unwrap();
        assert_eq!(parsed.text, "HELLO");

        let err = registry.parse(Path::new("a.pdf"), b"%PDF").unwrap_err();
        assert!(matches!(err, ParseError::Unsupported { extension } if extension == "pdf"));
    }
}
