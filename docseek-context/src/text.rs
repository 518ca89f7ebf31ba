//! Delimiter-driven text chunking.
//!
//! A [`TextChunker`] splits parsed document text into bounded spans. It first
//! tries the most significant delimiter (headings, declarations, blank lines)
//! and falls back to less significant ones (line breaks, spaces) only for
//! segments that are still too large. Adjacent segments are then packed
//! greedily into chunks of at most `max_chunk_length` bytes.
//!
//! Every [`TextChunk`] carries the byte range it covers in the input, so the
//! chunks of one document are contiguous, ordered and non-overlapping:
//!
//! ```
//! use docseek_context::text::TextChunker;
//!
//! let chunker = TextChunker::new(&[r"\n\n", r"\n", r" "], 40).unwrap();
//! let content = "First paragraph of the note.\n\nSecond paragraph, a bit longer than the first.";
//! let chunks = chunker.chunk(content);
//!
//! assert!(chunks.len() > 1);
//! for chunk in &chunks {
//!     assert_eq!(&content[chunk.start..chunk.end], chunk.text);
//! }
//! let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(rebuilt, content);
//! ```
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;

/// Delimiters for prose and Markdown, most significant first.
pub const MARKDOWN_DELIMITERS: &[&str] = &[
    r"(?m)^\s*#{1,6}\s+.*$", // Headings
    r"```",                  // Code fences
    r"\n\n",                 // Paragraphs
    r"(?m)^\s*[-*+]\s+",     // Unordered list items
    r"(?m)^\s*\d+\.\s+",     // Ordered list items
    r"\n",
    r" ",
];

/// Delimiters for source code.
pub const CODE_DELIMITERS: &[&str] = &[
    r"(?m)^(pub\s+)?(struct|enum|trait|impl|fn|class|def|function|interface)\s+\w+",
    r"(?m)^(import|use|from|#include)\s+",
    r"(?m)^(package|namespace|module)\s+",
    r"\n\n",
    r"\n",
    r" ",
];

/// Delimiters for structured data and anything unrecognized.
pub const PLAIN_DELIMITERS: &[&str] = &[r"\n\n", r"\n", r"[.!?]\s", r" "];

const HEADING_PATTERN: &str = r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t#]*$";

/// Pick delimiters suited to the file type of `path`.
///
/// ```
/// use std::path::Path;
/// use docseek_context::text::{get_delimiters_for_path, CODE_DELIMITERS, MARKDOWN_DELIMITERS};
///
/// assert_eq!(get_delimiters_for_path(Path::new("notes/README.md")), MARKDOWN_DELIMITERS);
/// assert_eq!(get_delimiters_for_path(Path::new("src/main.rs")), CODE_DELIMITERS);
/// ```
pub fn get_delimiters_for_path(path: &Path) -> &'static [&'static str] {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("md" | "markdown" | "mdx" | "txt" | "rst" | "org" | "adoc") => MARKDOWN_DELIMITERS,
        Some(
            "rs" | "py" | "js" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "cpp" | "h" | "hpp"
            | "cs" | "rb" | "php" | "swift" | "kt" | "scala" | "sh",
        ) => CODE_DELIMITERS,
        _ => {
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                if filename.starts_with("README") || filename.starts_with("CHANGELOG") {
                    return MARKDOWN_DELIMITERS;
                }
            }
            PLAIN_DELIMITERS
        }
    }
}

/// A bounded span of document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Position of this chunk within the document (0-indexed).
    pub sequence: usize,
    /// Byte offset of the first byte of the chunk in the chunked text.
    pub start: usize,
    /// Byte offset one past the last byte of the chunk.
    pub end: usize,
    pub text: String,
    /// Nearest preceding Markdown heading, when heading tracking is enabled.
    pub section: Option<String>,
}

impl TextChunk {
    /// True when the chunk holds nothing worth embedding.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Rough token estimate: whitespace-separated words.
    pub fn token_estimate(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Splits text into [`TextChunk`]s using an ordered list of delimiter regexes.
#[derive(Debug, Clone)]
pub struct TextChunker {
    delimiters: Vec<Regex>,
    max_chunk_length: usize,
    headings: Option<Regex>,
}

impl TextChunker {
    /// Compile `delimiter_patterns` into a chunker producing chunks of at most
    /// `max_chunk_length` bytes.
    ///
    /// # Errors
    /// Returns the regex error if a pattern does not compile.
    pub fn new(delimiter_patterns: &[&str], max_chunk_length: usize) -> Result<Self, regex::Error> {
        let delimiters = delimiter_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            delimiters,
            max_chunk_length: max_chunk_length.max(1),
            headings: None,
        })
    }

    /// Chunker configured for the file type of `path`. Markdown-like files
    /// also get section tracking.
    pub fn for_path(path: &Path, max_chunk_length: usize) -> Result<Self, regex::Error> {
        let delimiters = get_delimiters_for_path(path);
        let chunker = Self::new(delimiters, max_chunk_length)?;
        if delimiters == MARKDOWN_DELIMITERS {
            chunker.with_section_headings()
        } else {
            Ok(chunker)
        }
    }

    /// Record the nearest preceding Markdown heading on every chunk.
    pub fn with_section_headings(mut self) -> Result<Self, regex::Error> {
        self.headings = Some(Regex::new(HEADING_PATTERN)?);
        Ok(self)
    }

    pub fn max_chunk_length(&self) -> usize {
        self.max_chunk_length
    }

    /// Split `content` into chunks whose concatenation is `content`.
    pub fn chunk(&self, content: &str) -> Vec<TextChunk> {
        let segments = self.split_recursively(content, 0, 0);
        let headings = self.heading_positions(content);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut end = 0;

        for segment in segments {
            if end - start + segment.len() > self.max_chunk_length && start != end {
                chunks.push(self.make_chunk(content, chunks.len(), start..end, &headings));
                start = segment.start;
                end = segment.end;
            } else {
                if start == end {
                    start = segment.start;
                }
                end = segment.end;
            }
        }

        if start != end {
            chunks.push(self.make_chunk(content, chunks.len(), start..end, &headings));
        }

        chunks
    }

    fn make_chunk(
        &self,
        content: &str,
        sequence: usize,
        range: Range<usize>,
        headings: &[(usize, String)],
    ) -> TextChunk {
        let section = headings
            .iter()
            .take_while(|(offset, _)| *offset <= range.start)
            .last()
            .map(|(_, title)| title.clone());

        TextChunk {
            sequence,
            start: range.start,
            end: range.end,
            text: content[range].to_string(),
            section,
        }
    }

    fn heading_positions(&self, content: &str) -> Vec<(usize, String)> {
        let Some(headings) = &self.headings else {
            return Vec::new();
        };
        headings
            .captures_iter(content)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let title = caps.get(1)?.as_str().trim();
                (!title.is_empty()).then(|| (whole.start(), title.to_string()))
            })
            .collect()
    }

    // Returns byte ranges of "atomic" segments: pieces that fit the size limit,
    // delimiter matches, or hard splits once every delimiter has been tried.
    fn split_recursively(
        &self,
        text: &str,
        delimiter_idx: usize,
        offset: usize,
    ) -> Vec<Range<usize>> {
        let mut segments = Vec::new();

        if text.is_empty() {
            return segments;
        }

        if text.len() <= self.max_chunk_length {
            segments.push(offset..offset + text.len());
            return segments;
        }

        if delimiter_idx >= self.delimiters.len() {
            let mut local_start = 0;
            while local_start < text.len() {
                let local_end = hard_split_end(text, local_start, self.max_chunk_length);
                segments.push(offset + local_start..offset + local_end);
                local_start = local_end;
            }
            return segments;
        }

        let delimiter = &self.delimiters[delimiter_idx];
        let mut local_start = 0;

        for mat in delimiter.find_iter(text) {
            if mat.start() == mat.end() {
                continue;
            }
            if mat.start() > local_start {
                segments.extend(self.split_recursively(
                    &text[local_start..mat.start()],
                    delimiter_idx + 1,
                    offset + local_start,
                ));
            }
            segments.extend(self.split_recursively(
                mat.as_str(),
                delimiter_idx + 1,
                offset + mat.start(),
            ));
            local_start = mat.end();
        }

        if local_start < text.len() {
            segments.extend(self.split_recursively(
                &text[local_start..],
                delimiter_idx + 1,
                offset + local_start,
            ));
        }

        segments
    }
}

/// End of a hard split starting at `start`, never cutting a UTF-8 sequence.
fn hard_split_end(text: &str, start: usize, max_len: usize) -> usize {
    let mut end = (start + max_len).min(text.len());
    while end > start && !text.is_char_boundary(end) {
        end -= 1;
    }
    if end == start {
        // A single character wider than the limit.
        end = start + 1;
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(content: &str, chunks: &[TextChunk]) {
        let mut expected_start = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
            assert_eq!(chunk.start, expected_start);
            assert_eq!(&content[chunk.start..chunk.end], chunk.text);
            expected_start = chunk.end;
        }
        assert_eq!(expected_start, content.len());
    }

    #[test]
    fn test_long_prose_splits_within_limit() {
        let content = (0..100)
            .map(|_| "This is a test sentence. ")
            .collect::<String>();
        let chunker = TextChunker::new(MARKDOWN_DELIMITERS, 500).unwrap();
        let chunks = chunker.chunk(&content);

        let optimal = content.len() / 500 + 1;
        assert!(chunks.len() >= optimal - 1);
        assert!(chunks.len() <= optimal + 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 500);
        }
        assert_contiguous(&content, &chunks);
    }

    #[test]
    fn test_short_content_is_one_chunk() {
        let content = "A very short note.";
        let chunker = TextChunker::new(MARKDOWN_DELIMITERS, 500).unwrap();
        let chunks = chunker.chunk(content);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, content);
        assert_eq!((chunks[0].start, chunks[0].end), (0, content.len()));
    }

    #[test]
    fn test_empty_content_has_no_chunks() {
        let chunker = TextChunker::new(MARKDOWN_DELIMITERS, 500).unwrap();
        assert!(chunker.chunk("").is_empty());
    }

    #[test]
    fn test_multibyte_text_never_splits_inside_a_character() {
        // No delimiters at all, so everything goes through the hard split.
        let content = "é".repeat(50) + &"日本語".repeat(20);
        let chunker = TextChunker::new(&[], 7).unwrap();
        let chunks = chunker.chunk(&content);

        assert!(chunks.len() > 1);
        assert_contiguous(&content, &chunks);
    }

    #[test]
    fn test_markdown_sections_follow_headings() {
        let content = format!(
            "# Intro\n\n{}\n\n## Details\n\n{}\n",
            "Opening words. ".repeat(10),
            "Closing words. ".repeat(10)
        );
        let chunker = TextChunker::for_path(Path::new("notes.md"), 120).unwrap();
        let chunks = chunker.chunk(&content);

        assert_contiguous(&content, &chunks);
        let closing = chunks
            .iter()
            .rev()
            .find(|c| c.text.contains("Closing"))
            .unwrap();
        assert_eq!(closing.section.as_deref(), Some("Details"));
        let opening = chunks.iter().find(|c| c.text.contains("Opening")).unwrap();
        assert_eq!(opening.section.as_deref(), Some("Intro"));
    }

    #[test]
    fn test_code_files_use_code_delimiters() {
        assert_eq!(get_delimiters_for_path(Path::new("lib.RS")), CODE_DELIMITERS);
        assert_eq!(get_delimiters_for_path(Path::new("data.csv")), PLAIN_DELIMITERS);
        assert_eq!(
            get_delimiters_for_path(Path::new("CHANGELOG")),
            MARKDOWN_DELIMITERS
        );
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(TextChunker::new(&["("], 10).is_err());
    }
}
