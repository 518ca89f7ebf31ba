//! Turning file contents into indexable text.
//!
//! - [`text`]: recursive, delimiter-driven chunking that keeps byte offsets
//!   into the parsed text.
//! - [`parser`]: the parser contract and the registry that maps file
//!   extensions to parsers, plus the built-in plain-text and image parsers.
pub mod parser;
pub mod text;

pub use parser::{
    ImageParser, OcrRegion, PageMap, ParseError, ParsedDocument, Parser, ParserRegistry,
    PlainTextParser,
};
pub use text::{TextChunk, TextChunker, get_delimiters_for_path};
