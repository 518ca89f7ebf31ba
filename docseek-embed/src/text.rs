//! Text preparation applied before tokenization.

pub const QUERY_PREFIX: &str = "query: ";
pub const PASSAGE_PREFIX: &str = "passage: ";

/// Remove characters that break tokenizers and map whitespace to spaces.
///
/// Drops NUL, U+FFFD and control, format and private-use characters. Tab,
/// newline and carriage return count as whitespace, so every whitespace
/// character becomes a single `' '` (runs are not collapsed).
///
/// ```
/// use docseek_embed::text::clean_text;
///
/// assert_eq!(clean_text("a\tb\u{0}c\u{200B}d\u{FFFD}"), "a bcd");
/// ```
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if c == '\0' || c == '\u{FFFD}' || is_control(c) {
                None
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                Some(c)
            }
        })
        .collect()
}

fn is_control(c: char) -> bool {
    if matches!(c, '\t' | '\n' | '\r') {
        return false;
    }
    c.is_control() || is_format(c) || is_private_use(c)
}

// Unicode general category Cf.
fn is_format(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{110BD}'
            | '\u{110CD}'
            | '\u{13430}'..='\u{1343F}'
            | '\u{1BCA0}'..='\u{1BCA3}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
    )
}

// Unicode general category Co.
fn is_private_use(c: char) -> bool {
    matches!(
        c,
        '\u{E000}'..='\u{F8FF}' | '\u{F0000}'..='\u{FFFFD}' | '\u{100000}'..='\u{10FFFD}'
    )
}

/// Prepare a search query for the model.
pub fn prepare_query(query: &str, e5: bool) -> String {
    let cleaned = clean_text(query);
    if e5 {
        format!("{QUERY_PREFIX}{cleaned}")
    } else {
        cleaned
    }
}

/// Prepare a document passage for the model.
pub fn prepare_passage(passage: &str, e5: bool) -> String {
    let cleaned = clean_text(passage);
    if e5 {
        format!("{PASSAGE_PREFIX}{cleaned}")
    } else {
        cleaned
    }
}

/// Strip a leading query or passage prefix, if any.
pub fn strip_prefix(text: &str) -> &str {
    text.strip_prefix(QUERY_PREFIX)
        .or_else(|| text.strip_prefix(PASSAGE_PREFIX))
        .unwrap_or(text)
}
