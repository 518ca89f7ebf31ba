//! Search helpers shared by the storage backends.
//!
//! [`fusion`] holds the application-level hybrid ranker. The functions in
//! this module are the brute-force fallbacks a backend runs when its native
//! keyword or vector query path is unavailable. They only use the
//! [`StorageAdapter`] document and chunk accessors, so they work the same on
//! every backend.

pub mod fusion;

use crate::storage::vector::cosine_similarity;
use crate::storage::{
    Document, DocumentChunk, DocumentFilters, MatchType, SearchResult, StorageAdapter, StoreResult,
};

/// Lower-cased alphanumeric terms of a keyword query.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Number of occurrences of `terms` in `text`, case-insensitive.
///
/// A query without alphanumeric terms matches the trimmed query as a whole.
pub fn substring_score(text: &str, query: &str, terms: &[String]) -> f64 {
    let haystack = text.to_lowercase();
    if terms.is_empty() {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return 0.0;
        }
        return haystack.matches(needle.as_str()).count() as f64;
    }
    terms
        .iter()
        .map(|term| haystack.matches(term.as_str()).count() as f64)
        .sum()
}

/// Build the result record for a chunk of `doc`.
pub fn chunk_result(
    doc: &Document,
    chunk: &DocumentChunk,
    score: f64,
    match_type: MatchType,
) -> SearchResult {
    SearchResult {
        chunk_id: chunk.id.clone(),
        document_id: doc.id.clone(),
        file_path: doc.file_path.clone(),
        file_name: doc.file_name.clone(),
        chunk_index: chunk.chunk_index,
        text: chunk.text.clone(),
        page: chunk.page,
        section: chunk.section.clone(),
        score,
        match_type,
    }
}

/// Sort best first (ties by chunk id) and keep `limit` results.
pub fn rank_top(mut results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(limit);
    results
}

/// Case-insensitive substring scan over every chunk of the filtered
/// documents.
pub async fn brute_force_keyword<S: StorageAdapter + ?Sized>(
    store: &S,
    query: &str,
    filters: &DocumentFilters,
    limit: usize,
) -> StoreResult<Vec<SearchResult>> {
    let terms = keyword_terms(query);
    let mut results = Vec::new();
    for doc in store.list_documents(filters, None, 0).await? {
        for chunk in store.get_chunks(&doc.id).await? {
            let score = substring_score(&chunk.text, query, &terms);
            if score > 0.0 {
                results.push(chunk_result(&doc, &chunk, score, MatchType::Keyword));
            }
        }
    }
    Ok(rank_top(results, limit))
}

/// Linear cosine scan over every embedded chunk of the filtered documents.
/// Vectors of a different width than `embedding` are skipped.
pub async fn brute_force_semantic<S: StorageAdapter + ?Sized>(
    store: &S,
    embedding: &[f32],
    filters: &DocumentFilters,
    limit: usize,
) -> StoreResult<Vec<SearchResult>> {
    let mut results = Vec::new();
    for doc in store.list_documents(filters, None, 0).await? {
        for chunk in store.get_chunks(&doc.id).await? {
            if let Some(vector) = chunk.embedding.as_ref().filter(|v| v.len() == embedding.len()) {
                let score = cosine_similarity(embedding, vector) as f64;
                results.push(chunk_result(&doc, &chunk, score, MatchType::Semantic));
            }
        }
    }
    Ok(rank_top(results, limit))
}

/// Outcome of a fallback scan: its results, or an empty list with a warning.
pub fn degrade(kind: &str, outcome: StoreResult<Vec<SearchResult>>) -> Vec<SearchResult> {
    match outcome {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!("Fallback {} search failed, returning no results: {}", kind, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_terms() {
        assert_eq!(keyword_terms("Rust, async-trait!"), vec!["rust", "async", "trait"]);
        assert_eq!(keyword_terms("a b A"), vec!["a", "b"]);
        assert!(keyword_terms("  ?? ").is_empty());
    }

    #[test]
    fn test_substring_score_counts_terms() {
        let terms = keyword_terms("tokio runtime");
        let score = substring_score("Tokio is a runtime; tokio schedules tasks", "", &terms);
        assert_eq!(score, 3.0);
        assert_eq!(substring_score("nothing here", "", &terms), 0.0);
    }

    #[test]
    fn test_substring_score_without_terms_matches_raw_query() {
        assert_eq!(substring_score("a ++ b ++ c", "++", &[]), 2.0);
        assert_eq!(substring_score("abc", "   ", &[]), 0.0);
    }

    #[test]
    fn test_rank_top_breaks_ties_by_chunk_id() {
        let make = |id: &str, score: f64| SearchResult {
            chunk_id: id.to_string(),
            document_id: "d".into(),
            file_path: "f".into(),
            file_name: "f".into(),
            chunk_index: 0,
            text: String::new(),
            page: None,
            section: None,
            score,
            match_type: MatchType::Keyword,
        };
        let ranked = rank_top(vec![make("b", 1.0), make("a", 1.0), make("c", 2.0)], 2);
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
