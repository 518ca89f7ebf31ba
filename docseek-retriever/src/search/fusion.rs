//! Reciprocal Rank Fusion of keyword and semantic result lists.
//!
//! ```text
//! score(chunk) = w_s / (k + rank_s) + w_k / (k + rank_k)
//! ```
//!
//! Ranks are 1-based positions in each list; a chunk absent from a list gets
//! no contribution from it. With non-negative weights a chunk found by both
//! searches always beats a chunk found by only one of them at the same rank.

use crate::storage::{
    DocumentFilters, HybridWeights, MatchType, SearchResult, StorageAdapter, StoreResult,
};
use std::collections::HashMap;

/// Standard RRF constant from Cormack, Clarke and Buettcher (SIGIR 2009).
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Each component search fetches this many times the requested limit.
pub const CANDIDATE_MULTIPLIER: usize = 5;

struct Fused {
    result: SearchResult,
    semantic_rank: Option<usize>,
    keyword_rank: Option<usize>,
}

/// Fuse two ranked lists into at most `limit` results, best first.
pub fn reciprocal_rank_fusion(
    semantic: &[SearchResult],
    keyword: &[SearchResult],
    weights: HybridWeights,
    rrf_k: f64,
    limit: usize,
) -> Vec<SearchResult> {
    let mut fused: HashMap<&str, Fused> = HashMap::new();

    for (rank, result) in semantic.iter().enumerate() {
        fused
            .entry(result.chunk_id.as_str())
            .or_insert_with(|| Fused {
                result: result.clone(),
                semantic_rank: None,
                keyword_rank: None,
            })
            .semantic_rank
            .get_or_insert(rank + 1);
    }

    for (rank, result) in keyword.iter().enumerate() {
        fused
            .entry(result.chunk_id.as_str())
            .or_insert_with(|| Fused {
                result: result.clone(),
                semantic_rank: None,
                keyword_rank: None,
            })
            .keyword_rank
            .get_or_insert(rank + 1);
    }

    let mut results: Vec<SearchResult> = fused
        .into_values()
        .map(|entry| {
            let semantic_score = entry
                .semantic_rank
                .map_or(0.0, |r| weights.semantic / (rrf_k + r as f64));
            let keyword_score = entry
                .keyword_rank
                .map_or(0.0, |r| weights.keyword / (rrf_k + r as f64));
            let match_type = match (entry.semantic_rank, entry.keyword_rank) {
                (Some(_), Some(_)) => MatchType::Hybrid,
                (Some(_), None) => MatchType::Semantic,
                _ => MatchType::Keyword,
            };
            SearchResult {
                score: semantic_score + keyword_score,
                match_type,
                ..entry.result
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(limit);
    results
}

/// Application-level hybrid search over any adapter: run both searches with
/// an inflated limit, then fuse.
pub async fn hybrid_search<S: StorageAdapter + ?Sized>(
    store: &S,
    query: &str,
    embedding: &[f32],
    filters: &DocumentFilters,
    limit: usize,
    weights: HybridWeights,
    rrf_k: f64,
) -> StoreResult<Vec<SearchResult>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let candidates = limit.saturating_mul(CANDIDATE_MULTIPLIER);
    let semantic = store.search_semantic(embedding, filters, candidates).await?;
    let keyword = store.search_keyword(query, filters, candidates).await?;

    tracing::debug!(
        "Fusing {} semantic and {} keyword candidates (k = {})",
        semantic.len(),
        keyword.len(),
        rrf_k
    );
    Ok(reciprocal_rank_fusion(
        &semantic, &keyword, weights, rrf_k, limit,
    ))
}
