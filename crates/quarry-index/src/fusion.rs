//! Reciprocal Rank Fusion of the lexical and vector rankings.
//!
//! A unit at 1-based rank `r` in a list contributes `1 / (k + r)`. Contributions
//! from both lists are summed; a unit absent from a list gets nothing from it.

use std::collections::HashMap;

pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub unit_id: String,
    /// 1-based rank in the lexical list, if the unit matched lexically.
    pub lexical_rank: Option<usize>,
    /// 1-based rank in the vector list, if the unit was in the top K.
    pub vector_rank: Option<usize>,
    pub fused_score: f64,
}

fn sanitize_k(k: f64) -> f64 {
    if k.is_finite() && k >= 0.0 { k } else { DEFAULT_RRF_K }
}

#[allow(clippy::cast_precision_loss)]
fn contribution(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// Fuse two ranked id lists and return the best `limit` results.
///
/// Ordering is fused score descending, then unit id ascending, so equal
/// inputs always produce the same output. A repeated id within one list
/// counts only at its first (best) rank.
#[must_use]
pub fn reciprocal_rank_fusion<L, V>(lexical: &[L], vector: &[V], k: f64, limit: usize) -> Vec<SearchResult>
where
    L: AsRef<str>,
    V: AsRef<str>,
{
    let k = sanitize_k(k);
    let mut fused: HashMap<&str, SearchResult> = HashMap::with_capacity(lexical.len() + vector.len());

    for (i, id) in lexical.iter().enumerate() {
        let rank = i + 1;
        let hit = fused.entry(id.as_ref()).or_insert_with(|| SearchResult {
            unit_id: id.as_ref().to_owned(),
            lexical_rank: None,
            vector_rank: None,
            fused_score: 0.0,
        });
        if hit.lexical_rank.is_none() {
            hit.lexical_rank = Some(rank);
            hit.fused_score += contribution(k, rank);
        }
    }
    for (i, id) in vector.iter().enumerate() {
        let rank = i + 1;
        let hit = fused.entry(id.as_ref()).or_insert_with(|| SearchResult {
            unit_id: id.as_ref().to_owned(),
            lexical_rank: None,
            vector_rank: None,
            fused_score: 0.0,
        });
        if hit.vector_rank.is_none() {
            hit.vector_rank = Some(rank);
            hit.fused_score += contribution(k, rank);
        }
    }

    let mut results: Vec<SearchResult> = fused.into_values().collect();
    sort_results(&mut results);
    results.truncate(limit);
    tracing::debug!(
        lexical = lexical.len(),
        vector = vector.len(),
        returned = results.len(),
        "rrf fusion"
    );
    results
}

/// Fused score descending, unit id ascending.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });
}
