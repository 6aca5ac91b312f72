use hindsight_schemas::UnitId;
use std::collections::HashMap;

use crate::strategies::RankedList;

/// Reciprocal Rank Fusion constant.
pub const RRF_K: f32 = 60.0;

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub id: UnitId,
    pub score: f32,
    /// Best (lowest) rank the unit held in any input list; tie-breaker.
    pub best_rank: usize,
}

/// Fuse ranked lists with RRF: a unit's score is the sum of
/// `1 / (k + rank)` over the lists containing it (1-based ranks);
/// absence contributes zero. Ties break by best single-list rank, then
/// id. The fused order depends only on the multiset of input lists.
pub fn rrf_fuse(lists: &[RankedList]) -> Vec<FusedHit> {
    let mut fused: HashMap<UnitId, FusedHit> = HashMap::new();

    for list in lists {
        for (index, hit) in list.iter().enumerate() {
            let rank = index + 1;
            let entry = fused.entry(hit.id.clone()).or_insert(FusedHit {
                id: hit.id.clone(),
                score: 0.0,
                best_rank: rank,
            });
            entry.score += 1.0 / (RRF_K + rank as f32);
            entry.best_rank = entry.best_rank.min(rank);
        }
    }

    let mut hits: Vec<FusedHit> = fused.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.best_rank.cmp(&b.best_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits
}
