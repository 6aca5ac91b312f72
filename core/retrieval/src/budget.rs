use hindsight_schemas::MemoryUnit;

use crate::tokenizer::count_tokens;

/// Keep the highest-ranked prefix whose texts fit in `max_tokens`.
///
/// Traversal is strictly in rank order and stops at the first unit
/// that would overflow; later smaller units are never pulled forward.
/// The top unit is always kept so a successful recall never returns
/// empty-handed, bounding overflow to one unit.
pub fn filter_by_budget(
    ranked: Vec<(MemoryUnit, f32)>,
    max_tokens: usize,
) -> Vec<(MemoryUnit, f32)> {
    let mut kept = Vec::new();
    let mut total = 0usize;

    for (index, (unit, score)) in ranked.into_iter().enumerate() {
        let tokens = count_tokens(&unit.text);
        if index > 0 && total + tokens > max_tokens {
            break;
        }
        total += tokens;
        kept.push((unit, score));
    }
    kept
}
