use anyhow::Result;
use chrono::Duration;
use hindsight_schemas::{
    BankId, Edge, EntityId, FactType, LinkType, MemoryUnit, TimeRange, UnitId,
};
use hindsight_storage::Database;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::extractor::ExtractedFact;

pub const SEMANTIC_LINK_THRESHOLD: f32 = 0.7;
pub const MAX_SEMANTIC_LINKS: usize = 5;
pub const MAX_TEMPORAL_LINKS: usize = 10;
pub const TEMPORAL_WINDOW_HOURS: i64 = 24;

/// Weight-1.0 bidirectional edges between units sharing an entity:
/// every pair of new units, and each new unit against each existing
/// unit already mentioning it.
pub fn create_entity_edges(
    db: &Database,
    new_unit_ids: &[UnitId],
    entity_ids: &[EntityId],
) -> Result<usize> {
    let new_set: HashSet<&UnitId> = new_unit_ids.iter().collect();
    let mut linked: HashSet<(UnitId, UnitId)> = HashSet::new();
    let mut created = 0;

    for entity_id in entity_ids {
        let mentioning = db.units_mentioning(entity_id)?;
        for a in &mentioning {
            if !new_set.contains(a) {
                continue;
            }
            for b in &mentioning {
                if a == b {
                    continue;
                }
                let key = if a < b {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                if !linked.insert(key) {
                    continue;
                }
                db.add_edge(&Edge {
                    src: a.clone(),
                    dst: b.clone(),
                    link_type: LinkType::Entity,
                    weight: 1.0,
                    causal_kind: None,
                })?;
                created += 1;
            }
        }
    }
    Ok(created)
}

/// Symmetric edges to the closest neighbours by cosine similarity,
/// weighted by the similarity itself. Capped to avoid quadratic blow-up
/// on large ingests.
pub fn create_semantic_edges(db: &Database, bank_id: &BankId, unit: &MemoryUnit) -> Result<usize> {
    let types: BTreeSet<FactType> = [FactType::World, FactType::Bank, FactType::Opinion]
        .into_iter()
        .collect();
    let neighbours = db.vector_knn(
        bank_id,
        &types,
        &unit.embedding,
        MAX_SEMANTIC_LINKS + 1,
        SEMANTIC_LINK_THRESHOLD,
    )?;

    let mut created = 0;
    for scored in neighbours {
        if scored.unit.id == unit.id {
            continue;
        }
        if created >= MAX_SEMANTIC_LINKS {
            break;
        }
        db.add_edge(&Edge {
            src: unit.id.clone(),
            dst: scored.unit.id,
            link_type: LinkType::Semantic,
            weight: scored.score.min(1.0),
            causal_kind: None,
        })?;
        created += 1;
    }
    Ok(created)
}

/// Edges to units learned within the 24-hour window around this one,
/// weight decaying linearly with the gap down to the 0.3 floor.
pub fn create_temporal_edges(db: &Database, bank_id: &BankId, unit: &MemoryUnit) -> Result<usize> {
    let window = TimeRange::new(
        unit.mentioned_at - Duration::hours(TEMPORAL_WINDOW_HOURS),
        unit.mentioned_at + Duration::hours(TEMPORAL_WINDOW_HOURS),
    );
    let mut nearby = db.units_mentioned_between(bank_id, &window)?;
    nearby.retain(|(id, _)| id != &unit.id);
    // Closest in time first.
    nearby.sort_by_key(|(_, mentioned)| {
        (*mentioned - unit.mentioned_at).num_seconds().abs()
    });

    let window_seconds = (TEMPORAL_WINDOW_HOURS * 3600) as f32;
    let mut created = 0;
    for (other_id, mentioned) in nearby.into_iter().take(MAX_TEMPORAL_LINKS) {
        let gap_seconds = (mentioned - unit.mentioned_at).num_seconds().abs() as f32;
        let weight = (1.0 - gap_seconds / window_seconds).max(0.3);
        db.add_edge(&Edge {
            src: unit.id.clone(),
            dst: other_id,
            link_type: LinkType::Temporal,
            weight,
            causal_kind: None,
        })?;
        created += 1;
    }
    Ok(created)
}

/// Directed weight-1.0 edges from the in-batch causal hints.
pub fn create_causal_edges(
    db: &Database,
    unit_ids: &[UnitId],
    facts: &[ExtractedFact],
) -> Result<usize> {
    let mut created = 0;
    for (index, fact) in facts.iter().enumerate() {
        let Some(src) = unit_ids.get(index) else {
            continue;
        };
        for hint in &fact.causal_relations {
            let Some(dst) = unit_ids.get(hint.target_index) else {
                debug!(
                    "causal hint from fact {} points outside the batch ({})",
                    index, hint.target_index
                );
                continue;
            };
            if src == dst {
                continue;
            }
            db.add_edge(&Edge {
                src: src.clone(),
                dst: dst.clone(),
                link_type: LinkType::Causal,
                weight: 1.0,
                causal_kind: Some(hint.kind),
            })?;
            created += 1;
        }
    }
    Ok(created)
}
