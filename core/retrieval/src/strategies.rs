use anyhow::Result;
use hindsight_schemas::{BankId, FactType, TimeRange, UnitId};
use hindsight_storage::{Database, Neighbor};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::spreading::{spread, NeighborProvider, Seed, SpreadingConfig};

/// One entry of a strategy's ranked output.
#[derive(Debug, Clone)]
pub struct StrategyHit {
    pub id: UnitId,
    pub score: f32,
}

pub type RankedList = Vec<StrategyHit>;

/// Similarity floor shared by the semantic strategy and graph seeding.
pub const MIN_SEED_SIMILARITY: f32 = 0.3;

impl NeighborProvider for Database {
    fn neighbors_of(&self, id: &UnitId) -> Result<Vec<Neighbor>> {
        self.neighbors(id, None)
    }
}

/// Nearest neighbours of the query embedding, ranked by similarity.
pub async fn semantic_strategy(
    db: &Arc<Mutex<Database>>,
    bank_id: &BankId,
    types: &BTreeSet<FactType>,
    query_embedding: &[f32],
    k: usize,
) -> Result<RankedList> {
    let db = db.lock().await;
    let hits = db.vector_knn(bank_id, types, query_embedding, k, MIN_SEED_SIMILARITY)?;
    Ok(hits
        .into_iter()
        .map(|s| StrategyHit {
            id: s.unit.id,
            score: s.score,
        })
        .collect())
}

/// BM25 keyword hits, ranked by score.
pub async fn keyword_strategy(
    db: &Arc<Mutex<Database>>,
    bank_id: &BankId,
    types: &BTreeSet<FactType>,
    query: &str,
    k: usize,
) -> Result<RankedList> {
    let db = db.lock().await;
    let hits = db.keyword_search(bank_id, types, query, k)?;
    Ok(hits
        .into_iter()
        .map(|s| StrategyHit {
            id: s.unit.id,
            score: s.score,
        })
        .collect())
}

/// Spreading activation from semantically similar seeds.
///
/// Seed count is `min(20, budget / 5)`; seeds activate at their query
/// similarity and the walk is bounded by `config.max_visits`.
pub async fn graph_strategy(
    db: &Arc<Mutex<Database>>,
    bank_id: &BankId,
    types: &BTreeSet<FactType>,
    query_embedding: &[f32],
    config: &SpreadingConfig,
) -> Result<RankedList> {
    let seed_count = (config.max_visits / 5).clamp(1, 20);

    let db = db.lock().await;
    let seeds: Vec<Seed> = db
        .vector_knn(
            bank_id,
            types,
            query_embedding,
            seed_count,
            MIN_SEED_SIMILARITY,
        )?
        .into_iter()
        .map(|s| Seed {
            id: s.unit.id,
            activation: s.score,
        })
        .collect();

    if seeds.is_empty() {
        return Ok(Vec::new());
    }
    debug!("graph strategy: {} seeds", seeds.len());

    let activated = spread(&*db, &seeds, config, |_| Ok(true))?;
    filter_to_types(&db, activated, types)
}

/// Spreading activation restricted to a temporal neighbourhood.
///
/// Seeds are every unit overlapping the parsed range, at activation
/// 1.0. Neighbours are retained only when their occurred interval
/// still overlaps the range broadened by `broaden_days`, so the walk
/// picks up time-adjacent context without drifting across months.
pub async fn temporal_strategy(
    db: &Arc<Mutex<Database>>,
    bank_id: &BankId,
    types: &BTreeSet<FactType>,
    range: &TimeRange,
    config: &SpreadingConfig,
    broaden_days: i64,
) -> Result<RankedList> {
    let db = db.lock().await;
    let seeds: Vec<Seed> = db
        .range_lookup(bank_id, types, range)?
        .into_iter()
        .map(|unit| Seed {
            id: unit.id,
            activation: 1.0,
        })
        .collect();

    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let broadened = range.broaden(broaden_days);
    let mut occurred_cache: HashMap<UnitId, bool> = HashMap::new();
    let activated = spread(&*db, &seeds, config, |id| {
        if let Some(&keep) = occurred_cache.get(id) {
            return Ok(keep);
        }
        let keep = match db.get_unit(id)? {
            Some(unit) => unit
                .occurred()
                .map(|(start, end)| broadened.overlaps_occurred(start, end))
                .unwrap_or(false),
            None => false,
        };
        occurred_cache.insert(id.clone(), keep);
        Ok(keep)
    })?;
    filter_to_types(&db, activated, types)
}

/// The walk may reach units outside the requested fact types; drop them
/// from the ranked output without disturbing order.
fn filter_to_types(
    db: &Database,
    activated: Vec<crate::spreading::ActivatedNode>,
    types: &BTreeSet<FactType>,
) -> Result<RankedList> {
    let mut list = Vec::with_capacity(activated.len());
    for node in activated {
        if let Some(unit) = db.get_unit(&node.id)? {
            if types.contains(&unit.fact_type) {
                list.push(StrategyHit {
                    id: node.id,
                    score: node.activation,
                });
            }
        }
    }
    Ok(list)
}
