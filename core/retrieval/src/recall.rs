use anyhow::Result;
use chrono::{DateTime, Utc};
use hindsight_models::{CrossEncoder, EmbeddingClient};
use hindsight_schemas::{
    EngineError, EntityObservation, FactType, MemoryUnit, RecallRequest, RecallResponse,
    ResultItem, StrategyTrace, TraceInfo, UnitId,
};
use hindsight_storage::Database;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::budget::filter_by_budget;
use crate::fusion::rrf_fuse;
use crate::reranker::{RerankCandidate, RerankHandle};
use crate::spreading::SpreadingConfig;
use crate::strategies::{
    graph_strategy, keyword_strategy, semantic_strategy, temporal_strategy, RankedList,
};
use crate::temporal::TemporalParser;
use crate::tokenizer::count_tokens;

/// Timeouts and tuning for a recall pipeline instance.
#[derive(Debug, Clone)]
pub struct RecallConfig {
    pub embed_timeout: Duration,
    /// Applies to the semantic and keyword strategies individually.
    pub strategy_timeout: Duration,
    /// Wall-clock bound for each spreading walk, regardless of budget.
    pub graph_timeout: Duration,
    pub rerank_timeout: Duration,
    pub decay: f32,
    pub min_activation: f32,
    pub max_hops: u32,
    pub temporal_hops: u32,
    pub broaden_days: i64,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            embed_timeout: Duration::from_secs(2),
            strategy_timeout: Duration::from_millis(500),
            graph_timeout: Duration::from_secs(1),
            rerank_timeout: Duration::from_millis(800),
            decay: 0.8,
            min_activation: 0.05,
            max_hops: 5,
            temporal_hops: 3,
            broaden_days: 30,
        }
    }
}

enum StrategyStatus {
    Completed,
    TimedOut,
    Failed,
}

struct StrategyOutcome {
    name: &'static str,
    list: RankedList,
    status: StrategyStatus,
    elapsed_ms: u64,
}

impl StrategyOutcome {
    fn ok(&self) -> bool {
        matches!(self.status, StrategyStatus::Completed)
    }
}

async fn run_strategy(
    name: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<RankedList>>,
) -> StrategyOutcome {
    let started = Instant::now();
    let (list, status) = match tokio::time::timeout(limit, fut).await {
        Ok(Ok(list)) => (list, StrategyStatus::Completed),
        Ok(Err(e)) => {
            warn!("{} strategy failed: {}", name, e);
            (Vec::new(), StrategyStatus::Failed)
        }
        Err(_) => {
            warn!("{} strategy timed out after {:?}", name, limit);
            (Vec::new(), StrategyStatus::TimedOut)
        }
    };
    StrategyOutcome {
        name,
        list,
        status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// The recall pipeline: four strategies in parallel, RRF fusion,
/// cross-encoder rerank, token budget truncation.
pub struct RecallEngine {
    db: Arc<Mutex<Database>>,
    embedder: Arc<dyn EmbeddingClient>,
    reranker: RerankHandle,
    parser: TemporalParser,
    config: RecallConfig,
}

impl RecallEngine {
    /// Must be called from within a tokio runtime; the rerank worker is
    /// spawned here.
    pub fn new(
        db: Arc<Mutex<Database>>,
        embedder: Arc<dyn EmbeddingClient>,
        encoder: Arc<dyn CrossEncoder>,
        config: RecallConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            reranker: RerankHandle::spawn(encoder),
            parser: TemporalParser::new(),
            config,
        }
    }

    pub async fn recall(&self, request: &RecallRequest) -> Result<RecallResponse, EngineError> {
        self.recall_at(request, Utc::now()).await
    }

    /// Recall with an explicit clock, so temporal resolution is
    /// reproducible.
    pub async fn recall_at(
        &self,
        request: &RecallRequest,
        now: DateTime<Utc>,
    ) -> Result<RecallResponse, EngineError> {
        validate(request)?;

        {
            let db = self.db.lock().await;
            let exists = db
                .bank_exists(&request.bank_id)
                .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
            if !exists {
                return Err(EngineError::NotFound(format!("bank {}", request.bank_id)));
            }
        }

        let range = self.parser.parse(&request.query, now);
        if let Some(range) = &range {
            debug!("temporal constraint detected: {}", range);
        }

        // Seed phase: an unusable embedding fails the whole call.
        let query_embedding =
            match tokio::time::timeout(self.config.embed_timeout, self.embedder.embed(&request.query))
                .await
            {
                Ok(Ok(embedding)) => embedding,
                Ok(Err(e)) => return Err(EngineError::EmbedUnavailable(e.to_string())),
                Err(_) => {
                    return Err(EngineError::EmbedUnavailable("embedding timed out".into()))
                }
            };

        let visit_budget = request.budget.visit_budget();
        let k = visit_budget * 4;
        let graph_config = SpreadingConfig {
            max_visits: visit_budget,
            decay: self.config.decay,
            max_hops: self.config.max_hops,
            min_activation: self.config.min_activation,
        };
        let temporal_config = SpreadingConfig {
            max_hops: self.config.temporal_hops,
            ..graph_config.clone()
        };

        let (semantic, keyword, graph, temporal) = tokio::join!(
            run_strategy(
                "semantic",
                self.config.strategy_timeout,
                semantic_strategy(
                    &self.db,
                    &request.bank_id,
                    &request.types,
                    &query_embedding,
                    k
                ),
            ),
            run_strategy(
                "keyword",
                self.config.strategy_timeout,
                keyword_strategy(&self.db, &request.bank_id, &request.types, &request.query, k),
            ),
            run_strategy(
                "graph",
                self.config.graph_timeout,
                graph_strategy(
                    &self.db,
                    &request.bank_id,
                    &request.types,
                    &query_embedding,
                    &graph_config
                ),
            ),
            async {
                match &range {
                    Some(range) => Some(
                        run_strategy(
                            "temporal",
                            self.config.graph_timeout,
                            temporal_strategy(
                                &self.db,
                                &request.bank_id,
                                &request.types,
                                range,
                                &temporal_config,
                                self.config.broaden_days,
                            ),
                        )
                        .await,
                    ),
                    None => None,
                }
            }
        );

        // Usability gate: fused output needs at least one of the flat
        // strategies to have completed.
        if !semantic.ok() && !keyword.ok() {
            let timed_out = matches!(semantic.status, StrategyStatus::TimedOut)
                || matches!(keyword.status, StrategyStatus::TimedOut);
            return Err(if timed_out {
                EngineError::DeadlineExceeded
            } else {
                EngineError::CoreUnavailable("semantic and keyword strategies failed".into())
            });
        }

        let mut warnings = Vec::new();
        let mut outcomes = vec![semantic, keyword, graph];
        if let Some(temporal) = temporal {
            outcomes.push(temporal);
        }
        for outcome in &outcomes {
            if !outcome.ok() {
                warnings.push(format!("{}_unavailable", outcome.name));
            }
        }

        let lists: Vec<RankedList> = outcomes.iter().map(|o| o.list.clone()).collect();
        let mut fused = rrf_fuse(&lists);
        fused.truncate(k);
        let fused_count = fused.len();

        // Materialise candidates; with a temporal constraint, dated
        // units outside the broadened range are dropped (undated units
        // pass through).
        let fused_scores: HashMap<UnitId, f32> =
            fused.iter().map(|h| (h.id.clone(), h.score)).collect();
        let ids: Vec<UnitId> = fused.iter().map(|h| h.id.clone()).collect();
        let mut candidates: Vec<(MemoryUnit, f32)> = {
            let db = self.db.lock().await;
            db.get_many(&ids)
                .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?
                .into_iter()
                .filter(|unit| match (&range, unit.occurred()) {
                    (Some(range), Some((start, end))) => range
                        .broaden(self.config.broaden_days)
                        .overlaps_occurred(start, end),
                    _ => true,
                })
                .map(|unit| {
                    let score = fused_scores.get(&unit.id).copied().unwrap_or(0.0);
                    (unit, score)
                })
                .collect()
        };

        // Rerank, failing open to the fused order.
        let rerank_candidates: Vec<RerankCandidate> = candidates
            .iter()
            .map(|(unit, _)| RerankCandidate {
                text: unit.text.clone(),
                occurred_start: unit.occurred_start,
                occurred_end: unit.occurred_end,
            })
            .collect();
        let reranked = match self
            .reranker
            .rerank(&request.query, rerank_candidates, self.config.rerank_timeout)
            .await
        {
            Ok(scores) => {
                for ((_, score), reranked) in candidates.iter_mut().zip(&scores) {
                    *score = *reranked;
                }
                let mut indexed: Vec<(usize, (MemoryUnit, f32))> =
                    candidates.drain(..).enumerate().collect();
                indexed.sort_by(|(ai, (_, a)), (bi, (_, b))| {
                    b.total_cmp(a).then_with(|| ai.cmp(bi))
                });
                candidates = indexed.into_iter().map(|(_, pair)| pair).collect();
                true
            }
            Err(e) => {
                warn!("reranker unavailable, falling back to fused order: {}", e);
                warnings.push("rerank_unavailable".to_string());
                false
            }
        };

        let kept = filter_by_budget(candidates, request.max_tokens);

        // Best-effort hit accounting.
        let kept_ids: Vec<UnitId> = kept.iter().map(|(unit, _)| unit.id.clone()).collect();
        {
            let db = self.db.lock().await;
            if let Err(e) = db.bump_access_counts(&kept_ids) {
                debug!("access count bump dropped: {}", e);
            }
        }

        let entities = if request.include_entities {
            Some(self.collect_entities(&kept_ids, request).await?)
        } else {
            None
        };

        let trace = request.trace.then(|| TraceInfo {
            strategies: outcomes
                .iter()
                .map(|o| StrategyTrace {
                    name: o.name.to_string(),
                    candidates: o.list.len(),
                    elapsed_ms: o.elapsed_ms,
                    completed: o.ok(),
                })
                .collect(),
            fused_candidates: fused_count,
            reranked,
            temporal_range: range,
        });

        Ok(RecallResponse {
            results: to_result_items(kept),
            entities,
            trace,
            warnings,
        })
    }

    /// Entities mentioned by the returned units, with their current
    /// observations, truncated to the entity token budget.
    async fn collect_entities(
        &self,
        unit_ids: &[UnitId],
        request: &RecallRequest,
    ) -> Result<Vec<EntityObservation>, EngineError> {
        let db = self.db.lock().await;
        let entities = db
            .entities_for_units(unit_ids)
            .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;

        let mut total_tokens = 0usize;
        let mut collected = Vec::new();
        'outer: for entity in entities {
            let observations = db
                .observations_for_entity(&request.bank_id, &entity.id)
                .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
            let mut texts = Vec::new();
            for observation in observations {
                let tokens = count_tokens(&observation.text);
                if total_tokens + tokens > request.max_entity_tokens {
                    if !texts.is_empty() {
                        collected.push(EntityObservation {
                            id: entity.id.clone(),
                            name: entity.canonical_name.clone(),
                            entity_type: entity.entity_type,
                            observations: texts,
                        });
                    }
                    break 'outer;
                }
                total_tokens += tokens;
                texts.push(observation.text);
            }
            if !texts.is_empty() {
                collected.push(EntityObservation {
                    id: entity.id,
                    name: entity.canonical_name,
                    entity_type: entity.entity_type,
                    observations: texts,
                });
            }
        }
        Ok(collected)
    }
}

fn validate(request: &RecallRequest) -> Result<(), EngineError> {
    if request.query.trim().is_empty() {
        return Err(EngineError::Invalid("query must not be empty".into()));
    }
    if request.max_tokens == 0 {
        return Err(EngineError::Invalid("max_tokens must be positive".into()));
    }
    if request.types.is_empty() {
        return Err(EngineError::Invalid(
            "at least one fact type is required".into(),
        ));
    }
    if request.types.contains(&FactType::Observation) {
        return Err(EngineError::Invalid(
            "observation units are not searchable".into(),
        ));
    }
    Ok(())
}

/// Min-max normalise scores over the returned batch into [0,1] weights;
/// a flat batch maps to 1.0.
fn to_result_items(kept: Vec<(MemoryUnit, f32)>) -> Vec<ResultItem> {
    let min = kept.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = kept
        .iter()
        .map(|(_, s)| *s)
        .fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;

    kept.into_iter()
        .map(|(unit, score)| {
            let weight = if span > f32::EPSILON {
                (score - min) / span
            } else {
                1.0
            };
            ResultItem {
                id: unit.id,
                text: unit.text,
                context: unit.context,
                event_date: unit.occurred_start,
                weight,
                fact_type: unit.fact_type,
            }
        })
        .collect()
}
