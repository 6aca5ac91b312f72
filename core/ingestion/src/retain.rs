use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use hindsight_models::{EmbeddingClient, LlmClient};
use hindsight_schemas::{
    generate_operation_id, generate_unit_id, BankId, EngineError, EntityId, FactType, MemoryUnit,
    OperationId, OperationRecord, OperationStatus, RetainRequest, RetainResponse, UnitId,
};
use hindsight_storage::Database;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entities::EntityResolver;
use crate::extractor::{ExtractedFact, FactExtractor};
use crate::links;
use crate::worker::{Task, TaskQueue};

/// Facts from one content item keep their original order by staggering
/// `mentioned_at`, so retrieval can tell earlier statements from later
/// ones in the same document.
const SECONDS_PER_FACT: i64 = 10;

/// Shared dependencies of the retain pipeline and the background
/// workers. The caller constructs and owns these; the core keeps no
/// process-wide state.
#[derive(Clone)]
pub struct RetainContext {
    pub db: Arc<Mutex<Database>>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub extractor: Arc<dyn FactExtractor>,
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// Write-side entry point: extract facts, persist them, build the
/// graph, and fan out background tasks.
pub struct RetainPipeline {
    ctx: RetainContext,
    queue: TaskQueue,
}

impl RetainPipeline {
    pub fn new(ctx: RetainContext, queue: TaskQueue) -> Self {
        Self { ctx, queue }
    }

    pub async fn retain(&self, request: &RetainRequest) -> Result<RetainResponse, EngineError> {
        validate(request)?;

        if request.run_async {
            let operation_id = generate_operation_id();
            let record = OperationRecord {
                id: operation_id.clone(),
                bank_id: request.bank_id.clone(),
                status: OperationStatus::Pending,
                unit_ids: Vec::new(),
                error: None,
                created_at: Utc::now(),
                completed_at: None,
            };
            {
                let db = self.ctx.db.lock().await;
                db.create_operation(&record)
                    .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
            }
            self.queue.submit(Task::Retain {
                operation_id: operation_id.clone(),
                request: request.clone(),
            });
            return Ok(RetainResponse {
                operation_id: Some(operation_id),
                unit_ids: Vec::new(),
            });
        }

        let unit_ids = run_retain(&self.ctx, &self.queue, request).await?;
        Ok(RetainResponse {
            operation_id: None,
            unit_ids,
        })
    }

    pub async fn operation_status(
        &self,
        operation_id: &OperationId,
    ) -> Result<OperationRecord, EngineError> {
        let db = self.ctx.db.lock().await;
        db.get_operation(operation_id)
            .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("operation {}", operation_id)))
    }
}

fn validate(request: &RetainRequest) -> Result<(), EngineError> {
    if request.bank_id.0.trim().is_empty() {
        return Err(EngineError::Invalid("bank_id must not be empty".into()));
    }
    let items = request.items();
    if items.is_empty() || items.iter().any(|item| item.content.trim().is_empty()) {
        return Err(EngineError::Invalid("content must not be empty".into()));
    }
    Ok(())
}

/// The retain pipeline proper. Runs inline for synchronous requests
/// and on the worker pool for `async=true`.
pub(crate) async fn run_retain(
    ctx: &RetainContext,
    queue: &TaskQueue,
    request: &RetainRequest,
) -> Result<Vec<UnitId>, EngineError> {
    validate(request)?;
    let now = Utc::now();

    // Extraction across all content items; fact order within an item
    // is preserved through the mentioned_at stagger.
    let mut facts: Vec<ExtractedFact> = Vec::new();
    let mut mentioned: Vec<DateTime<Utc>> = Vec::new();
    let mut contexts: Vec<Option<String>> = Vec::new();
    for item in request.items() {
        let base = item.timestamp.unwrap_or(now);
        let extracted = ctx
            .extractor
            .extract(&item.content, item.context.as_deref(), base)
            .await
            .map_err(|e| EngineError::LlmUnavailable(e.to_string()))?;
        // Causal hints are item-relative; shift to batch indices.
        let offset = facts.len();
        for (position, mut fact) in extracted.into_iter().enumerate() {
            for hint in &mut fact.causal_relations {
                hint.target_index += offset;
            }
            mentioned.push(base + Duration::seconds(position as i64 * SECONDS_PER_FACT));
            contexts.push(item.context.clone());
            facts.push(fact);
        }
    }

    if facts.is_empty() {
        debug!("retain extracted no facts for bank {}", request.bank_id);
        return Ok(Vec::new());
    }

    let texts: Vec<String> = facts.iter().map(|f| f.text.clone()).collect();
    let embeddings = ctx
        .embedder
        .embed_batch(&texts)
        .await
        .map_err(|e| EngineError::EmbedUnavailable(e.to_string()))?;

    // Phase one: persist units (and replace the document) in a single
    // transaction. `aligned` maps every fact index to a stored unit:
    // duplicates resolve to the unit that already carries the text.
    let mut created: Vec<UnitId> = Vec::new();
    let mut aligned: Vec<UnitId> = Vec::new();
    let mut new_units: Vec<MemoryUnit> = Vec::new();
    {
        let db = ctx.db.lock().await;
        db.with_transaction(|db| {
            db.ensure_bank(&request.bank_id)?;
            if let Some(document_id) = &request.document_id {
                db.upsert_document(&request.bank_id, document_id)?;
            }

            let mut batch_seen: std::collections::HashMap<String, UnitId> =
                std::collections::HashMap::new();
            for ((fact, embedding), mentioned_at) in
                facts.iter().zip(embeddings).zip(mentioned.iter())
            {
                let folded = fact.text.to_lowercase();
                if let Some(existing) = batch_seen.get(&folded) {
                    aligned.push(existing.clone());
                    continue;
                }
                if let Some(existing) = db.find_duplicate(&request.bank_id, &fact.text)? {
                    debug!("skipping duplicate fact: {}", fact.text);
                    batch_seen.insert(folded, existing.clone());
                    aligned.push(existing);
                    continue;
                }

                let unit = MemoryUnit {
                    id: generate_unit_id(),
                    bank_id: request.bank_id.clone(),
                    document_id: request.document_id.clone(),
                    text: fact.text.clone(),
                    embedding,
                    occurred_start: fact.occurred_start,
                    occurred_end: fact.occurred_end,
                    mentioned_at: *mentioned_at,
                    context: contexts[aligned.len()].clone(),
                    fact_type: fact.fact_type,
                    confidence_score: fact.confidence_score,
                    access_count: 0,
                };
                db.insert_unit(&unit)?;
                batch_seen.insert(folded, unit.id.clone());
                aligned.push(unit.id.clone());
                created.push(unit.id.clone());
                new_units.push(unit);
            }
            Ok(())
        })
        .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
    }

    // Phase two: entity resolution. This may consult the model, so it
    // runs between the two write transactions.
    let resolver = EntityResolver::new(ctx.llm.clone());
    let mut fact_entities: Vec<Vec<EntityId>> = Vec::with_capacity(facts.len());
    let mut affected_entities: BTreeSet<EntityId> = BTreeSet::new();
    for fact in &facts {
        let mut resolved = Vec::new();
        for mention in &fact.entities {
            let entity_id = resolver
                .resolve(&ctx.db, &request.bank_id, mention, &fact.text)
                .await
                .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
            affected_entities.insert(entity_id.clone());
            resolved.push(entity_id);
        }
        fact_entities.push(resolved);
    }

    // Phase three: links and edges.
    {
        let db = ctx.db.lock().await;
        db.with_transaction(|db| {
            for (unit_id, entity_ids) in aligned.iter().zip(&fact_entities) {
                for entity_id in entity_ids {
                    db.link_unit_entity(unit_id, entity_id)?;
                }
            }

            let entity_list: Vec<EntityId> = affected_entities.iter().cloned().collect();
            let entity_edges = links::create_entity_edges(db, &created, &entity_list)?;

            let mut semantic_edges = 0;
            let mut temporal_edges = 0;
            for unit in &new_units {
                semantic_edges += links::create_semantic_edges(db, &request.bank_id, unit)?;
                temporal_edges += links::create_temporal_edges(db, &request.bank_id, unit)?;
            }
            let causal_edges = links::create_causal_edges(db, &aligned, &facts)?;

            info!(
                "retain stored {} units ({} entity, {} semantic, {} temporal, {} causal edges)",
                created.len(),
                entity_edges,
                semantic_edges,
                temporal_edges,
                causal_edges,
            );
            Ok(())
        })
        .map_err(|e| EngineError::CoreUnavailable(e.to_string()))?;
    }

    // Fan out background work: one observation refresh per distinct
    // entity, and one reinforcement pass over the affected entities.
    for entity_id in &affected_entities {
        queue.submit(Task::RegenerateObservations {
            bank_id: request.bank_id.clone(),
            entity_id: entity_id.clone(),
        });
    }
    if !affected_entities.is_empty() {
        queue.submit(Task::ReinforceOpinions {
            bank_id: request.bank_id.clone(),
            entity_ids: affected_entities.into_iter().collect(),
        });
    }

    Ok(created)
}

/// Reinforcement contract: retain may revise the text and confidence
/// of existing opinions mentioning the affected entities. Failures are
/// logged and never block fact insertion; without a model this is a
/// no-op.
pub(crate) async fn reinforce_opinions(
    ctx: &RetainContext,
    bank_id: &BankId,
    entity_ids: &[EntityId],
) -> Result<()> {
    let Some(llm) = &ctx.llm else {
        debug!("no model configured, skipping opinion reinforcement");
        return Ok(());
    };

    let opinions: Vec<MemoryUnit> = {
        let db = ctx.db.lock().await;
        let mut seen = BTreeSet::new();
        let mut opinions = Vec::new();
        for entity_id in entity_ids {
            for unit_id in db.units_mentioning(entity_id)? {
                if !seen.insert(unit_id.clone()) {
                    continue;
                }
                if let Some(unit) = db.get_unit(&unit_id)? {
                    if unit.bank_id == *bank_id && unit.fact_type == FactType::Opinion {
                        opinions.push(unit);
                    }
                }
            }
        }
        opinions
    };
    if opinions.is_empty() {
        return Ok(());
    }

    let listing: Vec<String> = opinions
        .iter()
        .enumerate()
        .map(|(i, unit)| {
            format!(
                "{}: {} (confidence {:.2})",
                i,
                unit.text,
                unit.confidence_score.unwrap_or(0.5)
            )
        })
        .collect();
    let prompt = format!(
        r#"These opinions may be affected by newly learned facts. For each one that should change, give revised text and confidence; omit the rest.

Opinions:
{}

Return JSON: {{"updates": [{{"index": 0, "text": "...", "confidence": 0.8}}]}}"#,
        listing.join("\n"),
    );

    let response = llm
        .complete(
            "You revise opinion memories in light of new facts. Return only valid JSON.",
            &prompt,
        )
        .await?;

    let Ok(value) = serde_json::from_str::<Value>(&response) else {
        warn!("reinforcement response is not valid JSON");
        return Ok(());
    };
    let Some(updates) = value.get("updates").and_then(|u| u.as_array()) else {
        return Ok(());
    };

    let db = ctx.db.lock().await;
    for update in updates {
        let Some(index) = update.get("index").and_then(|i| i.as_u64()) else {
            continue;
        };
        let Some(opinion) = opinions.get(index as usize) else {
            continue;
        };
        let text = update
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or(&opinion.text);
        let confidence = update
            .get("confidence")
            .and_then(|c| c.as_f64())
            .map(|c| c as f32)
            .or(opinion.confidence_score)
            .unwrap_or(0.5);
        db.update_opinion(&opinion.id, text, confidence)?;
        debug!("reinforced opinion {}", opinion.id);
    }
    Ok(())
}
