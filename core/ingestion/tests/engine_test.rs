use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hindsight_ingestion::{
    CausalHint, EntityMention, ExtractedFact, FactExtractor, RetainContext, RetainPipeline,
    TaskQueue, WorkerPool,
};
use hindsight_models::{CrossEncoder, HashingEmbedder, LexicalCrossEncoder};
use hindsight_retrieval::{RecallConfig, RecallEngine};
use hindsight_schemas::{
    BankId, CausalKind, EntityType, FactType, LinkType, RecallBudget, RecallRequest, RetainRequest,
    RetainPayload, OperationStatus,
};
use hindsight_storage::Database;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// ----------------------------------------------------------------------------
// Deterministic stand-ins for the model clients
// ----------------------------------------------------------------------------

/// Extractor with canned outputs per content string; unknown content
/// becomes a single world fact verbatim.
struct ScriptedExtractor {
    scripts: HashMap<String, Vec<ExtractedFact>>,
}

#[async_trait]
impl FactExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        content: &str,
        _context: Option<&str>,
        _reference: DateTime<Utc>,
    ) -> Result<Vec<ExtractedFact>> {
        Ok(self
            .scripts
            .get(content)
            .cloned()
            .unwrap_or_else(|| vec![fact(content)]))
    }
}

struct FailingEncoder;

#[async_trait]
impl CrossEncoder for FailingEncoder {
    async fn score_batch(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
        Err(anyhow::anyhow!("model crashed"))
    }
}

fn fact(text: &str) -> ExtractedFact {
    ExtractedFact {
        text: text.to_string(),
        fact_type: FactType::World,
        confidence_score: None,
        occurred_start: None,
        occurred_end: None,
        entities: Vec::new(),
        causal_relations: Vec::new(),
    }
}

fn fact_with_entities(text: &str, entities: &[(&str, EntityType)]) -> ExtractedFact {
    let mut f = fact(text);
    f.entities = entities
        .iter()
        .map(|(name, entity_type)| EntityMention {
            name: name.to_string(),
            entity_type: *entity_type,
        })
        .collect();
    f
}

fn fact_occurred(text: &str, year: i32, month: u32, day: u32) -> ExtractedFact {
    let mut f = fact(text);
    f.occurred_start = Some(Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap());
    f
}

struct Harness {
    db: Arc<Mutex<Database>>,
    engine: RecallEngine,
    pipeline: RetainPipeline,
    _pool: WorkerPool,
}

async fn harness(
    scripts: Vec<(&str, Vec<ExtractedFact>)>,
    encoder: Arc<dyn CrossEncoder>,
) -> Harness {
    let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let embedder = Arc::new(HashingEmbedder::new());

    let ctx = RetainContext {
        db: db.clone(),
        embedder: embedder.clone(),
        extractor: Arc::new(ScriptedExtractor {
            scripts: scripts
                .into_iter()
                .map(|(content, facts)| (content.to_string(), facts))
                .collect(),
        }),
        llm: None,
    };
    let (queue, rx) = TaskQueue::new();
    let pool = WorkerPool::spawn(ctx.clone(), queue.clone(), rx, 4);

    Harness {
        db: db.clone(),
        engine: RecallEngine::new(db, embedder, encoder, RecallConfig::default()),
        pipeline: RetainPipeline::new(ctx, queue),
        _pool: pool,
    }
}

fn retain_request(bank: &str, content: &str) -> RetainRequest {
    RetainRequest {
        bank_id: BankId(bank.into()),
        content: RetainPayload::Text(content.into()),
        context: None,
        document_id: None,
        timestamp: None,
        run_async: false,
    }
}

async fn drain_observations(
    db: &Arc<Mutex<Database>>,
    bank: &BankId,
    entity_name: &str,
) -> Vec<String> {
    for _ in 0..100 {
        {
            let db = db.lock().await;
            let entities = db.entities_in_bank(bank).unwrap();
            if let Some(entity) = entities.iter().find(|e| e.canonical_name == entity_name) {
                let observations = db.observations_for_entity(bank, &entity.id).unwrap();
                if !observations.is_empty() {
                    return observations.into_iter().map(|u| u.text).collect();
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Vec::new()
}

// ----------------------------------------------------------------------------
// End-to-end scenarios
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_direct_hit_round_trip() {
    let h = harness(vec![], Arc::new(LexicalCrossEncoder::new())).await;

    let stored = h
        .pipeline
        .retain(&retain_request("b1", "Alice works at Google in Mountain View"))
        .await
        .unwrap();
    assert_eq!(stored.unit_ids.len(), 1);

    let mut request = RecallRequest::new(BankId("b1".into()), "Where does Alice work?");
    request.budget = RecallBudget::Low;
    request.max_tokens = 1000;

    let response = h.engine.recall(&request).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, stored.unit_ids[0]);
    assert!(response.results[0].weight >= 0.8);
}

#[tokio::test]
async fn test_multi_hop_via_shared_entity() {
    let h = harness(
        vec![(
            "office notes",
            vec![
                fact_with_entities("Alice works at Google", &[("Google", EntityType::Org)]),
                fact_with_entities(
                    "Google's office in Mountain View has a gym",
                    &[("Google", EntityType::Org)],
                ),
            ],
        )],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;

    let stored = h
        .pipeline
        .retain(&retain_request("b1", "office notes"))
        .await
        .unwrap();
    assert_eq!(stored.unit_ids.len(), 2);

    // The shared entity produced weight-1.0 edges between the units.
    {
        let db = h.db.lock().await;
        let neighbours = db
            .neighbors(&stored.unit_ids[0], Some(&[LinkType::Entity]))
            .unwrap();
        assert!(neighbours.iter().any(|n| n.dst == stored.unit_ids[1]));
    }

    let request = RecallRequest::new(
        BankId("b1".into()),
        "Does Alice have gym access at work?",
    );
    let response = h.engine.recall(&request).await.unwrap();

    let positions: Vec<_> = response.results.iter().map(|r| r.id.clone()).collect();
    let a = positions.iter().position(|id| *id == stored.unit_ids[0]);
    let b = positions.iter().position(|id| *id == stored.unit_ids[1]);
    assert!(a.is_some() && b.is_some(), "both units should be recalled");
    assert!(a < b, "the direct fact must precede the expansion");
}

#[tokio::test]
async fn test_temporal_filter_scenario() {
    let h = harness(
        vec![(
            "journal",
            vec![
                fact_occurred("Went to Yosemite", 2023, 6, 15),
                fact_occurred("Moved to Seattle", 2024, 1, 10),
            ],
        )],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;

    let stored = h
        .pipeline
        .retain(&retain_request("b1", "journal"))
        .await
        .unwrap();

    let request = RecallRequest::new(BankId("b1".into()), "What did I do last June?");
    let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let response = h.engine.recall_at(&request, now).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, stored.unit_ids[0]);
}

#[tokio::test]
async fn test_exact_keyword_beats_weak_semantics() {
    let h = harness(vec![], Arc::new(LexicalCrossEncoder::new())).await;

    let deploy = h
        .pipeline
        .retain(&retain_request(
            "b1",
            "Deployed the Foobar-9000 to prod on Tuesday",
        ))
        .await
        .unwrap();
    h.pipeline
        .retain(&retain_request("b1", "Lunch at the taqueria was excellent"))
        .await
        .unwrap();

    let request = RecallRequest::new(BankId("b1".into()), "Foobar-9000");
    let response = h.engine.recall(&request).await.unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].id, deploy.unit_ids[0]);
}

#[tokio::test]
async fn test_budget_truncation() {
    // Ten 100-token facts sharing a keyword; 350 tokens keep exactly 3.
    let facts: Vec<ExtractedFact> = (0..10)
        .map(|i| fact(&format!("projectx {:0391}", i)))
        .collect();
    assert!(facts.iter().all(|f| f.text.chars().count() == 400));

    let h = harness(
        vec![("project dump", facts)],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;
    let stored = h
        .pipeline
        .retain(&retain_request("b1", "project dump"))
        .await
        .unwrap();
    assert_eq!(stored.unit_ids.len(), 10);

    let mut request = RecallRequest::new(BankId("b1".into()), "projectx");
    request.max_tokens = 350;
    let response = h.engine.recall(&request).await.unwrap();
    assert_eq!(response.results.len(), 3);
}

#[tokio::test]
async fn test_degraded_rerank_keeps_results() {
    let h = harness(vec![], Arc::new(FailingEncoder)).await;
    h.pipeline
        .retain(&retain_request("b1", "Alice works at Google"))
        .await
        .unwrap();

    let request = RecallRequest::new(BankId("b1".into()), "Where does Alice work?");
    let response = h.engine.recall(&request).await.unwrap();

    assert!(!response.results.is_empty());
    assert!(response.warnings.contains(&"rerank_unavailable".to_string()));
}

// ----------------------------------------------------------------------------
// Write-side properties
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_document_reingest_replaces_units() {
    let h = harness(
        vec![(
            "doc content",
            vec![fact("first extracted fact"), fact("second extracted fact")],
        )],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;

    let mut request = retain_request("b1", "doc content");
    request.document_id = Some(hindsight_schemas::DocumentId("doc_report".into()));

    let first = h.pipeline.retain(&request).await.unwrap();
    assert_eq!(first.unit_ids.len(), 2);

    let second = h.pipeline.retain(&request).await.unwrap();
    assert_eq!(second.unit_ids.len(), 2);

    let db = h.db.lock().await;
    let bank = BankId("b1".into());
    assert_eq!(db.count_units(&bank).unwrap(), 2);
    // Prior units are gone, replaced by the re-extraction.
    for old in &first.unit_ids {
        assert!(db.get_unit(old).unwrap().is_none());
    }
    for new in &second.unit_ids {
        assert!(db.get_unit(new).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_duplicate_facts_are_not_restored() {
    let h = harness(vec![], Arc::new(LexicalCrossEncoder::new())).await;

    let first = h
        .pipeline
        .retain(&retain_request("b1", "Alice works at Google"))
        .await
        .unwrap();
    assert_eq!(first.unit_ids.len(), 1);

    let second = h
        .pipeline
        .retain(&retain_request("b1", "Alice works at Google"))
        .await
        .unwrap();
    assert!(second.unit_ids.is_empty());

    let db = h.db.lock().await;
    assert_eq!(db.count_units(&BankId("b1".into())).unwrap(), 1);
}

#[tokio::test]
async fn test_causal_hints_create_directed_edges() {
    let h = harness(
        vec![(
            "rainy day",
            vec![
                {
                    let mut f = fact("It rained heavily all morning");
                    f.causal_relations = vec![CausalHint {
                        target_index: 1,
                        kind: CausalKind::Causes,
                    }];
                    f
                },
                fact("The picnic was cancelled"),
            ],
        )],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;

    let stored = h
        .pipeline
        .retain(&retain_request("b1", "rainy day"))
        .await
        .unwrap();

    let db = h.db.lock().await;
    let causal = db
        .neighbors(&stored.unit_ids[0], Some(&[LinkType::Causal]))
        .unwrap();
    assert_eq!(causal.len(), 1);
    assert_eq!(causal[0].dst, stored.unit_ids[1]);
    assert_eq!(causal[0].causal_kind, Some(CausalKind::Causes));
    // Directed: no reverse edge.
    assert!(db
        .neighbors(&stored.unit_ids[1], Some(&[LinkType::Causal]))
        .unwrap()
        .is_empty());
}

// ----------------------------------------------------------------------------
// Background observation synthesis
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_observations_drain_after_retain() {
    let h = harness(
        vec![(
            "about alice",
            vec![
                fact_with_entities("Alice works at Google", &[("Alice", EntityType::Person)]),
                fact_with_entities(
                    "Alice moved to Mountain View",
                    &[("Alice", EntityType::Person)],
                ),
            ],
        )],
        Arc::new(LexicalCrossEncoder::new()),
    )
    .await;

    let retained_at = Utc::now();
    h.pipeline
        .retain(&retain_request("b1", "about alice"))
        .await
        .unwrap();

    let bank = BankId("b1".into());
    let observations = drain_observations(&h.db, &bank, "Alice").await;
    assert!(
        (1..=5).contains(&observations.len()),
        "expected 1..=5 observations, got {}",
        observations.len()
    );

    // Observation units are fresh and excluded from search.
    {
        let db = h.db.lock().await;
        let entities = db.entities_in_bank(&bank).unwrap();
        let alice = entities
            .iter()
            .find(|e| e.canonical_name == "Alice")
            .unwrap();
        let units = db.observations_for_entity(&bank, &alice.id).unwrap();
        assert!(units.iter().all(|u| u.mentioned_at >= retained_at));
        assert!(units.iter().all(|u| u.fact_type == FactType::Observation));
    }

    // include_entities attaches the observations to recall responses.
    let mut request = RecallRequest::new(BankId("b1".into()), "Where does Alice work?");
    request.include_entities = true;
    let response = h.engine.recall(&request).await.unwrap();
    let entities = response.entities.unwrap();
    assert!(!entities.is_empty());
    assert_eq!(entities[0].name, "Alice");
    assert!(!entities[0].observations.is_empty());
}

// ----------------------------------------------------------------------------
// Async retain
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_async_retain_operation_lifecycle() {
    let h = harness(vec![], Arc::new(LexicalCrossEncoder::new())).await;

    let mut request = retain_request("b1", "Asynchronously remembered fact");
    request.run_async = true;

    let accepted = h.pipeline.retain(&request).await.unwrap();
    assert!(accepted.unit_ids.is_empty());
    let operation_id = accepted.operation_id.expect("async retain returns an id");

    let mut record = None;
    for _ in 0..100 {
        let current = h.pipeline.operation_status(&operation_id).await.unwrap();
        if current.status == OperationStatus::Completed {
            record = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = record.expect("operation should complete");
    assert_eq!(record.unit_ids.len(), 1);

    let db = h.db.lock().await;
    assert!(db.get_unit(&record.unit_ids[0]).unwrap().is_some());
}
