use anyhow::{Context, Result};
use chrono::Utc;
use hindsight_schemas::{generate_unit_id, BankId, EntityId, FactType, MemoryUnit};
use serde_json::Value;
use tracing::{debug, warn};

use crate::retain::RetainContext;

/// Observation synthesis keeps between one and this many statements
/// per entity.
pub const MAX_OBSERVATIONS: usize = 5;

/// Rebuild the observation units for one entity from every
/// non-observation unit linked to it. Existing observations are
/// replaced wholesale; the new units carry no occurred dates.
/// Personality is never consulted here.
pub async fn regenerate(
    ctx: &RetainContext,
    bank_id: &BankId,
    entity_id: &EntityId,
) -> Result<usize> {
    let (entity, sources) = {
        let db = ctx.db.lock().await;
        let Some(entity) = db.get_entity(entity_id)? else {
            debug!("entity {} is gone, skipping observation refresh", entity_id);
            return Ok(0);
        };
        let unit_ids = db.units_mentioning(entity_id)?;
        let sources: Vec<MemoryUnit> = db
            .get_many(&unit_ids)?
            .into_iter()
            .filter(|unit| unit.bank_id == *bank_id && unit.fact_type != FactType::Observation)
            .collect();
        (entity, sources)
    };

    if sources.is_empty() {
        // Nothing to observe; clear any stale statements.
        let db = ctx.db.lock().await;
        let removed = db.delete_observations_for_entity(bank_id, entity_id)?;
        if removed > 0 {
            debug!("cleared {} stale observations for {}", removed, entity_id);
        }
        return Ok(0);
    }

    let statements = synthesize(ctx, &entity.canonical_name, &sources).await;
    if statements.is_empty() {
        return Ok(0);
    }

    let embeddings = ctx
        .embedder
        .embed_batch(&statements)
        .await
        .context("failed to embed observation statements")?;

    let db = ctx.db.lock().await;
    db.with_transaction(|db| {
        db.delete_observations_for_entity(bank_id, entity_id)?;
        let now = Utc::now();
        for (text, embedding) in statements.iter().zip(embeddings) {
            let unit = MemoryUnit {
                id: generate_unit_id(),
                bank_id: bank_id.clone(),
                document_id: None,
                text: text.clone(),
                embedding,
                occurred_start: None,
                occurred_end: None,
                mentioned_at: now,
                context: None,
                fact_type: FactType::Observation,
                confidence_score: None,
                access_count: 0,
            };
            db.insert_unit(&unit)?;
            db.link_unit_entity(&unit.id, entity_id)?;
        }
        Ok(statements.len())
    })
}

/// Ask the model for concise objective statements; fall back to the
/// most recent source facts when no model is configured or the reply
/// is unusable.
async fn synthesize(ctx: &RetainContext, entity_name: &str, sources: &[MemoryUnit]) -> Vec<String> {
    if let Some(llm) = &ctx.llm {
        let facts: Vec<String> = sources
            .iter()
            .map(|unit| format!("- {}", unit.text))
            .collect();
        let prompt = format!(
            r#"Known facts about {entity}:
{facts}

Write 3 to 5 concise, objective statements summarising what is known about {entity}. No speculation, no opinions about the statements themselves.

Return JSON: {{"observations": ["...", "..."]}}"#,
            entity = entity_name,
            facts = facts.join("\n"),
        );

        match llm
            .complete(
                "You summarise facts about an entity into objective observations. Return only valid JSON.",
                &prompt,
            )
            .await
        {
            Ok(response) => {
                let statements = parse_statements(&response);
                if !statements.is_empty() {
                    return statements;
                }
                warn!("observation response unusable, falling back to source facts");
            }
            Err(e) => warn!("observation synthesis call failed: {}", e),
        }
    }

    // Deterministic fallback: the most recently learned facts stand in
    // as observations.
    let mut recent: Vec<&MemoryUnit> = sources.iter().collect();
    recent.sort_by(|a, b| b.mentioned_at.cmp(&a.mentioned_at));
    recent
        .into_iter()
        .take(3)
        .map(|unit| unit.text.clone())
        .collect()
}

fn parse_statements(response: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(response) else {
        return Vec::new();
    };
    value
        .get("observations")
        .and_then(|o| o.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|s| s.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(MAX_OBSERVATIONS)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::FactExtractor;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use chrono::DateTime;
    use hindsight_models::{EmbeddingClient, HashingEmbedder};
    use hindsight_schemas::{generate_entity_id, Entity, EntityType};
    use hindsight_storage::Database;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct NoExtractor;

    #[async_trait]
    impl FactExtractor for NoExtractor {
        async fn extract(
            &self,
            _content: &str,
            _context: Option<&str>,
            _reference: DateTime<Utc>,
        ) -> AnyResult<Vec<crate::extractor::ExtractedFact>> {
            Ok(Vec::new())
        }
    }

    async fn setup() -> (RetainContext, Entity) {
        let db = Database::open_in_memory().unwrap();
        let bank = BankId("b1".into());
        db.ensure_bank(&bank).unwrap();
        let entity = Entity {
            id: generate_entity_id(),
            bank_id: bank,
            canonical_name: "Alice".into(),
            entity_type: EntityType::Person,
            aliases: vec![],
        };
        db.insert_entity(&entity).unwrap();

        let ctx = RetainContext {
            db: Arc::new(Mutex::new(db)),
            embedder: Arc::new(HashingEmbedder::new()),
            extractor: Arc::new(NoExtractor),
            llm: None,
        };
        (ctx, entity)
    }

    async fn add_fact(ctx: &RetainContext, entity: &Entity, text: &str) {
        let embedding = ctx.embedder.embed(text).await.unwrap();
        let unit = MemoryUnit {
            id: generate_unit_id(),
            bank_id: entity.bank_id.clone(),
            document_id: None,
            text: text.into(),
            embedding,
            occurred_start: None,
            occurred_end: None,
            mentioned_at: Utc::now(),
            context: None,
            fact_type: FactType::World,
            confidence_score: None,
            access_count: 0,
        };
        let db = ctx.db.lock().await;
        db.insert_unit(&unit).unwrap();
        db.link_unit_entity(&unit.id, &entity.id).unwrap();
    }

    #[tokio::test]
    async fn test_regenerate_replaces_observations() {
        let (ctx, entity) = setup().await;
        let bank = BankId("b1".into());
        add_fact(&ctx, &entity, "Alice works at Google").await;
        add_fact(&ctx, &entity, "Alice lives in Mountain View").await;

        let count = regenerate(&ctx, &bank, &entity.id).await.unwrap();
        assert!(count >= 1 && count <= MAX_OBSERVATIONS);

        let first: Vec<String> = {
            let db = ctx.db.lock().await;
            db.observations_for_entity(&bank, &entity.id)
                .unwrap()
                .into_iter()
                .map(|u| u.id.0)
                .collect()
        };
        assert_eq!(first.len(), count);

        // A second run replaces rather than accumulates.
        let count = regenerate(&ctx, &bank, &entity.id).await.unwrap();
        let second = {
            let db = ctx.db.lock().await;
            db.observations_for_entity(&bank, &entity.id).unwrap()
        };
        assert_eq!(second.len(), count);
        assert!(second.iter().all(|u| !first.contains(&u.id.0)));
        assert!(second.iter().all(|u| u.fact_type == FactType::Observation));
        assert!(second.iter().all(|u| u.occurred_start.is_none()));
    }

    #[tokio::test]
    async fn test_regenerate_without_sources_clears() {
        let (ctx, entity) = setup().await;
        let bank = BankId("b1".into());
        let count = regenerate(&ctx, &bank, &entity.id).await.unwrap();
        assert_eq!(count, 0);
        let db = ctx.db.lock().await;
        assert!(db.observations_for_entity(&bank, &entity.id).unwrap().is_empty());
    }

    #[test]
    fn test_parse_statements_lenient() {
        let parsed = parse_statements(r#"{"observations": ["a", "", "b"]}"#);
        assert_eq!(parsed, vec!["a".to_string(), "b".to_string()]);
        assert!(parse_statements("not json").is_empty());
        assert!(parse_statements(r#"{"other": []}"#).is_empty());

        let many = parse_statements(
            r#"{"observations": ["1", "2", "3", "4", "5", "6", "7"]}"#,
        );
        assert_eq!(many.len(), MAX_OBSERVATIONS);
    }
}
