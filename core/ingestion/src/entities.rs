use anyhow::Result;
use hindsight_models::LlmClient;
use hindsight_schemas::{
    generate_entity_id, normalize_entity_name, BankId, Entity, EntityId,
};
use hindsight_storage::Database;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::extractor::EntityMention;

/// Name similarity required to merge a mention into an existing entity
/// of the same type.
pub const MERGE_THRESHOLD: f32 = 0.85;

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Levenshtein ratio in [0,1]; 1.0 means identical.
pub fn similarity_ratio(a: &str, b: &str) -> f32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / longest as f32
}

/// Resolves entity mentions to canonical per-bank entities.
///
/// Lookup order: exact normalized-name or alias match, then fuzzy
/// match against same-typed entities, then (for several plausible
/// candidates) one LLM disambiguation with the fact text as context.
/// A fresh entity is created when nothing passes the threshold.
pub struct EntityResolver {
    llm: Option<Arc<dyn LlmClient>>,
}

impl EntityResolver {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    pub async fn resolve(
        &self,
        db: &Arc<Mutex<Database>>,
        bank_id: &BankId,
        mention: &EntityMention,
        fact_text: &str,
    ) -> Result<EntityId> {
        let normalized = normalize_entity_name(&mention.name);

        let candidates = {
            let db = db.lock().await;
            let exact = db.find_entities_by_name(bank_id, &normalized)?;
            if let Some(entity) = pick_exact(&exact, mention) {
                return Ok(entity);
            }

            // Fuzzy pass over same-typed entities of the bank.
            db.entities_in_bank(bank_id)?
                .into_iter()
                .filter(|e| e.entity_type == mention.entity_type)
                .filter(|e| best_ratio(e, &normalized) >= MERGE_THRESHOLD)
                .collect::<Vec<Entity>>()
        };

        let matched = match candidates.len() {
            0 => None,
            1 => Some(candidates[0].id.clone()),
            _ => self
                .disambiguate(&candidates, mention, fact_text)
                .await
                .or_else(|| {
                    // Fall back to the closest name.
                    candidates
                        .iter()
                        .max_by(|a, b| {
                            best_ratio(a, &normalized).total_cmp(&best_ratio(b, &normalized))
                        })
                        .map(|e| e.id.clone())
                }),
        };

        if let Some(entity_id) = matched {
            let db = db.lock().await;
            db.add_entity_alias(&entity_id, &mention.name)?;
            return Ok(entity_id);
        }

        self.create(db, bank_id, mention, &normalized).await
    }

    async fn create(
        &self,
        db: &Arc<Mutex<Database>>,
        bank_id: &BankId,
        mention: &EntityMention,
        normalized: &str,
    ) -> Result<EntityId> {
        let entity = Entity {
            id: generate_entity_id(),
            bank_id: bank_id.clone(),
            canonical_name: mention.name.clone(),
            entity_type: mention.entity_type,
            aliases: Vec::new(),
        };

        let db = db.lock().await;
        match db.insert_entity(&entity) {
            Ok(()) => {
                debug!("created entity {} ({})", entity.canonical_name, entity.id);
                Ok(entity.id)
            }
            // A concurrent writer may have created the same name; take
            // theirs.
            Err(e) => match db.find_entities_by_name(bank_id, normalized)?.first() {
                Some(existing) => Ok(existing.id.clone()),
                None => Err(e),
            },
        }
    }

    /// One LLM call per ambiguity: which candidate (if any) does the
    /// mention refer to, given the fact text?
    async fn disambiguate(
        &self,
        candidates: &[Entity],
        mention: &EntityMention,
        fact_text: &str,
    ) -> Option<EntityId> {
        let llm = self.llm.as_ref()?;
        let listing: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}: {} ({})", i, e.canonical_name, e.entity_type.as_str()))
            .collect();
        let prompt = format!(
            r#"A fact mentions the entity "{}".

Fact: {}

Known entities:
{}

Which known entity does the mention refer to? Return JSON: {{"match": <index or null>}}"#,
            mention.name,
            fact_text,
            listing.join("\n"),
        );

        match llm
            .complete(
                "You resolve entity mentions to canonical entities. Return only valid JSON.",
                &prompt,
            )
            .await
        {
            Ok(response) => serde_json::from_str::<Value>(&response)
                .ok()
                .and_then(|v| v.get("match")?.as_u64())
                .and_then(|index| candidates.get(index as usize))
                .map(|e| e.id.clone()),
            Err(e) => {
                warn!("entity disambiguation failed: {}", e);
                None
            }
        }
    }
}

// Exact-name matches merge only within the same entity type; a
// differently-typed namesake goes through the fuzzy/create path (the
// unique-name constraint still collapses canonical collisions there).
fn pick_exact(matches: &[Entity], mention: &EntityMention) -> Option<EntityId> {
    matches
        .iter()
        .find(|e| e.entity_type == mention.entity_type)
        .map(|e| e.id.clone())
}

fn best_ratio(entity: &Entity, normalized: &str) -> f32 {
    let canonical = similarity_ratio(
        &normalize_entity_name(&entity.canonical_name),
        normalized,
    );
    entity
        .aliases
        .iter()
        .map(|alias| similarity_ratio(&normalize_entity_name(alias), normalized))
        .fold(canonical, f32::max)
}
