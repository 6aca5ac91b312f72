use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hindsight_models::LlmClient;
use hindsight_schemas::{CausalKind, EntityType, FactType};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Character budget per extraction chunk; long contents are split at
/// sentence boundaries and the chunks processed concurrently.
const MAX_CHUNK_CHARS: usize = 3000;

/// Opinions without a model-provided confidence get this.
const DEFAULT_OPINION_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMention {
    pub name: String,
    pub entity_type: EntityType,
}

/// Causal link between two facts of the same extraction batch, by index.
#[derive(Debug, Clone, PartialEq)]
pub struct CausalHint {
    pub target_index: usize,
    pub kind: CausalKind,
}

/// One structured fact as produced by extraction. This is the closed,
/// strongly-typed form the rest of the pipeline operates on; the
/// boundary parser absorbs model weirdness.
#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub text: String,
    pub fact_type: FactType,
    pub confidence_score: Option<f32>,
    pub occurred_start: Option<DateTime<Utc>>,
    pub occurred_end: Option<DateTime<Utc>>,
    pub entities: Vec<EntityMention>,
    pub causal_relations: Vec<CausalHint>,
}

#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(
        &self,
        content: &str,
        context: Option<&str>,
        reference: DateTime<Utc>,
    ) -> Result<Vec<ExtractedFact>>;
}

/// LLM-backed extractor producing self-contained narrative facts with
/// temporal ranges, entity mentions and in-batch causal hints.
pub struct LlmFactExtractor {
    llm: Arc<dyn LlmClient>,
}

impl LlmFactExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(chunk: &str, context: Option<&str>, reference: DateTime<Utc>) -> String {
        format!(
            r#"Extract self-contained factual statements from the text below for a long-term memory system.

Reference date: {reference}. Resolve relative time expressions ("last week", "next month") to absolute dates.
Context: {context}

Rules:
- Each fact must be a complete, standalone sentence naming its subject.
- fact_type: "world" for facts independent of this conversation, "bank" for things said to or done by the assistant, "opinion" for formed beliefs (with a confidence between 0 and 1).
- occurred_start/occurred_end: ISO timestamps, only for datable events; otherwise null.
- entities: only specific named people, organizations, places, products or concepts, each with a type of PERSON, ORG, LOCATION, PRODUCT, CONCEPT or OTHER. No pronouns or generic nouns.
- causal_relations: link facts in this batch when one causes, is caused by, enables or prevents another. target_index is the 0-based index of the other fact.

Return JSON:
{{
  "facts": [
    {{
      "text": "...",
      "fact_type": "world",
      "confidence": null,
      "occurred_start": null,
      "occurred_end": null,
      "entities": [{{"name": "Alice", "type": "PERSON"}}],
      "causal_relations": [{{"target_index": 1, "kind": "causes"}}]
    }}
  ]
}}

Text:
{chunk}"#,
            reference = reference.format("%Y-%m-%d"),
            context = context.unwrap_or("none"),
            chunk = chunk,
        )
    }

    /// Lenient parse of the model response into the typed form.
    /// Malformed entries are skipped with a warning; unknown kinds fall
    /// back to sensible defaults rather than failing the batch.
    fn parse_response(response: &str) -> Result<Vec<ExtractedFact>> {
        let value: Value =
            serde_json::from_str(response).context("extraction response is not valid JSON")?;
        let Some(raw_facts) = value.get("facts").and_then(|f| f.as_array()) else {
            warn!("extraction response missing 'facts' array");
            return Ok(Vec::new());
        };

        let mut facts = Vec::new();
        for (index, raw) in raw_facts.iter().enumerate() {
            let Some(text) = raw.get("text").and_then(|t| t.as_str()) else {
                warn!("skipping fact {}: missing text", index);
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }

            let fact_type = raw
                .get("fact_type")
                .and_then(|t| t.as_str())
                .and_then(FactType::parse)
                .unwrap_or_else(|| {
                    warn!("fact {}: unknown fact_type, defaulting to world", index);
                    FactType::World
                });
            // Observations are synthesised, never extracted.
            let fact_type = if fact_type == FactType::Observation {
                FactType::World
            } else {
                fact_type
            };

            let confidence_score = if fact_type == FactType::Opinion {
                Some(
                    raw.get("confidence")
                        .and_then(|c| c.as_f64())
                        .map(|c| (c as f32).clamp(0.0, 1.0))
                        .unwrap_or(DEFAULT_OPINION_CONFIDENCE),
                )
            } else {
                None
            };

            let occurred_start = parse_datetime(raw.get("occurred_start"));
            let occurred_end = parse_datetime(raw.get("occurred_end"));
            // Guard the ordering invariant at the boundary.
            let (occurred_start, occurred_end) = match (occurred_start, occurred_end) {
                (Some(s), Some(e)) if s > e => (Some(e), Some(s)),
                other => other,
            };

            let entities = raw
                .get("entities")
                .and_then(|e| e.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|entry| match entry {
                            Value::String(name) if !name.trim().is_empty() => {
                                Some(EntityMention {
                                    name: name.trim().to_string(),
                                    entity_type: EntityType::Other,
                                })
                            }
                            Value::Object(_) => {
                                let name = entry.get("name").and_then(|n| n.as_str())?;
                                if name.trim().is_empty() {
                                    return None;
                                }
                                let entity_type = entry
                                    .get("type")
                                    .and_then(|t| t.as_str())
                                    .map(EntityType::parse)
                                    .unwrap_or(EntityType::Other);
                                Some(EntityMention {
                                    name: name.trim().to_string(),
                                    entity_type,
                                })
                            }
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let causal_relations = raw
                .get("causal_relations")
                .and_then(|c| c.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|entry| {
                            let target_index =
                                entry.get("target_index")?.as_u64()? as usize;
                            let kind = entry
                                .get("kind")
                                .and_then(|k| k.as_str())
                                .and_then(CausalKind::parse)?;
                            Some(CausalHint { target_index, kind })
                        })
                        .collect()
                })
                .unwrap_or_default();

            facts.push(ExtractedFact {
                text: text.trim().to_string(),
                fact_type,
                confidence_score,
                occurred_start,
                occurred_end,
                entities,
                causal_relations,
            });
        }

        debug!("extracted {} facts", facts.len());
        Ok(facts)
    }
}

fn parse_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Split text into chunks at sentence boundaries, each roughly under
/// `max_chars`.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        if !current.is_empty() && current.len() + sentence.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let boundary = matches!(b, b'.' | b'!' | b'?' | b'\n')
            && bytes.get(i + 1).map_or(true, |n| n.is_ascii_whitespace());
        if boundary {
            let end = (i + 1).min(text.len());
            if let Some(slice) = text.get(start..end) {
                sentences.push(slice);
                start = end;
            }
        }
    }
    if start < text.len() {
        if let Some(rest) = text.get(start..) {
            sentences.push(rest);
        }
    }
    sentences
}

#[async_trait]
impl FactExtractor for LlmFactExtractor {
    async fn extract(
        &self,
        content: &str,
        context: Option<&str>,
        reference: DateTime<Utc>,
    ) -> Result<Vec<ExtractedFact>> {
        let chunks = chunk_text(content, MAX_CHUNK_CHARS);
        let mut tasks: JoinSet<(usize, Result<Vec<ExtractedFact>>)> = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let llm = self.llm.clone();
            let prompt = Self::build_prompt(&chunk, context, reference);
            tasks.spawn(async move {
                let result = llm
                    .complete(
                        "You extract structured facts from text and return only valid JSON.",
                        &prompt,
                    )
                    .await
                    .and_then(|response| Self::parse_response(&response));
                (index, result)
            });
        }

        let mut per_chunk: Vec<(usize, Vec<ExtractedFact>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.context("extraction task panicked")?;
            per_chunk.push((index, result?));
        }
        per_chunk.sort_by_key(|(index, _)| *index);

        // Causal hints are chunk-relative; shift them to batch indices.
        let mut facts = Vec::new();
        for (_, chunk_facts) in per_chunk {
            let offset = facts.len();
            for mut fact in chunk_facts {
                for hint in &mut fact.causal_relations {
                    hint.target_index += offset;
                }
                facts.push(fact);
            }
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_lenient() {
        let response = r#"{
            "facts": [
                {
                    "text": "Alice works at Google",
                    "fact_type": "world",
                    "entities": [{"name": "Alice", "type": "PERSON"}, {"name": "Google", "type": "ORG"}]
                },
                {
                    "text": "The game was cancelled because of rain",
                    "fact_type": "event",
                    "occurred_start": "2023-06-15T00:00:00Z",
                    "entities": ["rain"],
                    "causal_relations": [{"target_index": 0, "kind": "caused_by"}]
                },
                {"fact_type": "world"},
                {
                    "text": "Rust is the right choice for this service",
                    "fact_type": "opinion"
                }
            ]
        }"#;

        let facts = LlmFactExtractor::parse_response(response).unwrap();
        assert_eq!(facts.len(), 3);

        assert_eq!(facts[0].fact_type, FactType::World);
        assert_eq!(facts[0].entities.len(), 2);
        assert_eq!(facts[0].entities[0].entity_type, EntityType::Person);

        // Unknown fact_type falls back to world; bare-string entities
        // become OTHER mentions.
        assert_eq!(facts[1].fact_type, FactType::World);
        assert!(facts[1].occurred_start.is_some());
        assert_eq!(facts[1].entities[0].entity_type, EntityType::Other);
        assert_eq!(
            facts[1].causal_relations[0],
            CausalHint {
                target_index: 0,
                kind: CausalKind::CausedBy
            }
        );

        // Opinions always carry a confidence.
        assert_eq!(facts[2].fact_type, FactType::Opinion);
        assert_eq!(facts[2].confidence_score, Some(DEFAULT_OPINION_CONFIDENCE));
    }

    #[test]
    fn test_parse_response_swapped_dates() {
        let response = r#"{"facts": [{
            "text": "Conference ran for three days",
            "fact_type": "world",
            "occurred_start": "2023-06-18T00:00:00Z",
            "occurred_end": "2023-06-15T00:00:00Z"
        }]}"#;
        let facts = LlmFactExtractor::parse_response(response).unwrap();
        assert!(facts[0].occurred_start.unwrap() <= facts[0].occurred_end.unwrap());
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(LlmFactExtractor::parse_response("not json").is_err());
        let facts = LlmFactExtractor::parse_response(r#"{"other": 1}"#).unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn test_chunking_respects_sentences() {
        let text = "First sentence. Second sentence! Third sentence? Fourth.";
        let chunks = chunk_text(text, 35);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 40);
        }
        assert_eq!(chunks.concat(), text);

        let short = chunk_text("short", 100);
        assert_eq!(short, vec!["short".to_string()]);
    }

    #[test]
    fn test_prompt_carries_reference_date() {
        let reference = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 2, 1, 0, 0, 0).unwrap();
        let prompt = LlmFactExtractor::build_prompt("some text", Some("journal"), reference);
        assert!(prompt.contains("2024-02-01"));
        assert!(prompt.contains("journal"));
        assert!(prompt.contains("some text"));
    }
}
