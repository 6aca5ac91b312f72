use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Dimensionality of all stored embeddings (BGE-small class models).
pub const EMBEDDING_DIM: usize = 384;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BankId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn generate_unit_id() -> UnitId {
    UnitId(format!("unit_{}", ulid::Ulid::new()))
}

pub fn generate_entity_id() -> EntityId {
    EntityId(format!("ent_{}", ulid::Ulid::new()))
}

pub fn generate_document_id() -> DocumentId {
    DocumentId(format!("doc_{}", ulid::Ulid::new()))
}

pub fn generate_operation_id() -> OperationId {
    OperationId(format!("op_{}", ulid::Ulid::new()))
}

// ============================================================================
// Fact and Entity Kinds
// ============================================================================

/// The four kinds of memory units. Observations are synthesised in the
/// background and are never returned by the search strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactType {
    #[serde(rename = "world")]
    World,
    #[serde(rename = "bank")]
    Bank,
    #[serde(rename = "opinion")]
    Opinion,
    #[serde(rename = "observation")]
    Observation,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::World => "world",
            FactType::Bank => "bank",
            FactType::Opinion => "opinion",
            FactType::Observation => "observation",
        }
    }

    pub fn parse(s: &str) -> Option<FactType> {
        match s {
            "world" => Some(FactType::World),
            "bank" => Some(FactType::Bank),
            "opinion" => Some(FactType::Opinion),
            "observation" => Some(FactType::Observation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "PERSON")]
    Person,
    #[serde(rename = "ORG")]
    Org,
    #[serde(rename = "LOCATION")]
    Location,
    #[serde(rename = "PRODUCT")]
    Product,
    #[serde(rename = "CONCEPT")]
    Concept,
    #[serde(rename = "OTHER")]
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Org => "ORG",
            EntityType::Location => "LOCATION",
            EntityType::Product => "PRODUCT",
            EntityType::Concept => "CONCEPT",
            EntityType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> EntityType {
        match s {
            "PERSON" => EntityType::Person,
            "ORG" => EntityType::Org,
            "LOCATION" => EntityType::Location,
            "PRODUCT" => EntityType::Product,
            "CONCEPT" => EntityType::Concept,
            _ => EntityType::Other,
        }
    }
}

// ============================================================================
// Link Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    #[serde(rename = "temporal")]
    Temporal,
    #[serde(rename = "semantic")]
    Semantic,
    #[serde(rename = "entity")]
    Entity,
    #[serde(rename = "causal")]
    Causal,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Entity => "entity",
            LinkType::Causal => "causal",
        }
    }

    pub fn parse(s: &str) -> Option<LinkType> {
        match s {
            "temporal" => Some(LinkType::Temporal),
            "semantic" => Some(LinkType::Semantic),
            "entity" => Some(LinkType::Entity),
            "causal" => Some(LinkType::Causal),
            _ => None,
        }
    }

    /// Lowest admissible weight for edges of this type.
    pub fn min_weight(&self) -> f32 {
        match self {
            LinkType::Entity => 1.0,
            LinkType::Semantic => 0.7,
            LinkType::Temporal => 0.3,
            LinkType::Causal => 0.0,
        }
    }

    /// Entity and semantic edges are stored in both directions.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, LinkType::Entity | LinkType::Semantic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CausalKind {
    #[serde(rename = "causes")]
    Causes,
    #[serde(rename = "caused_by")]
    CausedBy,
    #[serde(rename = "enables")]
    Enables,
    #[serde(rename = "prevents")]
    Prevents,
}

impl CausalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CausalKind::Causes => "causes",
            CausalKind::CausedBy => "caused_by",
            CausalKind::Enables => "enables",
            CausalKind::Prevents => "prevents",
        }
    }

    pub fn parse(s: &str) -> Option<CausalKind> {
        match s {
            "causes" => Some(CausalKind::Causes),
            "caused_by" => Some(CausalKind::CausedBy),
            "enables" => Some(CausalKind::Enables),
            "prevents" => Some(CausalKind::Prevents),
            _ => None,
        }
    }
}

// ============================================================================
// Memory Unit Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub id: UnitId,
    pub bank_id: BankId,
    pub document_id: Option<DocumentId>,
    /// Self-contained narrative fact.
    pub text: String,
    /// 384-dim L2-normalised vector.
    pub embedding: Vec<f32>,
    /// Closed interval for when the fact held in the world.
    pub occurred_start: Option<DateTime<Utc>>,
    pub occurred_end: Option<DateTime<Utc>>,
    /// When the fact was learned.
    pub mentioned_at: DateTime<Utc>,
    pub context: Option<String>,
    pub fact_type: FactType,
    /// Present iff `fact_type == Opinion`.
    pub confidence_score: Option<f32>,
    pub access_count: u64,
}

impl MemoryUnit {
    /// Check the structural invariants a unit must satisfy before storage.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.text.trim().is_empty() {
            return Err(EngineError::Invalid("memory unit text is empty".into()));
        }
        if self.embedding.len() != EMBEDDING_DIM {
            return Err(EngineError::Invalid(format!(
                "embedding has {} dims, expected {}",
                self.embedding.len(),
                EMBEDDING_DIM
            )));
        }
        if let (Some(start), Some(end)) = (self.occurred_start, self.occurred_end) {
            if start > end {
                return Err(EngineError::Invalid(
                    "occurred_start is after occurred_end".into(),
                ));
            }
        }
        match (self.fact_type, self.confidence_score) {
            (FactType::Opinion, None) => {
                return Err(EngineError::Invalid(
                    "opinion units require a confidence_score".into(),
                ));
            }
            (FactType::Opinion, Some(c)) if !(0.0..=1.0).contains(&c) => {
                return Err(EngineError::Invalid(format!(
                    "confidence_score {} outside [0,1]",
                    c
                )));
            }
            (t, Some(_)) if t != FactType::Opinion => {
                return Err(EngineError::Invalid(format!(
                    "confidence_score is forbidden for {} units",
                    t.as_str()
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// The occurred interval with a missing end collapsed onto the start.
    pub fn occurred(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.occurred_start, self.occurred_end) {
            (Some(s), Some(e)) => Some((s, e)),
            (Some(s), None) => Some((s, s)),
            _ => None,
        }
    }
}

// ============================================================================
// Entity Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub bank_id: BankId,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
}

/// Case-fold and collapse whitespace for entity identity comparisons.
/// No two entities in one bank share a normalized canonical name.
pub fn normalize_entity_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============================================================================
// Graph Edge Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src: UnitId,
    pub dst: UnitId,
    pub link_type: LinkType,
    pub weight: f32,
    pub causal_kind: Option<CausalKind>,
}

impl Edge {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.src == self.dst {
            return Err(EngineError::Invalid("edge endpoints are equal".into()));
        }
        if !(0.0..=1.0).contains(&self.weight) || self.weight < self.link_type.min_weight() {
            return Err(EngineError::Invalid(format!(
                "{} edge weight {} below floor {}",
                self.link_type.as_str(),
                self.weight,
                self.link_type.min_weight()
            )));
        }
        match self.link_type {
            LinkType::Causal if self.causal_kind.is_none() => Err(EngineError::Invalid(
                "causal edges require a causal_kind".into(),
            )),
            t if t != LinkType::Causal && self.causal_kind.is_some() => Err(
                EngineError::Invalid(format!("{} edges must not carry a causal_kind", t.as_str())),
            ),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Time Ranges
// ============================================================================

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Standard half-open overlap test against another half-open range.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap against a unit's closed occurred interval `[s, e]`.
    pub fn overlaps_occurred(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && self.start <= end
    }

    pub fn broaden(&self, days: i64) -> TimeRange {
        TimeRange {
            start: self.start - Duration::days(days),
            end: self.end + Duration::days(days),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

// ============================================================================
// Recall API Types
// ============================================================================

/// Scale knob for how far the graph strategy may roam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecallBudget {
    #[serde(rename = "low")]
    Low,
    #[default]
    #[serde(rename = "mid")]
    Mid,
    #[serde(rename = "high")]
    High,
}

impl RecallBudget {
    /// Maximum visited nodes for spreading activation; strategy K
    /// values scale off this number.
    pub fn visit_budget(&self) -> usize {
        match self {
            RecallBudget::Low => 100,
            RecallBudget::Mid => 300,
            RecallBudget::High => 600,
        }
    }
}

fn default_fact_types() -> BTreeSet<FactType> {
    [FactType::World, FactType::Bank, FactType::Opinion]
        .into_iter()
        .collect()
}

fn default_max_tokens() -> usize {
    4096
}

fn default_max_entity_tokens() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRequest {
    pub bank_id: BankId,
    pub query: String,
    #[serde(default = "default_fact_types")]
    pub types: BTreeSet<FactType>,
    #[serde(default)]
    pub budget: RecallBudget,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub include_entities: bool,
    #[serde(default = "default_max_entity_tokens")]
    pub max_entity_tokens: usize,
    /// Overall deadline for the call; engine default applies when unset.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl RecallRequest {
    pub fn new(bank_id: BankId, query: impl Into<String>) -> Self {
        Self {
            bank_id,
            query: query.into(),
            types: default_fact_types(),
            budget: RecallBudget::default(),
            max_tokens: default_max_tokens(),
            trace: false,
            include_entities: false,
            max_entity_tokens: default_max_entity_tokens(),
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: UnitId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Read-only alias of `occurred_start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_date: Option<DateTime<Utc>>,
    /// Post-rerank score, min-max normalised over the returned batch.
    pub weight: f32,
    pub fact_type: FactType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityObservation {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyTrace {
    pub name: String,
    pub candidates: usize,
    pub elapsed_ms: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInfo {
    pub strategies: Vec<StrategyTrace>,
    pub fused_candidates: usize,
    pub reranked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResponse {
    pub results: Vec<ResultItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<EntityObservation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

// ============================================================================
// Retain API Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetainPayload {
    Text(String),
    Items(Vec<RetainItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainItem {
    pub content: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainRequest {
    pub bank_id: BankId,
    pub content: RetainPayload,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub document_id: Option<DocumentId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "async", default)]
    pub run_async: bool,
}

impl RetainRequest {
    /// Flatten the payload into uniform items carrying the request-level
    /// context/timestamp defaults.
    pub fn items(&self) -> Vec<RetainItem> {
        match &self.content {
            RetainPayload::Text(text) => vec![RetainItem {
                content: text.clone(),
                context: self.context.clone(),
                timestamp: self.timestamp,
            }],
            RetainPayload::Items(items) => items
                .iter()
                .map(|item| RetainItem {
                    content: item.content.clone(),
                    context: item.context.clone().or_else(|| self.context.clone()),
                    timestamp: item.timestamp.or(self.timestamp),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub unit_ids: Vec<UnitId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<OperationStatus> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "running" => Some(OperationStatus::Running),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub bank_id: BankId,
    pub status: OperationStatus,
    pub unit_ids: Vec<UnitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Observable error kinds surfaced by the engine. Soft strategy
/// failures never appear here; they become response warnings.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("embedding model unavailable: {0}")]
    EmbedUnavailable(String),

    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("memory store unavailable: {0}")]
    CoreUnavailable(String),

    #[error("deadline exceeded before any usable result")]
    DeadlineExceeded,
}
