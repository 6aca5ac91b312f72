use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use hindsight_schemas::{
    BankId, DocumentId, Entity, EntityId, EntityType, FactType, MemoryUnit, OperationId,
    OperationRecord, OperationStatus, TimeRange, UnitId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// A unit with the score assigned by one of the search operations.
#[derive(Debug, Clone)]
pub struct ScoredUnit {
    pub unit: MemoryUnit,
    pub score: f32,
}

/// SQLite-backed fact store. Edge operations live in `graph.rs` as a
/// second impl block on the same connection.
pub struct Database {
    pub(crate) conn: Connection,
}

/// Uniform-width RFC3339 so stored timestamps compare lexicographically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Build an FTS5 MATCH expression from free text: each alphanumeric
/// token quoted and OR-ed. Returns None when no searchable token
/// survives.
fn fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

const UNIT_COLUMNS: &str = "id, bank_id, document_id, fact_type, text, context, embedding, \
     occurred_start, occurred_end, mentioned_at, confidence_score, access_count";

fn unit_from_row(row: &Row) -> rusqlite::Result<MemoryUnit> {
    let fact_type: String = row.get(3)?;
    let embedding: Vec<u8> = row.get(6)?;
    let occurred_start: Option<String> = row.get(7)?;
    let occurred_end: Option<String> = row.get(8)?;
    let mentioned_at: String = row.get(9)?;

    Ok(MemoryUnit {
        id: UnitId(row.get(0)?),
        bank_id: BankId(row.get(1)?),
        document_id: row.get::<_, Option<String>>(2)?.map(DocumentId),
        fact_type: FactType::parse(&fact_type).unwrap_or(FactType::World),
        text: row.get(4)?,
        context: row.get(5)?,
        embedding: decode_embedding(&embedding),
        occurred_start: occurred_start.as_deref().map(parse_ts).transpose()?,
        occurred_end: occurred_end.as_deref().map(parse_ts).transpose()?,
        mentioned_at: parse_ts(&mentioned_at)?,
        confidence_score: row.get(10)?,
        access_count: row.get::<_, i64>(11)? as u64,
    })
}

impl Database {
    /// Open (or create) the store at `path` and initialise the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::init(conn)?;
        info!("Fact store initialized");
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS banks (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT NOT NULL,
                bank_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (bank_id, id),
                FOREIGN KEY (bank_id) REFERENCES banks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_units (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                document_id TEXT,
                fact_type TEXT NOT NULL,
                text TEXT NOT NULL,
                context TEXT,
                embedding BLOB NOT NULL,
                occurred_start TEXT,
                occurred_end TEXT,
                mentioned_at TEXT NOT NULL,
                confidence_score REAL,
                access_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (bank_id) REFERENCES banks(id) ON DELETE CASCADE,
                FOREIGN KEY (bank_id, document_id)
                    REFERENCES documents(bank_id, id) ON DELETE CASCADE
            )",
            [],
        )?;

        // External-content FTS index over the unit text, kept in sync
        // by triggers.
        self.conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS unit_fts USING fts5(
                text,
                content='memory_units',
                content_rowid='rowid'
            )",
            [],
        )?;
        self.conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS unit_fts_insert
             AFTER INSERT ON memory_units BEGIN
                 INSERT INTO unit_fts(rowid, text) VALUES (new.rowid, new.text);
             END;
             CREATE TRIGGER IF NOT EXISTS unit_fts_delete
             AFTER DELETE ON memory_units BEGIN
                 INSERT INTO unit_fts(unit_fts, rowid, text)
                     VALUES ('delete', old.rowid, old.text);
             END;
             CREATE TRIGGER IF NOT EXISTS unit_fts_update
             AFTER UPDATE OF text ON memory_units BEGIN
                 INSERT INTO unit_fts(unit_fts, rowid, text)
                     VALUES ('delete', old.rowid, old.text);
                 INSERT INTO unit_fts(rowid, text) VALUES (new.rowid, new.text);
             END;",
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                canonical_name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                UNIQUE (bank_id, normalized_name),
                FOREIGN KEY (bank_id) REFERENCES banks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_links (
                unit_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                PRIMARY KEY (unit_id, entity_id),
                FOREIGN KEY (unit_id) REFERENCES memory_units(id) ON DELETE CASCADE,
                FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS unit_links (
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                link_type TEXT NOT NULL,
                weight REAL NOT NULL,
                causal_kind TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (src, dst, link_type),
                FOREIGN KEY (src) REFERENCES memory_units(id) ON DELETE CASCADE,
                FOREIGN KEY (dst) REFERENCES memory_units(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                status TEXT NOT NULL,
                unit_ids TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_units_bank_type
                 ON memory_units(bank_id, fact_type);
             CREATE INDEX IF NOT EXISTS idx_units_mentioned
                 ON memory_units(bank_id, mentioned_at);
             CREATE INDEX IF NOT EXISTS idx_units_occurred
                 ON memory_units(bank_id, occurred_start);
             CREATE INDEX IF NOT EXISTS idx_unit_links_src
                 ON unit_links(src);
             CREATE INDEX IF NOT EXISTS idx_entity_links_entity
                 ON entity_links(entity_id);",
        )?;

        Ok(())
    }

    /// Run `f` inside a single write transaction.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // ========================================================================
    // Banks and documents
    // ========================================================================

    pub fn ensure_bank(&self, bank_id: &BankId) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO banks (id, created_at) VALUES (?1, ?2)",
            params![bank_id.0, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn bank_exists(&self, bank_id: &BankId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM banks WHERE id = ?1",
            params![bank_id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Register a document and drop every unit from its previous
    /// ingestion. Unit deletion cascades to edges and entity links.
    pub fn upsert_document(&self, bank_id: &BankId, document_id: &DocumentId) -> Result<usize> {
        self.conn.execute(
            "INSERT OR IGNORE INTO documents (id, bank_id, created_at) VALUES (?1, ?2, ?3)",
            params![document_id.0, bank_id.0, fmt_ts(Utc::now())],
        )?;
        let removed = self.conn.execute(
            "DELETE FROM memory_units WHERE bank_id = ?1 AND document_id = ?2",
            params![bank_id.0, document_id.0],
        )?;
        if removed > 0 {
            debug!(
                "Replaced document {}: removed {} prior units",
                document_id, removed
            );
        }
        Ok(removed)
    }

    pub fn delete_document(&self, bank_id: &BankId, document_id: &DocumentId) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM memory_units WHERE bank_id = ?1 AND document_id = ?2",
            params![bank_id.0, document_id.0],
        )?;
        self.conn.execute(
            "DELETE FROM documents WHERE bank_id = ?1 AND id = ?2",
            params![bank_id.0, document_id.0],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // Memory units
    // ========================================================================

    pub fn insert_unit(&self, unit: &MemoryUnit) -> Result<()> {
        unit.validate().context("refusing to store invalid unit")?;
        self.conn.execute(
            "INSERT INTO memory_units (
                id, bank_id, document_id, fact_type, text, context, embedding,
                occurred_start, occurred_end, mentioned_at, confidence_score, access_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                unit.id.0,
                unit.bank_id.0,
                unit.document_id.as_ref().map(|d| d.0.clone()),
                unit.fact_type.as_str(),
                unit.text,
                unit.context,
                encode_embedding(&unit.embedding),
                unit.occurred_start.map(fmt_ts),
                unit.occurred_end.map(fmt_ts),
                fmt_ts(unit.mentioned_at),
                unit.confidence_score,
                unit.access_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_unit(&self, id: &UnitId) -> Result<Option<MemoryUnit>> {
        let unit = self
            .conn
            .query_row(
                &format!("SELECT {} FROM memory_units WHERE id = ?1", UNIT_COLUMNS),
                params![id.0],
                unit_from_row,
            )
            .optional()?;
        Ok(unit)
    }

    /// Fetch units preserving input order; unknown ids are skipped.
    pub fn get_many(&self, ids: &[UnitId]) -> Result<Vec<MemoryUnit>> {
        let mut units = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(unit) = self.get_unit(id)? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Cosine nearest neighbours over the bank, sorted descending.
    /// Observations are never candidates.
    pub fn vector_knn(
        &self,
        bank_id: &BankId,
        types: &BTreeSet<FactType>,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredUnit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM memory_units
             WHERE bank_id = ?1 AND fact_type != 'observation'",
            UNIT_COLUMNS
        ))?;

        let mut scored: Vec<ScoredUnit> = stmt
            .query_map(params![bank_id.0], unit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|unit| types.contains(&unit.fact_type))
            .filter_map(|unit| {
                let score = cosine_similarity(query, &unit.embedding);
                (score >= min_similarity).then_some(ScoredUnit { unit, score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.unit.id.cmp(&b.unit.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// BM25 full-text lookup over the unit text.
    pub fn keyword_search(
        &self,
        bank_id: &BankId,
        types: &BTreeSet<FactType>,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredUnit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {}, unit_fts.rank
             FROM memory_units m
             JOIN unit_fts ON m.rowid = unit_fts.rowid
             WHERE unit_fts MATCH ?1
               AND m.bank_id = ?2
               AND m.fact_type != 'observation'
             ORDER BY unit_fts.rank
             LIMIT ?3",
            UNIT_COLUMNS
                .split(", ")
                .map(|c| format!("m.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;

        let mut scored: Vec<ScoredUnit> = stmt
            .query_map(params![match_expr, bank_id.0, (k * 2) as i64], |row| {
                let unit = unit_from_row(row)?;
                let rank: f64 = row.get(12)?;
                Ok(ScoredUnit {
                    unit,
                    // FTS5 rank is negative bm25, ascending best-first.
                    score: -rank as f32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|s| types.contains(&s.unit.fact_type))
            .collect();

        scored.truncate(k);
        Ok(scored)
    }

    /// Units whose occurred interval overlaps the half-open range.
    pub fn range_lookup(
        &self,
        bank_id: &BankId,
        types: &BTreeSet<FactType>,
        range: &TimeRange,
    ) -> Result<Vec<MemoryUnit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM memory_units
             WHERE bank_id = ?1
               AND fact_type != 'observation'
               AND occurred_start IS NOT NULL
               AND occurred_start < ?2
               AND ?3 <= COALESCE(occurred_end, occurred_start)
             ORDER BY occurred_start",
            UNIT_COLUMNS
        ))?;

        let units = stmt
            .query_map(
                params![bank_id.0, fmt_ts(range.end), fmt_ts(range.start)],
                unit_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|unit| types.contains(&unit.fact_type))
            .collect();

        Ok(units)
    }

    /// Units learned inside a wall-clock window, for temporal linking.
    pub fn units_mentioned_between(
        &self,
        bank_id: &BankId,
        range: &TimeRange,
    ) -> Result<Vec<(UnitId, DateTime<Utc>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, mentioned_at FROM memory_units
             WHERE bank_id = ?1 AND fact_type != 'observation'
               AND mentioned_at >= ?2 AND mentioned_at < ?3
             ORDER BY mentioned_at",
        )?;
        let rows = stmt
            .query_map(
                params![bank_id.0, fmt_ts(range.start), fmt_ts(range.end)],
                |row| {
                    let id: String = row.get(0)?;
                    let mentioned: String = row.get(1)?;
                    Ok((UnitId(id), parse_ts(&mentioned)?))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Case-insensitive exact text duplicate within a bank.
    pub fn find_duplicate(&self, bank_id: &BankId, text: &str) -> Result<Option<UnitId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM memory_units
                 WHERE bank_id = ?1 AND fact_type != 'observation' AND lower(text) = lower(?2)
                 LIMIT 1",
                params![bank_id.0, text],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id.map(UnitId))
    }

    /// Best-effort retrieval-hit counter; callers may batch and drop
    /// failures.
    pub fn bump_access_counts(&self, ids: &[UnitId]) -> Result<()> {
        for id in ids {
            self.conn.execute(
                "UPDATE memory_units SET access_count = access_count + 1 WHERE id = ?1",
                params![id.0],
            )?;
        }
        Ok(())
    }

    /// Reinforcement contract: opinions may have text and confidence
    /// revised in place.
    pub fn update_opinion(
        &self,
        id: &UnitId,
        text: &str,
        confidence_score: f32,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE memory_units SET text = ?2, confidence_score = ?3
             WHERE id = ?1 AND fact_type = 'opinion'",
            params![id.0, text, confidence_score.clamp(0.0, 1.0)],
        )?;
        Ok(())
    }

    pub fn count_units(&self, bank_id: &BankId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_units WHERE bank_id = ?1",
            params![bank_id.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entities (
                id, bank_id, canonical_name, normalized_name, entity_type, aliases, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity.id.0,
                entity.bank_id.0,
                entity.canonical_name,
                hindsight_schemas::normalize_entity_name(&entity.canonical_name),
                entity.entity_type.as_str(),
                serde_json::to_string(&entity.aliases)?,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
        let entity_type: String = row.get(3)?;
        let aliases: String = row.get(4)?;
        Ok(Entity {
            id: EntityId(row.get(0)?),
            bank_id: BankId(row.get(1)?),
            canonical_name: row.get(2)?,
            entity_type: EntityType::parse(&entity_type),
            aliases: serde_json::from_str(&aliases).unwrap_or_default(),
        })
    }

    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let entity = self
            .conn
            .query_row(
                "SELECT id, bank_id, canonical_name, entity_type, aliases
                 FROM entities WHERE id = ?1",
                params![id.0],
                Self::entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    pub fn entities_in_bank(&self, bank_id: &BankId) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bank_id, canonical_name, entity_type, aliases
             FROM entities WHERE bank_id = ?1 ORDER BY canonical_name",
        )?;
        let entities = stmt
            .query_map(params![bank_id.0], Self::entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    /// Entities whose normalized canonical name or recorded alias
    /// matches exactly.
    pub fn find_entities_by_name(&self, bank_id: &BankId, normalized: &str) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bank_id, canonical_name, entity_type, aliases
             FROM entities
             WHERE bank_id = ?1 AND (normalized_name = ?2 OR aliases LIKE ?3)",
        )?;
        let alias_pattern = format!("%\"{}\"%", normalized.replace('"', ""));
        let entities = stmt
            .query_map(params![bank_id.0, normalized, alias_pattern], Self::entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    pub fn add_entity_alias(&self, id: &EntityId, alias: &str) -> Result<()> {
        let Some(mut entity) = self.get_entity(id)? else {
            return Ok(());
        };
        let normalized = hindsight_schemas::normalize_entity_name(alias);
        if entity
            .aliases
            .iter()
            .any(|a| hindsight_schemas::normalize_entity_name(a) == normalized)
        {
            return Ok(());
        }
        entity.aliases.push(normalized);
        self.conn.execute(
            "UPDATE entities SET aliases = ?2 WHERE id = ?1",
            params![id.0, serde_json::to_string(&entity.aliases)?],
        )?;
        Ok(())
    }

    pub fn link_unit_entity(&self, unit_id: &UnitId, entity_id: &EntityId) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO entity_links (unit_id, entity_id) VALUES (?1, ?2)",
            params![unit_id.0, entity_id.0],
        )?;
        Ok(())
    }

    pub fn units_mentioning(&self, entity_id: &EntityId) -> Result<Vec<UnitId>> {
        let mut stmt = self.conn.prepare(
            "SELECT unit_id FROM entity_links WHERE entity_id = ?1 ORDER BY unit_id",
        )?;
        let ids = stmt
            .query_map(params![entity_id.0], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(UnitId).collect())
    }

    /// Distinct entities linked to any of the given units, in first-seen
    /// unit order.
    pub fn entities_for_units(&self, ids: &[UnitId]) -> Result<Vec<Entity>> {
        let mut seen = BTreeSet::new();
        let mut entities = Vec::new();
        for unit_id in ids {
            let mut stmt = self.conn.prepare(
                "SELECT e.id, e.bank_id, e.canonical_name, e.entity_type, e.aliases
                 FROM entities e
                 JOIN entity_links l ON l.entity_id = e.id
                 WHERE l.unit_id = ?1
                 ORDER BY e.canonical_name",
            )?;
            let found = stmt
                .query_map(params![unit_id.0], Self::entity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for entity in found {
                if seen.insert(entity.id.clone()) {
                    entities.push(entity);
                }
            }
        }
        Ok(entities)
    }

    // ========================================================================
    // Observations
    // ========================================================================

    /// Current observation texts for an entity, oldest first.
    pub fn observations_for_entity(
        &self,
        bank_id: &BankId,
        entity_id: &EntityId,
    ) -> Result<Vec<MemoryUnit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM memory_units m
             JOIN entity_links l ON l.unit_id = m.id
             WHERE m.bank_id = ?1 AND l.entity_id = ?2 AND m.fact_type = 'observation'
             ORDER BY m.mentioned_at, m.id",
            UNIT_COLUMNS
                .split(", ")
                .map(|c| format!("m.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let units = stmt
            .query_map(params![bank_id.0, entity_id.0], unit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(units)
    }

    pub fn delete_observations_for_entity(
        &self,
        bank_id: &BankId,
        entity_id: &EntityId,
    ) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM memory_units
             WHERE bank_id = ?1 AND fact_type = 'observation'
               AND id IN (SELECT unit_id FROM entity_links WHERE entity_id = ?2)",
            params![bank_id.0, entity_id.0],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // Async retain operations
    // ========================================================================

    pub fn create_operation(&self, record: &OperationRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO operations (id, bank_id, status, unit_ids, error, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.0,
                record.bank_id.0,
                record.status.as_str(),
                serde_json::to_string(&record.unit_ids)?,
                record.error,
                fmt_ts(record.created_at),
                record.completed_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn mark_operation_running(&self, id: &OperationId) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET status = 'running' WHERE id = ?1",
            params![id.0],
        )?;
        Ok(())
    }

    pub fn finish_operation(
        &self,
        id: &OperationId,
        result: std::result::Result<&[UnitId], &str>,
    ) -> Result<()> {
        match result {
            Ok(unit_ids) => {
                self.conn.execute(
                    "UPDATE operations
                     SET status = 'completed', unit_ids = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![id.0, serde_json::to_string(unit_ids)?, fmt_ts(Utc::now())],
                )?;
            }
            Err(error) => {
                self.conn.execute(
                    "UPDATE operations
                     SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![id.0, error, fmt_ts(Utc::now())],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, bank_id, status, unit_ids, error, created_at, completed_at
                 FROM operations WHERE id = ?1",
                params![id.0],
                |row| {
                    let status: String = row.get(2)?;
                    let unit_ids: String = row.get(3)?;
                    let created_at: String = row.get(5)?;
                    let completed_at: Option<String> = row.get(6)?;
                    Ok(OperationRecord {
                        id: OperationId(row.get(0)?),
                        bank_id: BankId(row.get(1)?),
                        status: OperationStatus::parse(&status)
                            .unwrap_or(OperationStatus::Failed),
                        unit_ids: serde_json::from_str(&unit_ids).unwrap_or_default(),
                        error: row.get(4)?,
                        created_at: parse_ts(&created_at)?,
                        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
