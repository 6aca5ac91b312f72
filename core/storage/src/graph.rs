use anyhow::{Context, Result};
use chrono::Utc;
use hindsight_schemas::{CausalKind, Edge, LinkType, UnitId};
use rusqlite::params;

use crate::database::{fmt_ts, Database};

/// One outgoing edge as seen from a source unit.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub dst: UnitId,
    pub link_type: LinkType,
    pub weight: f32,
    pub causal_kind: Option<CausalKind>,
}

impl Database {
    /// Store an edge. Entity and semantic edges are written in both
    /// directions; re-adding an existing edge refreshes its weight.
    pub fn add_edge(&self, edge: &Edge) -> Result<()> {
        edge.validate().context("refusing to store invalid edge")?;

        let now = fmt_ts(Utc::now());
        self.conn.execute(
            "INSERT OR REPLACE INTO unit_links (src, dst, link_type, weight, causal_kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.src.0,
                edge.dst.0,
                edge.link_type.as_str(),
                edge.weight as f64,
                edge.causal_kind.map(|k| k.as_str()),
                now,
            ],
        )?;

        if edge.link_type.is_symmetric() {
            self.conn.execute(
                "INSERT OR REPLACE INTO unit_links (src, dst, link_type, weight, causal_kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
                params![
                    edge.dst.0,
                    edge.src.0,
                    edge.link_type.as_str(),
                    edge.weight as f64,
                    now,
                ],
            )?;
        }
        Ok(())
    }

    pub fn add_edges(&self, edges: &[Edge]) -> Result<()> {
        for edge in edges {
            self.add_edge(edge)?;
        }
        Ok(())
    }

    /// Outgoing edges of a unit, optionally restricted to link types.
    pub fn neighbors(
        &self,
        unit_id: &UnitId,
        link_types: Option<&[LinkType]>,
    ) -> Result<Vec<Neighbor>> {
        let mut stmt = self.conn.prepare(
            "SELECT dst, link_type, weight, causal_kind
             FROM unit_links WHERE src = ?1 ORDER BY dst, link_type",
        )?;
        let neighbors = stmt
            .query_map(params![unit_id.0], |row| {
                let link_type: String = row.get(1)?;
                let causal_kind: Option<String> = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    link_type,
                    row.get::<_, f64>(2)? as f32,
                    causal_kind,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|(dst, link_type, weight, causal_kind)| {
                let link_type = LinkType::parse(&link_type)?;
                Some(Neighbor {
                    dst: UnitId(dst),
                    link_type,
                    weight,
                    causal_kind: causal_kind.as_deref().and_then(CausalKind::parse),
                })
            })
            .filter(|n| link_types.map_or(true, |types| types.contains(&n.link_type)))
            .collect();
        Ok(neighbors)
    }

    pub fn remove_edges_for(&self, unit_id: &UnitId) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM unit_links WHERE src = ?1 OR dst = ?1",
            params![unit_id.0],
        )?;
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn edge_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM unit_links", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{make_unit, one_hot, setup};
    use hindsight_schemas::BankId;

    fn edge(src: &UnitId, dst: &UnitId, link_type: LinkType, weight: f32) -> Edge {
        Edge {
            src: src.clone(),
            dst: dst.clone(),
            link_type,
            weight,
            causal_kind: None,
        }
    }

    #[test]
    fn test_symmetric_edges_stored_both_ways() {
        let db = setup("b1");
        let a = make_unit("b1", "node a", one_hot(0));
        let b = make_unit("b1", "node b", one_hot(1));
        db.insert_unit(&a).unwrap();
        db.insert_unit(&b).unwrap();

        db.add_edge(&edge(&a.id, &b.id, LinkType::Entity, 1.0)).unwrap();
        assert_eq!(db.edge_count().unwrap(), 2);

        let from_b = db.neighbors(&b.id, None).unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].dst, a.id);
        assert_eq!(from_b[0].link_type, LinkType::Entity);
    }

    #[test]
    fn test_causal_edges_are_directed() {
        let db = setup("b1");
        let a = make_unit("b1", "rain", one_hot(0));
        let b = make_unit("b1", "cancelled game", one_hot(1));
        db.insert_unit(&a).unwrap();
        db.insert_unit(&b).unwrap();

        db.add_edge(&Edge {
            src: a.id.clone(),
            dst: b.id.clone(),
            link_type: LinkType::Causal,
            weight: 1.0,
            causal_kind: Some(CausalKind::Causes),
        })
        .unwrap();

        assert_eq!(db.edge_count().unwrap(), 1);
        let from_a = db.neighbors(&a.id, None).unwrap();
        assert_eq!(from_a[0].causal_kind, Some(CausalKind::Causes));
        assert!(db.neighbors(&b.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_neighbor_type_filter() {
        let db = setup("b1");
        let a = make_unit("b1", "a", one_hot(0));
        let b = make_unit("b1", "b", one_hot(1));
        let c = make_unit("b1", "c", one_hot(2));
        db.insert_unit(&a).unwrap();
        db.insert_unit(&b).unwrap();
        db.insert_unit(&c).unwrap();

        db.add_edge(&edge(&a.id, &b.id, LinkType::Semantic, 0.8)).unwrap();
        db.add_edge(&edge(&a.id, &c.id, LinkType::Temporal, 0.5)).unwrap();

        let semantic_only = db.neighbors(&a.id, Some(&[LinkType::Semantic])).unwrap();
        assert_eq!(semantic_only.len(), 1);
        assert_eq!(semantic_only[0].dst, b.id);

        let all = db.neighbors(&a.id, None).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_endpoint_delete_cascades_edges() {
        let db = setup("b1");
        let bank = BankId("b1".into());
        let mut a = make_unit("b1", "doomed", one_hot(0));
        a.document_id = Some(hindsight_schemas::DocumentId("doc_x".into()));
        let b = make_unit("b1", "survivor", one_hot(1));
        db.upsert_document(&bank, a.document_id.as_ref().unwrap()).unwrap();
        db.insert_unit(&a).unwrap();
        db.insert_unit(&b).unwrap();

        db.add_edge(&edge(&a.id, &b.id, LinkType::Semantic, 0.9)).unwrap();
        assert_eq!(db.edge_count().unwrap(), 2);

        db.upsert_document(&bank, a.document_id.as_ref().unwrap()).unwrap();
        assert_eq!(db.edge_count().unwrap(), 0);
        assert!(db.get_unit(&b.id).unwrap().is_some());
    }

    #[test]
    fn test_remove_edges_for_unit() {
        let db = setup("b1");
        let a = make_unit("b1", "a", one_hot(0));
        let b = make_unit("b1", "b", one_hot(1));
        db.insert_unit(&a).unwrap();
        db.insert_unit(&b).unwrap();
        db.add_edge(&edge(&a.id, &b.id, LinkType::Semantic, 0.9)).unwrap();

        let removed = db.remove_edges_for(&a.id).unwrap();
        assert_eq!(removed, 2);
        assert!(db.neighbors(&b.id, None).unwrap().is_empty());
    }
}
