use anyhow::Result;
use hindsight_schemas::{CausalKind, LinkType, UnitId};
use hindsight_storage::Neighbor;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Tuning knobs for spreading activation.
#[derive(Debug, Clone)]
pub struct SpreadingConfig {
    /// Stop after this many nodes have been expanded.
    pub max_visits: usize,
    /// Activation decay per hop.
    pub decay: f32,
    /// Nodes at this hop depth no longer propagate.
    pub max_hops: u32,
    /// Stop once the hottest frontier node falls below this.
    pub min_activation: f32,
}

impl Default for SpreadingConfig {
    fn default() -> Self {
        Self {
            max_visits: 300,
            decay: 0.8,
            max_hops: 5,
            min_activation: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seed {
    pub id: UnitId,
    pub activation: f32,
}

#[derive(Debug, Clone)]
pub struct ActivatedNode {
    pub id: UnitId,
    pub activation: f32,
    pub hops: u32,
}

/// Source of outgoing edges; the store implements this, tests use maps.
pub trait NeighborProvider {
    fn neighbors_of(&self, id: &UnitId) -> Result<Vec<Neighbor>>;
}

impl<S: std::hash::BuildHasher> NeighborProvider for HashMap<UnitId, Vec<Neighbor>, S> {
    fn neighbors_of(&self, id: &UnitId) -> Result<Vec<Neighbor>> {
        Ok(self.get(id).cloned().unwrap_or_default())
    }
}

/// Causal neighbours are prioritised over plain edges.
pub fn causal_boost(link_type: LinkType, causal_kind: Option<CausalKind>) -> f32 {
    match (link_type, causal_kind) {
        (LinkType::Causal, Some(CausalKind::Causes | CausalKind::CausedBy)) => 2.0,
        (LinkType::Causal, Some(CausalKind::Enables | CausalKind::Prevents)) => 1.5,
        _ => 1.0,
    }
}

struct NodeState {
    activation: f32,
    hops: u32,
    expanded: bool,
    /// Largest boost factor among arriving boosted contributions; the
    /// accumulated activation is capped here after each sum.
    boost_cap: Option<f32>,
}

struct Frontier {
    activation: f32,
    hops: u32,
    id: UnitId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on activation; fewer hops, then lexicographic id
        // break ties deterministically.
        self.activation
            .total_cmp(&other.activation)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Spreading activation over the typed weighted unit graph.
///
/// Activation accumulates by summing contributions, so cycles need no
/// special handling: each node propagates once, at the activation it
/// held when it reached the top of the frontier, and the budget plus
/// decay bound the walk. `retain` filters which neighbours may receive
/// activation at all (the temporal strategy narrows to a broadened
/// interval through it).
pub fn spread<P, F>(
    provider: &P,
    seeds: &[Seed],
    config: &SpreadingConfig,
    mut retain: F,
) -> Result<Vec<ActivatedNode>>
where
    P: NeighborProvider + ?Sized,
    F: FnMut(&UnitId) -> Result<bool>,
{
    let mut nodes: HashMap<UnitId, NodeState> = HashMap::new();
    let mut frontier = BinaryHeap::new();

    for seed in seeds {
        let state = nodes.entry(seed.id.clone()).or_insert(NodeState {
            activation: 0.0,
            hops: 0,
            expanded: false,
            boost_cap: None,
        });
        state.activation += seed.activation;
        frontier.push(Frontier {
            activation: state.activation,
            hops: 0,
            id: seed.id.clone(),
        });
    }

    let mut visits = 0;
    while let Some(entry) = frontier.pop() {
        if visits >= config.max_visits || entry.activation < config.min_activation {
            break;
        }
        let Some(state) = nodes.get(&entry.id) else {
            continue;
        };
        // Stale frontier entries (the node has accumulated more since
        // this push) and already-expanded nodes are skipped.
        if state.expanded || entry.activation < state.activation {
            continue;
        }
        let (activation, hops) = (state.activation, state.hops);
        nodes.get_mut(&entry.id).unwrap().expanded = true;
        visits += 1;

        if hops >= config.max_hops {
            continue;
        }

        for neighbor in provider.neighbors_of(&entry.id)? {
            if !retain(&neighbor.dst)? {
                continue;
            }
            let boost = causal_boost(neighbor.link_type, neighbor.causal_kind);
            let effective = neighbor.weight * boost;
            let contribution = activation * config.decay * effective;
            if contribution <= 0.0 {
                continue;
            }

            let state = nodes.entry(neighbor.dst.clone()).or_insert(NodeState {
                activation: 0.0,
                hops: hops + 1,
                expanded: false,
                boost_cap: None,
            });
            state.activation += contribution;
            if effective > 1.0 {
                state.boost_cap = Some(state.boost_cap.map_or(boost, |c| c.max(boost)));
            }
            if let Some(cap) = state.boost_cap {
                state.activation = state.activation.min(cap);
            }
            state.hops = state.hops.min(hops + 1);
            if !state.expanded {
                frontier.push(Frontier {
                    activation: state.activation,
                    hops: state.hops,
                    id: neighbor.dst.clone(),
                });
            }
        }
    }

    let mut activated: Vec<ActivatedNode> = nodes
        .into_iter()
        .map(|(id, state)| ActivatedNode {
            id,
            activation: state.activation,
            hops: state.hops,
        })
        .collect();
    activated.sort_by(|a, b| {
        b.activation
            .total_cmp(&a.activation)
            .then_with(|| a.hops.cmp(&b.hops))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(activated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> UnitId {
        UnitId(name.to_string())
    }

    fn edge(dst: &str, link_type: LinkType, weight: f32, causal_kind: Option<CausalKind>) -> Neighbor {
        Neighbor {
            dst: id(dst),
            link_type,
            weight,
            causal_kind,
        }
    }

    fn seed(name: &str, activation: f32) -> Seed {
        Seed {
            id: id(name),
            activation,
        }
    }

    fn graph(edges: &[(&str, Neighbor)]) -> HashMap<UnitId, Vec<Neighbor>> {
        let mut map: HashMap<UnitId, Vec<Neighbor>> = HashMap::new();
        for (src, neighbor) in edges {
            map.entry(id(src)).or_default().push(neighbor.clone());
        }
        map
    }

    fn keep_all(_: &UnitId) -> Result<bool> {
        Ok(true)
    }

    #[test]
    fn test_chain_decay() {
        let g = graph(&[
            ("a", edge("b", LinkType::Entity, 1.0, None)),
            ("b", edge("c", LinkType::Entity, 1.0, None)),
        ]);
        let result = spread(&g, &[seed("a", 1.0)], &SpreadingConfig::default(), keep_all).unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result[0].id, id("a"));
        assert!((result[0].activation - 1.0).abs() < 1e-6);
        assert!((result[1].activation - 0.8).abs() < 1e-6);
        assert!((result[2].activation - 0.64).abs() < 1e-6);
        assert_eq!(result[2].hops, 2);
    }

    #[test]
    fn test_causal_boost_prioritises_neighbours() {
        let g = graph(&[
            ("a", edge("cause", LinkType::Causal, 1.0, Some(CausalKind::Causes))),
            ("a", edge("enabler", LinkType::Causal, 1.0, Some(CausalKind::Enables))),
            ("a", edge("plain", LinkType::Entity, 1.0, None)),
        ]);
        let result = spread(&g, &[seed("a", 0.5)], &SpreadingConfig::default(), keep_all).unwrap();

        let activation = |name: &str| {
            result
                .iter()
                .find(|n| n.id == id(name))
                .unwrap()
                .activation
        };
        assert!((activation("cause") - 0.8).abs() < 1e-6); // 0.5 * 0.8 * 2.0
        assert!((activation("enabler") - 0.6).abs() < 1e-6); // 0.5 * 0.8 * 1.5
        assert!((activation("plain") - 0.4).abs() < 1e-6); // 0.5 * 0.8 * 1.0
        assert!(activation("cause") > activation("enabler"));
        assert!(activation("enabler") > activation("plain"));
    }

    #[test]
    fn test_boosted_sum_clamped_to_boost_cap() {
        // Two strong causal parents both feed x: 1.6 + 1.6 clamps at 2.0.
        let g = graph(&[
            ("a", edge("x", LinkType::Causal, 1.0, Some(CausalKind::Causes))),
            ("b", edge("x", LinkType::Causal, 1.0, Some(CausalKind::Causes))),
        ]);
        let result = spread(
            &g,
            &[seed("a", 1.0), seed("b", 1.0)],
            &SpreadingConfig::default(),
            keep_all,
        )
        .unwrap();

        let x = result.iter().find(|n| n.id == id("x")).unwrap();
        assert!((x.activation - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_unboosted_contributions_sum() {
        let g = graph(&[
            ("a", edge("x", LinkType::Entity, 1.0, None)),
            ("b", edge("x", LinkType::Entity, 1.0, None)),
        ]);
        let result = spread(
            &g,
            &[seed("a", 0.5), seed("b", 0.5)],
            &SpreadingConfig::default(),
            keep_all,
        )
        .unwrap();

        let x = result.iter().find(|n| n.id == id("x")).unwrap();
        assert!((x.activation - 0.8).abs() < 1e-6); // 0.4 + 0.4, no cap
    }

    #[test]
    fn test_terminates_on_cycles() {
        let g = graph(&[
            ("a", edge("b", LinkType::Entity, 1.0, None)),
            ("b", edge("c", LinkType::Entity, 1.0, None)),
            ("c", edge("a", LinkType::Entity, 1.0, None)),
        ]);
        let result = spread(&g, &[seed("a", 1.0)], &SpreadingConfig::default(), keep_all).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_visit_budget_stops_expansion() {
        let g = graph(&[
            ("a", edge("b", LinkType::Entity, 1.0, None)),
            ("b", edge("c", LinkType::Entity, 1.0, None)),
        ]);
        let config = SpreadingConfig {
            max_visits: 1,
            ..Default::default()
        };
        let result = spread(&g, &[seed("a", 1.0)], &config, keep_all).unwrap();
        // Only the seed expanded: b received activation, c never did.
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_min_activation_threshold() {
        let g = graph(&[
            ("a", edge("b", LinkType::Temporal, 0.3, None)),
            ("b", edge("c", LinkType::Temporal, 0.3, None)),
        ]);
        let config = SpreadingConfig {
            min_activation: 0.05,
            ..Default::default()
        };
        // b gets 0.24; c would get 0.0576, expanded. One more hop would
        // fall below threshold. With a tighter threshold c is cut off.
        let result = spread(&g, &[seed("a", 1.0)], &config, keep_all).unwrap();
        assert_eq!(result.len(), 3);

        let tight = SpreadingConfig {
            min_activation: 0.3,
            ..Default::default()
        };
        let result = spread(&g, &[seed("a", 1.0)], &tight, keep_all).unwrap();
        // c still receives a contribution before the frontier drains,
        // but b itself is below threshold and never expands.
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_hop_limit() {
        let g = graph(&[
            ("a", edge("b", LinkType::Entity, 1.0, None)),
            ("b", edge("c", LinkType::Entity, 1.0, None)),
            ("c", edge("d", LinkType::Entity, 1.0, None)),
        ]);
        let config = SpreadingConfig {
            max_hops: 2,
            ..Default::default()
        };
        let result = spread(&g, &[seed("a", 1.0)], &config, keep_all).unwrap();
        // d is at hop 3; c (hop 2) no longer propagates.
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_retain_predicate_blocks_neighbours() {
        let g = graph(&[
            ("a", edge("b", LinkType::Entity, 1.0, None)),
            ("a", edge("blocked", LinkType::Entity, 1.0, None)),
        ]);
        let result = spread(&g, &[seed("a", 1.0)], &SpreadingConfig::default(), |u| {
            Ok(u != &id("blocked"))
        })
        .unwrap();
        assert_eq!(result.len(), 2);
        assert!(!result.iter().any(|n| n.id == id("blocked")));
    }

    #[test]
    fn test_tie_breaks_by_hops_then_id() {
        let g = graph(&[
            ("a", edge("z", LinkType::Entity, 1.0, None)),
            ("z", edge("b", LinkType::Entity, 1.0, None)),
        ]);
        // b and a second seed "m" both end at activation 0.64.
        let result = spread(
            &g,
            &[seed("a", 1.0), seed("m", 0.64)],
            &SpreadingConfig::default(),
            keep_all,
        )
        .unwrap();
        let positions: Vec<&str> = result.iter().map(|n| n.id.0.as_str()).collect();
        // m is a seed (hop 0), b is two hops out; equal activation goes
        // to the closer node.
        let m_pos = positions.iter().position(|p| *p == "m").unwrap();
        let b_pos = positions.iter().position(|p| *p == "b").unwrap();
        assert!(m_pos < b_pos);
    }
}
