//! Breadth-first traversal with cycle reporting

use super::{GraphError, GraphSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Which way to walk the dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalDirection {
    /// Who depends on the root (dependents)
    Upstream,
    /// What the root depends on
    Downstream,
}

/// Edge attributes surfaced alongside each visited node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub target_port: u16,
    pub protocol: u8,
    pub bytes_total: u64,
    pub is_critical: bool,
}

/// One node reached by the traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalNode {
    pub asset_id: Uuid,
    pub name: String,
    pub depth: u32,
    /// Asset ids from the root to this node, inclusive
    pub path: Vec<Uuid>,
    pub edge: EdgeSummary,
}

/// Traversal output: visited nodes plus any cycles encountered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalResult {
    pub root: Uuid,
    pub direction: TraversalDirection,
    pub nodes: Vec<TraversalNode>,
    /// Edges that pointed back into the current path; reported, not
    /// followed
    pub cycles: Vec<(Uuid, Uuid)>,
}

/// BFS from `root`, visiting each asset once.
pub fn traverse(
    snapshot: &GraphSnapshot,
    root: Uuid,
    direction: TraversalDirection,
    max_depth: u32,
) -> Result<TraversalResult, GraphError> {
    let mut nodes = Vec::new();
    let mut cycles = Vec::new();
    let mut visited: HashSet<Uuid> = HashSet::from([root]);
    // Paths back to the root for cycle classification
    let mut paths: HashMap<Uuid, Vec<Uuid>> = HashMap::from([(root, vec![root])]);

    let mut queue: VecDeque<(Uuid, u32)> = VecDeque::from([(root, 0)]);
    while let Some((current, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for &edge_idx in snapshot.neighbors(current, direction) {
            let edge = &snapshot.edges()[edge_idx];
            let neighbor = snapshot.neighbor_of(edge_idx, direction);

            if visited.contains(&neighbor) {
                // An edge back into territory we've covered; a true
                // cycle if the neighbor sits on the current path
                if paths
                    .get(&current)
                    .is_some_and(|p| p.contains(&neighbor))
                {
                    cycles.push((current, neighbor));
                }
                continue;
            }
            visited.insert(neighbor);

            let mut path = paths.get(&current).cloned().unwrap_or_default();
            path.push(neighbor);
            paths.insert(neighbor, path.clone());

            nodes.push(TraversalNode {
                asset_id: neighbor,
                name: snapshot.asset_name(neighbor),
                depth: depth + 1,
                path,
                edge: EdgeSummary {
                    target_port: edge.target_port,
                    protocol: edge.protocol,
                    bytes_total: edge.bytes_total,
                    is_critical: edge.is_critical,
                },
            });
            queue.push_back((neighbor, depth + 1));
        }
    }

    Ok(TraversalResult {
        root,
        direction,
        nodes,
        cycles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::TestGraph;

    #[test]
    fn test_downstream_follows_outbound_edges() {
        // web -> app -> db
        let mut g = TestGraph::new();
        let web = g.asset("web");
        let app = g.asset("app");
        let db = g.asset("db");
        g.edge(web, app, 8080);
        g.edge(app, db, 5432);

        let snapshot = g.snapshot();
        let result = traverse(&snapshot, web, TraversalDirection::Downstream, 5).unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].asset_id, app);
        assert_eq!(result.nodes[0].depth, 1);
        assert_eq!(result.nodes[1].asset_id, db);
        assert_eq!(result.nodes[1].depth, 2);
        assert_eq!(result.nodes[1].path, vec![web, app, db]);
    }

    #[test]
    fn test_upstream_finds_dependents() {
        let mut g = TestGraph::new();
        let web = g.asset("web");
        let app = g.asset("app");
        let db = g.asset("db");
        g.edge(web, app, 8080);
        g.edge(app, db, 5432);

        let snapshot = g.snapshot();
        let result = traverse(&snapshot, db, TraversalDirection::Upstream, 5).unwrap();
        let ids: Vec<Uuid> = result.nodes.iter().map(|n| n.asset_id).collect();
        assert_eq!(ids, vec![app, web]);
    }

    #[test]
    fn test_max_depth_bounds_walk() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        g.edge(a, b, 1);
        g.edge(b, c, 2);

        let snapshot = g.snapshot();
        let result = traverse(&snapshot, a, TraversalDirection::Downstream, 1).unwrap();
        assert_eq!(result.nodes.len(), 1);
    }

    #[test]
    fn test_cycle_reported_not_followed() {
        // a -> b -> c -> a
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        g.edge(a, b, 1);
        g.edge(b, c, 2);
        g.edge(c, a, 3);

        let snapshot = g.snapshot();
        let result = traverse(&snapshot, a, TraversalDirection::Downstream, 10).unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.cycles, vec![(c, a)]);
    }

    #[test]
    fn test_diamond_visits_once() {
        // a -> b, a -> c, b -> d, c -> d
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        let d = g.asset("d");
        g.edge(a, b, 1);
        g.edge(a, c, 2);
        g.edge(b, d, 3);
        g.edge(c, d, 4);

        let snapshot = g.snapshot();
        let result = traverse(&snapshot, a, TraversalDirection::Downstream, 10).unwrap();
        let d_nodes: Vec<_> = result.nodes.iter().filter(|n| n.asset_id == d).collect();
        assert_eq!(d_nodes.len(), 1);
        // The re-convergent edge is not a cycle
        assert!(result.cycles.is_empty());
    }

    #[test]
    fn test_isolated_root_yields_empty() {
        let mut g = TestGraph::new();
        let lonely = g.asset("lonely");
        let snapshot = g.snapshot();
        let result = traverse(&snapshot, lonely, TraversalDirection::Downstream, 5).unwrap();
        assert!(result.nodes.is_empty());
        assert!(result.cycles.is_empty());
    }
}
