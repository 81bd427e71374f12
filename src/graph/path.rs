//! Best-path search between two assets
//!
//! `hops` uses plain BFS. The metric criteria enumerate simple paths
//! to a bounded depth and pick the best cumulative value: greatest for
//! bytes/flows, least for latency. Ties break by hop count, then by
//! lexicographic node order so results are deterministic.

use super::{GraphError, GraphSnapshot, TraversalDirection};
use crate::config::defaults::MAX_TRAVERSAL_DEPTH;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCriterion {
    Hops,
    Bytes,
    Flows,
    Latency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathResult {
    pub nodes: Vec<Uuid>,
    pub hops: u32,
    /// Cumulative value under the chosen criterion
    pub metric: f64,
    pub criterion: PathCriterion,
}

/// Find the single best path from `source` to `target`.
pub fn find_best(
    snapshot: &GraphSnapshot,
    source: Uuid,
    target: Uuid,
    criterion: PathCriterion,
) -> Result<Option<PathResult>, GraphError> {
    if source == target {
        return Ok(Some(PathResult {
            nodes: vec![source],
            hops: 0,
            metric: 0.0,
            criterion,
        }));
    }

    match criterion {
        PathCriterion::Hops => Ok(bfs_shortest(snapshot, source, target)),
        _ => Ok(best_metric_path(snapshot, source, target, criterion)),
    }
}

fn bfs_shortest(snapshot: &GraphSnapshot, source: Uuid, target: Uuid) -> Option<PathResult> {
    let mut previous: HashMap<Uuid, Uuid> = HashMap::new();
    let mut queue = VecDeque::from([source]);

    while let Some(current) = queue.pop_front() {
        if current == target {
            break;
        }
        // Deterministic neighbor order
        let mut neighbors: Vec<Uuid> = snapshot
            .neighbors(current, TraversalDirection::Downstream)
            .iter()
            .map(|&idx| snapshot.neighbor_of(idx, TraversalDirection::Downstream))
            .collect();
        neighbors.sort_unstable();

        for neighbor in neighbors {
            if neighbor != source && !previous.contains_key(&neighbor) {
                previous.insert(neighbor, current);
                queue.push_back(neighbor);
            }
        }
    }

    if !previous.contains_key(&target) {
        return None;
    }

    let mut nodes = vec![target];
    let mut cursor = target;
    while let Some(&prev) = previous.get(&cursor) {
        nodes.push(prev);
        if prev == source {
            break;
        }
        cursor = prev;
    }
    nodes.reverse();

    Some(PathResult {
        hops: nodes.len() as u32 - 1,
        metric: nodes.len() as f64 - 1.0,
        nodes,
        criterion: PathCriterion::Hops,
    })
}

/// Enumerate simple paths via bounded DFS and keep the best.
fn best_metric_path(
    snapshot: &GraphSnapshot,
    source: Uuid,
    target: Uuid,
    criterion: PathCriterion,
) -> Option<PathResult> {
    struct Search<'a> {
        snapshot: &'a GraphSnapshot,
        target: Uuid,
        criterion: PathCriterion,
        best: Option<PathResult>,
    }

    impl Search<'_> {
        fn edge_value(&self, edge_idx: usize) -> f64 {
            let edge = &self.snapshot.edges()[edge_idx];
            match self.criterion {
                PathCriterion::Bytes => edge.bytes_total as f64,
                PathCriterion::Flows => edge.flows_total as f64,
                // Unmeasured latency is pessimistically expensive so
                // measured routes win
                PathCriterion::Latency => edge.avg_latency_ms.unwrap_or(1_000.0),
                PathCriterion::Hops => 1.0,
            }
        }

        /// Whether `candidate` beats the best so far.
        fn improves(&self, metric: f64, path: &[Uuid]) -> bool {
            let Some(ref best) = self.best else {
                return true;
            };
            let metric_order = match self.criterion {
                // Greatest cumulative metric wins for volume criteria
                PathCriterion::Bytes | PathCriterion::Flows => {
                    metric.partial_cmp(&best.metric).map(std::cmp::Ordering::reverse)
                }
                // Least cumulative latency wins
                _ => metric.partial_cmp(&best.metric),
            }
            .unwrap_or(std::cmp::Ordering::Equal);

            match metric_order {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => {
                    let hops = path.len() as u32 - 1;
                    hops < best.hops
                        || (hops == best.hops
                            && path < best.nodes.as_slice())
                }
            }
        }

        fn dfs(&mut self, current: Uuid, path: &mut Vec<Uuid>, metric: f64) {
            if current == self.target {
                if self.improves(metric, path) {
                    self.best = Some(PathResult {
                        nodes: path.clone(),
                        hops: path.len() as u32 - 1,
                        metric,
                        criterion: self.criterion,
                    });
                }
                return;
            }
            if path.len() as u32 > MAX_TRAVERSAL_DEPTH {
                return;
            }

            let mut edges: Vec<usize> = self
                .snapshot
                .neighbors(current, TraversalDirection::Downstream)
                .to_vec();
            edges.sort_by_key(|&idx| self.snapshot.neighbor_of(idx, TraversalDirection::Downstream));

            for edge_idx in edges {
                let neighbor = self
                    .snapshot
                    .neighbor_of(edge_idx, TraversalDirection::Downstream);
                if path.contains(&neighbor) {
                    continue; // simple paths only
                }
                path.push(neighbor);
                self.dfs(neighbor, path, metric + self.edge_value(edge_idx));
                path.pop();
            }
        }
    }

    let mut search = Search {
        snapshot,
        target,
        criterion,
        best: None,
    };
    search.dfs(source, &mut vec![source], 0.0);
    search.best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::TestGraph;

    #[test]
    fn test_hops_finds_shortest() {
        // a -> b -> d and a -> c -> e -> d
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        let d = g.asset("d");
        let e = g.asset("e");
        g.edge(a, b, 1);
        g.edge(b, d, 2);
        g.edge(a, c, 3);
        g.edge(c, e, 4);
        g.edge(e, d, 5);

        let result = find_best(&g.snapshot(), a, d, PathCriterion::Hops)
            .unwrap()
            .unwrap();
        assert_eq!(result.hops, 2);
        assert_eq!(result.nodes, vec![a, b, d]);
    }

    #[test]
    fn test_bytes_prefers_heaviest_route() {
        // Short thin path vs longer fat path
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        let d = g.asset("d");
        g.edge_with(a, d, 1, 100, None);
        g.edge_with(a, b, 2, 50_000, None);
        g.edge_with(b, c, 3, 50_000, None);
        g.edge_with(c, d, 4, 50_000, None);

        let result = find_best(&g.snapshot(), a, d, PathCriterion::Bytes)
            .unwrap()
            .unwrap();
        assert_eq!(result.nodes, vec![a, b, c, d]);
        assert!((result.metric - 150_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_prefers_fastest_route() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let d = g.asset("d");
        g.edge_with(a, d, 1, 1_000, Some(500.0));
        g.edge_with(a, b, 2, 1_000, Some(5.0));
        g.edge_with(b, d, 3, 1_000, Some(10.0));

        let result = find_best(&g.snapshot(), a, d, PathCriterion::Latency)
            .unwrap()
            .unwrap();
        assert_eq!(result.nodes, vec![a, b, d]);
        assert!((result.metric - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_route_returns_none() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        g.edge(a, b, 1);
        // c is unreachable from a

        let result = find_best(&g.snapshot(), a, c, PathCriterion::Hops).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_source_equals_target() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let result = find_best(&g.snapshot(), a, a, PathCriterion::Bytes)
            .unwrap()
            .unwrap();
        assert_eq!(result.hops, 0);
        assert_eq!(result.nodes, vec![a]);
    }

    #[test]
    fn test_cycle_does_not_hang_search() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        g.edge(a, b, 1);
        g.edge(b, a, 2);
        g.edge(b, c, 3);

        let result = find_best(&g.snapshot(), a, c, PathCriterion::Flows)
            .unwrap()
            .unwrap();
        assert_eq!(result.nodes, vec![a, b, c]);
    }
}
