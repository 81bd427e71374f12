//! Single-point-of-failure detection
//!
//! Estimates betweenness centrality over the current edge set with
//! Brandes' algorithm on the unweighted digraph, then blends in degree
//! and criticality to rank candidates. Scores are normalized to 0-100
//! and bucketed into coarse risk levels.
//!
//! An optional scope restricts the analysis to the subgraph induced by
//! the given asset set: out-of-scope nodes are neither ranked nor
//! traversed, so centrality reflects paths inside the scope only.

use super::{GraphSnapshot, TraversalDirection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Self::Critical
        } else if score >= 50.0 {
            Self::High
        } else if score >= 25.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpofCandidate {
    pub asset_id: Uuid,
    pub name: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub betweenness: f64,
    pub dependents: u32,
    pub dependencies: u32,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpofAnalysis {
    pub candidates: Vec<SpofCandidate>,
    pub nodes_analyzed: u32,
}

pub fn detect(snapshot: &GraphSnapshot, scope: Option<&HashSet<Uuid>>) -> SpofAnalysis {
    let nodes: Vec<Uuid> = snapshot
        .node_ids()
        .into_iter()
        .filter(|id| scope.map_or(true, |s| s.contains(id)))
        .collect();
    let betweenness = brandes_betweenness(snapshot, &nodes, scope);
    let max_betweenness = betweenness.values().copied().fold(0.0_f64, f64::max);

    let in_scope_degree = |id: Uuid, direction: TraversalDirection| -> u32 {
        snapshot
            .neighbors(id, direction)
            .iter()
            .filter(|&&idx| {
                let peer = snapshot.neighbor_of(idx, direction);
                scope.map_or(true, |s| s.contains(&peer))
            })
            .count() as u32
    };

    let mut candidates: Vec<SpofCandidate> = nodes
        .iter()
        .map(|&id| {
            let centrality = betweenness.get(&id).copied().unwrap_or(0.0);
            let normalized = if max_betweenness > 0.0 {
                centrality / max_betweenness
            } else {
                0.0
            };
            let dependents = in_scope_degree(id, TraversalDirection::Upstream);
            let dependencies = in_scope_degree(id, TraversalDirection::Downstream);
            let degree_score = (f64::from(dependents) / 10.0).min(1.0);
            let critical_bump = if snapshot.is_critical(id) { 0.15 } else { 0.0 };

            let risk_score =
                ((0.6 * normalized + 0.25 * degree_score + critical_bump) * 100.0).min(100.0);
            SpofCandidate {
                asset_id: id,
                name: snapshot.asset_name(id),
                risk_score,
                risk_level: RiskLevel::from_score(risk_score),
                betweenness: centrality,
                dependents,
                dependencies,
                is_critical: snapshot.is_critical(id),
            }
        })
        .filter(|c| c.risk_score > 0.0)
        .collect();

    candidates.sort_by(|a, b| {
        b.risk_score
            .partial_cmp(&a.risk_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    SpofAnalysis {
        nodes_analyzed: nodes.len() as u32,
        candidates,
    }
}

/// Brandes' betweenness centrality for an unweighted digraph,
/// restricted to the scoped subgraph when a scope is given.
fn brandes_betweenness(
    snapshot: &GraphSnapshot,
    nodes: &[Uuid],
    scope: Option<&HashSet<Uuid>>,
) -> HashMap<Uuid, f64> {
    let mut centrality: HashMap<Uuid, f64> = nodes.iter().map(|&n| (n, 0.0)).collect();

    for &source in nodes {
        // BFS phase
        let mut stack: Vec<Uuid> = Vec::new();
        let mut predecessors: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut sigma: HashMap<Uuid, f64> = HashMap::from([(source, 1.0)]);
        let mut distance: HashMap<Uuid, i64> = HashMap::from([(source, 0)]);
        let mut queue: VecDeque<Uuid> = VecDeque::from([source]);

        while let Some(v) = queue.pop_front() {
            stack.push(v);
            let d_v = distance[&v];
            let sigma_v = sigma[&v];
            for &edge_idx in snapshot.neighbors(v, TraversalDirection::Downstream) {
                let w = snapshot.neighbor_of(edge_idx, TraversalDirection::Downstream);
                if scope.is_some_and(|s| !s.contains(&w)) {
                    continue; // edge leaves the scoped subgraph
                }
                if !distance.contains_key(&w) {
                    distance.insert(w, d_v + 1);
                    queue.push_back(w);
                }
                if distance[&w] == d_v + 1 {
                    *sigma.entry(w).or_insert(0.0) += sigma_v;
                    predecessors.entry(w).or_default().push(v);
                }
            }
        }

        // Accumulation phase
        let mut delta: HashMap<Uuid, f64> = HashMap::new();
        while let Some(w) = stack.pop() {
            let coefficient = (1.0 + delta.get(&w).copied().unwrap_or(0.0)) / sigma[&w];
            if let Some(preds) = predecessors.get(&w) {
                for &v in preds {
                    *delta.entry(v).or_insert(0.0) += sigma[&v] * coefficient;
                }
            }
            if w != source {
                if let Some(slot) = centrality.get_mut(&w) {
                    *slot += delta.get(&w).copied().unwrap_or(0.0);
                }
            }
        }
    }

    centrality
}
