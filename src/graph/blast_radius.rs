//! Blast radius: who breaks when this asset fails
//!
//! Walks upstream dependents to a bounded depth. An asset nothing
//! depends on yields zero totals and an empty list, never nulls.

use super::traversal::{traverse, TraversalDirection};
use super::{GraphError, GraphSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadiusNode {
    pub id: Uuid,
    pub name: String,
    pub depth: u32,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadius {
    pub asset_id: Uuid,
    pub total_affected: u32,
    pub critical_affected: u32,
    pub affected: Vec<BlastRadiusNode>,
}

pub fn calculate(
    snapshot: &GraphSnapshot,
    asset: Uuid,
    max_depth: u32,
) -> Result<BlastRadius, GraphError> {
    let result = traverse(snapshot, asset, TraversalDirection::Upstream, max_depth)?;

    let affected: Vec<BlastRadiusNode> = result
        .nodes
        .into_iter()
        .map(|node| BlastRadiusNode {
            is_critical: snapshot.is_critical(node.asset_id),
            id: node.asset_id,
            name: node.name,
            depth: node.depth,
        })
        .collect();

    let critical_affected = affected.iter().filter(|n| n.is_critical).count() as u32;
    Ok(BlastRadius {
        asset_id: asset,
        total_affected: affected.len() as u32,
        critical_affected,
        affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::TestGraph;

    #[test]
    fn test_no_dependents_means_zeroes_not_nulls() {
        let mut g = TestGraph::new();
        let leaf = g.asset("leaf");
        let other = g.asset("other");
        g.edge(leaf, other, 443); // leaf depends on other; nothing depends on leaf

        let result = calculate(&g.snapshot(), leaf, 5).unwrap();
        assert_eq!(result.total_affected, 0);
        assert_eq!(result.critical_affected, 0);
        assert!(result.affected.is_empty());
    }

    #[test]
    fn test_counts_direct_and_transitive_dependents() {
        // web -> app -> db: db's failure hits app and web
        let mut g = TestGraph::new();
        let web = g.critical_asset("web");
        let app = g.asset("app");
        let db = g.asset("db");
        g.edge(web, app, 8080);
        g.edge(app, db, 5432);

        let result = calculate(&g.snapshot(), db, 5).unwrap();
        assert_eq!(result.total_affected, 2);
        assert_eq!(result.critical_affected, 1);

        let web_node = result.affected.iter().find(|n| n.id == web).unwrap();
        assert_eq!(web_node.depth, 2);
        assert!(web_node.is_critical);
    }

    #[test]
    fn test_depth_limit_trims_radius() {
        let mut g = TestGraph::new();
        let a = g.asset("a");
        let b = g.asset("b");
        let c = g.asset("c");
        g.edge(a, b, 1);
        g.edge(b, c, 2);

        let result = calculate(&g.snapshot(), c, 1).unwrap();
        assert_eq!(result.total_affected, 1);
        assert_eq!(result.affected[0].id, b);
    }
}
