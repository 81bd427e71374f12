//! Failure impact analysis
//!
//! Estimates the consequence of an asset failing: which dependents are
//! hit directly or transitively, and a 0-100 severity score weighted by
//! failure mode, dependent count, and how much of the fallout is
//! critical.

use super::traversal::{traverse, TraversalDirection};
use super::{GraphError, GraphSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the asset is assumed to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Complete,
    Degraded,
    Intermittent,
}

impl FailureType {
    /// Weight applied to the severity score.
    fn weight(self) -> f64 {
        match self {
            Self::Complete => 1.0,
            Self::Degraded => 0.6,
            Self::Intermittent => 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactedAsset {
    pub id: Uuid,
    pub name: String,
    pub depth: u32,
    pub is_critical: bool,
    /// "direct" at depth 1, "indirect" beyond
    pub impact_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub asset_id: Uuid,
    pub failure_type: FailureType,
    pub severity_score: u8,
    pub affected_assets: Vec<ImpactedAsset>,
    pub direct_count: u32,
    pub indirect_count: u32,
    pub critical_count: u32,
}

pub fn analyze(
    snapshot: &GraphSnapshot,
    asset: Uuid,
    failure_type: FailureType,
    include_indirect: bool,
    max_depth: u32,
) -> Result<ImpactAnalysis, GraphError> {
    let depth = if include_indirect { max_depth } else { 1 };
    let result = traverse(snapshot, asset, TraversalDirection::Upstream, depth)?;

    let affected_assets: Vec<ImpactedAsset> = result
        .nodes
        .into_iter()
        .map(|node| ImpactedAsset {
            is_critical: snapshot.is_critical(node.asset_id),
            impact_type: if node.depth == 1 {
                "direct".to_string()
            } else {
                "indirect".to_string()
            },
            id: node.asset_id,
            name: node.name,
            depth: node.depth,
        })
        .collect();

    let direct_count = affected_assets.iter().filter(|a| a.depth == 1).count() as u32;
    let indirect_count = affected_assets.len() as u32 - direct_count;
    let critical_count = affected_assets.iter().filter(|a| a.is_critical).count() as u32;

    let severity_score = severity(
        failure_type,
        affected_assets.len() as u32,
        critical_count,
        snapshot.is_critical(asset),
    );

    Ok(ImpactAnalysis {
        asset_id: asset,
        failure_type,
        severity_score,
        affected_assets,
        direct_count,
        indirect_count,
        critical_count,
    })
}

/// Severity: failure weight × (base for the asset itself + dependent
/// volume + critical fallout), clamped to [0, 100].
fn severity(failure_type: FailureType, affected: u32, critical: u32, asset_critical: bool) -> u8 {
    let base = if asset_critical { 40.0 } else { 20.0 };
    let volume = 40.0 * (f64::from(affected) / 20.0).min(1.0);
    let critical_share = if affected > 0 {
        20.0 * f64::from(critical) / f64::from(affected)
    } else {
        0.0
    };
    let raw = failure_type.weight() * (base + volume + critical_share);
    raw.clamp(0.0, 100.0).round() as u8
}
