//! Dependency edges and their audit history
//!
//! A dependency is a directed, temporally-valid edge: source talks to
//! target on (target_port, protocol). There is at most one *current*
//! row (valid_to = None) per key; invalidated rows are kept for
//! point-in-time queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directed edge between two assets with temporal validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub id: Uuid,
    pub source_asset_id: Uuid,
    pub target_asset_id: Uuid,
    pub target_port: u16,
    pub protocol: u8,

    // Lifetime counters
    pub bytes_total: u64,
    pub packets_total: u64,
    pub flows_total: u64,

    // Rolling windows, recomputed by the builder on update
    #[serde(default)]
    pub bytes_last_24h: u64,
    #[serde(default)]
    pub bytes_last_7d: u64,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    #[serde(default)]
    pub avg_latency_ms: Option<f64>,

    #[serde(default)]
    pub is_critical: bool,
    /// User confirmed this edge is intentional
    #[serde(default)]
    pub is_confirmed: bool,
    /// User asked to hide this edge from topology views
    #[serde(default)]
    pub is_ignored: bool,
    pub discovered_by: String,

    // Temporal validity
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
}

impl Dependency {
    /// Key identifying the current row for this edge.
    pub fn edge_key(&self) -> (Uuid, Uuid, u16, u8) {
        (
            self.source_asset_id,
            self.target_asset_id,
            self.target_port,
            self.protocol,
        )
    }

    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether the edge was valid at the given reference time.
    pub fn valid_at(&self, t: DateTime<Utc>) -> bool {
        self.valid_from <= t && self.valid_to.map_or(true, |end| end > t)
    }

    /// Fold a window's aggregate counters into the edge.
    pub fn apply_window(
        &mut self,
        bytes: u64,
        packets: u64,
        flows: u64,
        window_end: DateTime<Utc>,
    ) {
        self.bytes_total = self.bytes_total.saturating_add(bytes);
        self.packets_total = self.packets_total.saturating_add(packets);
        self.flows_total = self.flows_total.saturating_add(flows);
        if window_end > self.last_seen {
            self.last_seen = window_end;
        }
    }
}

/// Kinds of transitions recorded in the dependency history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyChangeKind {
    Created,
    Updated,
    Deleted,
    Stale,
}

/// Append-only audit record of dependency transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHistory {
    pub id: Uuid,
    pub dependency_id: Uuid,
    pub change_type: DependencyChangeKind,
    pub changed_at: DateTime<Utc>,

    // Snapshot of the edge at change time
    pub source_asset_id: Uuid,
    pub target_asset_id: Uuid,
    pub target_port: u16,
    pub protocol: u8,
    pub bytes_total: u64,
    pub flows_total: u64,

    #[serde(default)]
    pub reason: Option<String>,
    /// system, user:email, api
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub previous_state: Option<serde_json::Value>,
    #[serde(default)]
    pub new_state: Option<serde_json::Value>,
}

impl DependencyHistory {
    /// Snapshot the given edge into a history row.
    pub fn snapshot(
        dep: &Dependency,
        change_type: DependencyChangeKind,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dependency_id: dep.id,
            change_type,
            changed_at: Utc::now(),
            source_asset_id: dep.source_asset_id,
            target_asset_id: dep.target_asset_id,
            target_port: dep.target_port,
            protocol: dep.protocol,
            bytes_total: dep.bytes_total,
            flows_total: dep.flows_total,
            reason,
            triggered_by: Some("system".to_string()),
            previous_state: None,
            new_state: serde_json::to_value(dep).ok(),
        }
    }
}
