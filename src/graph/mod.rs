//! Graph analytics over the dependency graph
//!
//! All operations run against an immutable snapshot of edges valid at
//! a reference time (default now), with adjacency prebuilt in both
//! directions. Cycles are data here, not errors: traversals carry
//! visited sets and report cycles instead of following them.

pub mod blast_radius;
pub mod impact;
pub mod path;
pub mod spof;
pub mod traversal;

pub use blast_radius::{BlastRadius, BlastRadiusNode};
pub use impact::{FailureType, ImpactAnalysis, ImpactedAsset};
pub use path::{PathCriterion, PathResult};
pub use spof::{RiskLevel, SpofAnalysis, SpofCandidate};
pub use traversal::{TraversalDirection, TraversalNode, TraversalResult};

use crate::cache::TtlCache;
use crate::config::defaults::{DEFAULT_MAX_DEPTH, MAX_TRAVERSAL_DEPTH};
use crate::metrics::metrics;
use crate::storage::{AssetStore, DependencyStore, StorageError};
use crate::types::{Asset, Dependency};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown asset {0}")]
    UnknownAsset(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Immutable view of the graph at a reference time.
pub struct GraphSnapshot {
    edges: Vec<Dependency>,
    /// source asset -> indices into `edges`
    outbound: HashMap<Uuid, Vec<usize>>,
    /// target asset -> indices into `edges`
    inbound: HashMap<Uuid, Vec<usize>>,
    assets: HashMap<Uuid, Asset>,
}

impl GraphSnapshot {
    /// Snapshot of current (non-invalidated) edges.
    pub fn current(
        dependencies: &DependencyStore,
        assets: &AssetStore,
    ) -> Result<Self, StorageError> {
        Self::build(dependencies.list_current()?, assets)
    }

    /// Point-in-time snapshot honoring `valid_from`/`valid_to`.
    pub fn at_time(
        dependencies: &DependencyStore,
        assets: &AssetStore,
        t0: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        Self::build(dependencies.list_valid_at(t0)?, assets)
    }

    fn build(edges: Vec<Dependency>, asset_store: &AssetStore) -> Result<Self, StorageError> {
        let mut outbound: HashMap<Uuid, Vec<usize>> = HashMap::new();
        let mut inbound: HashMap<Uuid, Vec<usize>> = HashMap::new();
        let mut assets = HashMap::new();

        for (idx, edge) in edges.iter().enumerate() {
            // User-ignored edges stay out of the adjacency: analytics
            // follow the same visibility rule as topology views
            if edge.is_ignored {
                continue;
            }
            outbound.entry(edge.source_asset_id).or_default().push(idx);
            inbound.entry(edge.target_asset_id).or_default().push(idx);
            for id in [edge.source_asset_id, edge.target_asset_id] {
                if let std::collections::hash_map::Entry::Vacant(slot) = assets.entry(id) {
                    if let Some(asset) = asset_store.get(id)? {
                        slot.insert(asset);
                    }
                }
            }
        }

        Ok(Self {
            edges,
            outbound,
            inbound,
            assets,
        })
    }

    pub fn edges(&self) -> &[Dependency] {
        &self.edges
    }

    pub fn asset(&self, id: Uuid) -> Option<&Asset> {
        self.assets.get(&id)
    }

    pub fn asset_name(&self, id: Uuid) -> String {
        self.assets
            .get(&id)
            .map_or_else(|| id.to_string(), |a| a.name.clone())
    }

    pub fn is_critical(&self, id: Uuid) -> bool {
        self.assets.get(&id).is_some_and(|a| a.is_critical)
    }

    /// Edge indices leaving `id` in the requested direction.
    pub(crate) fn neighbors(&self, id: Uuid, direction: TraversalDirection) -> &[usize] {
        let map = match direction {
            // Downstream: what this asset depends on (follow outbound)
            TraversalDirection::Downstream => &self.outbound,
            // Upstream: who depends on this asset (follow inbound backwards)
            TraversalDirection::Upstream => &self.inbound,
        };
        map.get(&id).map_or(&[], Vec::as_slice)
    }

    /// The neighbor reached via edge `idx` when walking `direction`.
    pub(crate) fn neighbor_of(&self, idx: usize, direction: TraversalDirection) -> Uuid {
        match direction {
            TraversalDirection::Downstream => self.edges[idx].target_asset_id,
            TraversalDirection::Upstream => self.edges[idx].source_asset_id,
        }
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .outbound
            .keys()
            .chain(self.inbound.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Facade bundling the graph operations with caching and metrics.
///
/// Expensive reads are memoized under the `topology` prefix; the
/// resolution worker invalidates that prefix after every write batch.
pub struct GraphAnalytics {
    dependencies: Arc<DependencyStore>,
    assets: Arc<AssetStore>,
    cache: Arc<TtlCache>,
}

impl GraphAnalytics {
    pub fn new(
        dependencies: Arc<DependencyStore>,
        assets: Arc<AssetStore>,
        cache: Arc<TtlCache>,
    ) -> Self {
        Self {
            dependencies,
            assets,
            cache,
        }
    }

    fn snapshot(&self, t0: Option<DateTime<Utc>>) -> Result<GraphSnapshot, StorageError> {
        match t0 {
            Some(t0) => GraphSnapshot::at_time(&self.dependencies, &self.assets, t0),
            None => GraphSnapshot::current(&self.dependencies, &self.assets),
        }
    }

    fn clamp_depth(max_depth: Option<u32>) -> u32 {
        max_depth
            .unwrap_or(DEFAULT_MAX_DEPTH)
            .clamp(1, MAX_TRAVERSAL_DEPTH)
    }

    pub fn traverse(
        &self,
        root: Uuid,
        direction: TraversalDirection,
        max_depth: Option<u32>,
        t0: Option<DateTime<Utc>>,
    ) -> Result<TraversalResult, GraphError> {
        let started = std::time::Instant::now();
        let snapshot = self.snapshot(t0)?;
        let result = traversal::traverse(&snapshot, root, direction, Self::clamp_depth(max_depth));
        metrics().observe_traversal("traverse", started.elapsed().as_secs_f64());
        result
    }

    pub fn blast_radius(
        &self,
        asset: Uuid,
        max_depth: Option<u32>,
        t0: Option<DateTime<Utc>>,
    ) -> Result<BlastRadius, GraphError> {
        let depth = Self::clamp_depth(max_depth);
        let cache_key = TtlCache::make_key(
            "topology",
            &serde_json::json!({
                "op": "blast_radius",
                "asset": asset.to_string(),
                "depth": depth,
                "t0": t0.map(|t| t.to_rfc3339()),
            }),
        );
        if let Some(hit) = self.cache.get(&cache_key) {
            if let Ok(cached) = serde_json::from_value(hit) {
                return Ok(cached);
            }
        }

        let started = std::time::Instant::now();
        let snapshot = self.snapshot(t0)?;
        let result = blast_radius::calculate(&snapshot, asset, depth)?;
        metrics().observe_traversal("blast_radius", started.elapsed().as_secs_f64());

        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.set(&cache_key, value, None);
        }
        Ok(result)
    }

    pub fn impact(
        &self,
        asset: Uuid,
        failure_type: FailureType,
        include_indirect: bool,
        max_depth: Option<u32>,
        t0: Option<DateTime<Utc>>,
    ) -> Result<ImpactAnalysis, GraphError> {
        let started = std::time::Instant::now();
        let snapshot = self.snapshot(t0)?;
        let result = impact::analyze(
            &snapshot,
            asset,
            failure_type,
            include_indirect,
            Self::clamp_depth(max_depth),
        );
        metrics().observe_traversal("impact", started.elapsed().as_secs_f64());
        result
    }

    /// SPOF candidates, optionally restricted to the subgraph induced
    /// by `scope`. `None` analyzes the whole graph.
    pub fn spof(
        &self,
        scope: Option<&[Uuid]>,
        t0: Option<DateTime<Utc>>,
    ) -> Result<SpofAnalysis, GraphError> {
        // Sorted ids so equivalent scopes share a cache entry
        let scope_key = scope.map(|ids| {
            let mut sorted: Vec<String> = ids.iter().map(Uuid::to_string).collect();
            sorted.sort_unstable();
            sorted
        });
        let cache_key = TtlCache::make_key(
            "topology",
            &serde_json::json!({
                "op": "spof",
                "scope": scope_key,
                "t0": t0.map(|t| t.to_rfc3339()),
            }),
        );
        if let Some(hit) = self.cache.get(&cache_key) {
            if let Ok(cached) = serde_json::from_value(hit) {
                return Ok(cached);
            }
        }

        let started = std::time::Instant::now();
        let snapshot = self.snapshot(t0)?;
        let scope_set: Option<std::collections::HashSet<Uuid>> =
            scope.map(|ids| ids.iter().copied().collect());
        let result = spof::detect(&snapshot, scope_set.as_ref());
        metrics().observe_traversal("spof", started.elapsed().as_secs_f64());

        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.set(&cache_key, value, None);
        }
        Ok(result)
    }

    pub fn path(
        &self,
        source: Uuid,
        target: Uuid,
        criterion: PathCriterion,
        t0: Option<DateTime<Utc>>,
    ) -> Result<Option<PathResult>, GraphError> {
        let started = std::time::Instant::now();
        let snapshot = self.snapshot(t0)?;
        let result = path::find_best(&snapshot, source, target, criterion);
        metrics().observe_traversal("path", started.elapsed().as_secs_f64());
        result
    }

    /// Drop every memoized topology read. Called after graph writes.
    pub fn invalidate_cache(&self) -> usize {
        self.cache.invalidate_prefix("topology")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builder for graph snapshots backed by a scratch store.

    use super::GraphSnapshot;
    use crate::storage::Stores;
    use crate::types::{Asset, Dependency};
    use chrono::Utc;
    use uuid::Uuid;

    pub struct TestGraph {
        _tmp: tempfile::TempDir,
        pub stores: Stores,
        next_ip: u16,
    }

    impl TestGraph {
        pub fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let stores = Stores::open(tmp.path()).unwrap();
            Self {
                _tmp: tmp,
                stores,
                next_ip: 1,
            }
        }

        pub fn asset(&mut self, name: &str) -> Uuid {
            self.asset_with(name, false)
        }

        pub fn critical_asset(&mut self, name: &str) -> Uuid {
            self.asset_with(name, true)
        }

        fn asset_with(&mut self, name: &str, critical: bool) -> Uuid {
            let ip = format!("10.0.{}.{}", self.next_ip / 250, self.next_ip % 250 + 1);
            self.next_ip += 1;
            let mut asset = Asset::from_observation(ip.parse().unwrap(), Utc::now());
            asset.name = name.to_string();
            asset.is_critical = critical;
            self.stores.assets.create(&asset).unwrap();
            asset.id
        }

        pub fn edge(&self, source: Uuid, target: Uuid, port: u16) -> Uuid {
            self.edge_with(source, target, port, 1_000, None)
        }

        pub fn edge_with(
            &self,
            source: Uuid,
            target: Uuid,
            port: u16,
            bytes: u64,
            latency_ms: Option<f64>,
        ) -> Uuid {
            let now = Utc::now();
            let dep = Dependency {
                id: Uuid::new_v4(),
                source_asset_id: source,
                target_asset_id: target,
                target_port: port,
                protocol: 6,
                bytes_total: bytes,
                packets_total: bytes / 100,
                flows_total: 10,
                bytes_last_24h: bytes,
                bytes_last_7d: bytes,
                first_seen: now,
                last_seen: now,
                avg_latency_ms: latency_ms,
                is_critical: false,
                is_confirmed: false,
                is_ignored: false,
                discovered_by: "flow_analysis".to_string(),
                valid_from: now,
                valid_to: None,
            };
            self.stores.dependencies.insert_current(&dep).unwrap();
            dep.id
        }

        pub fn snapshot(&self) -> GraphSnapshot {
            GraphSnapshot::current(&self.stores.dependencies, &self.stores.assets).unwrap()
        }
    }
}
