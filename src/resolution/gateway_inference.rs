//! Gateway inference: observations to confident gateway edges
//!
//! Next-hop observations staged by the aggregator are rolled up into
//! `AssetGateway` relationships. Each rollup groups observations by
//! `(source_ip, gateway_ip, destination_network)`, scores confidence
//! from flow volume, observation count, temporal consistency, and byte
//! volume, then reassigns roles so each destination context has one
//! primary gateway and traffic shares that sum to ~1.

use super::asset_mapper::AssetMapper;
use crate::config::defaults::ECMP_SHARE_THRESHOLD;
use crate::storage::{GatewayStore, StorageError};
use crate::types::{AssetGateway, GatewayObservation, GatewayRole};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OBSERVATION_BATCH: usize = 5_000;

// Saturation points for the confidence components
const FLOWS_SATURATION: f64 = 100.0;
const OBSERVATIONS_SATURATION: f64 = 10.0;
const BYTES_SATURATION: f64 = 10_000_000.0;

pub struct GatewayInference {
    mapper: Arc<AssetMapper>,
    gateways: Arc<GatewayStore>,
}

impl GatewayInference {
    pub fn new(mapper: Arc<AssetMapper>, gateways: Arc<GatewayStore>) -> Self {
        Self { mapper, gateways }
    }

    /// One rollup pass. Returns how many observations were consumed.
    pub fn process_observations(&self) -> Result<usize, StorageError> {
        let observations = self
            .gateways
            .list_unprocessed_observations(OBSERVATION_BATCH)?;
        if observations.is_empty() {
            return Ok(0);
        }

        // Group by (source, gateway, destination network context)
        struct Rollup {
            bytes: u64,
            flows: u64,
            observations: u64,
            windows: HashSet<i64>,
            last_window_end: chrono::DateTime<Utc>,
        }
        let mut groups: HashMap<(IpAddr, IpAddr, Option<String>), Rollup> = HashMap::new();
        let mut windows_per_source: HashMap<IpAddr, HashSet<i64>> = HashMap::new();

        for obs in &observations {
            if obs.source_ip == obs.gateway_ip {
                warn!(ip = %obs.source_ip, "Self-gateway observation ignored");
                continue;
            }
            let destination_network = match obs.destination_ip {
                Some(dst) => self.mapper.best_rule(dst)?.map(|r| r.cidr.to_string()),
                None => None,
            };
            let entry = groups
                .entry((obs.source_ip, obs.gateway_ip, destination_network))
                .or_insert_with(|| Rollup {
                    bytes: 0,
                    flows: 0,
                    observations: 0,
                    windows: HashSet::new(),
                    last_window_end: obs.window_end,
                });
            entry.bytes += obs.bytes_total;
            entry.flows += obs.flows_count;
            entry.observations += 1;
            entry.windows.insert(obs.window_start.timestamp());
            if obs.window_end > entry.last_window_end {
                entry.last_window_end = obs.window_end;
            }
            windows_per_source
                .entry(obs.source_ip)
                .or_default()
                .insert(obs.window_start.timestamp());
        }

        let mut touched_sources: HashSet<Uuid> = HashSet::new();
        for ((source_ip, gateway_ip, destination_network), rollup) in groups {
            let total_windows = windows_per_source
                .get(&source_ip)
                .map_or(1, |w| w.len().max(1));

            let flow_score = (rollup.flows as f64 / FLOWS_SATURATION).min(1.0);
            let obs_score = (rollup.observations as f64 / OBSERVATIONS_SATURATION).min(1.0);
            let consistency = rollup.windows.len() as f64 / total_windows as f64;
            let byte_score = (rollup.bytes as f64 / BYTES_SATURATION).min(1.0);
            let confidence =
                0.3 * flow_score + 0.2 * obs_score + 0.3 * consistency + 0.2 * byte_score;

            let confidence_scores = HashMap::from([
                ("flow_count".to_string(), flow_score),
                ("observations".to_string(), obs_score),
                ("consistency".to_string(), consistency),
                ("byte_volume".to_string(), byte_score),
            ]);

            let source = self.mapper.resolve(source_ip, rollup.last_window_end)?;
            let gateway = self.mapper.resolve(gateway_ip, rollup.last_window_end)?;
            if source.asset_id == gateway.asset_id {
                continue;
            }
            touched_sources.insert(source.asset_id);

            let now = Utc::now();
            match self.gateways.get_current(
                source.asset_id,
                gateway.asset_id,
                destination_network.as_deref(),
            )? {
                Some(mut edge) => {
                    edge.bytes_total += rollup.bytes;
                    edge.flows_total += rollup.flows;
                    edge.confidence = confidence;
                    edge.confidence_scores = Some(confidence_scores);
                    edge.last_seen = rollup.last_window_end.max(edge.last_seen);
                    edge.last_inferred_at = Some(now);
                    self.gateways.upsert_current(&edge)?;
                }
                None => {
                    let edge = AssetGateway {
                        id: Uuid::new_v4(),
                        source_asset_id: source.asset_id,
                        gateway_asset_id: gateway.asset_id,
                        is_default_gateway: destination_network.is_none(),
                        destination_network,
                        gateway_role: GatewayRole::Primary,
                        bytes_total: rollup.bytes,
                        flows_total: rollup.flows,
                        bytes_last_24h: 0,
                        bytes_last_7d: 0,
                        traffic_share: None,
                        confidence,
                        confidence_scores: Some(confidence_scores),
                        first_seen: rollup.last_window_end,
                        last_seen: rollup.last_window_end,
                        inference_method: "next_hop".to_string(),
                        last_inferred_at: Some(now),
                        valid_from: now,
                        valid_to: None,
                    };
                    self.gateways.upsert_current(&edge)?;
                }
            }
        }

        self.gateways.mark_observations_processed(&observations)?;

        // Shares and roles are relative, so recompute per touched source
        for source in touched_sources {
            self.recompute_shares(source)?;
        }

        debug!(count = observations.len(), "Gateway observations rolled up");
        Ok(observations.len())
    }

    /// Recompute traffic shares and roles for every destination context
    /// of one source asset. The highest-share gateway is primary, other
    /// gateways with >= 20% share are ECMP, the rest secondary.
    pub fn recompute_shares(&self, source_asset_id: Uuid) -> Result<(), StorageError> {
        let edges = self.gateways.list_current_for_source(source_asset_id)?;

        let mut by_context: HashMap<Option<String>, Vec<AssetGateway>> = HashMap::new();
        for edge in edges {
            by_context
                .entry(edge.destination_network.clone())
                .or_default()
                .push(edge);
        }

        for (_, mut group) in by_context {
            let total_bytes: u64 = group.iter().map(|g| g.bytes_total).sum();
            if total_bytes == 0 {
                continue;
            }
            // Highest share first; ties broken by gateway id for
            // deterministic role assignment
            group.sort_by(|a, b| {
                b.bytes_total
                    .cmp(&a.bytes_total)
                    .then(a.gateway_asset_id.cmp(&b.gateway_asset_id))
            });

            for (rank, edge) in group.iter_mut().enumerate() {
                let share = edge.bytes_total as f64 / total_bytes as f64;
                edge.traffic_share = Some(share);
                edge.gateway_role = if rank == 0 {
                    GatewayRole::Primary
                } else if share >= ECMP_SHARE_THRESHOLD {
                    GatewayRole::Ecmp
                } else {
                    GatewayRole::Secondary
                };
                self.gateways.upsert_current(edge)?;
            }
        }

        Ok(())
    }

    /// Retire current gateways unseen since the cutoff.
    pub fn retire_stale(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut retired = 0;
        for edge in self.gateways.list_current()? {
            if edge.last_seen < cutoff {
                self.gateways.invalidate(edge.id, Utc::now())?;
                retired += 1;
            }
        }
        if retired > 0 {
            info!(count = retired, "Retired stale gateway relationships");
        }
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Stores;
    use crate::types::ObservationSource;
    use chrono::{Duration, TimeZone};

    fn setup() -> (tempfile::TempDir, Stores, GatewayInference) {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let mapper = Arc::new(AssetMapper::new(
            stores.assets.clone(),
            stores.classification.clone(),
        ));
        let inference = GatewayInference::new(mapper, stores.gateways.clone());
        (tmp, stores, inference)
    }

    fn observation(
        source: &str,
        gateway: &str,
        bytes: u64,
        flows: u64,
        window_offset_min: i64,
    ) -> GatewayObservation {
        let window_start = chrono::Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
            + Duration::minutes(window_offset_min);
        GatewayObservation {
            id: Uuid::new_v4(),
            source_ip: source.parse().unwrap(),
            gateway_ip: gateway.parse().unwrap(),
            destination_ip: Some("8.8.8.8".parse().unwrap()),
            observation_source: ObservationSource::NextHop,
            exporter_ip: None,
            window_start,
            window_end: window_start + Duration::seconds(60),
            bytes_total: bytes,
            flows_count: flows,
            is_processed: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rollup_creates_gateway_edge() {
        let (_tmp, stores, inference) = setup();
        for i in 0..3 {
            stores
                .gateways
                .add_observation(&observation("10.0.0.1", "10.0.0.254", 1_000, 5, i))
                .unwrap();
        }

        let processed = inference.process_observations().unwrap();
        assert_eq!(processed, 3);

        let edges = stores.gateways.list_current().unwrap();
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.gateway_role, GatewayRole::Primary);
        assert_eq!(edge.bytes_total, 3_000);
        assert!(edge.confidence > 0.0 && edge.confidence <= 1.0);

        let scores = edge.confidence_scores.as_ref().unwrap();
        assert!(scores.contains_key("flow_count"));
        assert!(scores.contains_key("consistency"));
        // All three windows covered by the same pair
        assert!((scores["consistency"] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_roles_and_shares_per_context() {
        let (_tmp, stores, inference) = setup();
        // Dominant gateway and a 25% alternate for the same source
        for i in 0..3 {
            stores
                .gateways
                .add_observation(&observation("10.0.0.1", "10.0.0.254", 7_500, 10, i))
                .unwrap();
        }
        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.253", 7_500, 10, 0))
            .unwrap();

        inference.process_observations().unwrap();

        let edges = stores.gateways.list_current().unwrap();
        assert_eq!(edges.len(), 2);

        let total: f64 = edges.iter().map(|e| e.traffic_share.unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-9);

        let primary = edges
            .iter()
            .find(|e| e.gateway_role == GatewayRole::Primary)
            .unwrap();
        let other = edges
            .iter()
            .find(|e| e.gateway_role != GatewayRole::Primary)
            .unwrap();
        assert!(primary.bytes_total >= other.bytes_total);
        // 25% share ranks as ECMP, not secondary
        assert_eq!(other.gateway_role, GatewayRole::Ecmp);
    }

    #[test]
    fn test_minor_gateway_is_secondary() {
        let (_tmp, stores, inference) = setup();
        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.254", 95_000, 50, 0))
            .unwrap();
        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.253", 5_000, 2, 0))
            .unwrap();

        inference.process_observations().unwrap();

        let edges = stores.gateways.list_current().unwrap();
        let minor = edges
            .iter()
            .find(|e| e.bytes_total == 5_000)
            .unwrap();
        assert_eq!(minor.gateway_role, GatewayRole::Secondary);
    }

    #[test]
    fn test_self_gateway_observation_ignored() {
        let (_tmp, stores, inference) = setup();
        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.1", 1_000, 5, 0))
            .unwrap();

        inference.process_observations().unwrap();
        assert!(stores.gateways.list_current().unwrap().is_empty());
    }

    #[test]
    fn test_destination_network_from_rules() {
        let (_tmp, stores, inference) = setup();
        stores
            .classification
            .upsert_rule(&crate::types::ClassificationRule {
                id: Uuid::new_v4(),
                name: "dns range".to_string(),
                cidr: "8.8.8.0/24".parse().unwrap(),
                priority: 10,
                is_active: true,
                environment: None,
                datacenter: None,
                location: None,
                asset_type: None,
                is_internal: Some(false),
                default_owner: None,
                default_team: None,
                created_at: Utc::now(),
            })
            .unwrap();

        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.254", 1_000, 5, 0))
            .unwrap();
        inference.process_observations().unwrap();

        let edges = stores.gateways.list_current().unwrap();
        assert_eq!(edges[0].destination_network.as_deref(), Some("8.8.8.0/24"));
        assert!(!edges[0].is_default_gateway);
    }

    #[test]
    fn test_retire_stale() {
        let (_tmp, stores, inference) = setup();
        stores
            .gateways
            .add_observation(&observation("10.0.0.1", "10.0.0.254", 1_000, 5, 0))
            .unwrap();
        inference.process_observations().unwrap();

        let retired = inference
            .retire_stale(Utc::now() + Duration::days(30))
            .unwrap();
        assert_eq!(retired, 1);
        assert!(stores.gateways.list_current().unwrap().is_empty());
    }
}
