//! Dependency builder: aggregates in, temporally-valid edges out
//!
//! For each unprocessed aggregate: infer the client→server direction,
//! resolve both endpoints to assets, then create or update the current
//! dependency row. Edge creation emits change events; a failure on one
//! aggregate leaves it unprocessed so the next sweep retries it.

use super::asset_mapper::AssetMapper;
use crate::classification::constants::REGISTERED_PORT_MAX;
use crate::metrics::metrics;
use crate::storage::{
    AggregateStore, AssetStore, ChangeStore, DependencyStore, StorageError,
};
use crate::types::{
    protocols, ChangeEvent, ChangeType, Dependency, FlowAggregate,
};
use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct DependencyBuilder {
    mapper: Arc<AssetMapper>,
    aggregates: Arc<AggregateStore>,
    assets: Arc<AssetStore>,
    dependencies: Arc<DependencyStore>,
    changes: Arc<ChangeStore>,
}

/// Result of one builder sweep.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Client→server orientation of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub source_ip: IpAddr,
    pub target_ip: IpAddr,
    pub target_port: u16,
}

/// Infer which endpoint is the server.
///
/// The destination port is the listening port when it sits in the
/// well-known/registered range and is lower than the source port.
/// Symmetric ambiguous flows tie-break toward the lower port. ICMP has
/// no ports; the type value rides in `target_port` and direction is
/// taken as observed.
pub fn determine_direction(aggregate: &FlowAggregate) -> Direction {
    if aggregate.protocol == protocols::ICMP || aggregate.protocol == protocols::ICMPV6 {
        return Direction {
            source_ip: aggregate.src_ip,
            target_ip: aggregate.dst_ip,
            target_port: aggregate.dst_port,
        };
    }

    let (src_port, dst_port) = (aggregate.src_port, aggregate.dst_port);
    let dst_listening = is_service_port(dst_port) && dst_port < src_port;
    let src_listening = is_service_port(src_port) && src_port < dst_port;

    let forward = if dst_listening {
        true
    } else if src_listening {
        false
    } else {
        // Both ephemeral or both service ports: lower port listens
        dst_port <= src_port
    };

    if forward {
        Direction {
            source_ip: aggregate.src_ip,
            target_ip: aggregate.dst_ip,
            target_port: dst_port,
        }
    } else {
        Direction {
            source_ip: aggregate.dst_ip,
            target_ip: aggregate.src_ip,
            target_port: src_port,
        }
    }
}

fn is_service_port(port: u16) -> bool {
    port <= REGISTERED_PORT_MAX
}

impl DependencyBuilder {
    pub fn new(
        mapper: Arc<AssetMapper>,
        aggregates: Arc<AggregateStore>,
        assets: Arc<AssetStore>,
        dependencies: Arc<DependencyStore>,
        changes: Arc<ChangeStore>,
    ) -> Self {
        Self {
            mapper,
            aggregates,
            assets,
            dependencies,
            changes,
        }
    }

    /// Process one batch of unprocessed aggregates.
    pub fn build_batch(&self, batch: &[FlowAggregate]) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();

        for aggregate in batch {
            match self.build_one(aggregate) {
                Ok(BuildResult::Created) => {
                    outcome.processed += 1;
                    outcome.created += 1;
                }
                Ok(BuildResult::Updated) => {
                    outcome.processed += 1;
                    outcome.updated += 1;
                }
                Ok(BuildResult::Skipped) => {
                    outcome.processed += 1;
                    outcome.skipped += 1;
                }
                Err(e) => {
                    // Leave is_processed=false; the next sweep retries
                    error!(
                        aggregate_id = %aggregate.id,
                        window_start = %aggregate.window_start,
                        error = %e,
                        "Aggregate processing failed — will retry"
                    );
                }
            }
        }

        outcome
    }

    fn build_one(&self, aggregate: &FlowAggregate) -> Result<BuildResult, StorageError> {
        // Re-read guard: a concurrent sweep may have consumed this
        // aggregate between listing and processing
        if let Some(current) = self.aggregates.get_by_id(aggregate.id)? {
            if current.is_processed {
                return Ok(BuildResult::Skipped);
            }
        }

        // Self-conversations are a direction bug upstream; skip loudly
        if aggregate.src_ip == aggregate.dst_ip {
            warn!(
                ip = %aggregate.src_ip,
                window_start = %aggregate.window_start,
                "Self-loop aggregate skipped"
            );
            self.finish_aggregate(aggregate, None, None)?;
            return Ok(BuildResult::Skipped);
        }

        let direction = determine_direction(aggregate);

        let source = self.mapper.resolve(direction.source_ip, aggregate.window_end)?;
        let target = self.mapper.resolve(direction.target_ip, aggregate.window_end)?;
        for resolution in [&source, &target] {
            if resolution.created {
                self.changes
                    .append_event(&self.mapper.discovery_event(resolution.asset_id)?)?;
                metrics()
                    .change_events
                    .inc(&format!("change_type=\"{}\"", ChangeType::AssetDiscovered));
            }
        }

        if source.asset_id == target.asset_id {
            // Two IPs resolving to the same asset would self-loop
            self.finish_aggregate(aggregate, Some(source.asset_id), Some(target.asset_id))?;
            return Ok(BuildResult::Skipped);
        }

        let result = match self.dependencies.get_current(
            source.asset_id,
            target.asset_id,
            direction.target_port,
            aggregate.protocol,
        )? {
            Some(mut dep) => {
                dep.apply_window(
                    aggregate.bytes_total,
                    aggregate.packets_total,
                    aggregate.flows_count,
                    aggregate.window_end,
                );
                let (last_24h, last_7d) = self.dependencies.record_activity(
                    dep.id,
                    aggregate.window_start,
                    aggregate.bytes_total,
                    Utc::now(),
                )?;
                dep.bytes_last_24h = last_24h;
                dep.bytes_last_7d = last_7d;
                self.dependencies.update(&dep)?;
                metrics().dependencies_updated.inc();
                BuildResult::Updated
            }
            None => {
                let dep = Dependency {
                    id: Uuid::new_v4(),
                    source_asset_id: source.asset_id,
                    target_asset_id: target.asset_id,
                    target_port: direction.target_port,
                    protocol: aggregate.protocol,
                    bytes_total: aggregate.bytes_total,
                    packets_total: aggregate.packets_total,
                    flows_total: aggregate.flows_count,
                    bytes_last_24h: aggregate.bytes_total,
                    bytes_last_7d: aggregate.bytes_total,
                    first_seen: aggregate.window_start,
                    last_seen: aggregate.window_end,
                    avg_latency_ms: None,
                    is_critical: false,
                    is_confirmed: false,
                    is_ignored: false,
                    discovered_by: "flow_analysis".to_string(),
                    valid_from: aggregate.window_start,
                    valid_to: None,
                };
                self.dependencies.insert_current(&dep)?;
                self.dependencies.record_activity(
                    dep.id,
                    aggregate.window_start,
                    aggregate.bytes_total,
                    Utc::now(),
                )?;
                self.bump_connection_counts(source.asset_id, target.asset_id)?;
                self.emit_created_events(&dep)?;
                metrics().dependencies_created.inc();
                BuildResult::Created
            }
        };

        // Record the listening service on the target
        self.assets.observe_service(
            target.asset_id,
            direction.target_port,
            aggregate.protocol,
            aggregate.flows_count,
            aggregate.window_end,
        )?;

        self.finish_aggregate(aggregate, Some(source.asset_id), Some(target.asset_id))?;
        debug!(
            source = %source.asset_id,
            target = %target.asset_id,
            port = direction.target_port,
            "Aggregate resolved"
        );
        Ok(result)
    }

    /// Stamp asset ids onto the aggregate and flip `is_processed`.
    fn finish_aggregate(
        &self,
        aggregate: &FlowAggregate,
        src_asset_id: Option<Uuid>,
        dst_asset_id: Option<Uuid>,
    ) -> Result<(), StorageError> {
        let mut updated = aggregate.clone();
        updated.src_asset_id = src_asset_id;
        updated.dst_asset_id = dst_asset_id;
        self.aggregates.mark_processed(&updated)
    }

    fn bump_connection_counts(&self, source: Uuid, target: Uuid) -> Result<(), StorageError> {
        if let Some(mut asset) = self.assets.get(source)? {
            asset.connections_out += 1;
            self.assets.update(&asset)?;
        }
        if let Some(mut asset) = self.assets.get(target)? {
            asset.connections_in += 1;
            self.assets.update(&asset)?;
        }
        Ok(())
    }

    fn emit_created_events(&self, dep: &Dependency) -> Result<(), StorageError> {
        let mut event = ChangeEvent::new(
            ChangeType::DependencyCreated,
            format!(
                "New dependency {} -> {}:{}/{}",
                dep.source_asset_id, dep.target_asset_id, dep.target_port, dep.protocol
            ),
        );
        event.dependency_id = Some(dep.id);
        event.source_asset_id = Some(dep.source_asset_id);
        event.target_asset_id = Some(dep.target_asset_id);
        event.new_state = serde_json::to_value(dep).ok();
        self.changes.append_event(&event)?;
        metrics()
            .change_events
            .inc(&format!("change_type=\"{}\"", ChangeType::DependencyCreated));

        // One endpoint explicitly external makes this a boundary crossing
        let source_external = self
            .assets
            .get(dep.source_asset_id)?
            .is_some_and(|a| a.is_external());
        let target_external = self
            .assets
            .get(dep.target_asset_id)?
            .is_some_and(|a| a.is_external());
        if source_external || target_external {
            let mut external = ChangeEvent::new(
                ChangeType::NewExternalConnection,
                format!(
                    "External connection {} -> {}:{}",
                    dep.source_asset_id, dep.target_asset_id, dep.target_port
                ),
            );
            external.dependency_id = Some(dep.id);
            external.source_asset_id = Some(dep.source_asset_id);
            external.target_asset_id = Some(dep.target_asset_id);
            external.impact_score = 25;
            self.changes.append_event(&external)?;
            metrics().change_events.inc(&format!(
                "change_type=\"{}\"",
                ChangeType::NewExternalConnection
            ));
        }

        Ok(())
    }
}

enum BuildResult {
    Created,
    Updated,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EventQuery, Stores};
    use chrono::{DateTime, Duration, TimeZone};

    fn setup() -> (tempfile::TempDir, Stores, DependencyBuilder) {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let mapper = Arc::new(AssetMapper::new(
            stores.assets.clone(),
            stores.classification.clone(),
        ));
        let builder = DependencyBuilder::new(
            mapper,
            stores.aggregates.clone(),
            stores.assets.clone(),
            stores.dependencies.clone(),
            stores.changes.clone(),
        );
        (tmp, stores, builder)
    }

    fn aggregate(
        src: &str,
        dst: &str,
        src_port: u16,
        dst_port: u16,
        window_start: DateTime<chrono::Utc>,
    ) -> FlowAggregate {
        FlowAggregate {
            id: Uuid::new_v4(),
            window_start,
            window_end: window_start + Duration::seconds(60),
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port,
            dst_port,
            protocol: protocols::TCP,
            bytes_total: 4_096,
            packets_total: 8,
            flows_count: 1,
            primary_gateway_ip: None,
            exporter_ip: None,
            src_asset_id: None,
            dst_asset_id: None,
            is_processed: false,
        }
    }

    fn window() -> DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_direction_client_to_server() {
        let agg = aggregate("10.0.0.1", "10.0.0.2", 54_321, 5_432, window());
        let dir = determine_direction(&agg);
        assert_eq!(dir.source_ip.to_string(), "10.0.0.1");
        assert_eq!(dir.target_port, 5_432);
    }

    #[test]
    fn test_direction_swaps_reversed_flow() {
        // Server-to-client leg of the same conversation
        let agg = aggregate("10.0.0.2", "10.0.0.1", 5_432, 54_321, window());
        let dir = determine_direction(&agg);
        assert_eq!(dir.source_ip.to_string(), "10.0.0.1");
        assert_eq!(dir.target_ip.to_string(), "10.0.0.2");
        assert_eq!(dir.target_port, 5_432);
    }

    #[test]
    fn test_direction_ambiguous_ties_to_lower_port() {
        let agg = aggregate("10.0.0.1", "10.0.0.2", 55_000, 60_000, window());
        let dir = determine_direction(&agg);
        // Both ephemeral: lower port (on the source side) listens
        assert_eq!(dir.target_ip.to_string(), "10.0.0.1");
        assert_eq!(dir.target_port, 55_000);
    }

    #[test]
    fn test_icmp_keys_on_type_without_swapping() {
        let mut agg = aggregate("10.0.0.1", "10.0.0.2", 0, 8, window());
        agg.protocol = protocols::ICMP;
        let dir = determine_direction(&agg);
        assert_eq!(dir.source_ip.to_string(), "10.0.0.1");
        assert_eq!(dir.target_port, 8);
    }

    #[test]
    fn test_creates_edge_and_events() {
        let (_tmp, stores, builder) = setup();
        let agg = aggregate("10.0.0.1", "10.0.0.2", 54_321, 5_432, window());
        stores.aggregates.upsert_window(&[agg.clone()]).unwrap();

        let outcome = builder.build_batch(&[agg]);
        assert_eq!(outcome.created, 1);

        let edges = stores.dependencies.list_current().unwrap();
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.target_port, 5_432);
        assert_eq!(edge.bytes_total, 4_096);
        assert_eq!(edge.flows_total, 1);

        let created = stores
            .changes
            .list_events(&EventQuery {
                change_type: Some(ChangeType::DependencyCreated),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(created.len(), 1);

        // Two assets discovered along the way
        let discovered = stores
            .changes
            .list_events(&EventQuery {
                change_type: Some(ChangeType::AssetDiscovered),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(discovered.len(), 2);

        // Aggregate is marked processed with asset ids filled in
        let pending = stores.aggregates.list_unprocessed(10).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_both_legs_update_one_edge() {
        let (_tmp, stores, builder) = setup();
        let forward = aggregate("10.0.0.1", "10.0.0.2", 54_321, 5_432, window());
        let reverse = aggregate(
            "10.0.0.2",
            "10.0.0.1",
            5_432,
            54_321,
            window() + Duration::seconds(60),
        );
        stores
            .aggregates
            .upsert_window(&[forward.clone(), reverse.clone()])
            .unwrap();

        let outcome = builder.build_batch(&[forward, reverse]);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 1);

        let edges = stores.dependencies.list_current().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].bytes_total, 8_192);
        assert_eq!(edges[0].flows_total, 2);
    }

    #[test]
    fn test_reprocessing_does_not_double_count() {
        let (_tmp, stores, builder) = setup();
        let agg = aggregate("10.0.0.1", "10.0.0.2", 54_321, 5_432, window());
        stores.aggregates.upsert_window(&[agg.clone()]).unwrap();

        builder.build_batch(&[agg]);
        // The sweep pulls from the unprocessed index, which is now empty
        let pending = stores.aggregates.list_unprocessed(10).unwrap();
        assert!(pending.is_empty());

        let edges = stores.dependencies.list_current().unwrap();
        assert_eq!(edges[0].bytes_total, 4_096);
    }

    #[test]
    fn test_self_loop_skipped() {
        let (_tmp, stores, builder) = setup();
        let agg = aggregate("10.0.0.1", "10.0.0.1", 54_321, 5_432, window());
        stores.aggregates.upsert_window(&[agg.clone()]).unwrap();

        let outcome = builder.build_batch(&[agg]);
        assert_eq!(outcome.skipped, 1);
        assert!(stores.dependencies.list_current().unwrap().is_empty());
        // Still marked processed so it doesn't loop forever
        assert!(stores.aggregates.list_unprocessed(10).unwrap().is_empty());
    }

    #[test]
    fn test_service_observed_on_target() {
        let (_tmp, stores, builder) = setup();
        let agg = aggregate("10.0.0.1", "10.0.0.2", 54_321, 5_432, window());
        stores.aggregates.upsert_window(&[agg.clone()]).unwrap();
        builder.build_batch(&[agg]);

        let target = stores
            .assets
            .get_by_ip("10.0.0.2".parse().unwrap())
            .unwrap()
            .unwrap();
        let services = stores.assets.list_services(target.id).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].port, 5_432);
        assert_eq!(target.connections_in, 1);
    }

    #[test]
    fn test_external_connection_event() {
        let (_tmp, stores, builder) = setup();
        // Rule marking 10.0.0.0/8 internal and 203.0.113.0/24 external
        stores
            .classification
            .upsert_rule(&crate::types::ClassificationRule {
                id: Uuid::new_v4(),
                name: "external range".to_string(),
                cidr: "203.0.113.0/24".parse().unwrap(),
                priority: 10,
                is_active: true,
                environment: None,
                datacenter: None,
                location: None,
                asset_type: None,
                is_internal: Some(false),
                default_owner: None,
                default_team: None,
                created_at: chrono::Utc::now(),
            })
            .unwrap();

        let agg = aggregate("10.0.0.1", "203.0.113.50", 54_321, 443, window());
        stores.aggregates.upsert_window(&[agg.clone()]).unwrap();
        builder.build_batch(&[agg]);

        let external = stores
            .changes
            .list_events(&EventQuery {
                change_type: Some(ChangeType::NewExternalConnection),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(external.len(), 1);
    }
}
