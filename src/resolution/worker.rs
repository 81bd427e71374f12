//! Resolution worker
//!
//! The background loop that turns raw flows into graph state:
//! aggregate pending windows, build dependencies from unprocessed
//! aggregates, roll up gateway observations on a ~30s cadence, run
//! change detection on its configured interval, and evaluate alerts.
//! One failure never stops the loop; the failing step is retried on
//! the next pass.

use super::aggregator::FlowAggregator;
use super::change_detector::ChangeDetector;
use super::dependency_builder::DependencyBuilder;
use super::gateway_inference::GatewayInference;
use crate::alerting::AlertEngine;
use crate::config::defaults::{AGGREGATE_RETENTION_DAYS, FLOW_RETENTION_DAYS};
use crate::config::ResolutionSettings;
use crate::graph::GraphAnalytics;
use crate::storage::{Stores, StorageError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Retention sweep cadence (seconds).
const RETENTION_SWEEP_INTERVAL_SECS: i64 = 3_600;

/// Shared worker counters for the status surface.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub aggregates_created: AtomicU64,
    pub dependencies_processed: AtomicU64,
    pub gateways_processed: AtomicU64,
    pub detection_cycles: AtomicU64,
    pub alerts_created: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub aggregates_created: u64,
    pub dependencies_processed: u64,
    pub gateways_processed: u64,
    pub detection_cycles: u64,
    pub alerts_created: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            aggregates_created: self.aggregates_created.load(Ordering::Relaxed),
            dependencies_processed: self.dependencies_processed.load(Ordering::Relaxed),
            gateways_processed: self.gateways_processed.load(Ordering::Relaxed),
            detection_cycles: self.detection_cycles.load(Ordering::Relaxed),
            alerts_created: self.alerts_created.load(Ordering::Relaxed),
        }
    }
}

pub struct ResolutionWorker {
    stores: Stores,
    aggregator: FlowAggregator,
    builder: DependencyBuilder,
    gateway_inference: GatewayInference,
    detector: ChangeDetector,
    alert_engine: AlertEngine,
    graph: Arc<GraphAnalytics>,
    settings: ResolutionSettings,
    pub stats: Arc<WorkerStats>,

    last_gateway_run: DateTime<Utc>,
    last_detection_run: DateTime<Utc>,
    last_retention_run: DateTime<Utc>,
}

impl ResolutionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        aggregator: FlowAggregator,
        builder: DependencyBuilder,
        gateway_inference: GatewayInference,
        detector: ChangeDetector,
        alert_engine: AlertEngine,
        graph: Arc<GraphAnalytics>,
        settings: ResolutionSettings,
    ) -> Self {
        Self {
            stores,
            aggregator,
            builder,
            gateway_inference,
            detector,
            alert_engine,
            graph,
            settings,
            stats: Arc::new(WorkerStats::default()),
            last_gateway_run: DateTime::<Utc>::MIN_UTC,
            last_detection_run: DateTime::<Utc>::MIN_UTC,
            last_retention_run: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Resolution worker started");
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(10));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let had_work = match self.tick(Utc::now()) {
                Ok(had_work) => had_work,
                Err(e) => {
                    error!(error = %e, "Resolution pass failed — backing off");
                    false
                }
            };

            if !had_work {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(poll) => {}
                }
            } else {
                // Yield so collectors and the API stay responsive
                tokio::task::yield_now().await;
            }
        }

        info!(
            dependencies_processed = self.stats.dependencies_processed.load(Ordering::Relaxed),
            "Resolution worker stopped"
        );
    }

    /// One pass of the pipeline. Returns whether any work was done.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut had_work = false;

        // Aggregate completed windows
        let aggregated = self.aggregator.run_once(now)?;
        if aggregated > 0 {
            self.stats
                .aggregates_created
                .fetch_add(aggregated as u64, Ordering::Relaxed);
            had_work = true;
        }

        // Build dependencies from unprocessed aggregates
        let pending = self
            .stores
            .aggregates
            .list_unprocessed(self.settings.batch_size)?;
        if !pending.is_empty() {
            let outcome = self.builder.build_batch(&pending);
            self.stats
                .dependencies_processed
                .fetch_add(outcome.processed as u64, Ordering::Relaxed);
            if outcome.created > 0 || outcome.updated > 0 {
                // Graph changed; memoized topology reads are stale
                self.graph.invalidate_cache();
            }
            had_work = true;
        }

        // Gateway rollup on its own cadence
        if (now - self.last_gateway_run).num_seconds()
            >= self.settings.gateway_rollup_interval_secs as i64
        {
            self.last_gateway_run = now;
            match self.gateway_inference.process_observations() {
                Ok(count) if count > 0 => {
                    self.stats
                        .gateways_processed
                        .fetch_add(count as u64, Ordering::Relaxed);
                    had_work = true;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Gateway inference failed"),
            }
            let gateway_cutoff =
                now - ChronoDuration::seconds(self.settings.staleness_threshold_secs as i64);
            if let Err(e) = self.gateway_inference.retire_stale(gateway_cutoff) {
                error!(error = %e, "Gateway staleness sweep failed");
            }
        }

        // Change detection on its own cadence
        if (now - self.last_detection_run).num_seconds()
            >= (self.settings.detection_interval_minutes * 60) as i64
        {
            self.last_detection_run = now;
            match self.detector.run_cycle(now) {
                Ok(summary) => {
                    self.stats.detection_cycles.fetch_add(1, Ordering::Relaxed);
                    if summary.stale_dependencies > 0 {
                        self.graph.invalidate_cache();
                    }
                }
                Err(e) => error!(error = %e, "Change detection failed"),
            }
        }

        // Alerts for anything the builder or detector emitted
        match self.alert_engine.process_pending(now) {
            Ok(outcome) => {
                if outcome.alerts_created > 0 {
                    self.stats
                        .alerts_created
                        .fetch_add(outcome.alerts_created as u64, Ordering::Relaxed);
                }
                if outcome.events_processed > 0 {
                    had_work = true;
                }
            }
            Err(e) => error!(error = %e, "Alert engine pass failed"),
        }

        // Retention, once an hour
        if (now - self.last_retention_run).num_seconds() >= RETENTION_SWEEP_INTERVAL_SECS {
            self.last_retention_run = now;
            if let Err(e) = self.run_retention(now) {
                error!(error = %e, "Retention sweep failed");
            }
        }

        Ok(had_work)
    }

    fn run_retention(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.stores
            .flows
            .purge_before(now - ChronoDuration::days(FLOW_RETENTION_DAYS))?;
        self.stores
            .aggregates
            .purge_before(now - ChronoDuration::days(AGGREGATE_RETENTION_DAYS))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::config::CacheSettings;
    use crate::resolution::asset_mapper::AssetMapper;
    use crate::storage::EventQuery;
    use crate::types::{protocols, ChangeType, FlowRecord};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn build_worker(settings: ResolutionSettings) -> (tempfile::TempDir, Stores, ResolutionWorker) {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let mapper = Arc::new(AssetMapper::new(
            stores.assets.clone(),
            stores.classification.clone(),
        ));
        let aggregator = FlowAggregator::new(
            stores.flows.clone(),
            stores.aggregates.clone(),
            stores.gateways.clone(),
            &settings,
        );
        let builder = DependencyBuilder::new(
            mapper.clone(),
            stores.aggregates.clone(),
            stores.assets.clone(),
            stores.dependencies.clone(),
            stores.changes.clone(),
        );
        let gateway_inference = GatewayInference::new(mapper, stores.gateways.clone());
        let detector = ChangeDetector::new(
            stores.dependencies.clone(),
            stores.assets.clone(),
            stores.changes.clone(),
            &settings,
        );
        let alert_engine = AlertEngine::new(stores.changes.clone(), stores.assets.clone());
        let cache = Arc::new(TtlCache::new(&CacheSettings::default()));
        let graph = Arc::new(GraphAnalytics::new(
            stores.dependencies.clone(),
            stores.assets.clone(),
            cache,
        ));
        let worker = ResolutionWorker::new(
            stores.clone(),
            aggregator,
            builder,
            gateway_inference,
            detector,
            alert_engine,
            graph,
            settings,
        );
        (tmp, stores, worker)
    }

    fn flow(ts: DateTime<Utc>, next_hop: Option<&str>) -> FlowRecord {
        let mut extended_fields = HashMap::new();
        if let Some(hop) = next_hop {
            extended_fields.insert("next_hop".to_string(), serde_json::json!(hop));
        }
        FlowRecord {
            timestamp: ts,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 54_321,
            dst_port: 5_432,
            protocol: protocols::TCP,
            bytes_count: 4_096,
            packets_count: 8,
            exporter_ip: "192.168.0.1".parse().unwrap(),
            flow_start: None,
            flow_end: None,
            flow_duration_ms: None,
            tcp_flags: None,
            exporter_id: None,
            sampling_rate: 1,
            input_interface: None,
            output_interface: None,
            tos: None,
            flow_source: "netflow_v5".to_string(),
            extended_fields,
        }
    }

    #[test]
    fn test_full_pipeline_tick() {
        let settings = ResolutionSettings {
            window_seconds: 60,
            watermark_delay_secs: 90,
            ..Default::default()
        };
        let (_tmp, stores, mut worker) = build_worker(settings);

        // One flow in a long-completed window
        let flow_time = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 10).unwrap();
        stores
            .flows
            .insert_batch(&[flow(flow_time, Some("10.0.0.254"))])
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 10, 0).unwrap();
        let had_work = worker.tick(now).unwrap();
        assert!(had_work);

        // Aggregate, edge, gateway edge, and events all exist
        assert_eq!(stores.aggregates.count_all().unwrap(), 1);
        let edges = stores.dependencies.list_current().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_port, 5_432);
        assert_eq!(edges[0].bytes_total, 4_096);

        let gateways = stores.gateways.list_current().unwrap();
        assert_eq!(gateways.len(), 1);

        let created_events = stores
            .changes
            .list_events(&EventQuery {
                change_type: Some(ChangeType::DependencyCreated),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(created_events.len(), 1);
        // The alert engine pass consumed the event in the same tick
        assert!(created_events[0].is_processed);

        // Second tick with no new flows is a no-op
        let had_work = worker.tick(now + ChronoDuration::seconds(1)).unwrap();
        assert!(!had_work);
    }
}
