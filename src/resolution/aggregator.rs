//! Tumbling-window flow aggregation
//!
//! Rolls raw flow records into one `FlowAggregate` per
//! `(src_ip, dst_ip, src_port, dst_port, protocol)` group per window.
//! Windows are discovered from the raw store and processed in ascending
//! order; the most recent window waits out a watermark delay so late
//! flows still land in the right bucket. Reprocessing a window writes
//! identical rows, so the whole step is idempotent.

use crate::config::ResolutionSettings;
use crate::metrics::metrics;
use crate::storage::{AggregateStore, FlowStore, GatewayStore, StorageError};
use crate::types::{FlowAggregate, GatewayObservation, ObservationSource};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct FlowAggregator {
    flows: Arc<FlowStore>,
    aggregates: Arc<AggregateStore>,
    gateways: Arc<GatewayStore>,
    window: Duration,
    watermark_delay: Duration,
}

impl FlowAggregator {
    pub fn new(
        flows: Arc<FlowStore>,
        aggregates: Arc<AggregateStore>,
        gateways: Arc<GatewayStore>,
        settings: &ResolutionSettings,
    ) -> Self {
        Self {
            flows,
            aggregates,
            gateways,
            window: Duration::seconds(settings.window_seconds as i64),
            watermark_delay: Duration::seconds(settings.watermark_delay_secs as i64),
        }
    }

    /// Floor a timestamp to its window start.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.window.num_seconds().max(1);
        let aligned = ts.timestamp().div_euclid(width) * width;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }

    /// Window starts that have raw flows but no aggregate rows yet,
    /// ascending, excluding windows still inside the watermark.
    pub fn pending_windows(&self, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, StorageError> {
        let Some(min_ts) = self.flows.min_timestamp()? else {
            return Ok(Vec::new());
        };
        let Some(max_ts) = self.flows.max_timestamp()? else {
            return Ok(Vec::new());
        };

        let watermark = now - self.watermark_delay;
        let mut pending = Vec::new();
        let mut cursor = self.align(min_ts);
        let last = self.align(max_ts);

        while cursor <= last {
            let window_end = cursor + self.window;
            // The most recent (possibly incomplete) window waits for
            // the watermark to pass
            if window_end > watermark {
                break;
            }
            if !self.aggregates.window_exists(cursor)?
                && self.flows.has_any(cursor, window_end)?
            {
                pending.push(cursor);
            }
            cursor = window_end;
        }

        Ok(pending)
    }

    /// Aggregate one completed window. Returns the number of aggregate
    /// rows written.
    pub fn aggregate_window(&self, window_start: DateTime<Utc>) -> Result<usize, StorageError> {
        let started = std::time::Instant::now();
        let window_end = window_start + self.window;
        let records = self.flows.scan_window(window_start, window_end)?;
        if records.is_empty() {
            return Ok(0);
        }

        // Group by 5-tuple, accumulating counters and gateway hints
        struct Group {
            bytes: u64,
            packets: u64,
            flows: u64,
            next_hops: HashMap<IpAddr, u64>,
            exporter_ip: Option<IpAddr>,
        }
        let mut groups: HashMap<(IpAddr, IpAddr, u16, u16, u8), Group> = HashMap::new();

        for record in &records {
            let key = (
                record.src_ip,
                record.dst_ip,
                record.src_port,
                record.dst_port,
                record.protocol,
            );
            let group = groups.entry(key).or_insert_with(|| Group {
                bytes: 0,
                packets: 0,
                flows: 0,
                next_hops: HashMap::new(),
                exporter_ip: None,
            });
            group.bytes += record.bytes_count;
            group.packets += record.packets_count;
            group.flows += 1;
            group.exporter_ip.get_or_insert(record.exporter_ip);
            if let Some(hop) = record.next_hop() {
                *group.next_hops.entry(hop).or_insert(0) += 1;
            }
        }

        let mut aggregates = Vec::with_capacity(groups.len());
        let mut observations = Vec::new();

        for ((src_ip, dst_ip, src_port, dst_port, protocol), group) in groups {
            // Most frequently observed next hop wins the gateway slot
            let primary_gateway_ip = group
                .next_hops
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(hop, _)| *hop);

            if let Some(gateway_ip) = primary_gateway_ip {
                if gateway_ip != src_ip {
                    observations.push(GatewayObservation {
                        id: Uuid::new_v4(),
                        source_ip: src_ip,
                        gateway_ip,
                        destination_ip: Some(dst_ip),
                        observation_source: ObservationSource::NextHop,
                        exporter_ip: group.exporter_ip,
                        window_start,
                        window_end,
                        bytes_total: group.bytes,
                        flows_count: group.flows,
                        is_processed: false,
                        created_at: Utc::now(),
                    });
                }
            }

            aggregates.push(FlowAggregate {
                id: Uuid::new_v4(),
                window_start,
                window_end,
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                protocol,
                bytes_total: group.bytes,
                packets_total: group.packets,
                flows_count: group.flows,
                primary_gateway_ip,
                exporter_ip: group.exporter_ip,
                src_asset_id: None,
                dst_asset_id: None,
                is_processed: false,
            });
        }

        let count = aggregates.len();
        self.aggregates.upsert_window(&aggregates)?;
        for obs in &observations {
            self.gateways.add_observation(obs)?;
        }

        metrics()
            .aggregation_window_duration
            .observe(started.elapsed().as_secs_f64());
        debug!(
            window_start = %window_start,
            raw_flows = records.len(),
            aggregates = count,
            gateway_observations = observations.len(),
            "Window aggregated"
        );
        Ok(count)
    }

    /// Sweep all pending windows. Returns total aggregates written.
    ///
    /// A failure on one window is logged and skipped so later windows
    /// still process.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let windows = self.pending_windows(now)?;
        if windows.is_empty() {
            return Ok(0);
        }
        info!(count = windows.len(), "Processing pending aggregation windows");

        let mut total = 0;
        for window_start in windows {
            match self.aggregate_window(window_start) {
                Ok(count) => total += count,
                Err(e) => {
                    tracing::error!(
                        window_start = %window_start,
                        error = %e,
                        "Window aggregation failed — continuing with later windows"
                    );
                }
            }
        }
        Ok(total)
    }
}
