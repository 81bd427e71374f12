//! Behavioral feature extraction
//!
//! Distills an asset's recent flow activity into the `AssetFeatures`
//! row the scorers consume: directional volume, degree, port behavior,
//! protocol mix, temporal pattern, and the port-category flags.

use super::constants::{
    is_ephemeral_port, is_well_known_port, BUSINESS_HOURS_END, BUSINESS_HOURS_START,
    DATABASE_PORTS, SSH_PORTS, STORAGE_PORTS, WEB_PORTS,
};
use crate::storage::{AggregateStore, StorageError};
use crate::types::{Asset, AssetFeatures};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Listener must appear in this many distinct windows to count as
/// persistent.
const PERSISTENT_WINDOW_MIN: usize = 3;

pub struct FeatureExtractor {
    aggregates: Arc<AggregateStore>,
}

impl FeatureExtractor {
    pub fn new(aggregates: Arc<AggregateStore>) -> Self {
        Self { aggregates }
    }

    /// Compute features for one asset over `[now - window, now)`.
    pub fn extract(
        &self,
        asset: &Asset,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<AssetFeatures, StorageError> {
        let window_start = now - window;
        let rows = self.aggregates.scan_range(window_start, now)?;
        let ip = asset.ip_address;

        let mut features = AssetFeatures {
            asset_id: asset.id,
            window_start,
            window_end: now,
            computed_at: Utc::now(),
            ..Default::default()
        };

        let mut peers_in: HashSet<std::net::IpAddr> = HashSet::new();
        let mut peers_out: HashSet<std::net::IpAddr> = HashSet::new();
        let mut src_ports: HashSet<u16> = HashSet::new();
        let mut dst_ports: HashSet<u16> = HashSet::new();
        // Inbound local port -> distinct windows it was hit in
        let mut listener_windows: HashMap<u16, HashSet<i64>> = HashMap::new();
        let mut protocol_flows: HashMap<u8, u64> = HashMap::new();
        let mut active_hours: HashSet<(i64, u32)> = HashSet::new();
        let mut business_flows = 0u64;
        let mut inbound_well_known = 0u64;
        let mut inbound_ephemeral = 0u64;
        let mut inbound_flows = 0u64;
        // Per-window byte totals for the variance estimate
        let mut window_bytes: HashMap<i64, u64> = HashMap::new();
        // Peer pairs per window for churn
        let mut window_peers: HashMap<i64, HashSet<std::net::IpAddr>> = HashMap::new();

        for row in &rows {
            let outbound = row.src_ip == ip;
            let inbound = row.dst_ip == ip;
            if !outbound && !inbound {
                continue;
            }

            let window_key = row.window_start.timestamp();
            *window_bytes.entry(window_key).or_insert(0) += row.bytes_total;
            *protocol_flows.entry(row.protocol).or_insert(0) += row.flows_count;
            src_ports.insert(row.src_port);
            dst_ports.insert(row.dst_port);

            let hour = row.window_start.hour();
            active_hours.insert((row.window_start.timestamp() / 86_400, hour));
            if (BUSINESS_HOURS_START..BUSINESS_HOURS_END).contains(&hour) {
                business_flows += row.flows_count;
            }

            if outbound {
                features.flows_out += row.flows_count;
                features.bytes_out += row.bytes_total;
                features.packets_out += row.packets_total;
                peers_out.insert(row.dst_ip);
                window_peers.entry(window_key).or_default().insert(row.dst_ip);
            }
            if inbound {
                features.flows_in += row.flows_count;
                features.bytes_in += row.bytes_total;
                features.packets_in += row.packets_total;
                peers_in.insert(row.src_ip);
                window_peers.entry(window_key).or_default().insert(row.src_ip);
                inbound_flows += row.flows_count;
                if is_well_known_port(row.dst_port) {
                    inbound_well_known += row.flows_count;
                }
                if is_ephemeral_port(row.dst_port) {
                    inbound_ephemeral += row.flows_count;
                }
                listener_windows
                    .entry(row.dst_port)
                    .or_default()
                    .insert(window_key);
            }
        }

        features.fan_in = peers_in.len() as u32;
        features.fan_out = peers_out.len() as u32;
        features.unique_src_ports = src_ports.len() as u32;
        features.unique_dst_ports = dst_ports.len() as u32;
        features.total_flows = features.flows_in + features.flows_out;

        if inbound_flows > 0 {
            features.well_known_port_ratio = inbound_well_known as f64 / inbound_flows as f64;
            features.ephemeral_port_ratio = inbound_ephemeral as f64 / inbound_flows as f64;
        }

        let mut listeners: Vec<u16> = listener_windows
            .iter()
            .filter(|(_, windows)| windows.len() >= PERSISTENT_WINDOW_MIN)
            .map(|(port, _)| *port)
            .collect();
        listeners.sort_unstable();
        features.persistent_listener_ports = listeners;

        let total_protocol_flows: u64 = protocol_flows.values().sum();
        if total_protocol_flows > 0 {
            features.protocol_distribution = protocol_flows
                .into_iter()
                .map(|(proto, flows)| (proto, flows as f64 / total_protocol_flows as f64))
                .collect();
        }

        let total_packets = features.packets_in + features.packets_out;
        if total_packets > 0 {
            features.avg_packet_size =
                (features.bytes_in + features.bytes_out) as f64 / total_packets as f64;
        }

        features.active_hours = active_hours.len() as u32;
        if features.total_flows > 0 {
            features.business_hours_ratio = business_flows as f64 / features.total_flows as f64;
        }

        // Coefficient of variation of per-window byte totals
        if window_bytes.len() > 1 {
            let values: Vec<f64> = window_bytes.values().map(|&b| b as f64).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            if mean > 0.0 {
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                features.traffic_variance = variance.sqrt() / mean;
            }
        }

        // New peers per window as a churn proxy
        if window_peers.len() > 1 {
            let mut seen: HashSet<std::net::IpAddr> = HashSet::new();
            let mut new_peer_counts = Vec::new();
            let mut keys: Vec<i64> = window_peers.keys().copied().collect();
            keys.sort_unstable();
            for key in keys {
                let peers = &window_peers[&key];
                let fresh = peers.iter().filter(|p| !seen.contains(*p)).count();
                new_peer_counts.push(fresh as f64);
                seen.extend(peers.iter().copied());
            }
            // First window is all-new by definition; churn is the rest
            features.connection_churn =
                new_peer_counts[1..].iter().sum::<f64>() / (new_peer_counts.len() - 1) as f64;
        }

        let listening: HashSet<u16> = listener_windows.keys().copied().collect();
        features.has_db_ports = DATABASE_PORTS.iter().any(|p| listening.contains(p));
        features.has_storage_ports = STORAGE_PORTS.iter().any(|p| listening.contains(p));
        features.has_web_ports = WEB_PORTS.iter().any(|p| listening.contains(p));
        features.has_ssh_ports = SSH_PORTS.iter().any(|p| listening.contains(p));

        Ok(features)
    }
}
