//! Heuristic signal definitions
//!
//! Each classifiable type carries a bag of weighted signals. A signal
//! evaluates the features to a match strength in [0, 1]; negative
//! weights push against a type. The type score is the weighted sum
//! normalized by the positive weight mass, clamped to [0, 1].

use super::constants::{
    CONTAINER_PORTS, DIURNAL_PATTERN_THRESHOLD, HIGH_ACTIVE_HOURS_THRESHOLD,
    HIGH_BYTES_PER_FLOW_THRESHOLD, HIGH_CONNECTION_RATE_THRESHOLD, HIGH_FAN_IN_RATIO,
    HIGH_FAN_IN_THRESHOLD, HIGH_FAN_OUT_THRESHOLD, LOW_FAN_IN_THRESHOLD,
    NETWORK_DEVICE_PORTS, SYMMETRIC_TRAFFIC_THRESHOLD, VERY_HIGH_FAN_IN_THRESHOLD,
};
use crate::types::{protocols, AssetFeatures, AssetType};
use std::collections::HashMap;

/// One weighted behavioral signal.
pub struct Signal {
    pub name: &'static str,
    pub weight: f64,
    pub evaluator: fn(&AssetFeatures) -> f64,
}

impl Signal {
    fn evaluate(&self, features: &AssetFeatures) -> f64 {
        self.weight * (self.evaluator)(features).clamp(0.0, 1.0)
    }
}

/// Types the scorer can distinguish from flow behavior alone.
pub const CLASSIFIABLE_TYPES: &[AssetType] = &[
    AssetType::Server,
    AssetType::Workstation,
    AssetType::Database,
    AssetType::LoadBalancer,
    AssetType::NetworkDevice,
    AssetType::Storage,
    AssetType::Container,
];

// ---------------------------------------------------------------------------
// Shared evaluator helpers
// ---------------------------------------------------------------------------

fn ratio(a: f64, b: f64) -> f64 {
    if b <= 0.0 {
        0.0
    } else {
        a / b
    }
}

fn fan_in_score(features: &AssetFeatures) -> f64 {
    ratio(f64::from(features.fan_in), f64::from(HIGH_FAN_IN_THRESHOLD)).min(1.0)
}

fn fan_in_ratio(features: &AssetFeatures) -> f64 {
    let total = f64::from(features.fan_in) + f64::from(features.fan_out);
    ratio(f64::from(features.fan_in), total)
}

fn always_on(features: &AssetFeatures) -> f64 {
    if features.active_hours >= HIGH_ACTIVE_HOURS_THRESHOLD {
        1.0
    } else {
        f64::from(features.active_hours) / f64::from(HIGH_ACTIVE_HOURS_THRESHOLD)
    }
}

fn diurnal(features: &AssetFeatures) -> f64 {
    if features.business_hours_ratio >= DIURNAL_PATTERN_THRESHOLD {
        1.0
    } else {
        features.business_hours_ratio / DIURNAL_PATTERN_THRESHOLD
    }
}

fn symmetric_traffic(features: &AssetFeatures) -> f64 {
    let total = (features.bytes_in + features.bytes_out) as f64;
    if total <= 0.0 {
        return 0.0;
    }
    let imbalance = (features.bytes_in as f64 - features.bytes_out as f64).abs() / total;
    if imbalance <= SYMMETRIC_TRAFFIC_THRESHOLD {
        1.0
    } else {
        (1.0 - imbalance).max(0.0)
    }
}

fn listens_on(features: &AssetFeatures, ports: &[u16]) -> f64 {
    if features
        .persistent_listener_ports
        .iter()
        .any(|p| ports.contains(p))
    {
        1.0
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Per-type signal bags
// ---------------------------------------------------------------------------

fn database_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "db_ports_listening",
            weight: 0.40,
            evaluator: |f| if f.has_db_ports { 1.0 } else { 0.0 },
        },
        Signal {
            name: "persistent_db_listener",
            weight: 0.20,
            evaluator: |f| listens_on(f, super::constants::DATABASE_PORTS),
        },
        Signal {
            name: "high_fan_in",
            weight: 0.15,
            evaluator: fan_in_score,
        },
        Signal {
            name: "always_on",
            weight: 0.15,
            evaluator: always_on,
        },
        Signal {
            name: "low_fan_out",
            weight: 0.10,
            evaluator: |f| {
                if f.fan_out <= super::constants::LOW_FAN_OUT_THRESHOLD {
                    1.0
                } else {
                    0.0
                }
            },
        },
        Signal {
            name: "not_web_facing",
            weight: -0.15,
            evaluator: |f| if f.has_web_ports { 1.0 } else { 0.0 },
        },
    ]
}

fn server_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "well_known_listener",
            weight: 0.30,
            evaluator: |f| f.well_known_port_ratio,
        },
        Signal {
            name: "high_fan_in",
            weight: 0.25,
            evaluator: fan_in_score,
        },
        Signal {
            name: "inbound_dominant",
            weight: 0.20,
            evaluator: |f| {
                if fan_in_ratio(f) >= HIGH_FAN_IN_RATIO {
                    1.0
                } else {
                    ratio(fan_in_ratio(f), HIGH_FAN_IN_RATIO)
                }
            },
        },
        Signal {
            name: "always_on",
            weight: 0.15,
            evaluator: always_on,
        },
        Signal {
            name: "has_listeners",
            weight: 0.10,
            evaluator: |f| {
                if f.persistent_listener_ports.is_empty() {
                    0.0
                } else {
                    1.0
                }
            },
        },
    ]
}

fn workstation_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "outbound_dominant",
            weight: 0.30,
            evaluator: |f| {
                if f.fan_in <= LOW_FAN_IN_THRESHOLD && f.fan_out > f.fan_in {
                    1.0
                } else {
                    0.0
                }
            },
        },
        Signal {
            name: "business_hours_pattern",
            weight: 0.25,
            evaluator: diurnal,
        },
        Signal {
            name: "no_listeners",
            weight: 0.20,
            evaluator: |f| {
                if f.persistent_listener_ports.is_empty() {
                    1.0
                } else {
                    0.0
                }
            },
        },
        Signal {
            name: "web_browsing",
            weight: 0.15,
            evaluator: |f| ratio(f64::from(f.fan_out), f64::from(HIGH_FAN_OUT_THRESHOLD)).min(1.0),
        },
        Signal {
            name: "serving_traffic",
            weight: -0.25,
            evaluator: |f| fan_in_ratio(f),
        },
    ]
}

fn load_balancer_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "web_ports_both_ways",
            weight: 0.30,
            evaluator: |f| {
                if f.has_web_ports && f.fan_out > 0 {
                    1.0
                } else {
                    0.0
                }
            },
        },
        Signal {
            name: "symmetric_traffic",
            weight: 0.25,
            evaluator: symmetric_traffic,
        },
        Signal {
            name: "very_high_fan_in",
            weight: 0.25,
            evaluator: |f| {
                ratio(
                    f64::from(f.fan_in),
                    f64::from(VERY_HIGH_FAN_IN_THRESHOLD),
                )
                .min(1.0)
            },
        },
        Signal {
            name: "high_connection_rate",
            weight: 0.20,
            evaluator: |f| {
                ratio(f.total_flows as f64, HIGH_CONNECTION_RATE_THRESHOLD as f64).min(1.0)
            },
        },
    ]
}

fn network_device_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "management_ports",
            weight: 0.35,
            evaluator: |f| listens_on(f, NETWORK_DEVICE_PORTS),
        },
        Signal {
            name: "routing_protocols",
            weight: 0.25,
            evaluator: |f| {
                let routed: f64 = f
                    .protocol_distribution
                    .iter()
                    .filter(|(proto, _)| {
                        matches!(**proto, protocols::ICMP | protocols::GRE | protocols::ESP)
                    })
                    .map(|(_, share)| *share)
                    .sum();
                (routed * 4.0).min(1.0)
            },
        },
        Signal {
            name: "many_peers_both_ways",
            weight: 0.20,
            evaluator: |f| {
                let both = f.fan_in.min(f.fan_out);
                ratio(f64::from(both), f64::from(HIGH_FAN_IN_THRESHOLD)).min(1.0)
            },
        },
        Signal {
            name: "ssh_management",
            weight: 0.20,
            evaluator: |f| if f.has_ssh_ports { 1.0 } else { 0.0 },
        },
    ]
}

fn storage_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "storage_ports_listening",
            weight: 0.40,
            evaluator: |f| if f.has_storage_ports { 1.0 } else { 0.0 },
        },
        Signal {
            name: "large_transfers",
            weight: 0.30,
            evaluator: |f| {
                let total_flows = f.total_flows.max(1) as f64;
                let bytes_per_flow = (f.bytes_in + f.bytes_out) as f64 / total_flows;
                ratio(bytes_per_flow, HIGH_BYTES_PER_FLOW_THRESHOLD).min(1.0)
            },
        },
        Signal {
            name: "persistent_storage_listener",
            weight: 0.20,
            evaluator: |f| listens_on(f, super::constants::STORAGE_PORTS),
        },
        Signal {
            name: "moderate_fan_in",
            weight: 0.10,
            evaluator: fan_in_score,
        },
    ]
}

fn container_signals() -> Vec<Signal> {
    vec![
        Signal {
            name: "container_ports",
            weight: 0.50,
            evaluator: |f| listens_on(f, CONTAINER_PORTS),
        },
        Signal {
            name: "high_churn",
            weight: 0.30,
            evaluator: |f| (f.connection_churn / 5.0).min(1.0),
        },
        Signal {
            name: "ephemeral_listeners",
            weight: 0.20,
            evaluator: |f| f.ephemeral_port_ratio,
        },
    ]
}

fn signals_for(asset_type: AssetType) -> Vec<Signal> {
    match asset_type {
        AssetType::Database => database_signals(),
        AssetType::Server => server_signals(),
        AssetType::Workstation => workstation_signals(),
        AssetType::LoadBalancer => load_balancer_signals(),
        AssetType::NetworkDevice => network_device_signals(),
        AssetType::Storage => storage_signals(),
        AssetType::Container => container_signals(),
        _ => Vec::new(),
    }
}

/// Score every classifiable type. Values are normalized to [0, 1].
pub fn score_all(features: &AssetFeatures) -> HashMap<AssetType, f64> {
    CLASSIFIABLE_TYPES
        .iter()
        .map(|&asset_type| {
            let signals = signals_for(asset_type);
            let positive_mass: f64 = signals
                .iter()
                .map(|s| s.weight)
                .filter(|w| *w > 0.0)
                .sum();
            let raw: f64 = signals.iter().map(|s| s.evaluate(features)).sum();
            let normalized = if positive_mass > 0.0 {
                (raw / positive_mass).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (asset_type, normalized)
        })
        .collect()
}

/// Best-scoring type with its confidence, if anything scored at all.
pub fn best_match(scores: &HashMap<AssetType, f64>) -> Option<(AssetType, f64)> {
    scores
        .iter()
        .filter(|(_, score)| **score > 0.0)
        .max_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Deterministic winner on exact ties
                .then_with(|| a.0.as_str().cmp(b.0.as_str()).reverse())
        })
        .map(|(asset_type, score)| (*asset_type, *score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn base_features() -> AssetFeatures {
        AssetFeatures {
            asset_id: Uuid::new_v4(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            computed_at: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_database_profile_scores_database_highest() {
        let mut features = base_features();
        features.has_db_ports = true;
        features.persistent_listener_ports = vec![5432];
        features.fan_in = 150;
        features.fan_out = 2;
        features.flows_in = 5_000;
        features.total_flows = 5_100;
        features.active_hours = 24;

        let scores = score_all(&features);
        let (winner, confidence) = best_match(&scores).unwrap();
        assert_eq!(winner, AssetType::Database);
        assert!(confidence >= 0.85, "db confidence was {confidence}");
    }

    #[test]
    fn test_workstation_profile() {
        let mut features = base_features();
        features.fan_out = 40;
        features.fan_in = 1;
        features.flows_out = 500;
        features.total_flows = 510;
        features.business_hours_ratio = 0.9;
        features.active_hours = 9;

        let scores = score_all(&features);
        let (winner, _) = best_match(&scores).unwrap();
        assert_eq!(winner, AssetType::Workstation);
    }

    #[test]
    fn test_storage_profile() {
        let mut features = base_features();
        features.has_storage_ports = true;
        features.persistent_listener_ports = vec![2049];
        features.fan_in = 12;
        features.bytes_in = 10_000_000_000;
        features.bytes_out = 9_000_000_000;
        features.flows_in = 2_000;
        features.total_flows = 4_000;

        let scores = score_all(&features);
        let (winner, _) = best_match(&scores).unwrap();
        assert_eq!(winner, AssetType::Storage);
    }

    #[test]
    fn test_web_listener_penalizes_database() {
        let mut db_only = base_features();
        db_only.has_db_ports = true;
        db_only.fan_in = 30;

        let mut db_and_web = db_only.clone();
        db_and_web.has_web_ports = true;

        let db_score = score_all(&db_only)[&AssetType::Database];
        let mixed_score = score_all(&db_and_web)[&AssetType::Database];
        assert!(db_score > mixed_score);
    }

    #[test]
    fn test_empty_features_score_nothing() {
        let features = base_features();
        let scores = score_all(&features);
        assert!(best_match(&scores).is_none());
    }
}
