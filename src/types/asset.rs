//! Asset and service entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Asset type taxonomy.
///
/// Behavioral classification can only infer a subset of these from flow
/// data alone; the rest arrive via classification rules or manual edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Server,
    Workstation,
    Database,
    LoadBalancer,
    NetworkDevice,
    Storage,
    Container,
    VirtualMachine,
    CloudService,
    Router,
    Switch,
    Firewall,
    Unknown,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Workstation => "workstation",
            Self::Database => "database",
            Self::LoadBalancer => "load_balancer",
            Self::NetworkDevice => "network_device",
            Self::Storage => "storage",
            Self::Container => "container",
            Self::VirtualMachine => "virtual_machine",
            Self::CloudService => "cloud_service",
            Self::Router => "router",
            Self::Switch => "switch",
            Self::Firewall => "firewall",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host in the dependency graph, keyed by IP address.
///
/// Created on first flow observation or discovery, enriched by
/// classification rules and the behavioral classifier, and only ever
/// soft-deleted (`deleted_at` tombstone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    /// Unique among non-deleted assets
    pub ip_address: IpAddr,
    pub asset_type: AssetType,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Tri-state: `None` means unspecified, not external
    #[serde(default)]
    pub is_internal: Option<bool>,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub connections_in: u64,
    #[serde(default)]
    pub connections_out: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    // Classification state
    #[serde(default)]
    pub classification_locked: bool,
    #[serde(default)]
    pub classification_confidence: Option<f64>,
    #[serde(default)]
    pub classification_scores: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub last_classified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classification_method: Option<String>,

    /// Soft-delete tombstone. A deleted asset is never resurrected; a
    /// new one is created on the next observation of the same IP.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Asset {
    /// Create a bare asset from a first observation.
    pub fn from_observation(ip: IpAddr, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip_address: ip,
            asset_type: AssetType::Unknown,
            name: ip.to_string(),
            display_name: None,
            hostname: None,
            environment: None,
            datacenter: None,
            location: None,
            team: None,
            owner: None,
            is_internal: None,
            is_critical: false,
            connections_in: 0,
            connections_out: 0,
            first_seen: seen_at,
            last_seen: seen_at,
            classification_locked: false,
            classification_confidence: None,
            classification_scores: None,
            last_classified_at: None,
            classification_method: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Treats only an explicit `Some(false)` as external.
    pub fn is_external(&self) -> bool {
        self.is_internal == Some(false)
    }
}

/// A (asset, port, protocol) tuple observed as listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub port: u16,
    pub protocol: u8,
    #[serde(default)]
    pub name: Option<String>,
    pub connections_total: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_from_observation_defaults() {
        let now = Utc::now();
        let asset = Asset::from_observation("10.1.2.3".parse().unwrap(), now);
        assert_eq!(asset.asset_type, AssetType::Unknown);
        assert_eq!(asset.name, "10.1.2.3");
        assert_eq!(asset.is_internal, None);
        assert!(!asset.is_deleted());
        assert_eq!(asset.first_seen, now);
    }

    #[test]
    fn test_is_external_tri_state() {
        let now = Utc::now();
        let mut asset = Asset::from_observation("10.1.2.3".parse().unwrap(), now);
        // Unspecified is NOT external
        assert!(!asset.is_external());
        asset.is_internal = Some(false);
        assert!(asset.is_external());
        asset.is_internal = Some(true);
        assert!(!asset.is_external());
    }

    #[test]
    fn test_asset_type_round_trip() {
        let json = serde_json::to_string(&AssetType::LoadBalancer).unwrap();
        assert_eq!(json, "\"load_balancer\"");
        let back: AssetType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AssetType::LoadBalancer);
    }
}
