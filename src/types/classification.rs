//! Classification entities: CIDR rules, behavioral features, audit rows
//!
//! `Cidr` replaces the relational `inet`/`cidr` column types: longest
//! prefix wins, priority breaks ties at equal prefix length.

use crate::types::asset::AssetType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("malformed CIDR {0:?}")]
    Malformed(String),
    #[error("prefix length {got} exceeds maximum {max}")]
    PrefixTooLong { got: u8, max: u8 },
}

/// An IP network in CIDR notation, v4 or v6.
///
/// Stored canonically as a 128-bit base address plus prefix length;
/// IPv4 addresses occupy the low 32 bits with the prefix offset by 96.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    base: u128,
    /// Prefix length in the address's own family (0-32 or 0-128)
    prefix_len: u8,
    is_v4: bool,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CidrError> {
        let (max, is_v4) = match addr {
            IpAddr::V4(_) => (32, true),
            IpAddr::V6(_) => (128, false),
        };
        if prefix_len > max {
            return Err(CidrError::PrefixTooLong {
                got: prefix_len,
                max,
            });
        }
        let wide = ip_to_u128(addr);
        let mask = Self::mask(prefix_len, is_v4);
        Ok(Self {
            base: wide & mask,
            prefix_len,
            is_v4,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether this network contains the given address.
    ///
    /// Families never match across v4/v6.
    pub fn contains(&self, addr: IpAddr) -> bool {
        if self.is_v4 != addr.is_ipv4() {
            return false;
        }
        let mask = Self::mask(self.prefix_len, self.is_v4);
        ip_to_u128(addr) & mask == self.base
    }

    fn mask(prefix_len: u8, is_v4: bool) -> u128 {
        let effective = if is_v4 {
            96 + u32::from(prefix_len)
        } else {
            u32::from(prefix_len)
        };
        if effective == 0 {
            0
        } else {
            u128::MAX << (128 - effective)
        }
    }
}

fn ip_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, len_part) = s
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        let prefix_len: u8 = len_part
            .parse()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_v4 {
            let v4 = std::net::Ipv4Addr::from(self.base as u32);
            write!(f, "{}/{}", v4, self.prefix_len)
        } else {
            let v6 = std::net::Ipv6Addr::from(self.base);
            write!(f, "{}/{}", v6, self.prefix_len)
        }
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// CIDR → attributes mapping applied when assets are created or enriched.
///
/// At equal prefix length, the smaller `priority` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: Uuid,
    pub name: String,
    pub cidr: Cidr,
    pub priority: i32,
    pub is_active: bool,

    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Type hint applied only while the asset is still `unknown`
    #[serde(default)]
    pub asset_type: Option<AssetType>,
    /// Tri-state: `None` survives round-trips as "unspecified"
    #[serde(default)]
    pub is_internal: Option<bool>,
    #[serde(default)]
    pub default_owner: Option<String>,
    #[serde(default)]
    pub default_team: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Per-window behavioral metrics computed for one asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetFeatures {
    pub asset_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,

    // Directional volume
    pub flows_in: u64,
    pub flows_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,

    // Degree
    /// Distinct peers connecting to this asset
    pub fan_in: u32,
    /// Distinct peers this asset connects to
    pub fan_out: u32,

    // Port behavior
    pub unique_src_ports: u32,
    pub unique_dst_ports: u32,
    pub well_known_port_ratio: f64,
    pub ephemeral_port_ratio: f64,
    /// Local ports seen listening across multiple windows
    pub persistent_listener_ports: Vec<u16>,

    /// Protocol number → flow share
    pub protocol_distribution: HashMap<u8, f64>,

    pub avg_flow_duration_ms: f64,
    pub avg_packet_size: f64,
    /// New peer pairs per window, a churn proxy
    pub connection_churn: f64,

    // Temporal
    pub active_hours: u32,
    pub business_hours_ratio: f64,
    pub traffic_variance: f64,

    // Port-category flags
    pub has_db_ports: bool,
    pub has_storage_ports: bool,
    pub has_web_ports: bool,
    pub has_ssh_ports: bool,

    pub total_flows: u64,
    pub computed_at: DateTime<Utc>,
}

/// How a classification decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Heuristic,
    Ml,
    Hybrid,
    Manual,
    Rule,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Ml => "ml",
            Self::Hybrid => "hybrid",
            Self::Manual => "manual",
            Self::Rule => "rule",
        }
    }
}

/// Audit row appended whenever an asset's type changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationHistory {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub previous_type: AssetType,
    pub new_type: AssetType,
    pub confidence: f64,
    pub method: ClassificationMethod,
    #[serde(default)]
    pub scores: Option<HashMap<String, f64>>,
    pub changed_at: DateTime<Utc>,
    #[serde(default)]
    pub changed_by: Option<String>,
}

/// Registered ML model version. Exactly one record is active at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModelRecord {
    pub id: Uuid,
    pub version: String,
    pub algorithm: String,
    pub is_active: bool,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Training-set share per class label
    #[serde(default)]
    pub class_distribution: Option<HashMap<String, f64>>,
    pub trained_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
