//! Gateway observation and relationship types
//!
//! Next-hop fields on flow records accumulate as `GatewayObservation`
//! staging rows; a periodic rollup promotes consistent observations into
//! confidence-scored `AssetGateway` edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Role of a gateway in the network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRole {
    Primary,
    Secondary,
    Ecmp,
}

impl GatewayRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Ecmp => "ecmp",
        }
    }
}

/// How a gateway observation was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    NextHop,
    Exporter,
}

/// Pre-rollup staging record for gateway inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayObservation {
    pub id: Uuid,
    pub source_ip: IpAddr,
    pub gateway_ip: IpAddr,
    #[serde(default)]
    pub destination_ip: Option<IpAddr>,
    pub observation_source: ObservationSource,
    #[serde(default)]
    pub exporter_ip: Option<IpAddr>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub bytes_total: u64,
    pub flows_count: u64,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Inferred gateway relationship for an asset, with temporal validity.
///
/// `destination_network = None` means default route. Multiple gateways
/// per source are supported (ECMP / failover).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetGateway {
    pub id: Uuid,
    pub source_asset_id: Uuid,
    pub gateway_asset_id: Uuid,
    #[serde(default)]
    pub destination_network: Option<String>,
    pub gateway_role: GatewayRole,
    pub is_default_gateway: bool,

    // Traffic metrics
    pub bytes_total: u64,
    pub flows_total: u64,
    #[serde(default)]
    pub bytes_last_24h: u64,
    #[serde(default)]
    pub bytes_last_7d: u64,
    /// Fraction of the source's traffic toward this destination context
    /// that transits this gateway. Shares sum to ~1.0 per context.
    #[serde(default)]
    pub traffic_share: Option<f64>,

    // Confidence
    pub confidence: f64,
    /// Individual contributions: flow_count, observations, consistency,
    /// byte_volume
    #[serde(default)]
    pub confidence_scores: Option<HashMap<String, f64>>,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub inference_method: String,
    #[serde(default)]
    pub last_inferred_at: Option<DateTime<Utc>>,

    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
}

impl AssetGateway {
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Key identifying the current row: one per
    /// (source, gateway, destination context).
    pub fn relationship_key(&self) -> (Uuid, Uuid, Option<&str>) {
        (
            self.source_asset_id,
            self.gateway_asset_id,
            self.destination_network.as_deref(),
        )
    }
}
