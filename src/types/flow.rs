//! Flow record and aggregate types
//!
//! `FlowRecord` is the normalized representation every protocol parser
//! produces; `FlowAggregate` is the windowed rollup the resolution
//! pipeline consumes. Port and protocol ranges are enforced at
//! construction so nothing downstream has to re-validate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// IP protocol numbers used throughout the pipeline
pub mod protocols {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const GRE: u8 = 47;
    pub const ESP: u8 = 50;
    pub const ICMPV6: u8 = 58;
    pub const SCTP: u8 = 132;
}

/// TCP flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpFlags {
    Fin = 0x01,
    Syn = 0x02,
    Rst = 0x04,
    Psh = 0x08,
    Ack = 0x10,
    Urg = 0x20,
    Ece = 0x40,
    Cwr = 0x80,
}

/// Construction errors for flow records
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowRecordError {
    #[error("invalid sampling rate {0} (must be >= 1)")]
    InvalidSamplingRate(u32),
}

/// Normalized flow record from any supported protocol.
///
/// This is the internal representation after parsing NetFlow/sFlow/IPFIX.
/// Written once at ingest time and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub bytes_count: u64,
    pub packets_count: u64,
    pub exporter_ip: IpAddr,

    // Optional flow timing
    #[serde(default)]
    pub flow_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flow_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flow_duration_ms: Option<u64>,

    /// Only populated for TCP flows
    #[serde(default)]
    pub tcp_flags: Option<u8>,

    // Exporter info
    #[serde(default)]
    pub exporter_id: Option<u32>,
    /// 1 = unsampled. Counters are already scaled by this for sFlow.
    pub sampling_rate: u32,

    // Interface info
    #[serde(default)]
    pub input_interface: Option<u32>,
    #[serde(default)]
    pub output_interface: Option<u32>,

    // QoS
    #[serde(default)]
    pub tos: Option<u8>,

    /// Which wire protocol produced this record (e.g. "netflow_v5")
    pub flow_source: String,

    /// Protocol-specific extras: next_hop, AS numbers, masks, sequence
    #[serde(default)]
    pub extended_fields: HashMap<String, serde_json::Value>,
}

impl FlowRecord {
    /// Validate the fields that parsers cannot guarantee by type alone.
    ///
    /// Ports and protocol are `u16`/`u8` so their ranges hold by
    /// construction; the sampling rate still needs a runtime check.
    pub fn validate(&self) -> Result<(), FlowRecordError> {
        if self.sampling_rate < 1 {
            return Err(FlowRecordError::InvalidSamplingRate(self.sampling_rate));
        }
        Ok(())
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == protocols::TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == protocols::UDP
    }

    pub fn is_icmp(&self) -> bool {
        self.protocol == protocols::ICMP || self.protocol == protocols::ICMPV6
    }

    pub fn has_syn(&self) -> bool {
        self.tcp_flags
            .is_some_and(|f| f & TcpFlags::Syn as u8 != 0)
    }

    pub fn has_fin(&self) -> bool {
        self.tcp_flags
            .is_some_and(|f| f & TcpFlags::Fin as u8 != 0)
    }

    pub fn has_rst(&self) -> bool {
        self.tcp_flags
            .is_some_and(|f| f & TcpFlags::Rst as u8 != 0)
    }

    /// Next-hop IP extracted from extended fields, if the exporter sent one.
    ///
    /// `0.0.0.0` means "no next hop" on the wire and is filtered out here.
    pub fn next_hop(&self) -> Option<IpAddr> {
        let raw = self.extended_fields.get("next_hop")?.as_str()?;
        let ip: IpAddr = raw.parse().ok()?;
        if ip.is_unspecified() {
            return None;
        }
        Some(ip)
    }
}

/// Windowed rollup of flows sharing a 5-tuple.
///
/// Key = (window_start, window_end, src_ip, dst_ip, src_port, dst_port,
/// protocol). Additive within a window; `is_processed` flips false→true
/// exactly once when the dependency builder consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAggregate {
    pub id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub bytes_total: u64,
    pub packets_total: u64,
    pub flows_count: u64,
    /// Most common next hop observed inside the window
    #[serde(default)]
    pub primary_gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub exporter_ip: Option<IpAddr>,
    /// Filled in by the asset mapper during dependency building
    #[serde(default)]
    pub src_asset_id: Option<Uuid>,
    #[serde(default)]
    pub dst_asset_id: Option<Uuid>,
    pub is_processed: bool,
}

impl FlowAggregate {
    /// Deterministic key of the aggregate inside its window, used as the
    /// storage primary key so reprocessing a window upserts identical rows.
    pub fn group_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.src_ip, self.dst_ip, self.src_port, self.dst_port, self.protocol
        )
    }
}
