//! Flow protocol parsers
//!
//! Each parser takes `(raw_bytes, exporter_ip)` and yields normalized
//! `FlowRecord`s or fails with a tagged parse error. Parse failures are
//! counted and the datagram dropped; they never propagate past the
//! collector.

pub mod netflow_v5;
pub mod netflow_v9;
pub mod sflow;

use crate::types::FlowRecord;
use std::net::IpAddr;
use thiserror::Error;

pub use netflow_v5::NetflowV5Parser;
pub use netflow_v9::{IpfixParser, NetflowV9Parser, TemplateCache};
pub use sflow::SflowParser;

/// Tagged parse failure. The reason tag feeds the
/// `flowlens_flows_parse_errors_total{protocol,error_type}` metric.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{protocol}: packet truncated (got {got}, expected {expected} bytes)")]
    Truncated {
        protocol: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{protocol}: invalid version {version}")]
    InvalidVersion {
        protocol: &'static str,
        version: u16,
    },

    #[error("{protocol}: no template {template_id} for exporter")]
    UnknownTemplate {
        protocol: &'static str,
        template_id: u16,
    },

    #[error("{protocol}: {message}")]
    Malformed {
        protocol: &'static str,
        message: String,
    },
}

impl ParseError {
    /// Stable tag used as the `error_type` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::InvalidVersion { .. } => "invalid_version",
            Self::UnknownTemplate { .. } => "unknown_template",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// A wire-format parser producing normalized flow records.
pub trait FlowParser: Send + Sync {
    /// Protocol name used for logging and metric labels
    /// (e.g. "netflow_v5").
    fn protocol_name(&self) -> &'static str;

    /// Parse one datagram payload into flow records.
    fn parse(&self, data: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>, ParseError>;
}

/// Shared length guard for fixed-size headers.
pub(crate) fn require_len(
    protocol: &'static str,
    data: &[u8],
    expected: usize,
) -> Result<(), ParseError> {
    if data.len() < expected {
        return Err(ParseError::Truncated {
            protocol,
            got: data.len(),
            expected,
        });
    }
    Ok(())
}

// Big-endian field readers over a byte slice. Callers are responsible
// for length checks; out-of-range reads are a bug, not a wire error.
pub(crate) fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn ipv4_at(data: &[u8], offset: usize) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

pub(crate) fn ipv6_at(data: &[u8], offset: usize) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    std::net::Ipv6Addr::from(octets)
}
