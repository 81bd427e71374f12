//! NetFlow v5 parser
//!
//! NetFlow v5 is a fixed-format protocol: a 24-byte header followed by
//! exactly `count` 48-byte flow records, all big-endian.
//!
//! Header layout:
//!   version(u16=5) count(u16) sys_uptime(u32 ms) unix_secs(u32)
//!   unix_nsecs(u32) flow_sequence(u32) engine_type(u8) engine_id(u8)
//!   sampling_interval(u16)
//!
//! Record layout (48 bytes):
//!   srcaddr(4) dstaddr(4) nexthop(4) input(2) output(2) dPkts(4)
//!   dOctets(4) first(4) last(4) srcport(2) dstport(2) pad1(1)
//!   tcp_flags(1) prot(1) tos(1) src_as(2) dst_as(2) src_mask(1)
//!   dst_mask(1) pad2(2)
//!
//! `first`/`last` are sysuptime offsets in milliseconds; flow timestamps
//! are reconstructed from the exporter's wall clock minus those offsets.

use super::{be_u16, be_u32, ipv4_at, require_len, FlowParser, ParseError};
use crate::types::{protocols, FlowRecord};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::net::IpAddr;

pub const V5_HEADER_SIZE: usize = 24;
pub const V5_RECORD_SIZE: usize = 48;
pub const V5_VERSION: u16 = 5;

const PROTOCOL: &str = "netflow_v5";

/// Parsed v5 header fields needed to decode records.
#[derive(Debug, Clone, Copy)]
struct V5Header {
    count: u16,
    sys_uptime: u32,
    flow_sequence: u32,
    engine_id: u8,
    sampling_rate: u32,
    base_timestamp_ms: i64,
}

/// Parser for NetFlow version 5 packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetflowV5Parser;

impl FlowParser for NetflowV5Parser {
    fn protocol_name(&self) -> &'static str {
        PROTOCOL
    }

    fn parse(&self, data: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>, ParseError> {
        require_len(PROTOCOL, data, V5_HEADER_SIZE)?;
        let header = parse_header(data)?;

        let expected = V5_HEADER_SIZE + usize::from(header.count) * V5_RECORD_SIZE;
        if data.len() < expected {
            return Err(ParseError::Truncated {
                protocol: PROTOCOL,
                got: data.len(),
                expected,
            });
        }

        let mut records = Vec::with_capacity(usize::from(header.count));
        let mut offset = V5_HEADER_SIZE;
        for _ in 0..header.count {
            records.push(parse_record(
                &data[offset..offset + V5_RECORD_SIZE],
                &header,
                exporter_ip,
            ));
            offset += V5_RECORD_SIZE;
        }

        Ok(records)
    }
}

fn parse_header(data: &[u8]) -> Result<V5Header, ParseError> {
    let version = be_u16(data, 0);
    if version != V5_VERSION {
        return Err(ParseError::InvalidVersion {
            protocol: PROTOCOL,
            version,
        });
    }

    let count = be_u16(data, 2);
    let sys_uptime = be_u32(data, 4);
    let unix_secs = be_u32(data, 8);
    let unix_nsecs = be_u32(data, 12);
    let flow_sequence = be_u32(data, 16);
    let engine_id = data[21];
    let sampling_interval = be_u16(data, 22);

    // Upper 2 bits = sampling mode, lower 14 bits = rate. Rate 0 means
    // unsampled and is normalized to 1.
    let sampling_rate = u32::from(sampling_interval & 0x3FFF).max(1);

    let base_timestamp_ms =
        i64::from(unix_secs) * 1_000 + i64::from(unix_nsecs) / 1_000_000;

    Ok(V5Header {
        count,
        sys_uptime,
        flow_sequence,
        engine_id,
        sampling_rate,
        base_timestamp_ms,
    })
}

fn parse_record(data: &[u8], header: &V5Header, exporter_ip: IpAddr) -> FlowRecord {
    let src_ip = IpAddr::V4(ipv4_at(data, 0));
    let dst_ip = IpAddr::V4(ipv4_at(data, 4));
    let next_hop = ipv4_at(data, 8);
    let input_if = be_u16(data, 12);
    let output_if = be_u16(data, 14);
    let packets = be_u32(data, 16);
    let octets = be_u32(data, 20);
    let first = be_u32(data, 24);
    let last = be_u32(data, 28);
    let src_port = be_u16(data, 32);
    let dst_port = be_u16(data, 34);
    let tcp_flags = data[37];
    let protocol = data[38];
    let tos = data[39];
    let src_as = be_u16(data, 40);
    let dst_as = be_u16(data, 42);
    let src_mask = data[44];
    let dst_mask = data[45];

    // first/last are ms since exporter boot. Offsets beyond sys_uptime
    // mean the exporter just rebooted; clamp those to the base time so
    // timestamps never land in the future.
    let flow_start = uptime_offset_to_ts(header, first);
    let flow_end = uptime_offset_to_ts(header, last);
    let flow_duration_ms = u64::from(last.saturating_sub(first));

    let mut extended_fields = HashMap::new();
    extended_fields.insert(
        "next_hop".to_string(),
        serde_json::json!(next_hop.to_string()),
    );
    extended_fields.insert("src_as".to_string(), serde_json::json!(src_as));
    extended_fields.insert("dst_as".to_string(), serde_json::json!(dst_as));
    extended_fields.insert("src_mask".to_string(), serde_json::json!(src_mask));
    extended_fields.insert("dst_mask".to_string(), serde_json::json!(dst_mask));
    extended_fields.insert(
        "flow_sequence".to_string(),
        serde_json::json!(header.flow_sequence),
    );

    FlowRecord {
        // Flow end is the primary timestamp
        timestamp: flow_end,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        bytes_count: u64::from(octets),
        packets_count: u64::from(packets),
        exporter_ip,
        flow_start: Some(flow_start),
        flow_end: Some(flow_end),
        flow_duration_ms: Some(flow_duration_ms),
        tcp_flags: (protocol == protocols::TCP).then_some(tcp_flags),
        exporter_id: Some(u32::from(header.engine_id)),
        sampling_rate: header.sampling_rate,
        input_interface: Some(u32::from(input_if)),
        output_interface: Some(u32::from(output_if)),
        tos: Some(tos),
        flow_source: PROTOCOL.to_string(),
        extended_fields,
    }
}

fn uptime_offset_to_ts(header: &V5Header, uptime_ms: u32) -> DateTime<Utc> {
    let ms = if uptime_ms <= header.sys_uptime {
        header.base_timestamp_ms - i64::from(header.sys_uptime - uptime_ms)
    } else {
        header.base_timestamp_ms
    };
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

// ============================================================================
// Packet builder (for tests and the flowgen binary)
// ============================================================================

/// One flow entry fed to [`V5PacketBuilder`].
#[derive(Debug, Clone)]
pub struct V5Flow {
    pub src_ip: std::net::Ipv4Addr,
    pub dst_ip: std::net::Ipv4Addr,
    pub next_hop: std::net::Ipv4Addr,
    pub input_if: u16,
    pub output_if: u16,
    pub packets: u32,
    pub octets: u32,
    pub first: u32,
    pub last: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub protocol: u8,
    pub tos: u8,
    pub src_as: u16,
    pub dst_as: u16,
    pub src_mask: u8,
    pub dst_mask: u8,
}

impl Default for V5Flow {
    fn default() -> Self {
        Self {
            src_ip: std::net::Ipv4Addr::UNSPECIFIED,
            dst_ip: std::net::Ipv4Addr::UNSPECIFIED,
            next_hop: std::net::Ipv4Addr::UNSPECIFIED,
            input_if: 0,
            output_if: 0,
            packets: 0,
            octets: 0,
            first: 0,
            last: 0,
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            protocol: 0,
            tos: 0,
            src_as: 0,
            dst_as: 0,
            src_mask: 0,
            dst_mask: 0,
        }
    }
}

/// Wire-format NetFlow v5 packet builder.
#[derive(Debug, Clone)]
pub struct V5PacketBuilder {
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    pub sampling_interval: u16,
    flows: Vec<V5Flow>,
}

impl V5PacketBuilder {
    pub fn new(unix_secs: u32, sys_uptime: u32) -> Self {
        Self {
            sys_uptime,
            unix_secs,
            unix_nsecs: 0,
            flow_sequence: 0,
            engine_type: 0,
            engine_id: 0,
            sampling_interval: 0,
            flows: Vec::new(),
        }
    }

    pub fn add_flow(&mut self, flow: V5Flow) -> &mut Self {
        self.flows.push(flow);
        self
    }

    /// Encode the packet to wire bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(V5_HEADER_SIZE + self.flows.len() * V5_RECORD_SIZE);

        buf.extend_from_slice(&V5_VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.flows.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.sys_uptime.to_be_bytes());
        buf.extend_from_slice(&self.unix_secs.to_be_bytes());
        buf.extend_from_slice(&self.unix_nsecs.to_be_bytes());
        buf.extend_from_slice(&self.flow_sequence.to_be_bytes());
        buf.push(self.engine_type);
        buf.push(self.engine_id);
        buf.extend_from_slice(&self.sampling_interval.to_be_bytes());

        for flow in &self.flows {
            buf.extend_from_slice(&flow.src_ip.octets());
            buf.extend_from_slice(&flow.dst_ip.octets());
            buf.extend_from_slice(&flow.next_hop.octets());
            buf.extend_from_slice(&flow.input_if.to_be_bytes());
            buf.extend_from_slice(&flow.output_if.to_be_bytes());
            buf.extend_from_slice(&flow.packets.to_be_bytes());
            buf.extend_from_slice(&flow.octets.to_be_bytes());
            buf.extend_from_slice(&flow.first.to_be_bytes());
            buf.extend_from_slice(&flow.last.to_be_bytes());
            buf.extend_from_slice(&flow.src_port.to_be_bytes());
            buf.extend_from_slice(&flow.dst_port.to_be_bytes());
            buf.push(0); // pad1
            buf.push(flow.tcp_flags);
            buf.push(flow.protocol);
            buf.push(flow.tos);
            buf.extend_from_slice(&flow.src_as.to_be_bytes());
            buf.extend_from_slice(&flow.dst_as.to_be_bytes());
            buf.push(flow.src_mask);
            buf.push(flow.dst_mask);
            buf.extend_from_slice(&[0, 0]); // pad2
        }

        buf
    }
}
