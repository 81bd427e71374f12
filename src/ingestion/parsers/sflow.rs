//! sFlow v5 parser
//!
//! sFlow is sample-based: the agent exports one raw packet header per
//! sampled frame plus the sampling rate. Counters are scaled by that
//! rate at parse time so downstream consumers see estimated totals.
//!
//! Only standard flow samples (format 1) carrying raw packet headers
//! (record format 1) over Ethernet/IPv4/IPv6 are decoded; counter
//! samples and vendor extensions are skipped.

use super::{be_u16, be_u32, ipv4_at, ipv6_at, require_len, FlowParser, ParseError};
use crate::types::{protocols, FlowRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;

const PROTOCOL: &str = "sflow";

const SFLOW_VERSION: u32 = 5;
const SAMPLE_FLOW: u32 = 1;
const RECORD_RAW_PACKET_HEADER: u32 = 1;
const HEADER_PROTO_ETHERNET: u32 = 1;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Parser for sFlow version 5 datagrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct SflowParser;

impl FlowParser for SflowParser {
    fn protocol_name(&self) -> &'static str {
        PROTOCOL
    }

    fn parse(&self, data: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>, ParseError> {
        require_len(PROTOCOL, data, 4)?;
        let version = be_u32(data, 0);
        if version != SFLOW_VERSION {
            return Err(ParseError::InvalidVersion {
                protocol: PROTOCOL,
                version: version as u16,
            });
        }

        let mut cursor = Cursor::new(data, 4);
        let agent_addr_type = cursor.read_u32()?;
        match agent_addr_type {
            1 => cursor.skip(4)?,  // IPv4 agent address
            2 => cursor.skip(16)?, // IPv6 agent address
            other => {
                return Err(ParseError::Malformed {
                    protocol: PROTOCOL,
                    message: format!("unknown agent address type {other}"),
                })
            }
        }
        cursor.skip(4)?; // sub_agent_id
        cursor.skip(4)?; // sequence_number
        cursor.skip(4)?; // uptime
        let num_samples = cursor.read_u32()?;

        let mut records = Vec::new();
        for _ in 0..num_samples {
            let sample_type = cursor.read_u32()?;
            let sample_len = cursor.read_u32()? as usize;
            let body = cursor.take(sample_len)?;

            let enterprise = sample_type >> 12;
            let format = sample_type & 0xFFF;
            if enterprise == 0 && format == SAMPLE_FLOW {
                parse_flow_sample(body, exporter_ip, &mut records)?;
            }
            // Counter samples and vendor formats are skipped
        }

        Ok(records)
    }
}

/// Parse one flow sample body into zero or more records.
fn parse_flow_sample(
    body: &[u8],
    exporter_ip: IpAddr,
    records: &mut Vec<FlowRecord>,
) -> Result<(), ParseError> {
    let mut cursor = Cursor::new(body, 0);
    cursor.skip(4)?; // sequence_number
    cursor.skip(4)?; // source_id
    let sampling_rate = cursor.read_u32()?.max(1);
    cursor.skip(4)?; // sample_pool
    cursor.skip(4)?; // drops
    let input_if = cursor.read_u32()?;
    let output_if = cursor.read_u32()?;
    let num_records = cursor.read_u32()?;

    for _ in 0..num_records {
        let record_format = cursor.read_u32()?;
        let record_len = cursor.read_u32()? as usize;
        let record_body = cursor.take(record_len)?;

        let enterprise = record_format >> 12;
        let format = record_format & 0xFFF;
        if enterprise == 0 && format == RECORD_RAW_PACKET_HEADER {
            if let Some(record) =
                parse_raw_header(record_body, exporter_ip, sampling_rate, input_if, output_if)
            {
                records.push(record);
            }
        }
    }

    Ok(())
}

/// Decode a sampled raw packet header down to the transport layer.
fn parse_raw_header(
    body: &[u8],
    exporter_ip: IpAddr,
    sampling_rate: u32,
    input_if: u32,
    output_if: u32,
) -> Option<FlowRecord> {
    if body.len() < 16 {
        return None;
    }
    let header_protocol = be_u32(body, 0);
    let frame_length = be_u32(body, 4);
    // stripped at offset 8
    let header_size = be_u32(body, 12) as usize;
    if header_protocol != HEADER_PROTO_ETHERNET {
        return None;
    }
    let header = body.get(16..16 + header_size.min(body.len() - 16))?;
    if header.len() < 14 {
        return None;
    }

    // Ethernet: skip MACs, handle one VLAN tag
    let mut ethertype = be_u16(header, 12);
    let mut l3_offset = 14;
    if ethertype == ETHERTYPE_VLAN {
        if header.len() < 18 {
            return None;
        }
        ethertype = be_u16(header, 16);
        l3_offset = 18;
    }

    let (src_ip, dst_ip, protocol, l4): (IpAddr, IpAddr, u8, &[u8]) = match ethertype {
        ETHERTYPE_IPV4 => {
            let ip = header.get(l3_offset..)?;
            if ip.len() < 20 {
                return None;
            }
            let ihl = usize::from(ip[0] & 0x0F) * 4;
            if ihl < 20 || ip.len() < ihl {
                return None;
            }
            (
                IpAddr::V4(ipv4_at(ip, 12)),
                IpAddr::V4(ipv4_at(ip, 16)),
                ip[9],
                &ip[ihl..],
            )
        }
        ETHERTYPE_IPV6 => {
            let ip = header.get(l3_offset..)?;
            if ip.len() < 40 {
                return None;
            }
            (
                IpAddr::V6(ipv6_at(ip, 8)),
                IpAddr::V6(ipv6_at(ip, 24)),
                ip[6],
                &ip[40..],
            )
        }
        _ => return None, // non-IP frame
    };

    let (src_port, dst_port, tcp_flags) = match protocol {
        protocols::TCP if l4.len() >= 14 => {
            (be_u16(l4, 0), be_u16(l4, 2), Some(l4[13]))
        }
        protocols::TCP if l4.len() >= 4 => (be_u16(l4, 0), be_u16(l4, 2), None),
        protocols::UDP if l4.len() >= 4 => (be_u16(l4, 0), be_u16(l4, 2), None),
        _ => (0, 0, None),
    };

    let now = Utc::now();
    Some(FlowRecord {
        timestamp: now,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        // One sampled frame stands in for sampling_rate frames
        bytes_count: u64::from(frame_length) * u64::from(sampling_rate),
        packets_count: u64::from(sampling_rate),
        exporter_ip,
        flow_start: None,
        flow_end: None,
        flow_duration_ms: None,
        tcp_flags: if protocol == protocols::TCP { tcp_flags } else { None },
        exporter_id: None,
        sampling_rate,
        input_interface: Some(input_if),
        output_interface: Some(output_if),
        tos: None,
        flow_source: PROTOCOL.to_string(),
        extended_fields: HashMap::new(),
    })
}

/// Bounds-checked reader over a datagram body.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        if self.offset + 4 > self.data.len() {
            return Err(ParseError::Truncated {
                protocol: PROTOCOL,
                got: self.data.len(),
                expected: self.offset + 4,
            });
        }
        let v = be_u32(self.data, self.offset);
        self.offset += 4;
        Ok(v)
    }

    fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        if self.offset + n > self.data.len() {
            return Err(ParseError::Truncated {
                protocol: PROTOCOL,
                got: self.data.len(),
                expected: self.offset + n,
            });
        }
        self.offset += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.offset + n > self.data.len() {
            return Err(ParseError::Truncated {
                protocol: PROTOCOL,
                got: self.data.len(),
                expected: self.offset + n,
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }
}
