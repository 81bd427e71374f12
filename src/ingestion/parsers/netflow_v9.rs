//! NetFlow v9 and IPFIX parsers
//!
//! Both protocols are template-driven: exporters periodically send
//! template sets describing record layouts, then data sets referencing
//! them by id. Templates are cached per `(exporter_ip, source_id,
//! template_id)`; data sets arriving before their template are dropped
//! and counted with reason `unknown_template`.

use super::{be_u16, be_u32, ipv4_at, ipv6_at, require_len, FlowParser, ParseError};
use crate::metrics::{metrics, protocol_error_labels};
use crate::types::{protocols, FlowRecord};
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

const V9_PROTOCOL: &str = "netflow_v9";
const IPFIX_PROTOCOL: &str = "ipfix";

pub const V9_HEADER_SIZE: usize = 20;
pub const IPFIX_HEADER_SIZE: usize = 16;

// Field type ids shared by v9 and IPFIX (IANA IPFIX information elements)
mod field {
    pub const IN_BYTES: u16 = 1;
    pub const IN_PKTS: u16 = 2;
    pub const PROTOCOL: u16 = 4;
    pub const TOS: u16 = 5;
    pub const TCP_FLAGS: u16 = 6;
    pub const L4_SRC_PORT: u16 = 7;
    pub const IPV4_SRC_ADDR: u16 = 8;
    pub const INPUT_SNMP: u16 = 10;
    pub const L4_DST_PORT: u16 = 11;
    pub const IPV4_DST_ADDR: u16 = 12;
    pub const OUTPUT_SNMP: u16 = 14;
    pub const IPV4_NEXT_HOP: u16 = 15;
    pub const SRC_AS: u16 = 16;
    pub const DST_AS: u16 = 17;
    pub const LAST_SWITCHED: u16 = 21;
    pub const FIRST_SWITCHED: u16 = 22;
    pub const IPV6_SRC_ADDR: u16 = 27;
    pub const IPV6_DST_ADDR: u16 = 28;
    pub const IPV6_NEXT_HOP: u16 = 62;
    pub const FLOW_START_SECONDS: u16 = 150;
    pub const FLOW_END_SECONDS: u16 = 151;
}

/// One field spec inside a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    pub field_type: u16,
    pub length: u16,
}

/// Per-exporter template store shared by the v9 and IPFIX parsers.
///
/// Exporters resend templates periodically, so a restart self-heals
/// within one template refresh cycle.
#[derive(Debug, Default)]
pub struct TemplateCache {
    templates: DashMap<(IpAddr, u32, u16), Arc<Vec<TemplateField>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        exporter: IpAddr,
        source_id: u32,
        template_id: u16,
        fields: Vec<TemplateField>,
    ) {
        self.templates
            .insert((exporter, source_id, template_id), Arc::new(fields));
    }

    pub fn get(
        &self,
        exporter: IpAddr,
        source_id: u32,
        template_id: u16,
    ) -> Option<Arc<Vec<TemplateField>>> {
        self.templates
            .get(&(exporter, source_id, template_id))
            .map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Timing context carried from the packet header into record decoding.
#[derive(Debug, Clone, Copy)]
struct TimeContext {
    /// Exporter wall clock at export (seconds)
    export_secs: u32,
    /// Exporter uptime at export (ms); 0 for IPFIX
    sys_uptime: u32,
}

impl TimeContext {
    fn base_ts(&self) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.export_secs), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Convert a sysuptime offset (ms) into a wall-clock timestamp,
    /// clamped to the export time when the offset is ahead of uptime.
    fn from_uptime_ms(&self, uptime_ms: u32) -> chrono::DateTime<Utc> {
        let base_ms = i64::from(self.export_secs) * 1_000;
        let ms = if uptime_ms <= self.sys_uptime {
            base_ms - i64::from(self.sys_uptime - uptime_ms)
        } else {
            base_ms
        };
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

/// Parser for NetFlow version 9 packets.
#[derive(Debug, Clone)]
pub struct NetflowV9Parser {
    templates: Arc<TemplateCache>,
}

impl NetflowV9Parser {
    pub fn new(templates: Arc<TemplateCache>) -> Self {
        Self { templates }
    }
}

impl FlowParser for NetflowV9Parser {
    fn protocol_name(&self) -> &'static str {
        V9_PROTOCOL
    }

    fn parse(&self, data: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>, ParseError> {
        require_len(V9_PROTOCOL, data, V9_HEADER_SIZE)?;

        let version = be_u16(data, 0);
        if version != 9 {
            return Err(ParseError::InvalidVersion {
                protocol: V9_PROTOCOL,
                version,
            });
        }

        let sys_uptime = be_u32(data, 4);
        let unix_secs = be_u32(data, 8);
        let source_id = be_u32(data, 16);
        let time = TimeContext {
            export_secs: unix_secs,
            sys_uptime,
        };

        parse_sets(
            V9_PROTOCOL,
            data,
            V9_HEADER_SIZE,
            exporter_ip,
            source_id,
            time,
            &self.templates,
            SetIds {
                template: 0,
                options: 1,
            },
        )
    }
}

/// Parser for IPFIX (NetFlow v10) packets.
#[derive(Debug, Clone)]
pub struct IpfixParser {
    templates: Arc<TemplateCache>,
}

impl IpfixParser {
    pub fn new(templates: Arc<TemplateCache>) -> Self {
        Self { templates }
    }
}

impl FlowParser for IpfixParser {
    fn protocol_name(&self) -> &'static str {
        IPFIX_PROTOCOL
    }

    fn parse(&self, data: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>, ParseError> {
        require_len(IPFIX_PROTOCOL, data, IPFIX_HEADER_SIZE)?;

        let version = be_u16(data, 0);
        if version != 10 {
            return Err(ParseError::InvalidVersion {
                protocol: IPFIX_PROTOCOL,
                version,
            });
        }

        let total_len = usize::from(be_u16(data, 2));
        if data.len() < total_len {
            return Err(ParseError::Truncated {
                protocol: IPFIX_PROTOCOL,
                got: data.len(),
                expected: total_len,
            });
        }

        let export_secs = be_u32(data, 4);
        let observation_domain = be_u32(data, 12);
        let time = TimeContext {
            export_secs,
            sys_uptime: 0,
        };

        parse_sets(
            IPFIX_PROTOCOL,
            &data[..total_len],
            IPFIX_HEADER_SIZE,
            exporter_ip,
            observation_domain,
            time,
            &self.templates,
            SetIds {
                template: 2,
                options: 3,
            },
        )
    }
}

struct SetIds {
    template: u16,
    options: u16,
}

/// Walk the flowsets/sets after the header and decode what we can.
#[allow(clippy::too_many_arguments)]
fn parse_sets(
    protocol: &'static str,
    data: &[u8],
    mut offset: usize,
    exporter_ip: IpAddr,
    source_id: u32,
    time: TimeContext,
    templates: &TemplateCache,
    set_ids: SetIds,
) -> Result<Vec<FlowRecord>, ParseError> {
    let mut records = Vec::new();

    while offset + 4 <= data.len() {
        let set_id = be_u16(data, offset);
        let set_len = usize::from(be_u16(data, offset + 2));
        if set_len < 4 || offset + set_len > data.len() {
            return Err(ParseError::Malformed {
                protocol,
                message: format!("set {set_id} has invalid length {set_len}"),
            });
        }
        let body = &data[offset + 4..offset + set_len];

        if set_id == set_ids.template {
            parse_template_set(protocol, body, exporter_ip, source_id, templates)?;
        } else if set_id == set_ids.options {
            // Options templates describe exporter metadata, not flows
        } else if set_id >= 256 {
            match templates.get(exporter_ip, source_id, set_id) {
                Some(template) => {
                    decode_data_set(protocol, body, &template, exporter_ip, time, &mut records);
                }
                None => {
                    metrics()
                        .flows_parse_errors
                        .inc(&protocol_error_labels(protocol, "unknown_template"));
                    tracing::debug!(
                        protocol = protocol,
                        template_id = set_id,
                        exporter = %exporter_ip,
                        "Dropping data set without cached template"
                    );
                }
            }
        }

        offset += set_len;
    }

    Ok(records)
}

/// Parse a template set body: repeated template records.
fn parse_template_set(
    protocol: &'static str,
    body: &[u8],
    exporter_ip: IpAddr,
    source_id: u32,
    templates: &TemplateCache,
) -> Result<(), ParseError> {
    let mut offset = 0;
    // Trailing padding shorter than a template header terminates the walk
    while offset + 4 <= body.len() {
        let template_id = be_u16(body, offset);
        let field_count = usize::from(be_u16(body, offset + 2));
        if template_id == 0 && field_count == 0 {
            break; // padding
        }
        offset += 4;

        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            if offset + 4 > body.len() {
                return Err(ParseError::Malformed {
                    protocol,
                    message: format!("template {template_id} truncated mid-field"),
                });
            }
            let field_type = be_u16(body, offset);
            let length = be_u16(body, offset + 2);
            offset += 4;
            // IPFIX enterprise fields carry a 4-byte enterprise number
            if field_type & 0x8000 != 0 {
                if offset + 4 > body.len() {
                    return Err(ParseError::Malformed {
                        protocol,
                        message: format!("template {template_id} truncated in enterprise field"),
                    });
                }
                offset += 4;
            }
            fields.push(TemplateField { field_type, length });
        }

        tracing::debug!(
            protocol = protocol,
            template_id = template_id,
            fields = fields.len(),
            exporter = %exporter_ip,
            "Template cached"
        );
        templates.insert(exporter_ip, source_id, template_id, fields);
    }
    Ok(())
}

/// Decode consecutive fixed-length records from a data set body.
fn decode_data_set(
    protocol: &'static str,
    body: &[u8],
    template: &[TemplateField],
    exporter_ip: IpAddr,
    time: TimeContext,
    records: &mut Vec<FlowRecord>,
) {
    let record_len: usize = template.iter().map(|f| usize::from(f.length)).sum();
    if record_len == 0 {
        return;
    }

    let mut offset = 0;
    while offset + record_len <= body.len() {
        if let Some(record) =
            decode_record(protocol, &body[offset..offset + record_len], template, exporter_ip, time)
        {
            records.push(record);
        }
        offset += record_len;
    }
}

/// Decode one record. Returns None when the template lacks addresses.
fn decode_record(
    protocol: &'static str,
    data: &[u8],
    template: &[TemplateField],
    exporter_ip: IpAddr,
    time: TimeContext,
) -> Option<FlowRecord> {
    let mut src_ip: Option<IpAddr> = None;
    let mut dst_ip: Option<IpAddr> = None;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut proto = 0u8;
    let mut tos: Option<u8> = None;
    let mut tcp_flags: Option<u8> = None;
    let mut bytes = 0u64;
    let mut packets = 0u64;
    let mut input_if: Option<u32> = None;
    let mut output_if: Option<u32> = None;
    let mut first_switched: Option<u32> = None;
    let mut last_switched: Option<u32> = None;
    let mut flow_start_secs: Option<u32> = None;
    let mut flow_end_secs: Option<u32> = None;
    let mut extended_fields = HashMap::new();

    let mut offset = 0;
    for spec in template {
        let len = usize::from(spec.length);
        let raw = &data[offset..offset + len];
        offset += len;

        match spec.field_type {
            field::IN_BYTES => bytes = read_uint(raw),
            field::IN_PKTS => packets = read_uint(raw),
            field::PROTOCOL if len >= 1 => proto = raw[len - 1],
            field::TOS if len >= 1 => tos = Some(raw[len - 1]),
            field::TCP_FLAGS if len >= 1 => tcp_flags = Some(raw[len - 1]),
            field::L4_SRC_PORT => src_port = read_uint(raw) as u16,
            field::L4_DST_PORT => dst_port = read_uint(raw) as u16,
            field::IPV4_SRC_ADDR if len == 4 => src_ip = Some(IpAddr::V4(ipv4_at(raw, 0))),
            field::IPV4_DST_ADDR if len == 4 => dst_ip = Some(IpAddr::V4(ipv4_at(raw, 0))),
            field::IPV6_SRC_ADDR if len == 16 => src_ip = Some(IpAddr::V6(ipv6_at(raw, 0))),
            field::IPV6_DST_ADDR if len == 16 => dst_ip = Some(IpAddr::V6(ipv6_at(raw, 0))),
            field::IPV4_NEXT_HOP if len == 4 => {
                extended_fields.insert(
                    "next_hop".to_string(),
                    serde_json::json!(ipv4_at(raw, 0).to_string()),
                );
            }
            field::IPV6_NEXT_HOP if len == 16 => {
                extended_fields.insert(
                    "next_hop".to_string(),
                    serde_json::json!(ipv6_at(raw, 0).to_string()),
                );
            }
            field::INPUT_SNMP => input_if = Some(read_uint(raw) as u32),
            field::OUTPUT_SNMP => output_if = Some(read_uint(raw) as u32),
            field::SRC_AS => {
                extended_fields.insert("src_as".to_string(), serde_json::json!(read_uint(raw)));
            }
            field::DST_AS => {
                extended_fields.insert("dst_as".to_string(), serde_json::json!(read_uint(raw)));
            }
            field::FIRST_SWITCHED => first_switched = Some(read_uint(raw) as u32),
            field::LAST_SWITCHED => last_switched = Some(read_uint(raw) as u32),
            field::FLOW_START_SECONDS => flow_start_secs = Some(read_uint(raw) as u32),
            field::FLOW_END_SECONDS => flow_end_secs = Some(read_uint(raw) as u32),
            _ => {} // unmapped information element
        }
    }

    let (src_ip, dst_ip) = (src_ip?, dst_ip?);

    let flow_start = flow_start_secs
        .map(|s| Utc.timestamp_opt(i64::from(s), 0).single().unwrap_or_else(Utc::now))
        .or_else(|| first_switched.map(|ms| time.from_uptime_ms(ms)));
    let flow_end = flow_end_secs
        .map(|s| Utc.timestamp_opt(i64::from(s), 0).single().unwrap_or_else(Utc::now))
        .or_else(|| last_switched.map(|ms| time.from_uptime_ms(ms)));

    let flow_duration_ms = match (flow_start, flow_end) {
        (Some(start), Some(end)) if end >= start => {
            Some((end - start).num_milliseconds().max(0) as u64)
        }
        _ => None,
    };

    Some(FlowRecord {
        timestamp: flow_end.unwrap_or_else(|| time.base_ts()),
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: proto,
        bytes_count: bytes,
        packets_count: packets,
        exporter_ip,
        flow_start,
        flow_end,
        flow_duration_ms,
        tcp_flags: if proto == protocols::TCP { tcp_flags } else { None },
        exporter_id: None,
        sampling_rate: 1,
        input_interface: input_if,
        output_interface: output_if,
        tos,
        flow_source: protocol.to_string(),
        extended_fields,
    })
}

/// Big-endian unsigned integer of 1-8 bytes.
fn read_uint(raw: &[u8]) -> u64 {
    raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
