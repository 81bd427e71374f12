//! UDP flow collectors
//!
//! One collector task per listening port. The NetFlow port multiplexes
//! v5/v9/IPFIX by the version word; the sFlow port is single-protocol.
//! Parsed records go straight into the backpressure queue; a bad
//! datagram is counted and dropped, never fatal.

use super::backpressure::BackpressureQueue;
use super::parsers::{
    FlowParser, IpfixParser, NetflowV5Parser, NetflowV9Parser, SflowParser, TemplateCache,
};
use crate::metrics::{metrics, protocol_error_labels, protocol_exporter_labels};
use crate::types::FlowRecord;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{MAX_DATAGRAM_SIZE, UDP_RECV_BUFFER_BYTES};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Which wire protocols a port dispatches to.
pub enum ProtocolDispatch {
    /// NetFlow v5 / v9 / IPFIX share a port, keyed by the version word
    Netflow {
        v5: NetflowV5Parser,
        v9: NetflowV9Parser,
        ipfix: IpfixParser,
    },
    Sflow(SflowParser),
}

impl ProtocolDispatch {
    pub fn netflow(templates: Arc<TemplateCache>) -> Self {
        Self::Netflow {
            v5: NetflowV5Parser,
            v9: NetflowV9Parser::new(templates.clone()),
            ipfix: IpfixParser::new(templates),
        }
    }

    pub fn sflow() -> Self {
        Self::Sflow(SflowParser)
    }

    /// Route one datagram to the right parser.
    fn parse(
        &self,
        data: &[u8],
        exporter: IpAddr,
    ) -> Result<Vec<FlowRecord>, (super::parsers::ParseError, &'static str)> {
        match self {
            Self::Netflow { v5, v9, ipfix } => {
                if data.len() < 2 {
                    return Err((
                        super::parsers::ParseError::Truncated {
                            protocol: "netflow",
                            got: data.len(),
                            expected: 2,
                        },
                        "netflow",
                    ));
                }
                let version = u16::from_be_bytes([data[0], data[1]]);
                match version {
                    5 => v5.parse(data, exporter).map_err(|e| (e, v5.protocol_name())),
                    9 => v9.parse(data, exporter).map_err(|e| (e, v9.protocol_name())),
                    10 => ipfix
                        .parse(data, exporter)
                        .map_err(|e| (e, ipfix.protocol_name())),
                    other => Err((
                        super::parsers::ParseError::InvalidVersion {
                            protocol: "netflow",
                            version: other,
                        },
                        "netflow",
                    )),
                }
            }
            Self::Sflow(parser) => parser
                .parse(data, exporter)
                .map_err(|e| (e, parser.protocol_name())),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Netflow { .. } => "netflow",
            Self::Sflow(_) => "sflow",
        }
    }
}

/// Collector task statistics.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub datagrams_received: AtomicU64,
    pub records_parsed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub records_enqueued: AtomicU64,
}

/// Single-port UDP collector feeding the shared ingestion queue.
pub struct FlowCollector {
    port: u16,
    dispatch: ProtocolDispatch,
    queue: Arc<BackpressureQueue<FlowRecord>>,
    discard_external_flows: bool,
    pub stats: Arc<CollectorStats>,
}

impl FlowCollector {
    pub fn new(
        port: u16,
        dispatch: ProtocolDispatch,
        queue: Arc<BackpressureQueue<FlowRecord>>,
        discard_external_flows: bool,
    ) -> Self {
        Self {
            port,
            dispatch,
            queue,
            discard_external_flows,
            stats: Arc::new(CollectorStats::default()),
        }
    }

    /// Bind the socket with an enlarged kernel receive buffer.
    fn bind_socket(port: u16) -> Result<std::net::UdpSocket, CollectorError> {
        let addr: std::net::SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .map_err(|_| CollectorError::Bind {
                port,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"),
            })?;

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|source| CollectorError::Bind { port, source })?;

        if let Err(e) = socket.set_recv_buffer_size(UDP_RECV_BUFFER_BYTES) {
            warn!(port = port, error = %e, "Could not raise UDP receive buffer");
        }
        socket
            .set_nonblocking(true)
            .map_err(|source| CollectorError::Bind { port, source })?;
        socket
            .bind(&addr.into())
            .map_err(|source| CollectorError::Bind { port, source })?;

        Ok(socket.into())
    }

    /// Receive datagrams until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CollectorError> {
        let std_socket = Self::bind_socket(self.port)?;
        let socket = UdpSocket::from_std(std_socket)?;
        info!(
            port = self.port,
            protocol = self.dispatch.label(),
            "Flow collector listening"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(port = self.port, "Flow collector shutting down");
                    return Ok(());
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = result?;
                    self.handle_datagram(&buf[..len], peer.ip());
                }
            }
        }
    }

    /// Parse one datagram and enqueue its records.
    pub fn handle_datagram(&self, data: &[u8], exporter: IpAddr) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let records = match self.dispatch.parse(data, exporter) {
            Ok(records) => records,
            Err((err, protocol)) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                metrics()
                    .flows_parse_errors
                    .inc(&protocol_error_labels(protocol, err.reason()));
                debug!(
                    protocol = protocol,
                    exporter = %exporter,
                    reason = err.reason(),
                    error = %err,
                    "Datagram rejected"
                );
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        metrics().flows_received.add(
            &protocol_exporter_labels(&records[0].flow_source, &exporter),
            records.len() as u64,
        );

        let mut enqueued = 0u64;
        for record in records {
            if record.validate().is_err() {
                metrics()
                    .flows_parse_errors
                    .inc(&protocol_error_labels(self.dispatch.label(), "malformed"));
                continue;
            }
            if self.discard_external_flows
                && !is_private_ip(record.src_ip)
                && !is_private_ip(record.dst_ip)
            {
                metrics().flows_dropped.inc("reason=\"external\"");
                continue;
            }
            metrics().flows_parsed.inc();
            self.stats.records_parsed.fetch_add(1, Ordering::Relaxed);
            if self.queue.put(record) {
                enqueued += 1;
            }
        }
        self.stats
            .records_enqueued
            .fetch_add(enqueued, Ordering::Relaxed);
    }
}

/// RFC1918 / RFC4193 / loopback / link-local check used by the
/// `discard_external_flows` pre-filter.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionSettings;
    use crate::ingestion::parsers::netflow_v5::{V5Flow, V5PacketBuilder};
    use crate::types::protocols;

    fn collector(discard_external: bool) -> (FlowCollector, Arc<BackpressureQueue<FlowRecord>>) {
        let queue = Arc::new(BackpressureQueue::new(&IngestionSettings::default()));
        let templates = Arc::new(TemplateCache::new());
        let collector = FlowCollector::new(
            2055,
            ProtocolDispatch::netflow(templates),
            queue.clone(),
            discard_external,
        );
        (collector, queue)
    }

    fn v5_datagram(src: &str, dst: &str) -> Vec<u8> {
        let mut builder = V5PacketBuilder::new(1_700_000_000, 10_000);
        builder.add_flow(V5Flow {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: 40_000,
            dst_port: 443,
            protocol: protocols::TCP,
            packets: 2,
            octets: 120,
            first: 9_000,
            last: 10_000,
            ..Default::default()
        });
        builder.build()
    }

    #[tokio::test]
    async fn test_datagram_parsed_and_enqueued() {
        let (collector, queue) = collector(false);
        collector.handle_datagram(&v5_datagram("10.0.0.1", "10.0.0.2"), "192.168.0.1".parse().unwrap());

        assert_eq!(queue.len(), 1);
        let record = queue.get().await;
        assert_eq!(record.dst_port, 443);
        assert_eq!(collector.stats.records_parsed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_bad_datagram_counted_not_fatal() {
        let (collector, queue) = collector(false);
        collector.handle_datagram(&[0xFF; 16], "192.168.0.1".parse().unwrap());

        assert!(queue.is_empty());
        assert_eq!(collector.stats.parse_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_external_flows_discarded_when_configured() {
        let (collector, queue) = collector(true);
        // Both endpoints public
        collector.handle_datagram(&v5_datagram("8.8.8.8", "1.1.1.1"), "192.168.0.1".parse().unwrap());
        assert!(queue.is_empty());

        // One endpoint private: kept
        collector.handle_datagram(&v5_datagram("10.0.0.1", "1.1.1.1"), "192.168.0.1".parse().unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));
        assert!(!is_private_ip("2001:db8::1".parse().unwrap()));
    }
}
