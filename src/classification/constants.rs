//! Classification constants
//!
//! Port taxonomies, range boundaries, and behavioral thresholds used by
//! the feature extractor and the heuristic scorer.

/// Ports strongly associated with database engines.
pub const DATABASE_PORTS: &[u16] = &[
    1433,  // MSSQL
    1521,  // Oracle
    3306,  // MySQL
    5432,  // PostgreSQL
    27017, // MongoDB
    6379,  // Redis
    9042,  // Cassandra CQL
    7000,  // Cassandra inter-node
    5984,  // CouchDB
    8086,  // InfluxDB
    9200,  // Elasticsearch
    11211, // Memcached
];

/// Ports strongly associated with storage protocols.
pub const STORAGE_PORTS: &[u16] = &[
    2049, // NFS
    445,  // SMB/CIFS
    3260, // iSCSI
    111,  // RPCbind (often for NFS)
    139,  // NetBIOS (SMB legacy)
    548,  // AFP
    873,  // Rsync
];

/// Web-serving ports, including common dev-server defaults.
pub const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443, 3000, 5000, 8000];

pub const SSH_PORTS: &[u16] = &[22];

pub const LOAD_BALANCER_PORTS: &[u16] = &[
    80, 443, 8080, 8443, 1936, // HAProxy stats
];

pub const NETWORK_DEVICE_PORTS: &[u16] = &[
    22,   // SSH management
    23,   // Telnet
    161,  // SNMP
    162,  // SNMP trap
    179,  // BGP
    520,  // RIP
    1723, // PPTP
    500,  // IKE (VPN)
    4500, // IPSec NAT-T
];

pub const CONTAINER_PORTS: &[u16] = &[
    2375,  // Docker API (unencrypted)
    2376,  // Docker API (TLS)
    6443,  // Kubernetes API
    10250, // Kubelet API
    10255, // Kubelet read-only
    4194,  // cAdvisor
    8001,  // Kubernetes dashboard
];

// Port range boundaries
pub const WELL_KNOWN_PORT_MAX: u16 = 1023;
pub const REGISTERED_PORT_MIN: u16 = 1024;
pub const REGISTERED_PORT_MAX: u16 = 49151;
pub const EPHEMERAL_PORT_MIN: u16 = 32768;

// Fan-in/fan-out thresholds
pub const HIGH_FAN_IN_THRESHOLD: u32 = 20;
pub const VERY_HIGH_FAN_IN_THRESHOLD: u32 = 100;
pub const HIGH_FAN_OUT_THRESHOLD: u32 = 50;
pub const LOW_FAN_IN_THRESHOLD: u32 = 5;
pub const LOW_FAN_OUT_THRESHOLD: u32 = 5;

// Traffic volume thresholds
pub const HIGH_BYTES_PER_FLOW_THRESHOLD: f64 = 1_000_000.0;
pub const HIGH_CONNECTION_RATE_THRESHOLD: u64 = 5_000;

// Temporal thresholds
pub const BUSINESS_HOURS_START: u32 = 8;
pub const BUSINESS_HOURS_END: u32 = 18;
/// 24x7 indicator
pub const HIGH_ACTIVE_HOURS_THRESHOLD: u32 = 18;
pub const DIURNAL_PATTERN_THRESHOLD: f64 = 0.7;

// Ratio thresholds
pub const HIGH_FAN_IN_RATIO: f64 = 0.6;
pub const SYMMETRIC_TRAFFIC_THRESHOLD: f64 = 0.3;

/// Category name for a port, if it belongs to one of the taxonomies.
pub fn get_port_category(port: u16) -> Option<&'static str> {
    if DATABASE_PORTS.contains(&port) {
        return Some("database");
    }
    if STORAGE_PORTS.contains(&port) {
        return Some("storage");
    }
    if WEB_PORTS.contains(&port) {
        return Some("web");
    }
    if SSH_PORTS.contains(&port) {
        return Some("ssh");
    }
    if LOAD_BALANCER_PORTS.contains(&port) {
        return Some("load_balancer");
    }
    if NETWORK_DEVICE_PORTS.contains(&port) {
        return Some("network_device");
    }
    if CONTAINER_PORTS.contains(&port) {
        return Some("container");
    }
    None
}

/// Well-known range: 0-1023.
pub fn is_well_known_port(port: u16) -> bool {
    port <= WELL_KNOWN_PORT_MAX
}

/// Ephemeral range: 32768 and up.
pub fn is_ephemeral_port(port: u16) -> bool {
    port >= EPHEMERAL_PORT_MIN
}

/// Registered range: 1024-49151.
pub fn is_registered_port(port: u16) -> bool {
    (REGISTERED_PORT_MIN..=REGISTERED_PORT_MAX).contains(&port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_boundaries() {
        assert!(is_well_known_port(0));
        assert!(is_well_known_port(1023));
        assert!(!is_well_known_port(1024));

        assert!(is_ephemeral_port(32768));
        assert!(!is_ephemeral_port(32767));

        assert!(is_registered_port(1024));
        assert!(is_registered_port(49151));
        assert!(!is_registered_port(1023));
        assert!(!is_registered_port(49152));
    }

    #[test]
    fn test_port_categories() {
        assert_eq!(get_port_category(5432), Some("database"));
        assert_eq!(get_port_category(2049), Some("storage"));
        assert_eq!(get_port_category(22), Some("ssh"));
        assert_eq!(get_port_category(6443), Some("container"));
        assert_eq!(get_port_category(54321), None);
    }

    #[test]
    fn test_web_before_load_balancer_for_shared_ports() {
        // 80/443 belong to both lists; the web category wins lookup
        assert_eq!(get_port_category(80), Some("web"));
        assert_eq!(get_port_category(1936), Some("load_balancer"));
    }
}
