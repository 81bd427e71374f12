//! System-wide default constants.
//!
//! Centralises magic numbers used across the pipeline. Grouped by
//! subsystem for easy discovery.

// ============================================================================
// Ingestion
// ============================================================================

/// Default UDP port for NetFlow v5/v9 and IPFIX datagrams.
pub const NETFLOW_PORT: u16 = 2055;

/// Default UDP port for sFlow datagrams.
pub const SFLOW_PORT: u16 = 6343;

/// Maximum UDP datagram size accepted from exporters.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Kernel receive buffer requested on collector sockets (bytes).
///
/// Large enough to absorb multi-exporter bursts between reads.
pub const UDP_RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Bounded ingestion queue capacity (flow records).
pub const QUEUE_MAX_SIZE: usize = 100_000;

/// Queue size at which adaptive sampling begins.
pub const SAMPLE_THRESHOLD: usize = 50_000;

/// Queue size at which new records are dropped outright.
pub const DROP_THRESHOLD: usize = 80_000;

/// Keep 1 in N records while sampling.
pub const SAMPLE_RATE: u32 = 2;

/// Target records per storage batch.
pub const BATCH_SIZE: usize = 1_000;

/// Maximum wait for a batch to fill before a partial flush (ms).
pub const BATCH_TIMEOUT_MS: u64 = 500;

/// Batch writer retry budget before a batch is dropped.
pub const BATCH_MAX_RETRIES: u32 = 5;

/// Initial batch writer retry delay (doubles each attempt, ms).
pub const BATCH_RETRY_BASE_MS: u64 = 100;

// ============================================================================
// Enrichment
// ============================================================================

/// Hard timeout for a single DNS lookup (ms).
pub const DNS_TIMEOUT_MS: u64 = 2_000;

/// Bounded DNS result cache size.
pub const DNS_CACHE_SIZE: usize = 10_000;

/// DNS cache entry lifetime (seconds).
pub const DNS_CACHE_TTL_SECS: u64 = 3_600;

/// Maximum concurrent enrichment lookups in flight.
pub const ENRICHMENT_CONCURRENCY: usize = 100;

// ============================================================================
// Resolution
// ============================================================================

/// Tumbling aggregation window width (seconds).
pub const WINDOW_SECONDS: u64 = 60;

/// Grace period before the most recent window may be aggregated,
/// accommodating late-arriving flows (seconds).
pub const WATERMARK_DELAY_SECS: u64 = 90;

/// A current dependency unseen for this long is invalidated (seconds).
pub const STALENESS_THRESHOLD_SECS: u64 = 7 * 24 * 3_600;

/// Cadence of the change-detection sweep (minutes).
pub const DETECTION_INTERVAL_MINUTES: u64 = 5;

/// Relative 24h-byte delta that counts as a traffic spike or drop.
pub const SPIKE_RATIO: f64 = 3.0;

/// Aggregates pulled per dependency-builder sweep.
pub const RESOLUTION_BATCH_SIZE: usize = 500;

/// Poll interval when the resolution worker finds no work (ms).
pub const RESOLUTION_POLL_INTERVAL_MS: u64 = 1_000;

/// Cadence of the gateway observation rollup (seconds).
pub const GATEWAY_ROLLUP_INTERVAL_SECS: u64 = 30;

/// Minimum traffic share for a non-primary gateway to rank as ECMP.
pub const ECMP_SHARE_THRESHOLD: f64 = 0.20;

/// Bounded IP → asset id cache size in the asset mapper.
pub const ASSET_CACHE_SIZE: usize = 50_000;

/// An asset unseen for this long is flagged offline (seconds).
pub const ASSET_OFFLINE_THRESHOLD_SECS: u64 = 24 * 3_600;

// ============================================================================
// Classification
// ============================================================================

/// Minimum recommendation confidence for auto-applying a type.
pub const AUTO_UPDATE_THRESHOLD: f64 = 0.70;

/// Minimum flows observed before a classification is trusted.
pub const MIN_FLOWS: u64 = 100;

/// Minimum distinct active hours before a classification is trusted.
pub const MIN_OBSERVATION_HOURS: u32 = 24;

/// Minimum ML probability before the hybrid engine prefers ML output.
pub const ML_CONFIDENCE_THRESHOLD: f64 = 0.80;

/// Minimum flows before the hybrid engine consults the ML model.
pub const ML_MIN_FLOWS: u64 = 500;

/// Cadence of the classification sweep (minutes).
pub const CLASSIFICATION_INTERVAL_MINUTES: u64 = 60;

// ============================================================================
// Cache
// ============================================================================

/// Default TTL for topology cache entries (seconds). 0 disables caching.
pub const TOPOLOGY_CACHE_TTL_SECS: u64 = 30;

/// Maximum topology cache entries before eviction.
pub const TOPOLOGY_CACHE_MAX_ENTRIES: usize = 500;

/// Interval between expired-entry cleanup passes (seconds).
pub const CACHE_CLEANUP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// Graph analytics
// ============================================================================

/// Default traversal depth bound.
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Hard ceiling on traversal depth regardless of caller input.
pub const MAX_TRAVERSAL_DEPTH: u32 = 10;

// ============================================================================
// Retention
// ============================================================================

/// Raw flow record retention (days).
pub const FLOW_RETENTION_DAYS: i64 = 7;

/// Aggregate retention (days).
pub const AGGREGATE_RETENTION_DAYS: i64 = 30;
