//! Process-global metrics registry
//!
//! Counters, gauges, and histograms maintained by the pipeline and
//! rendered to Prometheus text format (version 0.0.4) by hand, the same
//! way the rest of the system exposes observability: no exporter crate,
//! just atomics behind accessors. The metric names here are an external
//! contract and must not change.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Settable gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter family with one label dimension set.
///
/// Label values are joined into the rendered series name; cardinality is
/// bounded by the callers (protocols, error tags, asset types).
#[derive(Debug, Default)]
pub struct LabeledCounter {
    series: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    pub fn inc(&self, labels: &str) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &str, n: u64) {
        self.series
            .entry(labels.to_string())
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &str) -> u64 {
        self.series
            .get(labels)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn render_into(&self, out: &mut String, name: &str) {
        let mut keys: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        for key in keys {
            if let Some(entry) = self.series.get(&key) {
                out.push_str(&format!(
                    "{name}{{{key}}} {}\n",
                    entry.load(Ordering::Relaxed)
                ));
            }
        }
    }
}

/// Histogram bucket boundaries for latency-style observations (seconds).
const LATENCY_BUCKETS: [f64; 10] = [
    0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
];

/// Histogram bucket boundaries for batch sizes (records).
const SIZE_BUCKETS: [f64; 8] = [1.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 10_000.0];

/// Fixed-bucket histogram: per-bucket counts, a sum (in micro-units to
/// stay atomic), and a count.
#[derive(Debug)]
pub struct Histogram {
    buckets: &'static [f64],
    counts: Vec<AtomicU64>,
    /// Sum scaled by 1e6 so it fits an atomic integer
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: (0..buckets.len()).map(|_| AtomicU64::default()).collect(),
            sum_micros: AtomicU64::default(),
            total: AtomicU64::default(),
        }
    }

    pub fn latency() -> Self {
        Self::new(&LATENCY_BUCKETS)
    }

    pub fn sizes() -> Self {
        Self::new(&SIZE_BUCKETS)
    }

    pub fn observe(&self, value: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add((value * 1_000_000.0).max(0.0) as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn render_into(&self, out: &mut String, name: &str, labels: Option<&str>) {
        let label_prefix = |extra: &str| -> String {
            match labels {
                Some(l) if extra.is_empty() => format!("{{{l}}}"),
                Some(l) => format!("{{{l},{extra}}}"),
                None if extra.is_empty() => String::new(),
                None => format!("{{{extra}}}"),
            }
        };
        for (i, bound) in self.buckets.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{} {}\n",
                label_prefix(&format!("le=\"{bound}\"")),
                self.counts[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{} {}\n",
            label_prefix("le=\"+Inf\""),
            self.total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "{name}_sum{} {:.6}\n",
            label_prefix(""),
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!(
            "{name}_count{} {}\n",
            label_prefix(""),
            self.total.load(Ordering::Relaxed)
        ));
    }
}

/// All pipeline metrics. Obtain via [`metrics()`].
#[derive(Debug)]
pub struct Metrics {
    /// `flowlens_flows_received_total{protocol,exporter}`
    pub flows_received: LabeledCounter,
    /// `flowlens_flows_parsed_total`
    pub flows_parsed: Counter,
    /// `flowlens_flows_parse_errors_total{protocol,error_type}`
    pub flows_parse_errors: LabeledCounter,
    /// `flowlens_flows_dropped_total{reason}`
    pub flows_dropped: LabeledCounter,
    /// `flowlens_flows_sampled_total`
    pub flows_sampled: Counter,
    /// `flowlens_ingestion_queue_size`
    pub ingestion_queue_size: Gauge,
    /// `flowlens_ingestion_batch_size`
    pub ingestion_batch_size: Histogram,
    /// `flowlens_ingestion_latency_seconds`
    pub ingestion_latency: Histogram,
    /// `flowlens_dependencies_created_total`
    pub dependencies_created: Counter,
    /// `flowlens_dependencies_updated_total`
    pub dependencies_updated: Counter,
    /// `flowlens_assets_discovered_total{asset_type}`
    pub assets_discovered: LabeledCounter,
    /// `flowlens_aggregation_window_duration_seconds`
    pub aggregation_window_duration: Histogram,
    /// `flowlens_graph_traversal_duration_seconds{operation}`
    pub graph_traversal_duration: DashMap<&'static str, Histogram>,
    /// `flowlens_cache_hits_total`
    pub cache_hits: Counter,
    /// `flowlens_cache_misses_total`
    pub cache_misses: Counter,
    /// `flowlens_change_events_total{change_type}`
    pub change_events: LabeledCounter,
    /// `flowlens_alerts_created_total{severity}`
    pub alerts_created: LabeledCounter,
    /// `flowlens_alerts_suppressed_total`
    pub alerts_suppressed: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            flows_received: LabeledCounter::default(),
            flows_parsed: Counter::default(),
            flows_parse_errors: LabeledCounter::default(),
            flows_dropped: LabeledCounter::default(),
            flows_sampled: Counter::default(),
            ingestion_queue_size: Gauge::default(),
            ingestion_batch_size: Histogram::sizes(),
            ingestion_latency: Histogram::latency(),
            dependencies_created: Counter::default(),
            dependencies_updated: Counter::default(),
            assets_discovered: LabeledCounter::default(),
            aggregation_window_duration: Histogram::latency(),
            graph_traversal_duration: DashMap::new(),
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            change_events: LabeledCounter::default(),
            alerts_created: LabeledCounter::default(),
            alerts_suppressed: Counter::default(),
        }
    }

    /// Record a graph operation's duration under its operation label.
    pub fn observe_traversal(&self, operation: &'static str, seconds: f64) {
        self.graph_traversal_duration
            .entry(operation)
            .or_insert_with(Histogram::latency)
            .observe(seconds);
    }

    /// Render every metric in Prometheus text format 0.0.4.
    pub fn render(&self) -> String {
        let mut body = String::with_capacity(8 * 1024);

        body.push_str("# HELP flowlens_flows_received_total Flow records received per protocol and exporter\n");
        body.push_str("# TYPE flowlens_flows_received_total counter\n");
        self.flows_received
            .render_into(&mut body, "flowlens_flows_received_total");

        body.push_str("# HELP flowlens_flows_parsed_total Flow records successfully parsed\n");
        body.push_str("# TYPE flowlens_flows_parsed_total counter\n");
        body.push_str(&format!(
            "flowlens_flows_parsed_total {}\n",
            self.flows_parsed.get()
        ));

        body.push_str("# HELP flowlens_flows_parse_errors_total Datagrams rejected by parsers\n");
        body.push_str("# TYPE flowlens_flows_parse_errors_total counter\n");
        self.flows_parse_errors
            .render_into(&mut body, "flowlens_flows_parse_errors_total");

        body.push_str("# HELP flowlens_flows_dropped_total Flow records shed by backpressure or retry exhaustion\n");
        body.push_str("# TYPE flowlens_flows_dropped_total counter\n");
        self.flows_dropped
            .render_into(&mut body, "flowlens_flows_dropped_total");

        body.push_str("# HELP flowlens_flows_sampled_total Flow records discarded by adaptive sampling\n");
        body.push_str("# TYPE flowlens_flows_sampled_total counter\n");
        body.push_str(&format!(
            "flowlens_flows_sampled_total {}\n",
            self.flows_sampled.get()
        ));

        body.push_str("# HELP flowlens_ingestion_queue_size Current ingestion queue depth\n");
        body.push_str("# TYPE flowlens_ingestion_queue_size gauge\n");
        body.push_str(&format!(
            "flowlens_ingestion_queue_size {}\n",
            self.ingestion_queue_size.get()
        ));

        body.push_str("# HELP flowlens_ingestion_batch_size Records per storage batch\n");
        body.push_str("# TYPE flowlens_ingestion_batch_size histogram\n");
        self.ingestion_batch_size
            .render_into(&mut body, "flowlens_ingestion_batch_size", None);

        body.push_str("# HELP flowlens_ingestion_latency_seconds Batch write latency\n");
        body.push_str("# TYPE flowlens_ingestion_latency_seconds histogram\n");
        self.ingestion_latency
            .render_into(&mut body, "flowlens_ingestion_latency_seconds", None);

        body.push_str("# HELP flowlens_dependencies_created_total Dependency edges created\n");
        body.push_str("# TYPE flowlens_dependencies_created_total counter\n");
        body.push_str(&format!(
            "flowlens_dependencies_created_total {}\n",
            self.dependencies_created.get()
        ));

        body.push_str("# HELP flowlens_dependencies_updated_total Dependency edges updated\n");
        body.push_str("# TYPE flowlens_dependencies_updated_total counter\n");
        body.push_str(&format!(
            "flowlens_dependencies_updated_total {}\n",
            self.dependencies_updated.get()
        ));

        body.push_str("# HELP flowlens_assets_discovered_total Assets created per type\n");
        body.push_str("# TYPE flowlens_assets_discovered_total counter\n");
        self.assets_discovered
            .render_into(&mut body, "flowlens_assets_discovered_total");

        body.push_str("# HELP flowlens_aggregation_window_duration_seconds Time to aggregate one window\n");
        body.push_str("# TYPE flowlens_aggregation_window_duration_seconds histogram\n");
        self.aggregation_window_duration.render_into(
            &mut body,
            "flowlens_aggregation_window_duration_seconds",
            None,
        );

        body.push_str("# HELP flowlens_graph_traversal_duration_seconds Graph analytics latency per operation\n");
        body.push_str("# TYPE flowlens_graph_traversal_duration_seconds histogram\n");
        let mut ops: Vec<&'static str> = self
            .graph_traversal_duration
            .iter()
            .map(|e| *e.key())
            .collect();
        ops.sort_unstable();
        for op in ops {
            if let Some(hist) = self.graph_traversal_duration.get(op) {
                hist.render_into(
                    &mut body,
                    "flowlens_graph_traversal_duration_seconds",
                    Some(&format!("operation=\"{op}\"")),
                );
            }
        }

        body.push_str("# HELP flowlens_cache_hits_total Topology cache hits\n");
        body.push_str("# TYPE flowlens_cache_hits_total counter\n");
        body.push_str(&format!("flowlens_cache_hits_total {}\n", self.cache_hits.get()));

        body.push_str("# HELP flowlens_cache_misses_total Topology cache misses\n");
        body.push_str("# TYPE flowlens_cache_misses_total counter\n");
        body.push_str(&format!(
            "flowlens_cache_misses_total {}\n",
            self.cache_misses.get()
        ));

        body.push_str("# HELP flowlens_change_events_total Change events emitted per type\n");
        body.push_str("# TYPE flowlens_change_events_total counter\n");
        self.change_events
            .render_into(&mut body, "flowlens_change_events_total");

        body.push_str("# HELP flowlens_alerts_created_total Alerts created per severity\n");
        body.push_str("# TYPE flowlens_alerts_created_total counter\n");
        self.alerts_created
            .render_into(&mut body, "flowlens_alerts_created_total");

        body.push_str("# HELP flowlens_alerts_suppressed_total Alerts suppressed by maintenance windows\n");
        body.push_str("# TYPE flowlens_alerts_suppressed_total counter\n");
        body.push_str(&format!(
            "flowlens_alerts_suppressed_total {}\n",
            self.alerts_suppressed.get()
        ));

        body
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// The process-wide metrics registry.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Format a `{protocol,exporter}` label pair.
pub fn protocol_exporter_labels(protocol: &str, exporter: &std::net::IpAddr) -> String {
    format!("protocol=\"{protocol}\",exporter=\"{exporter}\"")
}

/// Format a `{protocol,error_type}` label pair.
pub fn protocol_error_labels(protocol: &str, error_type: &str) -> String {
    format!("protocol=\"{protocol}\",error_type=\"{error_type}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::default();
        g.set(42);
        assert_eq!(g.get(), 42);
    }

    #[test]
    fn test_labeled_counter_renders_sorted() {
        let c = LabeledCounter::default();
        c.inc("reason=\"backpressure\"");
        c.add("reason=\"retry_exhausted\"", 3);

        let mut out = String::new();
        c.render_into(&mut out, "test_total");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "test_total{reason=\"backpressure\"} 1");
        assert_eq!(lines[1], "test_total{reason=\"retry_exhausted\"} 3");
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let h = Histogram::latency();
        h.observe(0.003);
        h.observe(0.2);

        let mut out = String::new();
        h.render_into(&mut out, "lat", None);
        // 0.003 lands in every bucket >= 0.005; 0.2 in every bucket >= 0.5
        assert!(out.contains("lat_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("lat_bucket{le=\"0.5\"} 2"));
        assert!(out.contains("lat_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("lat_count 2"));
    }

    #[test]
    fn test_render_contains_contract_names() {
        let m = Metrics::new();
        m.flows_parsed.inc();
        m.observe_traversal("blast_radius", 0.02);
        let body = m.render();
        assert!(body.contains("flowlens_flows_parsed_total 1"));
        assert!(body.contains("flowlens_ingestion_queue_size"));
        assert!(body.contains("operation=\"blast_radius\""));
    }
}
