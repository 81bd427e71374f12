//! FlowLens: flow telemetry to a live asset-dependency graph
//!
//! Ingests NetFlow v5/v9, IPFIX, and sFlow over UDP and maintains a
//! temporally-valid dependency graph of who talks to whom, on what
//! ports, how much, and since when.
//!
//! ## Architecture
//!
//! - **Ingestion**: UDP collectors → protocol parsers → backpressure
//!   queue → batch writer → raw flow store
//! - **Resolution**: tumbling-window aggregation → asset mapping →
//!   dependency edges, with gateway inference and change detection
//!   riding the same loop
//! - **Analytics**: traversal, blast radius, impact, SPOF, and
//!   path-finding over current or point-in-time edges
//! - **Classification**: behavioral features scored by weighted
//!   heuristics, with an optional hot-swappable ML model

pub mod alerting;
pub mod api;
pub mod cache;
pub mod classification;
pub mod config;
pub mod enrichment;
pub mod graph;
pub mod ingestion;
pub mod metrics;
pub mod resolution;
pub mod storage;
pub mod types;

// Re-export the pipeline's core types
pub use types::{
    Alert, AlertRule, AlertSeverity, Asset, AssetGateway, AssetType, ChangeEvent, ChangeType,
    Dependency, FlowAggregate, FlowRecord, GatewayRole, MaintenanceWindow,
};

// Re-export the ingestion boundary
pub use ingestion::{BackpressureQueue, BackpressureState, FlowParser, ParseError};

// Re-export graph operations
pub use graph::{
    BlastRadius, FailureType, GraphAnalytics, PathCriterion, TraversalDirection,
};

// Re-export storage root
pub use storage::{StorageError, Stores};
