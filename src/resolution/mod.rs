//! Resolution pipeline: windowed aggregation, asset mapping, dependency
//! building, gateway inference, and change detection.

pub mod aggregator;
pub mod asset_mapper;
pub mod change_detector;
pub mod dependency_builder;
pub mod gateway_inference;
pub mod worker;

pub use aggregator::FlowAggregator;
pub use asset_mapper::AssetMapper;
pub use change_detector::{ChangeDetector, DetectionSummary};
pub use dependency_builder::{determine_direction, DependencyBuilder};
pub use gateway_inference::GatewayInference;
pub use worker::{ResolutionWorker, WorkerStats, WorkerStatsSnapshot};
