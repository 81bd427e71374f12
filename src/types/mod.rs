//! Core entity types for the flow-to-graph pipeline
//!
//! Everything that crosses a module or storage boundary lives here:
//! flow records and aggregates, assets, dependency edges, gateway
//! relationships, change events, alerts, and classification entities.

pub mod asset;
pub mod change;
pub mod classification;
pub mod dependency;
pub mod flow;
pub mod gateway;

pub use asset::{Asset, AssetType, Service};
pub use change::{
    Alert, AlertRule, AlertSeverity, ChangeEvent, ChangeType, MaintenanceWindow, RuleSchedule,
};
pub use classification::{
    AssetFeatures, Cidr, CidrError, ClassificationHistory, ClassificationMethod,
    ClassificationRule, MlModelRecord,
};
pub use dependency::{Dependency, DependencyChangeKind, DependencyHistory};
pub use flow::{protocols, FlowAggregate, FlowRecord, FlowRecordError, TcpFlags};
pub use gateway::{AssetGateway, GatewayObservation, GatewayRole, ObservationSource};
