//! Persistent state
//!
//! One embedded sled database, one tree per logical table. Values are
//! JSON-serialized entities; keys are big-endian timestamps or UUID
//! bytes chosen so range scans express the hot-path indexes (current
//! dependencies, unprocessed aggregates, time-ordered events).
//!
//! Relational invariants the schema would normally carry (the unique
//! current-dependency key, no self-loops, longest-prefix rule lookup)
//! are enforced in store code.

pub mod assets;
pub mod changes;
pub mod classification;
pub mod dependencies;
pub mod flows;
pub mod gateways;

pub use assets::AssetStore;
pub use changes::{AlertQuery, ChangeStore, EventQuery};
pub use classification::ClassificationStore;
pub use dependencies::DependencyStore;
pub use flows::{AggregateStore, FlowStore};
pub use gateways::GatewayStore;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether retrying could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Io(_))
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// All stores, opened over a single sled database.
#[derive(Clone)]
pub struct Stores {
    pub flows: Arc<FlowStore>,
    pub aggregates: Arc<AggregateStore>,
    pub assets: Arc<AssetStore>,
    pub dependencies: Arc<DependencyStore>,
    pub gateways: Arc<GatewayStore>,
    pub changes: Arc<ChangeStore>,
    pub classification: Arc<ClassificationStore>,
    db: Arc<sled::Db>,
}

impl Stores {
    /// Open (or create) the database at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Arc::new(sled::open(path)?);
        Ok(Self {
            flows: Arc::new(FlowStore::open(&db)?),
            aggregates: Arc::new(AggregateStore::open(&db)?),
            assets: Arc::new(AssetStore::open(&db)?),
            dependencies: Arc::new(DependencyStore::open(&db)?),
            gateways: Arc::new(GatewayStore::open(&db)?),
            changes: Arc::new(ChangeStore::open(&db)?),
            classification: Arc::new(ClassificationStore::open(&db)?),
            db,
        })
    }

    /// Flush everything to disk. Called once at shutdown; sled's
    /// background flusher covers steady state.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Big-endian millisecond key for chronological ordering.
pub(crate) fn ts_key(ts: chrono::DateTime<chrono::Utc>) -> [u8; 8] {
    // Clamp pre-epoch timestamps instead of wrapping the sort order
    (ts.timestamp_millis().max(0) as u64).to_be_bytes()
}

/// Decode a JSON value, surfacing corrupt rows as storage errors.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    raw: &sled::IVec,
) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(raw)?)
}
