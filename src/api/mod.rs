//! HTTP shim: health, Prometheus metrics, and the change/alert read
//! and acknowledgement surface.
//!
//! This is a thin shell over the stores; the real consumers
//! (dashboards, notification fan-out) live outside the core.
//! Authentication and websockets are deliberately absent.

mod handlers;
mod routes;

pub use routes::create_app;

use crate::cache::TtlCache;
use crate::ingestion::BackpressureQueue;
use crate::resolution::WorkerStats;
use crate::storage::Stores;
use crate::types::FlowRecord;
use std::sync::Arc;
use std::time::Instant;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub stores: Stores,
    pub queue: Arc<BackpressureQueue<FlowRecord>>,
    pub cache: Arc<TtlCache>,
    pub worker_stats: Arc<WorkerStats>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(
        stores: Stores,
        queue: Arc<BackpressureQueue<FlowRecord>>,
        cache: Arc<TtlCache>,
        worker_stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            stores,
            queue,
            cache,
            worker_stats,
            started_at: Instant::now(),
        }
    }
}
