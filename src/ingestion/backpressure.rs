//! Bounded ingestion queue with adaptive backpressure
//!
//! The queue between parsers and the batch writer degrades in two
//! stages instead of blocking producers:
//!
//! | Size                                | State    | Put policy              |
//! |-------------------------------------|----------|-------------------------|
//! | `< sample_threshold`                | NORMAL   | accept                  |
//! | `[sample_threshold, drop_threshold)`| SAMPLING | accept 1 in sample_rate |
//! | `>= drop_threshold`                 | DROPPING | reject                  |
//!
//! Producers never block; consumers wake on the first available item or
//! a timeout, whichever comes first.

use crate::config::IngestionSettings;
use crate::metrics::metrics;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue pressure state, observed on every put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureState {
    Normal,
    Sampling,
    Dropping,
}

impl BackpressureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Sampling,
            2 => Self::Dropping,
            _ => Self::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Sampling => 1,
            Self::Dropping => 2,
        }
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub queue_max_size: usize,
    pub queue_utilization: f64,
    pub state: BackpressureState,
    pub total_received: u64,
    pub total_accepted: u64,
    pub total_sampled: u64,
    pub total_dropped: u64,
}

/// Bounded FIFO with sampling/dropping backpressure.
pub struct BackpressureQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    size: AtomicUsize,
    state: AtomicU8,

    sample_threshold: usize,
    drop_threshold: usize,
    max_size: usize,
    sample_rate: u32,

    // Stats
    total_received: AtomicU64,
    total_accepted: AtomicU64,
    total_sampled: AtomicU64,
    total_dropped: AtomicU64,
    sample_counter: AtomicU64,
}

impl<T> BackpressureQueue<T> {
    pub fn new(settings: &IngestionSettings) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(settings.queue_max_size.min(4_096))),
            notify: Notify::new(),
            size: AtomicUsize::new(0),
            state: AtomicU8::new(BackpressureState::Normal.as_u8()),
            sample_threshold: settings.sample_threshold,
            drop_threshold: settings.drop_threshold,
            max_size: settings.queue_max_size,
            sample_rate: settings.sample_rate.max(1),
            total_received: AtomicU64::new(0),
            total_accepted: AtomicU64::new(0),
            total_sampled: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            sample_counter: AtomicU64::new(0),
        }
    }

    /// Offer one item. Returns whether it was accepted.
    ///
    /// Never blocks: under pressure the item is sampled away or dropped
    /// and the corresponding counter incremented.
    pub fn put(&self, item: T) -> bool {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        let state = self.observe_state();

        match state {
            BackpressureState::Dropping => {
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                metrics().flows_dropped.inc("reason=\"backpressure\"");
                false
            }
            BackpressureState::Sampling => {
                let n = self.sample_counter.fetch_add(1, Ordering::Relaxed);
                if n % u64::from(self.sample_rate) == 0 {
                    self.push(item);
                    true
                } else {
                    self.total_sampled.fetch_add(1, Ordering::Relaxed);
                    metrics().flows_sampled.inc();
                    false
                }
            }
            BackpressureState::Normal => {
                self.push(item);
                true
            }
        }
    }

    /// Offer a batch. Returns `(accepted, rejected)` counts.
    pub fn put_batch(&self, items: impl IntoIterator<Item = T>) -> (usize, usize) {
        let mut accepted = 0;
        let mut rejected = 0;
        for item in items {
            if self.put(item) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        (accepted, rejected)
    }

    /// Wait for and take the next item.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.get_nowait() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next item if one is immediately available.
    pub fn get_nowait(&self) -> Option<T> {
        let mut items = match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let item = items.pop_front();
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
            metrics()
                .ingestion_queue_size
                .set(self.size.load(Ordering::Relaxed) as u64);
        }
        item
    }

    /// Take up to `max_items`, waking on the first item or the timeout,
    /// whichever comes first. May return an empty batch on timeout.
    pub async fn get_batch(&self, max_items: usize, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        loop {
            {
                let mut items = match self.items.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                while batch.len() < max_items {
                    match items.pop_front() {
                        Some(item) => batch.push(item),
                        None => break,
                    }
                }
            }
            if !batch.is_empty() {
                self.size.fetch_sub(batch.len(), Ordering::Relaxed);
                metrics()
                    .ingestion_queue_size
                    .set(self.size.load(Ordering::Relaxed) as u64);
                self.observe_state();
                return batch;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return batch;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> BackpressureState {
        BackpressureState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> QueueStats {
        let size = self.len();
        QueueStats {
            queue_size: size,
            queue_max_size: self.max_size,
            queue_utilization: size as f64 / self.max_size.max(1) as f64,
            state: self.state(),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_sampled: self.total_sampled.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }

    fn push(&self, item: T) {
        {
            let mut items = match self.items.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            items.push_back(item);
        }
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        let size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
        metrics().ingestion_queue_size.set(size as u64);
        self.notify.notify_one();
    }

    /// Recompute the state from the current size and log transitions.
    fn observe_state(&self) -> BackpressureState {
        let size = self.len();
        let new_state = if size >= self.drop_threshold {
            BackpressureState::Dropping
        } else if size >= self.sample_threshold {
            BackpressureState::Sampling
        } else {
            BackpressureState::Normal
        };

        let prev = self.state.swap(new_state.as_u8(), Ordering::Relaxed);
        if prev != new_state.as_u8() {
            tracing::warn!(
                from = ?BackpressureState::from_u8(prev),
                to = ?new_state,
                queue_size = size,
                "Ingestion queue state change"
            );
        }
        new_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IngestionSettings {
        IngestionSettings {
            queue_max_size: 10_000,
            sample_threshold: 5_000,
            drop_threshold: 8_000,
            sample_rate: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(&settings());
        assert_eq!(queue.state(), BackpressureState::Normal);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let queue = BackpressureQueue::new(&settings());
        assert!(queue.put(42));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, 42);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_batch_fifo_order() {
        let queue = BackpressureQueue::new(&settings());
        for i in 0..10 {
            queue.put(i);
        }
        let batch = queue.get_batch(5, Duration::from_millis(100)).await;
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_get_batch_times_out_empty() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(&settings());
        let batch = queue.get_batch(5, Duration::from_millis(20)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_sampling_state_at_threshold() {
        let queue = BackpressureQueue::new(&settings());
        for i in 0..5_100 {
            queue.put(i);
        }
        assert_eq!(queue.state(), BackpressureState::Sampling);

        let stats = queue.stats();
        assert!(stats.total_sampled > 0, "some items should be sampled away");
        assert!(stats.total_sampled < 150, "roughly half of the overflow is kept");
    }

    #[tokio::test]
    async fn test_dropping_state_and_put_rejection() {
        let queue = BackpressureQueue::new(&settings());
        // Past sample_threshold only 1 in 2 is kept, so feeding 12 000
        // pushes the depth through drop_threshold
        for i in 0..12_000 {
            queue.put(i);
        }
        assert_eq!(queue.state(), BackpressureState::Dropping);

        let before = queue.stats().total_dropped;
        assert!(!queue.put(99_999));
        assert_eq!(queue.stats().total_dropped, before + 1);
    }

    #[tokio::test]
    async fn test_state_recovery_after_drain() {
        let queue = BackpressureQueue::new(&settings());
        for i in 0..12_000 {
            queue.put(i);
        }
        assert_eq!(queue.state(), BackpressureState::Dropping);

        while !queue.is_empty() {
            queue.get_batch(1_000, Duration::from_millis(10)).await;
        }
        // State is recomputed on the next put
        assert!(queue.put(1));
        assert_eq!(queue.state(), BackpressureState::Normal);
    }

    #[tokio::test]
    async fn test_put_batch_counts() {
        let queue = BackpressureQueue::new(&settings());
        let (accepted, rejected) = queue.put_batch(0..10);
        assert_eq!(accepted, 10);
        assert_eq!(rejected, 0);
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test]
    async fn test_get_nowait() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(&settings());
        assert_eq!(queue.get_nowait(), None);
        queue.put(7);
        assert_eq!(queue.get_nowait(), Some(7));
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let queue = BackpressureQueue::new(&settings());
        for i in 0..5 {
            queue.put(i);
        }
        let stats = queue.stats();
        assert_eq!(stats.queue_size, 5);
        assert_eq!(stats.queue_max_size, 10_000);
        assert_eq!(stats.total_received, 5);
        assert!((stats.queue_utilization - 0.0005).abs() < 1e-9);
    }
}
