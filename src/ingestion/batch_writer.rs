//! Batch writer: queue consumer persisting raw flows
//!
//! Pulls batches from the backpressure queue and performs one bulk
//! insert per batch. Transient store errors are retried with
//! exponential backoff; after the retry budget the batch is dropped and
//! counted so ingestion never stalls behind a sick store.

use super::backpressure::BackpressureQueue;
use crate::config::defaults::{BATCH_MAX_RETRIES, BATCH_RETRY_BASE_MS};
use crate::metrics::metrics;
use crate::storage::FlowStore;
use crate::types::FlowRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Writer configuration distilled from ingestion settings.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

/// Queue-to-store pump.
pub struct BatchWriter {
    queue: Arc<BackpressureQueue<FlowRecord>>,
    store: Arc<FlowStore>,
    config: BatchWriterConfig,
    batches_written: u64,
    batches_dropped: u64,
}

impl BatchWriter {
    pub fn new(
        queue: Arc<BackpressureQueue<FlowRecord>>,
        store: Arc<FlowStore>,
        config: BatchWriterConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            batches_written: 0,
            batches_dropped: 0,
        }
    }

    /// Consume until cancelled, then drain what's already queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            "Batch writer started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.drain_on_shutdown().await;
                    info!(
                        batches_written = self.batches_written,
                        batches_dropped = self.batches_dropped,
                        "Batch writer stopped"
                    );
                    return;
                }
                batch = self.queue.get_batch(self.config.batch_size, self.config.batch_timeout) => {
                    if !batch.is_empty() {
                        self.write_batch(batch).await;
                    }
                }
            }
        }
    }

    /// Flush whatever is still queued without waiting for more.
    async fn drain_on_shutdown(&mut self) {
        loop {
            let batch = self
                .queue
                .get_batch(self.config.batch_size, Duration::from_millis(0))
                .await;
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "Draining queue on shutdown");
            self.write_batch(batch).await;
        }
    }

    /// One bulk insert with retry/backoff; drops the batch after the
    /// retry budget is exhausted.
    async fn write_batch(&mut self, batch: Vec<FlowRecord>) {
        let batch_len = batch.len();
        let first_timestamp = batch.first().map(|r| r.timestamp);
        let started = std::time::Instant::now();

        let mut attempt = 0u32;
        loop {
            match self.store.insert_batch(&batch) {
                Ok(()) => {
                    self.batches_written += 1;
                    metrics().ingestion_batch_size.observe(batch_len as f64);
                    metrics()
                        .ingestion_latency
                        .observe(started.elapsed().as_secs_f64());
                    return;
                }
                Err(e) if attempt < BATCH_MAX_RETRIES && e.is_transient() => {
                    let delay = Duration::from_millis(
                        BATCH_RETRY_BASE_MS * 2u64.saturating_pow(attempt),
                    );
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        max_attempts = BATCH_MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch insert failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.batches_dropped += 1;
                    metrics()
                        .flows_dropped
                        .add("reason=\"retry_exhausted\"", batch_len as u64);
                    error!(
                        batch_size = batch_len,
                        first_record_timestamp = ?first_timestamp,
                        attempts = attempt + 1,
                        error = %e,
                        "Batch insert failed permanently — dropping batch"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionSettings;
    use crate::storage::Stores;
    use crate::types::protocols;
    use chrono::Utc;
    use std::collections::HashMap;

    fn record(i: u16) -> FlowRecord {
        FlowRecord {
            timestamp: Utc::now(),
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 40_000 + i,
            dst_port: 443,
            protocol: protocols::TCP,
            bytes_count: 100,
            packets_count: 1,
            exporter_ip: "192.168.0.1".parse().unwrap(),
            flow_start: None,
            flow_end: None,
            flow_duration_ms: None,
            tcp_flags: None,
            exporter_id: None,
            sampling_rate: 1,
            input_interface: None,
            output_interface: None,
            tos: None,
            flow_source: "test".to_string(),
            extended_fields: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_writes_queued_records() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let queue = Arc::new(BackpressureQueue::new(&IngestionSettings::default()));

        for i in 0..10 {
            queue.put(record(i));
        }

        let writer = BatchWriter::new(
            queue.clone(),
            stores.flows.clone(),
            BatchWriterConfig {
                batch_size: 100,
                batch_timeout: Duration::from_millis(20),
            },
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(cancel.clone()));

        // Give the writer a moment to flush, then stop it
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(stores.flows.count_all().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_drains_queue_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let queue = Arc::new(BackpressureQueue::new(&IngestionSettings::default()));

        let writer = BatchWriter::new(
            queue.clone(),
            stores.flows.clone(),
            BatchWriterConfig {
                batch_size: 4,
                batch_timeout: Duration::from_secs(60),
            },
        );

        let cancel = CancellationToken::new();
        for i in 0..7 {
            queue.put(record(i));
        }
        cancel.cancel();

        writer.run(cancel).await;
        assert_eq!(stores.flows.count_all().unwrap(), 7);
    }
}
