//! Raw flow and aggregate stores
//!
//! Raw flows are partitioned by day: keys are
//! `YYYYMMDD | timestamp_ms(8, BE) | seq(8, BE)` so windows scan as key
//! ranges and retention drops whole day prefixes.
//!
//! Aggregates key on `window_start_ms(8, BE) | md5(group_key)`, the
//! window + 5-tuple primary key, which makes reprocessing a window an
//! idempotent upsert. A side tree mirrors the
//! `(is_processed = false, window_start)` partial index.

use super::{decode, StorageError};
use crate::types::{FlowAggregate, FlowRecord};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

const DAY_FORMAT: &str = "%Y%m%d";

/// Store for immutable raw flow records.
pub struct FlowStore {
    tree: sled::Tree,
    seq: AtomicU64,
}

impl FlowStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree("flow_records")?,
            seq: AtomicU64::new(0),
        })
    }

    fn key(&self, ts: DateTime<Utc>) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(ts.format(DAY_FORMAT).to_string().as_bytes());
        key.extend_from_slice(&super::ts_key(ts));
        key.extend_from_slice(&self.seq.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        key
    }

    /// Bulk insert one batch. Records are write-once; keys never collide
    /// thanks to the per-process sequence suffix.
    pub fn insert_batch(&self, records: &[FlowRecord]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for record in records {
            batch.insert(self.key(record.timestamp), serde_json::to_vec(record)?);
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// All records with `start <= timestamp < end`.
    pub fn scan_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>, StorageError> {
        let mut records = Vec::new();
        let mut day = start.date_naive();
        let last_day = end.date_naive();

        while day <= last_day {
            let day_prefix = day.format(DAY_FORMAT).to_string();
            let mut lo = day_prefix.clone().into_bytes();
            lo.extend_from_slice(&super::ts_key(start));
            let mut hi = day_prefix.into_bytes();
            hi.extend_from_slice(&super::ts_key(end));

            for item in self.tree.range(lo..hi) {
                let (_, value) = item?;
                let record: FlowRecord = decode(&value)?;
                if record.timestamp >= start && record.timestamp < end {
                    records.push(record);
                }
            }
            day = day
                .succ_opt()
                .ok_or_else(|| StorageError::Integrity("date overflow".to_string()))?;
        }

        Ok(records)
    }

    /// Whether any record exists with `start <= timestamp < end`.
    ///
    /// Cheap key-range probe; used for pending-window discovery.
    pub fn has_any(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut day = start.date_naive();
        let last_day = end.date_naive();
        while day <= last_day {
            let day_prefix = day.format(DAY_FORMAT).to_string();
            let mut lo = day_prefix.clone().into_bytes();
            lo.extend_from_slice(&super::ts_key(start));
            let mut hi = day_prefix.into_bytes();
            hi.extend_from_slice(&super::ts_key(end));
            if self.tree.range(lo..hi).next().is_some() {
                return Ok(true);
            }
            day = day
                .succ_opt()
                .ok_or_else(|| StorageError::Integrity("date overflow".to_string()))?;
        }
        Ok(false)
    }

    /// Earliest stored record timestamp, if any.
    pub fn min_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        match self.tree.first()? {
            Some((_, value)) => {
                let record: FlowRecord = decode(&value)?;
                Ok(Some(record.timestamp))
            }
            None => Ok(None),
        }
    }

    /// Latest stored record timestamp, if any.
    pub fn max_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        match self.tree.last()? {
            Some((_, value)) => {
                let record: FlowRecord = decode(&value)?;
                Ok(Some(record.timestamp))
            }
            None => Ok(None),
        }
    }

    pub fn count_all(&self) -> Result<usize, StorageError> {
        Ok(self.tree.len())
    }

    /// Drop whole day partitions older than the retention horizon.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let cutoff_prefix = cutoff.format(DAY_FORMAT).to_string();
        let mut removed = 0u64;

        for item in self.tree.iter() {
            let (key, _) = item?;
            if key.len() < 8 {
                continue;
            }
            let day = &key[..8];
            if day < cutoff_prefix.as_bytes() {
                self.tree.remove(&key)?;
                removed += 1;
            } else {
                break; // keys are day-ordered
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, cutoff = %cutoff, "Purged expired flow records");
        }
        Ok(removed)
    }
}

/// Store for windowed flow aggregates.
pub struct AggregateStore {
    tree: sled::Tree,
    /// Mirrors the partial index on `(is_processed = false, window_start)`
    unprocessed: sled::Tree,
    /// id → primary key, for mark-processed by id
    by_id: sled::Tree,
}

impl AggregateStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree("flow_aggregates")?,
            unprocessed: db.open_tree("flow_aggregates_unprocessed")?,
            by_id: db.open_tree("flow_aggregates_by_id")?,
        })
    }

    fn key(aggregate: &FlowAggregate) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&super::ts_key(aggregate.window_start));
        key.extend_from_slice(&md5::compute(aggregate.group_key().as_bytes()).0);
        key
    }

    /// Upsert one window's aggregates. Re-running a window writes the
    /// same keys, so aggregation stays idempotent.
    pub fn upsert_window(&self, aggregates: &[FlowAggregate]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        let mut index_batch = sled::Batch::default();
        let mut id_batch = sled::Batch::default();

        for aggregate in aggregates {
            let key = Self::key(aggregate);
            batch.insert(key.clone(), serde_json::to_vec(aggregate)?);
            id_batch.insert(aggregate.id.as_bytes().to_vec(), key.clone());
            if aggregate.is_processed {
                index_batch.remove(key);
            } else {
                index_batch.insert(key, &[]);
            }
        }

        self.tree.apply_batch(batch)?;
        self.by_id.apply_batch(id_batch)?;
        self.unprocessed.apply_batch(index_batch)?;
        Ok(())
    }

    /// Whether any aggregate row exists for the given window start.
    pub fn window_exists(&self, window_start: DateTime<Utc>) -> Result<bool, StorageError> {
        let prefix = super::ts_key(window_start);
        Ok(self.tree.scan_prefix(prefix).next().is_some())
    }

    /// Unprocessed aggregates in ascending window order.
    pub fn list_unprocessed(&self, limit: usize) -> Result<Vec<FlowAggregate>, StorageError> {
        let mut out = Vec::new();
        for item in self.unprocessed.iter() {
            if out.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if let Some(value) = self.tree.get(&key)? {
                let aggregate: FlowAggregate = decode(&value)?;
                if !aggregate.is_processed {
                    out.push(aggregate);
                }
            } else {
                // Dangling index entry; heal it
                self.unprocessed.remove(&key)?;
            }
        }
        Ok(out)
    }

    /// Flip `is_processed` to true, updating row and index together.
    pub fn mark_processed(&self, aggregate: &FlowAggregate) -> Result<(), StorageError> {
        let key = Self::key(aggregate);
        let mut updated = aggregate.clone();
        updated.is_processed = true;
        self.tree.insert(key.clone(), serde_json::to_vec(&updated)?)?;
        self.unprocessed.remove(key)?;
        Ok(())
    }

    /// All aggregates in `[start, end)`, processed or not.
    pub fn scan_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FlowAggregate>, StorageError> {
        let lo = super::ts_key(start).to_vec();
        let hi = super::ts_key(end).to_vec();
        let mut out = Vec::new();
        for item in self.tree.range(lo..hi) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Aggregates for one window, in stable key order.
    pub fn list_window(
        &self,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<FlowAggregate>, StorageError> {
        let prefix = super::ts_key(window_start);
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn get_by_id(&self, id: Uuid) -> Result<Option<FlowAggregate>, StorageError> {
        let Some(key) = self.by_id.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.tree.get(&key)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn count_all(&self) -> Result<usize, StorageError> {
        Ok(self.tree.len())
    }

    /// Drop aggregates older than the retention horizon.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let hi = super::ts_key(cutoff).to_vec();
        let mut removed = 0u64;
        let expired: Vec<(sled::IVec, sled::IVec)> = self
            .tree
            .range(..hi)
            .filter_map(Result::ok)
            .collect();
        for (key, value) in expired {
            if let Ok(aggregate) = decode::<FlowAggregate>(&value) {
                self.by_id.remove(aggregate.id.as_bytes())?;
            }
            self.tree.remove(&key)?;
            self.unprocessed.remove(&key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Retention horizon helper shared by purge tasks.
pub fn retention_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days)
}
