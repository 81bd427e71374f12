//! Dependency store
//!
//! Three trees cooperate here:
//!
//! - `dependencies`: every edge version, keyed by UUID
//! - `dependencies_current`: the unique partial index on
//!   `(source, target, port, protocol) WHERE valid_to IS NULL`
//! - `dependency_activity`: per-edge per-window byte counts feeding
//!   the rolling 24h/7d metrics
//! - `dependency_history`: append-only audit log
//!
//! Self-loops are rejected at the store boundary; a duplicate current
//! row is an integrity violation, not an upsert.

use super::{decode, ts_key, StorageError};
use crate::types::{Dependency, DependencyChangeKind, DependencyHistory};
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use uuid::Uuid;

pub struct DependencyStore {
    tree: sled::Tree,
    current: sled::Tree,
    activity: sled::Tree,
    history: sled::Tree,
    /// Serializes current-row insert/invalidate per edge key, standing
    /// in for the row-level lock a relational store would take.
    write_lock: Mutex<()>,
}

fn edge_key(source: Uuid, target: Uuid, port: u16, protocol: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(35);
    key.extend_from_slice(source.as_bytes());
    key.extend_from_slice(target.as_bytes());
    key.extend_from_slice(&port.to_be_bytes());
    key.push(protocol);
    key
}

impl DependencyStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree("dependencies")?,
            current: db.open_tree("dependencies_current")?,
            activity: db.open_tree("dependency_activity")?,
            history: db.open_tree("dependency_history")?,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current edge for the key, if one exists.
    pub fn get_current(
        &self,
        source: Uuid,
        target: Uuid,
        port: u16,
        protocol: u8,
    ) -> Result<Option<Dependency>, StorageError> {
        let Some(id_bytes) = self.current.get(edge_key(source, target, port, protocol))? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| StorageError::Integrity(format!("corrupt current index: {e}")))?;
        self.get(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Dependency>, StorageError> {
        match self.tree.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert a new current edge.
    ///
    /// Rejects self-loops and duplicate current rows; the latter is a
    /// bug upstream (two builders must serialize on the edge key).
    pub fn insert_current(&self, dep: &Dependency) -> Result<(), StorageError> {
        if dep.source_asset_id == dep.target_asset_id {
            return Err(StorageError::Integrity(format!(
                "self-loop dependency rejected for asset {}",
                dep.source_asset_id
            )));
        }
        if !dep.is_current() {
            return Err(StorageError::Integrity(
                "insert_current called with valid_to set".to_string(),
            ));
        }

        let _guard = self.lock();
        let key = edge_key(
            dep.source_asset_id,
            dep.target_asset_id,
            dep.target_port,
            dep.protocol,
        );
        if self.current.get(&key)?.is_some() {
            return Err(StorageError::Integrity(format!(
                "duplicate current dependency {} -> {}:{}/{}",
                dep.source_asset_id, dep.target_asset_id, dep.target_port, dep.protocol
            )));
        }

        self.tree.insert(dep.id.as_bytes(), serde_json::to_vec(dep)?)?;
        self.current.insert(key, dep.id.as_bytes().to_vec())?;
        self.append_history(DependencyHistory::snapshot(
            dep,
            DependencyChangeKind::Created,
            None,
        ))?;
        Ok(())
    }

    /// Persist counter/metric updates to an existing edge version.
    pub fn update(&self, dep: &Dependency) -> Result<(), StorageError> {
        self.tree.insert(dep.id.as_bytes(), serde_json::to_vec(dep)?)?;
        Ok(())
    }

    /// Close the current row: set `valid_to`, drop the index entry, log
    /// history. The row stays behind for point-in-time queries.
    pub fn invalidate(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        change: DependencyChangeKind,
        reason: Option<String>,
    ) -> Result<Dependency, StorageError> {
        let _guard = self.lock();
        let Some(mut dep) = self.get(id)? else {
            return Err(StorageError::NotFound(format!("dependency {id}")));
        };
        if !dep.is_current() {
            return Ok(dep); // already invalidated
        }
        dep.valid_to = Some(at);
        self.tree.insert(dep.id.as_bytes(), serde_json::to_vec(&dep)?)?;

        let key = edge_key(
            dep.source_asset_id,
            dep.target_asset_id,
            dep.target_port,
            dep.protocol,
        );
        // Only remove the index entry if it still points at this row
        if let Some(current) = self.current.get(&key)? {
            if current.as_ref() == dep.id.as_bytes() {
                self.current.remove(&key)?;
            }
        }
        self.append_history(DependencyHistory::snapshot(&dep, change, reason))?;
        Ok(dep)
    }

    /// All current edges.
    pub fn list_current(&self) -> Result<Vec<Dependency>, StorageError> {
        let mut out = Vec::new();
        for item in self.current.iter() {
            let (_, id_bytes) = item?;
            let id = Uuid::from_slice(&id_bytes)
                .map_err(|e| StorageError::Integrity(format!("corrupt current index: {e}")))?;
            if let Some(dep) = self.get(id)? {
                out.push(dep);
            }
        }
        Ok(out)
    }

    /// Edges valid at the reference time, for point-in-time analytics.
    pub fn list_valid_at(&self, at: DateTime<Utc>) -> Result<Vec<Dependency>, StorageError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let dep: Dependency = decode(&value)?;
            if dep.valid_at(at) {
                out.push(dep);
            }
        }
        Ok(out)
    }

    /// Current edges whose `last_seen` predates the cutoff.
    pub fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Dependency>, StorageError> {
        Ok(self
            .list_current()?
            .into_iter()
            .filter(|d| d.last_seen < cutoff)
            .collect())
    }

    pub fn count_current(&self) -> Result<usize, StorageError> {
        Ok(self.current.len())
    }

    // ------------------------------------------------------------------
    // Rolling activity
    // ------------------------------------------------------------------

    /// Record one window's bytes for an edge and return the refreshed
    /// `(bytes_last_24h, bytes_last_7d)` sums. Entries older than 7 days
    /// are reclaimed during the same pass.
    pub fn record_activity(
        &self,
        dep_id: Uuid,
        window_start: DateTime<Utc>,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64), StorageError> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(dep_id.as_bytes());
        key.extend_from_slice(&ts_key(window_start));
        // Additive within a window: merge with any existing count
        let prior = self
            .activity
            .get(&key)?
            .map(|v| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&v);
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0);
        self.activity
            .insert(key, (prior + bytes).to_be_bytes().to_vec())?;

        let horizon_7d = now - Duration::days(7);
        let horizon_24h = now - Duration::hours(24);
        let mut sum_24h = 0u64;
        let mut sum_7d = 0u64;
        let mut expired = Vec::new();

        for item in self.activity.scan_prefix(dep_id.as_bytes()) {
            let (key, value) = item?;
            let mut ts_buf = [0u8; 8];
            ts_buf.copy_from_slice(&key[16..24]);
            let ts_millis = u64::from_be_bytes(ts_buf) as i64;
            let mut bytes_buf = [0u8; 8];
            bytes_buf.copy_from_slice(&value);
            let bytes = u64::from_be_bytes(bytes_buf);

            if ts_millis < horizon_7d.timestamp_millis() {
                expired.push(key);
                continue;
            }
            sum_7d += bytes;
            if ts_millis >= horizon_24h.timestamp_millis() {
                sum_24h += bytes;
            }
        }
        for key in expired {
            self.activity.remove(key)?;
        }

        Ok((sum_24h, sum_7d))
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn append_history(&self, entry: DependencyHistory) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&ts_key(entry.changed_at));
        key.extend_from_slice(entry.id.as_bytes());
        self.history.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    /// Audit entries for one edge, oldest first.
    pub fn history_for(&self, dep_id: Uuid) -> Result<Vec<DependencyHistory>, StorageError> {
        let mut out = Vec::new();
        for item in self.history.iter() {
            let (_, value) = item?;
            let entry: DependencyHistory = decode(&value)?;
            if entry.dependency_id == dep_id {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, DependencyStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db = sled::open(tmp.path()).unwrap();
        let store = DependencyStore::open(&db).unwrap();
        (tmp, store)
    }

    fn dep(source: Uuid, target: Uuid, port: u16) -> Dependency {
        let now = Utc::now();
        Dependency {
            id: Uuid::new_v4(),
            source_asset_id: source,
            target_asset_id: target,
            target_port: port,
            protocol: 6,
            bytes_total: 0,
            packets_total: 0,
            flows_total: 0,
            bytes_last_24h: 0,
            bytes_last_7d: 0,
            first_seen: now,
            last_seen: now,
            avg_latency_ms: None,
            is_critical: false,
            is_confirmed: false,
            is_ignored: false,
            discovered_by: "flow_analysis".to_string(),
            valid_from: now,
            valid_to: None,
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let (_tmp, store) = open();
        let id = Uuid::new_v4();
        let err = store.insert_current(&dep(id, id, 443)).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
    }

    #[test]
    fn test_duplicate_current_rejected() {
        let (_tmp, store) = open();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert_current(&dep(a, b, 443)).unwrap();
        let err = store.insert_current(&dep(a, b, 443)).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));

        // Different port is a different edge
        store.insert_current(&dep(a, b, 8443)).unwrap();
        assert_eq!(store.count_current().unwrap(), 2);
    }

    #[test]
    fn test_invalidate_then_reinsert_preserves_history() {
        let (_tmp, store) = open();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = dep(a, b, 5432);
        store.insert_current(&first).unwrap();

        let closed_at = Utc::now();
        store
            .invalidate(
                first.id,
                closed_at,
                DependencyChangeKind::Stale,
                Some("staleness sweep".to_string()),
            )
            .unwrap();
        assert!(store.get_current(a, b, 5432, 6).unwrap().is_none());

        // Reappearance creates a fresh current row
        let second = dep(a, b, 5432);
        store.insert_current(&second).unwrap();
        let current = store.get_current(a, b, 5432, 6).unwrap().unwrap();
        assert_eq!(current.id, second.id);

        // Both versions remain queryable point-in-time
        let before_close = store.list_valid_at(closed_at - Duration::seconds(1)).unwrap();
        assert!(before_close.iter().any(|d| d.id == first.id));
        let after = store.list_valid_at(Utc::now()).unwrap();
        assert!(after.iter().any(|d| d.id == second.id));
        assert!(!after.iter().any(|d| d.id == first.id));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let (_tmp, store) = open();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let edge = dep(a, b, 80);
        store.insert_current(&edge).unwrap();

        let at = Utc::now();
        store
            .invalidate(edge.id, at, DependencyChangeKind::Stale, None)
            .unwrap();
        let again = store
            .invalidate(edge.id, at + Duration::hours(1), DependencyChangeKind::Stale, None)
            .unwrap();
        // First invalidation wins
        assert_eq!(again.valid_to, Some(at));
    }

    #[test]
    fn test_rolling_activity_sums() {
        let (_tmp, store) = open();
        let dep_id = Uuid::new_v4();
        let now = Utc::now();

        // Two recent windows and one beyond 24h
        store
            .record_activity(dep_id, now - Duration::hours(30), 1_000, now)
            .unwrap();
        store
            .record_activity(dep_id, now - Duration::hours(2), 200, now)
            .unwrap();
        let (last_24h, last_7d) = store
            .record_activity(dep_id, now - Duration::minutes(1), 50, now)
            .unwrap();

        assert_eq!(last_24h, 250);
        assert_eq!(last_7d, 1_250);
    }

    #[test]
    fn test_history_log() {
        let (_tmp, store) = open();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let edge = dep(a, b, 443);
        store.insert_current(&edge).unwrap();
        store
            .invalidate(edge.id, Utc::now(), DependencyChangeKind::Stale, None)
            .unwrap();

        let history = store.history_for(edge.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_type, DependencyChangeKind::Created);
        assert_eq!(history[1].change_type, DependencyChangeKind::Stale);
    }
}
