//! Change event, alert, alert rule, and maintenance window stores

use super::{decode, ts_key, StorageError};
use crate::types::{Alert, AlertRule, ChangeEvent, ChangeType, MaintenanceWindow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub struct ChangeStore {
    events: sled::Tree,
    events_by_id: sled::Tree,
    alerts: sled::Tree,
    alerts_by_id: sled::Tree,
    rules: sled::Tree,
    windows: sled::Tree,
}

/// Read-path filter for change events.
#[derive(Debug, Default, Clone)]
pub struct EventQuery {
    pub since: Option<DateTime<Utc>>,
    pub change_type: Option<ChangeType>,
    pub unprocessed_only: bool,
    pub limit: usize,
}

/// Read-path filter for alerts.
#[derive(Debug, Default, Clone)]
pub struct AlertQuery {
    pub unresolved_only: bool,
    pub unacknowledged_only: bool,
    pub limit: usize,
}

impl ChangeStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            events: db.open_tree("change_events")?,
            events_by_id: db.open_tree("change_events_by_id")?,
            alerts: db.open_tree("alerts")?,
            alerts_by_id: db.open_tree("alerts_by_id")?,
            rules: db.open_tree("alert_rules")?,
            windows: db.open_tree("maintenance_windows")?,
        })
    }

    fn event_key(event: &ChangeEvent) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&ts_key(event.detected_at));
        key.extend_from_slice(event.id.as_bytes());
        key
    }

    fn alert_key(alert: &Alert) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&ts_key(alert.created_at));
        key.extend_from_slice(alert.id.as_bytes());
        key
    }

    // ------------------------------------------------------------------
    // Change events
    // ------------------------------------------------------------------

    pub fn append_event(&self, event: &ChangeEvent) -> Result<(), StorageError> {
        let key = Self::event_key(event);
        self.events.insert(key.clone(), serde_json::to_vec(event)?)?;
        self.events_by_id.insert(event.id.as_bytes(), key)?;
        Ok(())
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<ChangeEvent>, StorageError> {
        let Some(key) = self.events_by_id.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.events.get(&key)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn update_event(&self, event: &ChangeEvent) -> Result<(), StorageError> {
        let key = Self::event_key(event);
        self.events.insert(key, serde_json::to_vec(event)?)?;
        Ok(())
    }

    /// Events matching the query, newest first.
    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<ChangeEvent>, StorageError> {
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let mut out = Vec::new();

        for item in self.events.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let event: ChangeEvent = decode(&value)?;
            if let Some(since) = query.since {
                if event.detected_at < since {
                    break; // keys are time-ordered
                }
            }
            if let Some(ct) = query.change_type {
                if event.change_type != ct {
                    continue;
                }
            }
            if query.unprocessed_only && event.is_processed {
                continue;
            }
            out.push(event);
        }
        Ok(out)
    }

    pub fn mark_event_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        let Some(mut event) = self.get_event(id)? else {
            return Err(StorageError::NotFound(format!("change event {id}")));
        };
        event.is_processed = true;
        event.processed_at = Some(at);
        self.update_event(&event)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub fn insert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        let key = Self::alert_key(alert);
        self.alerts.insert(key.clone(), serde_json::to_vec(alert)?)?;
        self.alerts_by_id.insert(alert.id.as_bytes(), key)?;
        Ok(())
    }

    pub fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, StorageError> {
        let Some(key) = self.alerts_by_id.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.alerts.get(&key)? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn update_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        let key = Self::alert_key(alert);
        self.alerts.insert(key, serde_json::to_vec(alert)?)?;
        Ok(())
    }

    /// Alerts matching the query, newest first.
    pub fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, StorageError> {
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let mut out = Vec::new();
        for item in self.alerts.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let alert: Alert = decode(&value)?;
            if query.unresolved_only && alert.is_resolved {
                continue;
            }
            if query.unacknowledged_only && alert.is_acknowledged {
                continue;
            }
            out.push(alert);
        }
        Ok(out)
    }

    /// Unresolved auto-clear-eligible alerts bound to a dependency.
    pub fn auto_clear_candidates(&self, dependency_id: Uuid) -> Result<Vec<Alert>, StorageError> {
        let mut out = Vec::new();
        for item in self.alerts.iter() {
            let (_, value) = item?;
            let alert: Alert = decode(&value)?;
            if alert.auto_clear_eligible
                && !alert.is_resolved
                && alert.dependency_id == Some(dependency_id)
            {
                out.push(alert);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Alert rules
    // ------------------------------------------------------------------

    pub fn upsert_rule(&self, rule: &AlertRule) -> Result<(), StorageError> {
        self.rules.insert(rule.id.as_bytes(), serde_json::to_vec(rule)?)?;
        Ok(())
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Option<AlertRule>, StorageError> {
        match self.rules.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Active rules sorted by priority ascending (lower runs first).
    pub fn list_active_rules(&self) -> Result<Vec<AlertRule>, StorageError> {
        let mut rules: Vec<AlertRule> = Vec::new();
        for item in self.rules.iter() {
            let (_, value) = item?;
            let rule: AlertRule = decode(&value)?;
            if rule.is_active {
                rules.push(rule);
            }
        }
        rules.sort_by_key(|r| r.priority);
        Ok(rules)
    }

    pub fn delete_rule(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.rules.remove(id.as_bytes())?.is_some())
    }

    // ------------------------------------------------------------------
    // Maintenance windows
    // ------------------------------------------------------------------

    pub fn upsert_window(&self, window: &MaintenanceWindow) -> Result<(), StorageError> {
        if window.end_time <= window.start_time {
            return Err(StorageError::Integrity(format!(
                "maintenance window {} has end_time <= start_time",
                window.name
            )));
        }
        self.windows
            .insert(window.id.as_bytes(), serde_json::to_vec(window)?)?;
        Ok(())
    }

    pub fn get_window(&self, id: Uuid) -> Result<Option<MaintenanceWindow>, StorageError> {
        match self.windows.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Windows in effect at the given instant.
    pub fn list_active_windows(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceWindow>, StorageError> {
        let mut out = Vec::new();
        for item in self.windows.iter() {
            let (_, value) = item?;
            let window: MaintenanceWindow = decode(&value)?;
            if window.is_active_at(at) {
                out.push(window);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertSeverity;
    use chrono::Duration;

    fn open() -> (tempfile::TempDir, ChangeStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db = sled::open(tmp.path()).unwrap();
        let store = ChangeStore::open(&db).unwrap();
        (tmp, store)
    }

    fn alert(dep: Option<Uuid>, auto_clear: bool) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Warning,
            change_event_id: Uuid::new_v4(),
            title: "t".to_string(),
            message: "m".to_string(),
            created_at: Utc::now(),
            asset_id: None,
            dependency_id: dep,
            is_acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            is_resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            notification_sent: false,
            notification_channels: None,
            auto_clear_eligible: auto_clear,
            auto_cleared: false,
        }
    }

    #[test]
    fn test_event_append_query_process() {
        let (_tmp, store) = open();
        let event = ChangeEvent::new(ChangeType::DependencyCreated, "edge appeared");
        store.append_event(&event).unwrap();

        let all = store.list_events(&EventQuery::default()).unwrap();
        assert_eq!(all.len(), 1);

        let filtered = store
            .list_events(&EventQuery {
                change_type: Some(ChangeType::AssetDiscovered),
                ..Default::default()
            })
            .unwrap();
        assert!(filtered.is_empty());

        store.mark_event_processed(event.id, Utc::now()).unwrap();
        let unprocessed = store
            .list_events(&EventQuery {
                unprocessed_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(unprocessed.is_empty());
    }

    #[test]
    fn test_alert_lifecycle_round_trip() {
        let (_tmp, store) = open();
        let mut a = alert(None, false);
        store.insert_alert(&a).unwrap();

        a.acknowledge("ops");
        store.update_alert(&a).unwrap();

        let read = store.get_alert(a.id).unwrap().unwrap();
        assert!(read.is_acknowledged);

        let unacked = store
            .list_alerts(&AlertQuery {
                unacknowledged_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(unacked.is_empty());
    }

    #[test]
    fn test_auto_clear_candidates_filter() {
        let (_tmp, store) = open();
        let dep_id = Uuid::new_v4();
        store.insert_alert(&alert(Some(dep_id), true)).unwrap();
        store.insert_alert(&alert(Some(dep_id), false)).unwrap();
        store.insert_alert(&alert(Some(Uuid::new_v4()), true)).unwrap();

        let candidates = store.auto_clear_candidates(dep_id).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_window_time_range_invariant() {
        let (_tmp, store) = open();
        let now = Utc::now();
        let bad = MaintenanceWindow {
            id: Uuid::new_v4(),
            name: "inverted".to_string(),
            description: None,
            asset_ids: None,
            environments: None,
            datacenters: None,
            start_time: now,
            end_time: now - Duration::hours(1),
            is_recurring: false,
            recurrence_rule: None,
            suppress_alerts: true,
            is_active: true,
            created_by: "admin".to_string(),
            suppressed_alerts_count: 0,
        };
        assert!(matches!(
            store.upsert_window(&bad).unwrap_err(),
            StorageError::Integrity(_)
        ));
    }

    #[test]
    fn test_rules_sorted_by_priority() {
        let (_tmp, store) = open();
        let mk = |priority: u32| AlertRule {
            id: Uuid::new_v4(),
            name: format!("rule-{priority}"),
            description: None,
            is_active: true,
            change_types: vec![ChangeType::DependencyCreated],
            asset_filter: None,
            severity: AlertSeverity::Info,
            title_template: "{change_type}".to_string(),
            description_template: "{summary}".to_string(),
            notify_channels: None,
            cooldown_minutes: 0,
            priority,
            last_triggered_at: None,
            trigger_count: 0,
            schedule: None,
            created_at: Utc::now(),
        };
        store.upsert_rule(&mk(200)).unwrap();
        store.upsert_rule(&mk(50)).unwrap();
        store.upsert_rule(&mk(100)).unwrap();

        let rules = store.list_active_rules().unwrap();
        let priorities: Vec<u32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![50, 100, 200]);
    }
}
