//! Change events, alerts, alert rules, and maintenance windows

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Types of changes detected in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    // Dependency changes
    DependencyCreated,
    DependencyRemoved,
    DependencyStale,
    DependencyTrafficSpike,
    DependencyTrafficDrop,
    // Asset changes
    AssetDiscovered,
    AssetRemoved,
    AssetOffline,
    AssetOnline,
    // Service changes
    ServiceDiscovered,
    ServiceRemoved,
    // Topology changes
    NewExternalConnection,
    CriticalPathChange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependencyCreated => "dependency_created",
            Self::DependencyRemoved => "dependency_removed",
            Self::DependencyStale => "dependency_stale",
            Self::DependencyTrafficSpike => "dependency_traffic_spike",
            Self::DependencyTrafficDrop => "dependency_traffic_drop",
            Self::AssetDiscovered => "asset_discovered",
            Self::AssetRemoved => "asset_removed",
            Self::AssetOffline => "asset_offline",
            Self::AssetOnline => "asset_online",
            Self::ServiceDiscovered => "service_discovered",
            Self::ServiceRemoved => "service_removed",
            Self::NewExternalConnection => "new_external_connection",
            Self::CriticalPathChange => "critical_path_change",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a detected change in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub change_type: ChangeType,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,

    // Related entities
    #[serde(default)]
    pub asset_id: Option<Uuid>,
    #[serde(default)]
    pub dependency_id: Option<Uuid>,
    #[serde(default)]
    pub source_asset_id: Option<Uuid>,
    #[serde(default)]
    pub target_asset_id: Option<Uuid>,

    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub previous_state: Option<serde_json::Value>,
    #[serde(default)]
    pub new_state: Option<serde_json::Value>,

    /// 0-100, weighted by criticality and dependent count
    pub impact_score: u8,
    pub affected_assets_count: u32,

    pub is_processed: bool,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_type,
            detected_at: Utc::now(),
            occurred_at: None,
            asset_id: None,
            dependency_id: None,
            source_asset_id: None,
            target_asset_id: None,
            summary: summary.into(),
            description: None,
            previous_state: None,
            new_state: None,
            impact_score: 0,
            affected_assets_count: 0,
            is_processed: false,
            processed_at: None,
        }
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// User-facing notification bound to a change event.
///
/// Lifecycle: unacknowledged → acknowledged → resolved. Resolving
/// implies acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub change_event_id: Uuid,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,

    // Denormalized refs for query efficiency
    #[serde(default)]
    pub asset_id: Option<Uuid>,
    #[serde(default)]
    pub dependency_id: Option<Uuid>,

    pub is_acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,

    pub is_resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolution_notes: Option<String>,

    // Notification bookkeeping
    pub notification_sent: bool,
    #[serde(default)]
    pub notification_channels: Option<Vec<String>>,

    /// Whether the alert can be auto-resolved when its underlying
    /// condition clears (e.g. a stale dependency reappears)
    #[serde(default)]
    pub auto_clear_eligible: bool,
    #[serde(default)]
    pub auto_cleared: bool,
}

impl Alert {
    pub fn acknowledge(&mut self, by: &str) {
        self.is_acknowledged = true;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(by.to_string());
    }

    pub fn resolve(&mut self, by: &str, notes: Option<String>) {
        self.is_resolved = true;
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(by.to_string());
        self.resolution_notes = notes;
        if !self.is_acknowledged {
            self.acknowledge(by);
        }
    }
}

/// Optional time-of-day schedule gating an alert rule.
///
/// Days use lowercase three-letter names ("mon".."sun"); the hour range
/// is half-open `[start, end)` in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSchedule {
    #[serde(default)]
    pub days: Option<Vec<String>>,
    #[serde(default)]
    pub hours: Option<HourRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl RuleSchedule {
    /// Whether the schedule admits the given instant.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if let Some(ref days) = self.days {
            let day = match at.weekday() {
                chrono::Weekday::Mon => "mon",
                chrono::Weekday::Tue => "tue",
                chrono::Weekday::Wed => "wed",
                chrono::Weekday::Thu => "thu",
                chrono::Weekday::Fri => "fri",
                chrono::Weekday::Sat => "sat",
                chrono::Weekday::Sun => "sun",
            };
            if !days.iter().any(|d| d == day) {
                return false;
            }
        }
        if let Some(hours) = self.hours {
            let h = at.hour() as u8;
            if h < hours.start || h >= hours.end {
                return false;
            }
        }
        true
    }
}

/// Declarative subscription matching change events to alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,

    /// Which change types trigger this rule
    pub change_types: Vec<ChangeType>,
    /// Key-wise equality match on asset attributes,
    /// e.g. {"environment": "production", "is_critical": true}
    #[serde(default)]
    pub asset_filter: Option<HashMap<String, serde_json::Value>>,

    pub severity: AlertSeverity,
    /// Supports `{name}` placeholders rendered from the event context
    pub title_template: String,
    pub description_template: String,

    #[serde(default)]
    pub notify_channels: Option<Vec<String>>,

    /// Don't re-alert within this period
    pub cooldown_minutes: u32,
    /// Lower = evaluated first
    pub priority: u32,

    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,

    #[serde(default)]
    pub schedule: Option<RuleSchedule>,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn matches_change_type(&self, change_type: ChangeType) -> bool {
        self.change_types.contains(&change_type)
    }

    /// Key-wise equality match. No filter means match everything.
    pub fn matches_asset_filter(&self, asset_data: &HashMap<String, serde_json::Value>) -> bool {
        let Some(ref filter) = self.asset_filter else {
            return true;
        };
        filter
            .iter()
            .all(|(key, expected)| asset_data.get(key) == Some(expected))
    }

    pub fn is_on_cooldown(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_triggered_at else {
            return false;
        };
        if self.cooldown_minutes == 0 {
            return false;
        }
        (now - last).num_seconds() < i64::from(self.cooldown_minutes) * 60
    }

    /// Record a trigger: bumps the counter and starts the cooldown.
    pub fn mark_triggered(&mut self, at: DateTime<Utc>) {
        self.last_triggered_at = Some(at);
        self.trigger_count += 1;
    }
}

/// Scoped alert suppression for planned maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    // Scope: all-None means every asset
    #[serde(default)]
    pub asset_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub environments: Option<Vec<String>>,
    #[serde(default)]
    pub datacenters: Option<Vec<String>>,

    /// Invariant: end_time > start_time
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    pub is_recurring: bool,
    /// iCal RRULE, e.g. "FREQ=WEEKLY;BYDAY=SU;BYHOUR=2"
    #[serde(default)]
    pub recurrence_rule: Option<String>,

    pub suppress_alerts: bool,
    pub is_active: bool,
    pub created_by: String,
    /// Alerts suppressed by this window are counted here, not lost
    #[serde(default)]
    pub suppressed_alerts_count: u64,
}

impl MaintenanceWindow {
    /// Whether the window is in effect at the given instant.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.is_active && self.start_time <= at && at <= self.end_time
    }

    /// Whether the given asset falls inside this window's scope.
    pub fn affects_asset(
        &self,
        asset_id: Uuid,
        environment: Option<&str>,
        datacenter: Option<&str>,
    ) -> bool {
        let unscoped = self.asset_ids.is_none()
            && self.environments.is_none()
            && self.datacenters.is_none();
        if unscoped {
            return true;
        }
        if let Some(ref ids) = self.asset_ids {
            if ids.contains(&asset_id) {
                return true;
            }
        }
        if let (Some(envs), Some(env)) = (self.environments.as_ref(), environment) {
            if envs.iter().any(|e| e == env) {
                return true;
            }
        }
        if let (Some(dcs), Some(dc)) = (self.datacenters.as_ref(), datacenter) {
            if dcs.iter().any(|d| d == dc) {
                return true;
            }
        }
        false
    }
}
