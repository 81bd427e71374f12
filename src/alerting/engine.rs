//! Alert engine: change events matched against user rules
//!
//! For each unprocessed change event, active rules are evaluated in
//! priority order. A rule fires unless it misses the change type or
//! asset filter, sits on cooldown, is outside its schedule, or a
//! maintenance window covers the involved assets. Suppressions are
//! counted on the window, never silently lost.

use super::template;
use crate::metrics::metrics;
use crate::storage::{AssetStore, ChangeStore, EventQuery, StorageError};
use crate::types::{Alert, AlertRule, Asset, ChangeEvent, ChangeType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct AlertEngine {
    changes: Arc<ChangeStore>,
    assets: Arc<AssetStore>,
}

/// Counters from one engine pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AlertOutcome {
    pub events_processed: usize,
    pub alerts_created: usize,
    pub suppressed_by_maintenance: usize,
    pub skipped_by_cooldown: usize,
}

impl AlertEngine {
    pub fn new(changes: Arc<ChangeStore>, assets: Arc<AssetStore>) -> Self {
        Self { changes, assets }
    }

    /// Evaluate all unprocessed events against the active rules.
    pub fn process_pending(&self, now: DateTime<Utc>) -> Result<AlertOutcome, StorageError> {
        let events = self.changes.list_events(&EventQuery {
            unprocessed_only: true,
            ..Default::default()
        })?;
        if events.is_empty() {
            return Ok(AlertOutcome::default());
        }

        let mut rules = self.changes.list_active_rules()?;
        let mut outcome = AlertOutcome::default();

        for event in events {
            self.evaluate_event(&event, &mut rules, now, &mut outcome)?;
            self.changes.mark_event_processed(event.id, now)?;
            outcome.events_processed += 1;
        }

        if outcome.alerts_created > 0 {
            info!(
                events = outcome.events_processed,
                alerts = outcome.alerts_created,
                suppressed = outcome.suppressed_by_maintenance,
                "Alert engine pass complete"
            );
        }
        Ok(outcome)
    }

    /// Run one event through every rule, in priority order.
    fn evaluate_event(
        &self,
        event: &ChangeEvent,
        rules: &mut [AlertRule],
        now: DateTime<Utc>,
        outcome: &mut AlertOutcome,
    ) -> Result<(), StorageError> {
        let primary_asset = self.load_asset(event.asset_id.or(event.source_asset_id))?;
        let source_asset = self.load_asset(event.source_asset_id)?;
        let target_asset = self.load_asset(event.target_asset_id)?;
        let asset_data = primary_asset.as_ref().map(asset_filter_data);

        for rule in rules.iter_mut() {
            if !rule.matches_change_type(event.change_type) {
                continue;
            }
            if let Some(ref data) = asset_data {
                if !rule.matches_asset_filter(data) {
                    continue;
                }
            } else if rule.asset_filter.is_some() {
                // Filtered rule can't match an event with no asset
                continue;
            }
            if rule.is_on_cooldown(now) {
                outcome.skipped_by_cooldown += 1;
                debug!(rule = %rule.name, "Rule on cooldown — skipped");
                continue;
            }
            if let Some(ref schedule) = rule.schedule {
                if !schedule.matches(now) {
                    continue;
                }
            }
            if self.suppressed_by_maintenance(event, primary_asset.as_ref(), now)? {
                outcome.suppressed_by_maintenance += 1;
                metrics().alerts_suppressed.inc();
                continue;
            }

            let context = template::event_context(
                event,
                primary_asset.as_ref(),
                source_asset.as_ref(),
                target_asset.as_ref(),
            );
            let alert = Alert {
                id: Uuid::new_v4(),
                severity: rule.severity,
                change_event_id: event.id,
                title: template::render(&rule.title_template, &context),
                message: template::render(&rule.description_template, &context),
                created_at: now,
                asset_id: event.asset_id.or(event.source_asset_id),
                dependency_id: event.dependency_id,
                is_acknowledged: false,
                acknowledged_at: None,
                acknowledged_by: None,
                is_resolved: false,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
                notification_sent: false,
                notification_channels: rule.notify_channels.clone(),
                auto_clear_eligible: matches!(
                    event.change_type,
                    ChangeType::DependencyStale
                        | ChangeType::DependencyRemoved
                        | ChangeType::AssetOffline
                ),
                auto_cleared: false,
            };
            self.changes.insert_alert(&alert)?;
            metrics()
                .alerts_created
                .inc(&format!("severity=\"{}\"", rule.severity.as_str()));

            rule.mark_triggered(now);
            self.changes.upsert_rule(rule)?;
            outcome.alerts_created += 1;
        }

        Ok(())
    }

    /// Whether any active maintenance window covers the event's assets.
    fn suppressed_by_maintenance(
        &self,
        event: &ChangeEvent,
        primary_asset: Option<&Asset>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let windows = self.changes.list_active_windows(now)?;
        if windows.is_empty() {
            return Ok(false);
        }

        let involved: Vec<&Asset> = primary_asset.into_iter().collect();
        for mut window in windows {
            if !window.suppress_alerts {
                continue;
            }
            let covered = if involved.is_empty() {
                // Unscoped windows suppress asset-less events too
                window.asset_ids.is_none()
                    && window.environments.is_none()
                    && window.datacenters.is_none()
            } else {
                involved.iter().any(|asset| {
                    window.affects_asset(
                        asset.id,
                        asset.environment.as_deref(),
                        asset.datacenter.as_deref(),
                    )
                })
            };
            if covered {
                window.suppressed_alerts_count += 1;
                self.changes.upsert_window(&window)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn load_asset(&self, id: Option<Uuid>) -> Result<Option<Asset>, StorageError> {
        match id {
            Some(id) => self.assets.get(id),
            None => Ok(None),
        }
    }
}

/// Asset attributes exposed to rule filters, key-wise.
fn asset_filter_data(asset: &Asset) -> HashMap<String, serde_json::Value> {
    let mut data = HashMap::from([
        ("name".to_string(), serde_json::json!(asset.name)),
        (
            "asset_type".to_string(),
            serde_json::json!(asset.asset_type.as_str()),
        ),
        (
            "is_critical".to_string(),
            serde_json::json!(asset.is_critical),
        ),
    ]);
    if let Some(ref env) = asset.environment {
        data.insert("environment".to_string(), serde_json::json!(env));
    }
    if let Some(ref dc) = asset.datacenter {
        data.insert("datacenter".to_string(), serde_json::json!(dc));
    }
    if let Some(ref team) = asset.team {
        data.insert("team".to_string(), serde_json::json!(team));
    }
    if let Some(internal) = asset.is_internal {
        data.insert("is_internal".to_string(), serde_json::json!(internal));
    }
    data
}
