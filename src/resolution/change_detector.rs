//! Change detection sweep
//!
//! Runs on a fixed cadence and emits change events for: stale
//! dependencies, assets going offline/online, and 24h traffic spikes
//! or drops against the previous cycle's baseline. Also auto-resolves
//! eligible alerts whose underlying condition has cleared.

use crate::config::ResolutionSettings;
use crate::metrics::metrics;
use crate::storage::{AssetStore, ChangeStore, DependencyStore, StorageError};
use crate::types::{ChangeEvent, ChangeType, Dependency, DependencyChangeKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct ChangeDetector {
    dependencies: Arc<DependencyStore>,
    assets: Arc<AssetStore>,
    changes: Arc<ChangeStore>,
    staleness_threshold: Duration,
    offline_threshold: Duration,
    spike_ratio: f64,
    /// bytes_last_24h per edge at the previous cycle
    traffic_baseline: HashMap<Uuid, u64>,
    /// Assets currently flagged offline, to emit transitions once
    offline_assets: HashSet<Uuid>,
}

/// Counters from one detection cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    pub stale_dependencies: usize,
    pub assets_offline: usize,
    pub assets_online: usize,
    pub traffic_spikes: usize,
    pub traffic_drops: usize,
    pub alerts_auto_cleared: usize,
    pub events_created: usize,
}

impl ChangeDetector {
    pub fn new(
        dependencies: Arc<DependencyStore>,
        assets: Arc<AssetStore>,
        changes: Arc<ChangeStore>,
        settings: &ResolutionSettings,
    ) -> Self {
        Self {
            dependencies,
            assets,
            changes,
            staleness_threshold: Duration::seconds(settings.staleness_threshold_secs as i64),
            offline_threshold: Duration::seconds(settings.asset_offline_threshold_secs as i64),
            spike_ratio: settings.spike_ratio,
            traffic_baseline: HashMap::new(),
            offline_assets: HashSet::new(),
        }
    }

    /// One full detection cycle at the given reference time.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<DetectionSummary, StorageError> {
        let mut summary = DetectionSummary::default();

        self.sweep_stale(now, &mut summary)?;
        self.sweep_asset_liveness(now, &mut summary)?;
        self.sweep_traffic(&mut summary)?;
        self.auto_clear(&mut summary)?;

        if summary.events_created > 0 {
            info!(
                stale = summary.stale_dependencies,
                offline = summary.assets_offline,
                online = summary.assets_online,
                spikes = summary.traffic_spikes,
                drops = summary.traffic_drops,
                auto_cleared = summary.alerts_auto_cleared,
                "Change detection cycle complete"
            );
        }
        Ok(summary)
    }

    fn emit(&self, event: ChangeEvent, summary: &mut DetectionSummary) -> Result<(), StorageError> {
        metrics()
            .change_events
            .inc(&format!("change_type=\"{}\"", event.change_type));
        self.changes.append_event(&event)?;
        summary.events_created += 1;
        Ok(())
    }

    /// Invalidate current edges unseen past the staleness threshold.
    fn sweep_stale(
        &self,
        now: DateTime<Utc>,
        summary: &mut DetectionSummary,
    ) -> Result<(), StorageError> {
        let cutoff = now - self.staleness_threshold;
        for dep in self.dependencies.list_stale(cutoff)? {
            let closed = self.dependencies.invalidate(
                dep.id,
                now,
                DependencyChangeKind::Stale,
                Some("staleness sweep".to_string()),
            )?;
            summary.stale_dependencies += 1;

            let mut event = ChangeEvent::new(
                ChangeType::DependencyStale,
                format!(
                    "Dependency {} -> {}:{} stale (last seen {})",
                    closed.source_asset_id,
                    closed.target_asset_id,
                    closed.target_port,
                    closed.last_seen
                ),
            );
            event.dependency_id = Some(closed.id);
            event.source_asset_id = Some(closed.source_asset_id);
            event.target_asset_id = Some(closed.target_asset_id);
            event.previous_state = serde_json::to_value(&closed).ok();
            event.impact_score = if closed.is_critical { 75 } else { 30 };
            event.affected_assets_count = 1;
            self.emit(event, summary)?;

            if closed.is_critical {
                let mut critical = ChangeEvent::new(
                    ChangeType::CriticalPathChange,
                    format!(
                        "Critical dependency {} -> {}:{} went stale",
                        closed.source_asset_id, closed.target_asset_id, closed.target_port
                    ),
                );
                critical.dependency_id = Some(closed.id);
                critical.source_asset_id = Some(closed.source_asset_id);
                critical.target_asset_id = Some(closed.target_asset_id);
                critical.impact_score = 90;
                self.emit(critical, summary)?;
            }
        }
        Ok(())
    }

    /// Flag assets unseen past the offline threshold; flag recoveries.
    fn sweep_asset_liveness(
        &mut self,
        now: DateTime<Utc>,
        summary: &mut DetectionSummary,
    ) -> Result<(), StorageError> {
        let cutoff = now - self.offline_threshold;
        let mut events = Vec::new();

        for asset in self.assets.list_active()? {
            let is_quiet = asset.last_seen < cutoff;
            let was_offline = self.offline_assets.contains(&asset.id);

            if is_quiet && !was_offline {
                self.offline_assets.insert(asset.id);
                summary.assets_offline += 1;
                let mut event = ChangeEvent::new(
                    ChangeType::AssetOffline,
                    format!("Asset {} offline (last seen {})", asset.name, asset.last_seen),
                );
                event.asset_id = Some(asset.id);
                event.impact_score = if asset.is_critical { 80 } else { 40 };
                events.push(event);
            } else if !is_quiet && was_offline {
                self.offline_assets.remove(&asset.id);
                summary.assets_online += 1;
                let mut event = ChangeEvent::new(
                    ChangeType::AssetOnline,
                    format!("Asset {} back online", asset.name),
                );
                event.asset_id = Some(asset.id);
                events.push(event);
            }
        }

        for event in events {
            self.emit(event, summary)?;
        }
        Ok(())
    }

    /// Compare each edge's rolling 24h bytes against the previous
    /// cycle. `|delta| / max(prior, 1) >= spike_ratio` fires an event;
    /// the baseline updates every cycle either way so a plateau only
    /// alerts once.
    fn sweep_traffic(&mut self, summary: &mut DetectionSummary) -> Result<(), StorageError> {
        let current_edges = self.dependencies.list_current()?;
        let mut next_baseline = HashMap::with_capacity(current_edges.len());
        let mut events = Vec::new();

        for dep in &current_edges {
            let current = dep.bytes_last_24h;
            next_baseline.insert(dep.id, current);

            let Some(&prior) = self.traffic_baseline.get(&dep.id) else {
                continue; // first sighting establishes the baseline
            };
            let delta = current.abs_diff(prior) as f64;
            if delta / prior.max(1) as f64 >= self.spike_ratio {
                let spike = current > prior;
                if spike {
                    summary.traffic_spikes += 1;
                } else {
                    summary.traffic_drops += 1;
                }
                events.push(self.traffic_event(dep, prior, current, spike));
            }
        }

        self.traffic_baseline = next_baseline;
        for event in events {
            self.emit(event, summary)?;
        }
        Ok(())
    }

    fn traffic_event(
        &self,
        dep: &Dependency,
        prior: u64,
        current: u64,
        spike: bool,
    ) -> ChangeEvent {
        let change_type = if spike {
            ChangeType::DependencyTrafficSpike
        } else {
            ChangeType::DependencyTrafficDrop
        };
        let mut event = ChangeEvent::new(
            change_type,
            format!(
                "Traffic {} on {} -> {}:{} ({prior} -> {current} bytes/24h)",
                if spike { "spike" } else { "drop" },
                dep.source_asset_id,
                dep.target_asset_id,
                dep.target_port
            ),
        );
        event.dependency_id = Some(dep.id);
        event.source_asset_id = Some(dep.source_asset_id);
        event.target_asset_id = Some(dep.target_asset_id);
        event.previous_state = Some(serde_json::json!({ "bytes_last_24h": prior }));
        event.new_state = Some(serde_json::json!({ "bytes_last_24h": current }));
        event.impact_score = if dep.is_critical { 60 } else { 20 };
        event
    }

    /// Resolve auto-clear-eligible alerts whose edge has reappeared.
    fn auto_clear(&self, summary: &mut DetectionSummary) -> Result<(), StorageError> {
        let candidates = self.changes.list_alerts(&crate::storage::AlertQuery {
            unresolved_only: true,
            ..Default::default()
        })?;

        for mut alert in candidates {
            if !alert.auto_clear_eligible {
                continue;
            }
            let Some(dep_id) = alert.dependency_id else {
                continue;
            };
            let Some(old) = self.dependencies.get(dep_id)? else {
                continue;
            };
            // Condition cleared when a current row exists again for the
            // same edge key
            let reappeared = self
                .dependencies
                .get_current(
                    old.source_asset_id,
                    old.target_asset_id,
                    old.target_port,
                    old.protocol,
                )?
                .is_some();
            if reappeared {
                alert.resolve("system", Some("condition cleared".to_string()));
                alert.auto_cleared = true;
                self.changes.update_alert(&alert)?;
                summary.alerts_auto_cleared += 1;
                debug!(alert_id = %alert.id, "Alert auto-cleared");
            }
        }
        Ok(())
    }
}
