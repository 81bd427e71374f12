//! IP → Asset resolution
//!
//! Resolves an IP to an asset id, creating the asset on first sight and
//! enriching it from the longest-prefix matching classification rule.
//! Soft-deleted assets are never resurrected; the next observation of
//! their IP creates a fresh asset.
//!
//! Recent resolutions are cached in a bounded LRU so the hot path skips
//! the store entirely.

use crate::config::defaults::ASSET_CACHE_SIZE;
use crate::metrics::metrics;
use crate::storage::{AssetStore, ClassificationStore, StorageError};
use crate::types::{Asset, AssetType, ChangeEvent, ChangeType, ClassificationRule};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub struct AssetMapper {
    assets: Arc<AssetStore>,
    classification: Arc<ClassificationStore>,
    cache: DashMap<IpAddr, CacheSlot>,
    cache_capacity: usize,
}

#[derive(Clone, Copy)]
struct CacheSlot {
    asset_id: Uuid,
    last_used: Instant,
}

/// Outcome of a resolution, so callers can emit discovery events.
pub struct Resolution {
    pub asset_id: Uuid,
    pub created: bool,
}

impl AssetMapper {
    pub fn new(assets: Arc<AssetStore>, classification: Arc<ClassificationStore>) -> Self {
        Self {
            assets,
            classification,
            cache: DashMap::new(),
            cache_capacity: ASSET_CACHE_SIZE,
        }
    }

    #[cfg(test)]
    fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Resolve an IP to its live asset, creating one if needed.
    pub fn resolve(&self, ip: IpAddr, seen_at: DateTime<Utc>) -> Result<Resolution, StorageError> {
        // Fast path: cached id, just touch last_seen lazily
        if let Some(mut slot) = self.cache.get_mut(&ip) {
            slot.last_used = Instant::now();
            let asset_id = slot.asset_id;
            drop(slot);
            self.touch_last_seen(asset_id, seen_at)?;
            return Ok(Resolution {
                asset_id,
                created: false,
            });
        }

        if let Some(mut asset) = self.assets.get_by_ip(ip)? {
            if seen_at > asset.last_seen {
                asset.last_seen = seen_at;
                self.assets.update(&asset)?;
            }
            self.cache_insert(ip, asset.id);
            return Ok(Resolution {
                asset_id: asset.id,
                created: false,
            });
        }

        // First observation: create and enrich from rules
        let mut asset = Asset::from_observation(ip, seen_at);
        if let Some(rule) = self.best_rule(ip)? {
            apply_rule(&mut asset, &rule);
        }
        self.assets.create(&asset)?;
        self.cache_insert(ip, asset.id);

        metrics()
            .assets_discovered
            .inc(&format!("asset_type=\"{}\"", asset.asset_type));
        tracing::debug!(ip = %ip, asset_id = %asset.id, asset_type = %asset.asset_type, "Asset discovered");

        Ok(Resolution {
            asset_id: asset.id,
            created: true,
        })
    }

    /// Build the discovery change event for a freshly created asset.
    pub fn discovery_event(&self, asset_id: Uuid) -> Result<ChangeEvent, StorageError> {
        let asset = self
            .assets
            .get(asset_id)?
            .ok_or_else(|| StorageError::NotFound(format!("asset {asset_id}")))?;
        let mut event = ChangeEvent::new(
            ChangeType::AssetDiscovered,
            format!("New asset discovered: {}", asset.name),
        );
        event.asset_id = Some(asset.id);
        event.new_state = serde_json::to_value(&asset).ok();
        Ok(event)
    }

    /// Longest-prefix matching active rule; priority breaks ties.
    pub fn best_rule(&self, ip: IpAddr) -> Result<Option<ClassificationRule>, StorageError> {
        let mut best: Option<ClassificationRule> = None;
        for rule in self.classification.list_active_rules()? {
            if !rule.cidr.contains(ip) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    let (cur_len, cur_prio) = (current.cidr.prefix_len(), current.priority);
                    let (new_len, new_prio) = (rule.cidr.prefix_len(), rule.priority);
                    new_len > cur_len || (new_len == cur_len && new_prio < cur_prio)
                }
            };
            if better {
                best = Some(rule);
            }
        }
        Ok(best)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn touch_last_seen(&self, asset_id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(mut asset) = self.assets.get(asset_id)? {
            if seen_at > asset.last_seen {
                asset.last_seen = seen_at;
                self.assets.update(&asset)?;
            }
        }
        Ok(())
    }

    fn cache_insert(&self, ip: IpAddr, asset_id: Uuid) {
        if self.cache.len() >= self.cache_capacity {
            self.evict_oldest();
        }
        self.cache.insert(
            ip,
            CacheSlot {
                asset_id,
                last_used: Instant::now(),
            },
        );
    }

    /// Drop the least-recently-used tenth of the cache.
    fn evict_oldest(&self) {
        let evict_count = (self.cache_capacity / 10).max(1);
        let mut by_age: Vec<(IpAddr, Instant)> = self
            .cache
            .iter()
            .map(|e| (*e.key(), e.value().last_used))
            .collect();
        by_age.sort_by_key(|(_, used)| *used);
        for (ip, _) in by_age.into_iter().take(evict_count) {
            self.cache.remove(&ip);
        }
    }
}

/// Inherit rule attributes where the asset has no explicit value.
fn apply_rule(asset: &mut Asset, rule: &ClassificationRule) {
    if asset.environment.is_none() {
        asset.environment = rule.environment.clone();
    }
    if asset.datacenter.is_none() {
        asset.datacenter = rule.datacenter.clone();
    }
    if asset.location.is_none() {
        asset.location = rule.location.clone();
    }
    if asset.owner.is_none() {
        asset.owner = rule.default_owner.clone();
    }
    if asset.team.is_none() {
        asset.team = rule.default_team.clone();
    }
    // Tri-state: only a rule that explicitly says internal/external
    // fills an unspecified asset
    if asset.is_internal.is_none() {
        asset.is_internal = rule.is_internal;
    }
    if asset.asset_type == AssetType::Unknown {
        if let Some(hint) = rule.asset_type {
            asset.asset_type = hint;
            asset.classification_method = Some("rule".to_string());
        }
    }
}
