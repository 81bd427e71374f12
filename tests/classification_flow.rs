//! Classification integration tests
//!
//! Covers CIDR rule resolution through the asset mapper and the
//! classify-then-auto-apply path through the engine, using only the
//! crate's public surface.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use flowlens::classification::{
    ClassificationEngine, ClassificationOutcome, FeatureExtractor, MlClassifier,
};
use flowlens::config::ClassificationSettings;
use flowlens::resolution::AssetMapper;
use flowlens::storage::Stores;
use flowlens::types::{protocols, Asset, AssetType, ClassificationRule, FlowAggregate};

fn rule(name: &str, cidr: &str, priority: i32, environment: &str) -> ClassificationRule {
    ClassificationRule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        cidr: cidr.parse().unwrap(),
        priority,
        is_active: true,
        environment: Some(environment.to_string()),
        datacenter: None,
        location: None,
        asset_type: None,
        is_internal: Some(true),
        default_owner: None,
        default_team: None,
        created_at: Utc::now(),
    }
}

#[test]
fn test_longest_prefix_beats_priority() {
    let tmp = tempfile::tempdir().unwrap();
    let stores = Stores::open(tmp.path()).unwrap();
    let mapper = AssetMapper::new(stores.assets.clone(), stores.classification.clone());

    // /8 with the better priority, /16 with the worse one
    stores
        .classification
        .upsert_rule(&rule("corp", "10.0.0.0/8", 100, "prod"))
        .unwrap();
    stores
        .classification
        .upsert_rule(&rule("staging-lab", "10.1.0.0/16", 500, "staging"))
        .unwrap();

    mapper.resolve("10.1.2.3".parse().unwrap(), Utc::now()).unwrap();

    let asset = stores
        .assets
        .get_by_ip("10.1.2.3".parse().unwrap())
        .unwrap()
        .unwrap();
    // Longer prefix wins despite the higher priority number
    assert_eq!(asset.environment.as_deref(), Some("staging"));
    assert_eq!(asset.is_internal, Some(true));

    // An address only the /8 covers falls back to it
    mapper.resolve("10.9.0.1".parse().unwrap(), Utc::now()).unwrap();
    let other = stores
        .assets
        .get_by_ip("10.9.0.1".parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(other.environment.as_deref(), Some("prod"));
}

#[test]
fn test_inactive_rule_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let stores = Stores::open(tmp.path()).unwrap();
    let mapper = AssetMapper::new(stores.assets.clone(), stores.classification.clone());

    let mut inactive = rule("off", "10.0.0.0/8", 1, "nowhere");
    inactive.is_active = false;
    stores.classification.upsert_rule(&inactive).unwrap();

    mapper.resolve("10.1.2.3".parse().unwrap(), Utc::now()).unwrap();
    let asset = stores
        .assets
        .get_by_ip("10.1.2.3".parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(asset.environment, None);
    assert_eq!(asset.is_internal, None);
}

/// Database-shaped traffic: many clients, port 5432, around the clock.
fn seed_database_traffic(stores: &Stores, target_ip: &str, now: chrono::DateTime<Utc>) {
    let mut rows = Vec::new();
    for hour in 0..8 {
        for client in 0..25u16 {
            let window_start = now - Duration::hours(hour) - Duration::minutes(3);
            rows.push(FlowAggregate {
                id: Uuid::new_v4(),
                window_start,
                window_end: window_start + Duration::seconds(60),
                src_ip: format!("10.0.1.{}", client + 1).parse().unwrap(),
                dst_ip: target_ip.parse().unwrap(),
                src_port: 40_000 + client,
                dst_port: 5432,
                protocol: protocols::TCP,
                bytes_total: 80_000,
                packets_total: 90,
                flows_count: 4,
                primary_gateway_ip: None,
                exporter_ip: None,
                src_asset_id: None,
                dst_asset_id: None,
                is_processed: true,
            });
        }
    }
    stores.aggregates.upsert_window(&rows).unwrap();
}

fn engine(stores: &Stores, settings: ClassificationSettings) -> ClassificationEngine {
    ClassificationEngine::new(
        stores.assets.clone(),
        stores.classification.clone(),
        FeatureExtractor::new(stores.aggregates.clone()),
        Arc::new(MlClassifier::new()),
        settings,
    )
}

#[test]
fn test_auto_apply_database_with_history() {
    let tmp = tempfile::tempdir().unwrap();
    let stores = Stores::open(tmp.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap();

    let asset = Asset::from_observation("10.0.0.2".parse().unwrap(), now);
    stores.assets.create(&asset).unwrap();
    seed_database_traffic(&stores, "10.0.0.2", now);

    let engine = engine(
        &stores,
        ClassificationSettings {
            auto_update_threshold: 0.70,
            min_flows: 100,
            min_observation_hours: 4,
            ..Default::default()
        },
    );

    let outcome = engine.classify(asset.id, now).unwrap();
    let ClassificationOutcome::Applied(rec) = outcome else {
        panic!("expected auto-apply, got {outcome:?}");
    };
    assert_eq!(rec.asset_type, AssetType::Database);
    assert!(rec.confidence >= 0.85);
    assert!(rec.scores["database"] > rec.scores["workstation"]);

    let updated = stores.assets.get(asset.id).unwrap().unwrap();
    assert_eq!(updated.asset_type, AssetType::Database);
    assert!(updated.classification_confidence.unwrap() >= 0.70);
    assert!(updated.last_classified_at.is_some());

    let history = stores.classification.history_for(asset.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].new_type, AssetType::Database);
}

#[test]
fn test_locked_asset_keeps_manual_type() {
    let tmp = tempfile::tempdir().unwrap();
    let stores = Stores::open(tmp.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap();

    let mut asset = Asset::from_observation("10.0.0.2".parse().unwrap(), now);
    asset.asset_type = AssetType::Storage; // operator says so
    asset.classification_locked = true;
    stores.assets.create(&asset).unwrap();
    seed_database_traffic(&stores, "10.0.0.2", now);

    let engine = engine(
        &stores,
        ClassificationSettings {
            min_observation_hours: 4,
            ..Default::default()
        },
    );

    engine.classify(asset.id, now).unwrap();
    let unchanged = stores.assets.get(asset.id).unwrap().unwrap();
    assert_eq!(unchanged.asset_type, AssetType::Storage);
    assert!(stores.classification.history_for(asset.id).unwrap().is_empty());
}
