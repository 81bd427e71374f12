//! Classification engine
//!
//! Extracts features, scores them through the heuristics and (when a
//! model is active and the data is rich enough) the ML classifier, and
//! auto-applies the winning type to unlocked assets above the
//! confidence threshold. Every applied change lands in the
//! classification history; locked assets are never touched.

use super::features::FeatureExtractor;
use super::heuristics;
use super::ml::MlClassifier;
use crate::config::ClassificationSettings;
use crate::storage::{AssetStore, ClassificationStore, StorageError};
use crate::types::{
    AssetFeatures, AssetType, ClassificationHistory, ClassificationMethod,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Feature window used for classification decisions.
const CLASSIFICATION_WINDOW_HOURS: i64 = 24;

/// A scored type recommendation.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub asset_type: AssetType,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Full score map, values in [0, 100]
    pub scores: HashMap<String, f64>,
    pub method: ClassificationMethod,
    pub features: AssetFeatures,
}

/// Outcome of classifying one asset.
#[derive(Debug, Clone)]
pub enum ClassificationOutcome {
    /// Type applied to the asset
    Applied(Recommendation),
    /// Recommendation produced but not applied, with the reason
    RecommendationOnly(Recommendation, SkipReason),
    /// Not enough observation data; nothing mutated
    InsufficientData { total_flows: u64, active_hours: u32 },
    /// No signal matched at all
    NoSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Asset has `classification_locked = true`
    Locked,
    /// Confidence below the auto-update threshold
    BelowThreshold,
    /// Recommended type matches the current type
    Unchanged,
}

pub struct ClassificationEngine {
    assets: Arc<AssetStore>,
    store: Arc<ClassificationStore>,
    extractor: FeatureExtractor,
    pub ml: Arc<MlClassifier>,
    settings: ClassificationSettings,
}

impl ClassificationEngine {
    pub fn new(
        assets: Arc<AssetStore>,
        store: Arc<ClassificationStore>,
        extractor: FeatureExtractor,
        ml: Arc<MlClassifier>,
        settings: ClassificationSettings,
    ) -> Self {
        Self {
            assets,
            store,
            extractor,
            ml,
            settings,
        }
    }

    /// Classify one asset and auto-apply when permitted.
    pub fn classify(
        &self,
        asset_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClassificationOutcome, StorageError> {
        let Some(mut asset) = self.assets.get(asset_id)? else {
            return Err(StorageError::NotFound(format!("asset {asset_id}")));
        };
        if asset.is_deleted() {
            return Ok(ClassificationOutcome::NoSignal);
        }

        let features = self.extractor.extract(
            &asset,
            Duration::hours(CLASSIFICATION_WINDOW_HOURS),
            now,
        )?;
        self.store.put_features(&features)?;

        if features.total_flows < self.settings.min_flows
            || features.active_hours < self.settings.min_observation_hours
        {
            return Ok(ClassificationOutcome::InsufficientData {
                total_flows: features.total_flows,
                active_hours: features.active_hours,
            });
        }

        let Some(recommendation) = self.recommend(&features) else {
            return Ok(ClassificationOutcome::NoSignal);
        };

        // Manual overrides always win
        if asset.classification_locked {
            return Ok(ClassificationOutcome::RecommendationOnly(
                recommendation,
                SkipReason::Locked,
            ));
        }
        if recommendation.confidence < self.settings.auto_update_threshold {
            return Ok(ClassificationOutcome::RecommendationOnly(
                recommendation,
                SkipReason::BelowThreshold,
            ));
        }

        let previous_type = asset.asset_type;
        asset.classification_confidence = Some(recommendation.confidence);
        asset.classification_scores = Some(recommendation.scores.clone());
        asset.last_classified_at = Some(now);
        asset.classification_method = Some(recommendation.method.as_str().to_string());
        asset.asset_type = recommendation.asset_type;
        self.assets.update(&asset)?;

        if previous_type == recommendation.asset_type {
            return Ok(ClassificationOutcome::RecommendationOnly(
                recommendation,
                SkipReason::Unchanged,
            ));
        }

        self.store.append_history(&ClassificationHistory {
            id: Uuid::new_v4(),
            asset_id,
            previous_type,
            new_type: recommendation.asset_type,
            confidence: recommendation.confidence,
            method: recommendation.method,
            scores: Some(recommendation.scores.clone()),
            changed_at: now,
            changed_by: None,
        })?;

        info!(
            asset_id = %asset_id,
            from = %previous_type,
            to = %recommendation.asset_type,
            confidence = recommendation.confidence,
            method = recommendation.method.as_str(),
            "Asset type auto-applied"
        );
        Ok(ClassificationOutcome::Applied(recommendation))
    }

    /// Hybrid scoring: prefer the ML model when it is active, fed
    /// enough flows, and confident; otherwise fall back to heuristics.
    fn recommend(&self, features: &AssetFeatures) -> Option<Recommendation> {
        let heuristic_scores = heuristics::score_all(features);
        let score_map: HashMap<String, f64> = heuristic_scores
            .iter()
            .map(|(t, s)| (t.as_str().to_string(), s * 100.0))
            .collect();

        if self.ml.is_ready() && features.total_flows >= self.settings.ml_min_flows {
            if let Some(prediction) = self.ml.predict(features) {
                if prediction.probability >= self.settings.ml_confidence_threshold {
                    if let Ok(asset_type) = serde_json::from_value::<AssetType>(
                        serde_json::Value::String(prediction.class.clone()),
                    ) {
                        let ml_scores: HashMap<String, f64> = prediction
                            .distribution
                            .iter()
                            .map(|(class, p)| (class.clone(), p * 100.0))
                            .collect();
                        return Some(Recommendation {
                            asset_type,
                            confidence: prediction.probability,
                            scores: ml_scores,
                            method: ClassificationMethod::Ml,
                            features: features.clone(),
                        });
                    }
                }
                debug!(
                    class = %prediction.class,
                    probability = prediction.probability,
                    "ML prediction below threshold — falling back to heuristics"
                );
            }
        }

        let (asset_type, confidence) = heuristics::best_match(&heuristic_scores)?;
        Some(Recommendation {
            asset_type,
            confidence,
            scores: score_map,
            method: ClassificationMethod::Heuristic,
            features: features.clone(),
        })
    }

    /// Classify every live asset. Returns (applied, examined).
    pub fn run_sweep(&self, now: DateTime<Utc>) -> Result<(usize, usize), StorageError> {
        let assets = self.assets.list_active()?;
        let examined = assets.len();
        let mut applied = 0;
        for asset in assets {
            match self.classify(asset.id, now) {
                Ok(ClassificationOutcome::Applied(_)) => applied += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(asset_id = %asset.id, error = %e, "Classification failed");
                }
            }
        }
        Ok((applied, examined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Stores;
    use crate::types::{protocols, Asset, FlowAggregate};
    use chrono::TimeZone;

    fn setup(settings: ClassificationSettings) -> (tempfile::TempDir, Stores, ClassificationEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let engine = ClassificationEngine::new(
            stores.assets.clone(),
            stores.classification.clone(),
            FeatureExtractor::new(stores.aggregates.clone()),
            Arc::new(MlClassifier::new()),
            settings,
        );
        (tmp, stores, engine)
    }

    fn db_settings() -> ClassificationSettings {
        ClassificationSettings {
            auto_update_threshold: 0.70,
            min_flows: 100,
            min_observation_hours: 3,
            ..Default::default()
        }
    }

    /// Seed aggregates that make 10.0.0.2 look like a busy PostgreSQL
    /// server: heavy fan-in on 5432 across many hours.
    fn seed_db_traffic(stores: &Stores, now: DateTime<Utc>) -> Asset {
        let asset = Asset::from_observation("10.0.0.2".parse().unwrap(), now);
        stores.assets.create(&asset).unwrap();

        let mut rows = Vec::new();
        for hour in 0..6 {
            for client in 0..30 {
                let window_start = now - Duration::hours(hour) - Duration::minutes(5);
                rows.push(FlowAggregate {
                    id: Uuid::new_v4(),
                    window_start,
                    window_end: window_start + Duration::seconds(60),
                    src_ip: format!("10.0.1.{}", client + 1).parse().unwrap(),
                    dst_ip: "10.0.0.2".parse().unwrap(),
                    src_port: 40_000 + client,
                    dst_port: 5432,
                    protocol: protocols::TCP,
                    bytes_total: 100_000,
                    packets_total: 100,
                    flows_count: 5,
                    primary_gateway_ip: None,
                    exporter_ip: None,
                    src_asset_id: None,
                    dst_asset_id: None,
                    is_processed: true,
                });
            }
        }
        stores.aggregates.upsert_window(&rows).unwrap();
        asset
    }

    #[test]
    fn test_auto_apply_database() {
        let (_tmp, stores, engine) = setup(db_settings());
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 30).unwrap();
        let asset = seed_db_traffic(&stores, now);

        let outcome = engine.classify(asset.id, now).unwrap();
        let ClassificationOutcome::Applied(rec) = outcome else {
            panic!("expected Applied, got {outcome:?}");
        };
        assert_eq!(rec.asset_type, AssetType::Database);
        assert!(rec.confidence >= 0.70);

        let updated = stores.assets.get(asset.id).unwrap().unwrap();
        assert_eq!(updated.asset_type, AssetType::Database);
        assert_eq!(
            updated.classification_method.as_deref(),
            Some("heuristic")
        );
        assert!(updated.classification_scores.is_some());

        let history = stores.classification.history_for(asset.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_type, AssetType::Unknown);
        assert_eq!(history[0].new_type, AssetType::Database);
    }

    #[test]
    fn test_locked_asset_never_updated() {
        let (_tmp, stores, engine) = setup(db_settings());
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 30).unwrap();
        let mut asset = seed_db_traffic(&stores, now);
        asset.classification_locked = true;
        stores.assets.update(&asset).unwrap();

        let outcome = engine.classify(asset.id, now).unwrap();
        assert!(matches!(
            outcome,
            ClassificationOutcome::RecommendationOnly(_, SkipReason::Locked)
        ));

        let unchanged = stores.assets.get(asset.id).unwrap().unwrap();
        assert_eq!(unchanged.asset_type, AssetType::Unknown);
        assert!(stores.classification.history_for(asset.id).unwrap().is_empty());
    }

    #[test]
    fn test_insufficient_data_no_mutation() {
        let (_tmp, stores, engine) = setup(ClassificationSettings {
            min_flows: 1_000_000,
            ..db_settings()
        });
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 30).unwrap();
        let asset = seed_db_traffic(&stores, now);

        let outcome = engine.classify(asset.id, now).unwrap();
        assert!(matches!(
            outcome,
            ClassificationOutcome::InsufficientData { .. }
        ));
        let unchanged = stores.assets.get(asset.id).unwrap().unwrap();
        assert_eq!(unchanged.asset_type, AssetType::Unknown);
        assert!(unchanged.last_classified_at.is_none());
    }

    #[test]
    fn test_reclassification_same_type_no_duplicate_history() {
        let (_tmp, stores, engine) = setup(db_settings());
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 30).unwrap();
        let asset = seed_db_traffic(&stores, now);

        engine.classify(asset.id, now).unwrap();
        let second = engine.classify(asset.id, now).unwrap();
        assert!(matches!(
            second,
            ClassificationOutcome::RecommendationOnly(_, SkipReason::Unchanged)
        ));
        assert_eq!(stores.classification.history_for(asset.id).unwrap().len(), 1);
    }

    #[test]
    fn test_quiet_asset_yields_insufficient_data() {
        let (_tmp, stores, engine) = setup(db_settings());
        let now = Utc::now();
        let asset = Asset::from_observation("10.9.9.9".parse().unwrap(), now);
        stores.assets.create(&asset).unwrap();

        let outcome = engine.classify(asset.id, now).unwrap();
        assert!(matches!(
            outcome,
            ClassificationOutcome::InsufficientData { total_flows: 0, .. }
        ));
    }

    #[test]
    fn test_ml_used_when_confident() {
        let (_tmp, stores, engine) = setup(ClassificationSettings {
            ml_min_flows: 100,
            ml_confidence_threshold: 0.8,
            ..db_settings()
        });
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 30).unwrap();
        let asset = seed_db_traffic(&stores, now);

        // A model that fires hard on the db-ports dimension
        let mut db_row = vec![0.0; super::super::ml::FEATURE_NAMES.len()];
        db_row[16] = 10.0;
        let ws_row = vec![0.0; super::super::ml::FEATURE_NAMES.len()];
        engine
            .ml
            .activate(super::super::ml::ModelWeights {
                version: "t".to_string(),
                algorithm: "softmax".to_string(),
                classes: vec!["database".to_string(), "workstation".to_string()],
                feature_names: super::super::ml::FEATURE_NAMES
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect(),
                weights: vec![db_row, ws_row],
                bias: vec![0.0, 0.0],
            })
            .unwrap();

        let outcome = engine.classify(asset.id, now).unwrap();
        let ClassificationOutcome::Applied(rec) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(rec.method, ClassificationMethod::Ml);
        assert_eq!(rec.asset_type, AssetType::Database);
    }
}
