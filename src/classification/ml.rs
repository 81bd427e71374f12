//! ML classifier
//!
//! A linear softmax model over the vectorized feature row. Models are
//! trained offline, shipped as JSON weight files, registered in the
//! model registry, and hot-swapped atomically; prediction never takes
//! a lock. Exactly one model is active at a time.

use crate::types::AssetFeatures;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MlError {
    #[error("model file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model shape mismatch: {0}")]
    Shape(String),
}

/// Fixed vectorization order. Training and inference must agree on
/// this list, so it ships inside the model file and is verified at
/// load time.
pub const FEATURE_NAMES: &[&str] = &[
    "flows_in",
    "flows_out",
    "bytes_in",
    "bytes_out",
    "fan_in",
    "fan_out",
    "unique_src_ports",
    "unique_dst_ports",
    "well_known_port_ratio",
    "ephemeral_port_ratio",
    "listener_count",
    "avg_packet_size",
    "connection_churn",
    "active_hours",
    "business_hours_ratio",
    "traffic_variance",
    "has_db_ports",
    "has_storage_ports",
    "has_web_ports",
    "has_ssh_ports",
];

/// Serialized model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    pub version: String,
    pub algorithm: String,
    pub classes: Vec<String>,
    pub feature_names: Vec<String>,
    /// One weight row per class, one column per feature
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl ModelWeights {
    fn validate(&self) -> Result<(), MlError> {
        if self
            .feature_names
            .iter()
            .map(String::as_str)
            .ne(FEATURE_NAMES.iter().copied())
        {
            return Err(MlError::Shape(format!(
                "feature names differ from the expected vectorization (got {} names)",
                self.feature_names.len()
            )));
        }
        if self.weights.len() != self.classes.len() || self.bias.len() != self.classes.len() {
            return Err(MlError::Shape(format!(
                "{} classes but {} weight rows / {} biases",
                self.classes.len(),
                self.weights.len(),
                self.bias.len()
            )));
        }
        for (i, row) in self.weights.iter().enumerate() {
            if row.len() != FEATURE_NAMES.len() {
                return Err(MlError::Shape(format!(
                    "class {} has {} weights, expected {}",
                    self.classes[i],
                    row.len(),
                    FEATURE_NAMES.len()
                )));
            }
        }
        Ok(())
    }
}

/// Flatten features into the model's input vector.
///
/// Volume counters are log-scaled so a busy database doesn't dwarf
/// every other dimension.
pub fn vectorize(features: &AssetFeatures) -> Vec<f64> {
    let ln1p = |v: f64| (1.0 + v).ln();
    vec![
        ln1p(features.flows_in as f64),
        ln1p(features.flows_out as f64),
        ln1p(features.bytes_in as f64),
        ln1p(features.bytes_out as f64),
        ln1p(f64::from(features.fan_in)),
        ln1p(f64::from(features.fan_out)),
        ln1p(f64::from(features.unique_src_ports)),
        ln1p(f64::from(features.unique_dst_ports)),
        features.well_known_port_ratio,
        features.ephemeral_port_ratio,
        ln1p(features.persistent_listener_ports.len() as f64),
        ln1p(features.avg_packet_size),
        ln1p(features.connection_churn),
        f64::from(features.active_hours) / 24.0,
        features.business_hours_ratio,
        features.traffic_variance,
        f64::from(u8::from(features.has_db_ports)),
        f64::from(u8::from(features.has_storage_ports)),
        f64::from(u8::from(features.has_web_ports)),
        f64::from(u8::from(features.has_ssh_ports)),
    ]
}

/// Prediction output: winning class, its probability, and the full
/// distribution.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub class: String,
    pub probability: f64,
    pub distribution: HashMap<String, f64>,
}

/// Lock-free classifier wrapper around the active model.
pub struct MlClassifier {
    active: ArcSwapOption<ModelWeights>,
}

impl Default for MlClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MlClassifier {
    pub fn new() -> Self {
        Self {
            active: ArcSwapOption::const_empty(),
        }
    }

    /// Load a weight file from disk without activating it.
    pub fn load_weights(path: &Path) -> Result<ModelWeights, MlError> {
        let raw = std::fs::read(path)?;
        let weights: ModelWeights = serde_json::from_slice(&raw)?;
        weights.validate()?;
        Ok(weights)
    }

    /// Swap in a new active model. Readers pick it up on their next
    /// prediction; in-flight predictions finish on the old weights.
    pub fn activate(&self, weights: ModelWeights) -> Result<(), MlError> {
        weights.validate()?;
        tracing::info!(
            version = %weights.version,
            algorithm = %weights.algorithm,
            classes = weights.classes.len(),
            "ML model activated"
        );
        self.active.store(Some(Arc::new(weights)));
        Ok(())
    }

    pub fn deactivate(&self) {
        self.active.store(None);
    }

    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }

    pub fn active_version(&self) -> Option<String> {
        self.active.load().as_ref().map(|m| m.version.clone())
    }

    /// Predict a class distribution, or None when no model is active.
    pub fn predict(&self, features: &AssetFeatures) -> Option<Prediction> {
        let model = self.active.load_full()?;
        let x = vectorize(features);

        let logits: Vec<f64> = model
            .weights
            .iter()
            .zip(model.bias.iter())
            .map(|(row, bias)| row.iter().zip(x.iter()).map(|(w, v)| w * v).sum::<f64>() + bias)
            .collect();

        // Stable softmax
        let max_logit = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max_logit).exp()).collect();
        let total: f64 = exps.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }

        let mut best_idx = 0;
        let mut distribution = HashMap::with_capacity(model.classes.len());
        for (idx, (class, exp)) in model.classes.iter().zip(exps.iter()).enumerate() {
            let p = exp / total;
            distribution.insert(class.clone(), p);
            if *exp > exps[best_idx] {
                best_idx = idx;
            }
        }

        Some(Prediction {
            class: model.classes[best_idx].clone(),
            probability: exps[best_idx] / total,
            distribution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn two_class_model() -> ModelWeights {
        // "database" keys on the has_db_ports dimension (index 16),
        // "workstation" on fan_out (index 5)
        let mut db_row = vec![0.0; FEATURE_NAMES.len()];
        db_row[16] = 5.0;
        let mut ws_row = vec![0.0; FEATURE_NAMES.len()];
        ws_row[5] = 2.0;

        ModelWeights {
            version: "test-1".to_string(),
            algorithm: "softmax".to_string(),
            classes: vec!["database".to_string(), "workstation".to_string()],
            feature_names: FEATURE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            weights: vec![db_row, ws_row],
            bias: vec![0.0, 0.0],
        }
    }

    fn features(db_ports: bool, fan_out: u32) -> AssetFeatures {
        AssetFeatures {
            asset_id: Uuid::new_v4(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            computed_at: Utc::now(),
            has_db_ports: db_ports,
            fan_out,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_active_model_predicts_none() {
        let classifier = MlClassifier::new();
        assert!(!classifier.is_ready());
        assert!(classifier.predict(&features(true, 0)).is_none());
    }

    #[test]
    fn test_prediction_picks_dominant_class() {
        let classifier = MlClassifier::new();
        classifier.activate(two_class_model()).unwrap();

        let db = classifier.predict(&features(true, 0)).unwrap();
        assert_eq!(db.class, "database");
        assert!(db.probability > 0.9);

        let ws = classifier.predict(&features(false, 50)).unwrap();
        assert_eq!(ws.class, "workstation");
    }

    #[test]
    fn test_distribution_sums_to_one() {
        let classifier = MlClassifier::new();
        classifier.activate(two_class_model()).unwrap();
        let prediction = classifier.predict(&features(true, 10)).unwrap();
        let total: f64 = prediction.distribution.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_shape_validation() {
        let mut bad = two_class_model();
        bad.bias.pop();
        assert!(matches!(
            MlClassifier::new().activate(bad).unwrap_err(),
            MlError::Shape(_)
        ));

        let mut wrong_names = two_class_model();
        wrong_names.feature_names[0] = "something_else".to_string();
        assert!(matches!(
            MlClassifier::new().activate(wrong_names).unwrap_err(),
            MlError::Shape(_)
        ));
    }

    #[test]
    fn test_hot_swap() {
        let classifier = MlClassifier::new();
        classifier.activate(two_class_model()).unwrap();
        assert_eq!(classifier.active_version().as_deref(), Some("test-1"));

        let mut v2 = two_class_model();
        v2.version = "test-2".to_string();
        classifier.activate(v2).unwrap();
        assert_eq!(classifier.active_version().as_deref(), Some("test-2"));

        classifier.deactivate();
        assert!(!classifier.is_ready());
    }
}
