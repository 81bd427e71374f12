//! Classification rule, feature, history, and model registry stores

use super::{decode, ts_key, StorageError};
use crate::types::{AssetFeatures, ClassificationHistory, ClassificationRule, MlModelRecord};
use uuid::Uuid;

pub struct ClassificationStore {
    rules: sled::Tree,
    features: sled::Tree,
    history: sled::Tree,
    models: sled::Tree,
}

impl ClassificationStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            rules: db.open_tree("classification_rules")?,
            features: db.open_tree("asset_features")?,
            history: db.open_tree("classification_history")?,
            models: db.open_tree("ml_model_registry")?,
        })
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub fn upsert_rule(&self, rule: &ClassificationRule) -> Result<(), StorageError> {
        self.rules.insert(rule.id.as_bytes(), serde_json::to_vec(rule)?)?;
        Ok(())
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Option<ClassificationRule>, StorageError> {
        match self.rules.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn list_active_rules(&self) -> Result<Vec<ClassificationRule>, StorageError> {
        let mut out = Vec::new();
        for item in self.rules.iter() {
            let (_, value) = item?;
            let rule: ClassificationRule = decode(&value)?;
            if rule.is_active {
                out.push(rule);
            }
        }
        Ok(out)
    }

    pub fn delete_rule(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.rules.remove(id.as_bytes())?.is_some())
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    fn feature_key(asset_id: Uuid, window_start: chrono::DateTime<chrono::Utc>) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(asset_id.as_bytes());
        key.extend_from_slice(&ts_key(window_start));
        key
    }

    pub fn put_features(&self, features: &AssetFeatures) -> Result<(), StorageError> {
        self.features.insert(
            Self::feature_key(features.asset_id, features.window_start),
            serde_json::to_vec(features)?,
        )?;
        Ok(())
    }

    /// Most recent feature row for an asset.
    pub fn latest_features(&self, asset_id: Uuid) -> Result<Option<AssetFeatures>, StorageError> {
        let mut latest: Option<AssetFeatures> = None;
        for item in self.features.scan_prefix(asset_id.as_bytes()) {
            let (_, value) = item?;
            latest = Some(decode(&value)?);
        }
        Ok(latest)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn append_history(&self, entry: &ClassificationHistory) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&ts_key(entry.changed_at));
        key.extend_from_slice(entry.id.as_bytes());
        self.history.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    pub fn history_for(&self, asset_id: Uuid) -> Result<Vec<ClassificationHistory>, StorageError> {
        let mut out = Vec::new();
        for item in self.history.iter() {
            let (_, value) = item?;
            let entry: ClassificationHistory = decode(&value)?;
            if entry.asset_id == asset_id {
                out.push(entry);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Model registry
    // ------------------------------------------------------------------

    pub fn register_model(&self, model: &MlModelRecord) -> Result<(), StorageError> {
        self.models.insert(model.id.as_bytes(), serde_json::to_vec(model)?)?;
        Ok(())
    }

    /// Activate one model, deactivating every other record so exactly
    /// one is active at a time.
    pub fn activate_model(&self, id: Uuid) -> Result<(), StorageError> {
        let mut found = false;
        let mut updates = Vec::new();
        for item in self.models.iter() {
            let (key, value) = item?;
            let mut model: MlModelRecord = decode(&value)?;
            let should_be_active = model.id == id;
            if should_be_active {
                found = true;
            }
            if model.is_active != should_be_active {
                model.is_active = should_be_active;
                updates.push((key.to_vec(), serde_json::to_vec(&model)?));
            }
        }
        if !found {
            return Err(StorageError::NotFound(format!("ml model {id}")));
        }
        for (key, value) in updates {
            self.models.insert(key, value)?;
        }
        Ok(())
    }

    pub fn active_model(&self) -> Result<Option<MlModelRecord>, StorageError> {
        for item in self.models.iter() {
            let (_, value) = item?;
            let model: MlModelRecord = decode(&value)?;
            if model.is_active {
                return Ok(Some(model));
            }
        }
        Ok(None)
    }

    pub fn list_models(&self) -> Result<Vec<MlModelRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.models.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}
