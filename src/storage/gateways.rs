//! Gateway observation and relationship stores

use super::{decode, ts_key, StorageError};
use crate::types::{AssetGateway, GatewayObservation};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub struct GatewayStore {
    observations: sled::Tree,
    /// Unprocessed observation keys, mirroring the partial index
    obs_pending: sled::Tree,
    gateways: sled::Tree,
    /// Current relationship per (source, gateway, destination context)
    gateways_current: sled::Tree,
}

fn obs_key(obs: &GatewayObservation) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&ts_key(obs.created_at));
    key.extend_from_slice(obs.id.as_bytes());
    key
}

fn relationship_key(source: Uuid, gateway: Uuid, destination_network: Option<&str>) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(source.as_bytes());
    key.extend_from_slice(gateway.as_bytes());
    key.extend_from_slice(&md5::compute(destination_network.unwrap_or("default")).0);
    key
}

impl GatewayStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            observations: db.open_tree("gateway_observations")?,
            obs_pending: db.open_tree("gateway_observations_pending")?,
            gateways: db.open_tree("asset_gateways")?,
            gateways_current: db.open_tree("asset_gateways_current")?,
        })
    }

    // ------------------------------------------------------------------
    // Observations
    // ------------------------------------------------------------------

    pub fn add_observation(&self, obs: &GatewayObservation) -> Result<(), StorageError> {
        let key = obs_key(obs);
        self.observations.insert(key.clone(), serde_json::to_vec(obs)?)?;
        if !obs.is_processed {
            self.obs_pending.insert(key, &[])?;
        }
        Ok(())
    }

    /// Unprocessed observations, oldest first.
    pub fn list_unprocessed_observations(
        &self,
        limit: usize,
    ) -> Result<Vec<GatewayObservation>, StorageError> {
        let mut out = Vec::new();
        for item in self.obs_pending.iter() {
            if out.len() >= limit {
                break;
            }
            let (key, _) = item?;
            match self.observations.get(&key)? {
                Some(value) => out.push(decode(&value)?),
                None => {
                    self.obs_pending.remove(&key)?;
                }
            }
        }
        Ok(out)
    }

    pub fn mark_observations_processed(
        &self,
        observations: &[GatewayObservation],
    ) -> Result<(), StorageError> {
        for obs in observations {
            let key = obs_key(obs);
            let mut updated = obs.clone();
            updated.is_processed = true;
            self.observations.insert(key.clone(), serde_json::to_vec(&updated)?)?;
            self.obs_pending.remove(key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    pub fn get_current(
        &self,
        source: Uuid,
        gateway: Uuid,
        destination_network: Option<&str>,
    ) -> Result<Option<AssetGateway>, StorageError> {
        let Some(id_bytes) = self
            .gateways_current
            .get(relationship_key(source, gateway, destination_network))?
        else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| StorageError::Integrity(format!("corrupt gateway index: {e}")))?;
        self.get(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AssetGateway>, StorageError> {
        match self.gateways.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Insert or update the current relationship for the key.
    ///
    /// Self-gateways are invalid by construction.
    pub fn upsert_current(&self, gateway: &AssetGateway) -> Result<(), StorageError> {
        if gateway.source_asset_id == gateway.gateway_asset_id {
            return Err(StorageError::Integrity(format!(
                "self-gateway rejected for asset {}",
                gateway.source_asset_id
            )));
        }
        self.gateways
            .insert(gateway.id.as_bytes(), serde_json::to_vec(gateway)?)?;
        if gateway.is_current() {
            self.gateways_current.insert(
                relationship_key(
                    gateway.source_asset_id,
                    gateway.gateway_asset_id,
                    gateway.destination_network.as_deref(),
                ),
                gateway.id.as_bytes().to_vec(),
            )?;
        }
        Ok(())
    }

    /// Retire a current relationship by setting `valid_to`.
    pub fn invalidate(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        let Some(mut gateway) = self.get(id)? else {
            return Err(StorageError::NotFound(format!("asset gateway {id}")));
        };
        if !gateway.is_current() {
            return Ok(());
        }
        gateway.valid_to = Some(at);
        self.gateways
            .insert(gateway.id.as_bytes(), serde_json::to_vec(&gateway)?)?;
        let key = relationship_key(
            gateway.source_asset_id,
            gateway.gateway_asset_id,
            gateway.destination_network.as_deref(),
        );
        if let Some(current) = self.gateways_current.get(&key)? {
            if current.as_ref() == gateway.id.as_bytes() {
                self.gateways_current.remove(&key)?;
            }
        }
        Ok(())
    }

    pub fn list_current(&self) -> Result<Vec<AssetGateway>, StorageError> {
        let mut out = Vec::new();
        for item in self.gateways_current.iter() {
            let (_, id_bytes) = item?;
            let id = Uuid::from_slice(&id_bytes)
                .map_err(|e| StorageError::Integrity(format!("corrupt gateway index: {e}")))?;
            if let Some(gateway) = self.get(id)? {
                out.push(gateway);
            }
        }
        Ok(out)
    }

    /// Current relationships originating at one source asset.
    pub fn list_current_for_source(
        &self,
        source: Uuid,
    ) -> Result<Vec<AssetGateway>, StorageError> {
        let mut out = Vec::new();
        for item in self.gateways_current.scan_prefix(source.as_bytes()) {
            let (_, id_bytes) = item?;
            let id = Uuid::from_slice(&id_bytes)
                .map_err(|e| StorageError::Integrity(format!("corrupt gateway index: {e}")))?;
            if let Some(gateway) = self.get(id)? {
                out.push(gateway);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GatewayRole, ObservationSource};

    fn open() -> (tempfile::TempDir, GatewayStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db = sled::open(tmp.path()).unwrap();
        let store = GatewayStore::open(&db).unwrap();
        (tmp, store)
    }

    fn observation() -> GatewayObservation {
        let now = Utc::now();
        GatewayObservation {
            id: Uuid::new_v4(),
            source_ip: "10.0.0.1".parse().unwrap(),
            gateway_ip: "10.0.0.254".parse().unwrap(),
            destination_ip: Some("8.8.8.8".parse().unwrap()),
            observation_source: ObservationSource::NextHop,
            exporter_ip: None,
            window_start: now,
            window_end: now,
            bytes_total: 1_000,
            flows_count: 5,
            is_processed: false,
            created_at: now,
        }
    }

    fn gateway(source: Uuid, gw: Uuid) -> AssetGateway {
        let now = Utc::now();
        AssetGateway {
            id: Uuid::new_v4(),
            source_asset_id: source,
            gateway_asset_id: gw,
            destination_network: None,
            gateway_role: GatewayRole::Primary,
            is_default_gateway: true,
            bytes_total: 0,
            flows_total: 0,
            bytes_last_24h: 0,
            bytes_last_7d: 0,
            traffic_share: None,
            confidence: 0.5,
            confidence_scores: None,
            first_seen: now,
            last_seen: now,
            inference_method: "next_hop".to_string(),
            last_inferred_at: None,
            valid_from: now,
            valid_to: None,
        }
    }

    #[test]
    fn test_observation_pending_lifecycle() {
        let (_tmp, store) = open();
        let obs = observation();
        store.add_observation(&obs).unwrap();

        let pending = store.list_unprocessed_observations(10).unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_observations_processed(&pending).unwrap();
        assert!(store.list_unprocessed_observations(10).unwrap().is_empty());
    }

    #[test]
    fn test_self_gateway_rejected() {
        let (_tmp, store) = open();
        let id = Uuid::new_v4();
        let err = store.upsert_current(&gateway(id, id)).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
    }

    #[test]
    fn test_upsert_and_invalidate() {
        let (_tmp, store) = open();
        let (source, gw) = (Uuid::new_v4(), Uuid::new_v4());
        let relationship = gateway(source, gw);
        store.upsert_current(&relationship).unwrap();

        assert!(store.get_current(source, gw, None).unwrap().is_some());
        assert_eq!(store.list_current_for_source(source).unwrap().len(), 1);

        store.invalidate(relationship.id, Utc::now()).unwrap();
        assert!(store.get_current(source, gw, None).unwrap().is_none());
    }
}
