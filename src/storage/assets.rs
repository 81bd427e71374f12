//! Asset store
//!
//! Primary tree keys on the asset UUID; a side tree maps IP → id for
//! the live (non-deleted) asset on that address, mirroring the unique
//! constraint on `ip_address WHERE deleted_at IS NULL`.

use super::{decode, StorageError};
use crate::types::{Asset, Service};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use uuid::Uuid;

pub struct AssetStore {
    tree: sled::Tree,
    by_ip: sled::Tree,
    services: sled::Tree,
}

impl AssetStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree("assets")?,
            by_ip: db.open_tree("assets_by_ip")?,
            services: db.open_tree("services")?,
        })
    }

    /// Insert a new asset. Fails if a live asset already owns the IP.
    pub fn create(&self, asset: &Asset) -> Result<(), StorageError> {
        let ip_key = asset.ip_address.to_string();
        if !asset.is_deleted() && self.by_ip.get(ip_key.as_bytes())?.is_some() {
            return Err(StorageError::Integrity(format!(
                "live asset already exists for ip {ip_key}"
            )));
        }
        self.tree
            .insert(asset.id.as_bytes(), serde_json::to_vec(asset)?)?;
        if !asset.is_deleted() {
            self.by_ip
                .insert(ip_key.as_bytes(), asset.id.as_bytes().to_vec())?;
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Asset>, StorageError> {
        match self.tree.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Live (non-deleted) asset for an IP, if any.
    pub fn get_by_ip(&self, ip: IpAddr) -> Result<Option<Asset>, StorageError> {
        let Some(id_bytes) = self.by_ip.get(ip.to_string().as_bytes())? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| StorageError::Integrity(format!("corrupt ip index: {e}")))?;
        self.get(id)
    }

    /// Persist changes to an existing asset, maintaining the IP index
    /// across soft-deletes.
    pub fn update(&self, asset: &Asset) -> Result<(), StorageError> {
        self.tree
            .insert(asset.id.as_bytes(), serde_json::to_vec(asset)?)?;
        let ip_key = asset.ip_address.to_string();
        if asset.is_deleted() {
            // Only drop the index entry if it still points at this asset
            if let Some(current) = self.by_ip.get(ip_key.as_bytes())? {
                if current.as_ref() == asset.id.as_bytes() {
                    self.by_ip.remove(ip_key.as_bytes())?;
                }
            }
        } else {
            self.by_ip
                .insert(ip_key.as_bytes(), asset.id.as_bytes().to_vec())?;
        }
        Ok(())
    }

    /// Soft-delete: set the tombstone and free the IP for a future
    /// asset. The row itself is retained.
    pub fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        let Some(mut asset) = self.get(id)? else {
            return Err(StorageError::NotFound(format!("asset {id}")));
        };
        asset.deleted_at = Some(at);
        self.update(&asset)
    }

    /// All live assets.
    pub fn list_active(&self) -> Result<Vec<Asset>, StorageError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let asset: Asset = decode(&value)?;
            if !asset.is_deleted() {
                out.push(asset);
            }
        }
        Ok(out)
    }

    pub fn count_active(&self) -> Result<usize, StorageError> {
        Ok(self.list_active()?.len())
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    fn service_key(asset_id: Uuid, port: u16, protocol: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(19);
        key.extend_from_slice(asset_id.as_bytes());
        key.extend_from_slice(&port.to_be_bytes());
        key.push(protocol);
        key
    }

    /// Record a listening (asset, port, protocol) observation,
    /// accumulating its connection counter.
    pub fn observe_service(
        &self,
        asset_id: Uuid,
        port: u16,
        protocol: u8,
        connections: u64,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let key = Self::service_key(asset_id, port, protocol);
        let service = match self.services.get(&key)? {
            Some(value) => {
                let mut service: Service = decode(&value)?;
                service.connections_total += connections;
                if seen_at > service.last_seen {
                    service.last_seen = seen_at;
                }
                service
            }
            None => Service {
                id: Uuid::new_v4(),
                asset_id,
                port,
                protocol,
                name: None,
                connections_total: connections,
                first_seen: seen_at,
                last_seen: seen_at,
            },
        };
        self.services.insert(key, serde_json::to_vec(&service)?)?;
        Ok(())
    }

    /// Services listening on one asset.
    pub fn list_services(&self, asset_id: Uuid) -> Result<Vec<Service>, StorageError> {
        let mut out = Vec::new();
        for item in self.services.scan_prefix(asset_id.as_bytes()) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, AssetStore) {
        let tmp = tempfile::tempdir().unwrap();
        let db = sled::open(tmp.path()).unwrap();
        let store = AssetStore::open(&db).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_create_and_lookup_by_ip() {
        let (_tmp, store) = open();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let asset = Asset::from_observation(ip, Utc::now());
        store.create(&asset).unwrap();

        let found = store.get_by_ip(ip).unwrap().unwrap();
        assert_eq!(found.id, asset.id);
    }

    #[test]
    fn test_duplicate_live_ip_rejected() {
        let (_tmp, store) = open();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        store.create(&Asset::from_observation(ip, Utc::now())).unwrap();

        let err = store
            .create(&Asset::from_observation(ip, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
    }

    #[test]
    fn test_soft_delete_frees_ip_but_keeps_row() {
        let (_tmp, store) = open();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let asset = Asset::from_observation(ip, Utc::now());
        store.create(&asset).unwrap();

        store.soft_delete(asset.id, Utc::now()).unwrap();
        assert!(store.get_by_ip(ip).unwrap().is_none());
        // Tombstoned row still readable by id
        assert!(store.get(asset.id).unwrap().unwrap().is_deleted());

        // A new asset can claim the IP
        let replacement = Asset::from_observation(ip, Utc::now());
        store.create(&replacement).unwrap();
        assert_eq!(store.get_by_ip(ip).unwrap().unwrap().id, replacement.id);
    }

    #[test]
    fn test_service_accumulation() {
        let (_tmp, store) = open();
        let asset_id = Uuid::new_v4();
        let now = Utc::now();

        store.observe_service(asset_id, 5432, 6, 3, now).unwrap();
        store.observe_service(asset_id, 5432, 6, 2, now).unwrap();
        store.observe_service(asset_id, 443, 6, 1, now).unwrap();

        let services = store.list_services(asset_id).unwrap();
        assert_eq!(services.len(), 2);
        let db_service = services.iter().find(|s| s.port == 5432).unwrap();
        assert_eq!(db_service.connections_total, 5);
    }
}
