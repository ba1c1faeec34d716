use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::database::CameraStore;
use crate::errors::{CameraError, Result};
use crate::models::{CameraRecord, Credentials, DeviceInfo};

/// Everything registration learned about a device, before it has an identity
/// in the directory.
#[derive(Debug, Clone)]
pub struct RegistrationDraft {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    pub info: DeviceInfo,
    pub stream_uri: String,
}

/// Authoritative set of known cameras, mirrored into the persistence store.
///
/// All mutations take the write lock for the whole store round-trip, so
/// there is exactly one writer at a time while readers share the map.
pub struct DeviceDirectory {
    records: RwLock<HashMap<String, CameraRecord>>,
    store: Arc<dyn CameraStore>,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn CameraStore>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Replaces the in-memory view with what the store holds.
    pub async fn load(&self) -> Result<usize> {
        let persisted = self.store.get_all_cameras().await?;
        let mut records = self.records.write().await;
        records.clear();
        for record in persisted {
            records.insert(record.id.clone(), record);
        }
        info!("Loaded {} camera(s) into the device directory", records.len());
        Ok(records.len())
    }

    pub async fn list(&self) -> Vec<CameraRecord> {
        let mut records: Vec<CameraRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn get(&self, id: &str) -> Option<CameraRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn find_by_endpoint(&self, address: &str, port: u16) -> Option<CameraRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.address == address && r.port == port)
            .cloned()
    }

    /// (address, port) of every active record.
    pub async fn endpoints(&self) -> HashSet<(String, u16)> {
        self.records
            .read()
            .await
            .values()
            .map(|r| (r.address.clone(), r.port))
            .collect()
    }

    /// Inserts a new record or refreshes the one already registered at the
    /// same address. An existing record keeps its id, creation time and
    /// operator-assigned name/location; `updated_at` always moves forward.
    pub async fn upsert(&self, draft: RegistrationDraft) -> Result<CameraRecord> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let id = draft.address.clone();

        let record = match records.get(&id) {
            Some(existing) => CameraRecord {
                id: existing.id.clone(),
                address: draft.address,
                port: draft.port,
                credentials: draft.credentials,
                manufacturer: draft.info.manufacturer,
                model: draft.info.model,
                firmware_version: draft.info.firmware_version,
                serial_number: draft.info.serial_number,
                stream_uri: draft.stream_uri,
                display_name: existing.display_name.clone(),
                location: existing.location.clone(),
                created_at: existing.created_at,
                updated_at: next_update_time(existing.updated_at, now),
            },
            None => CameraRecord {
                display_name: default_display_name(&draft.info, &draft.address),
                id: id.clone(),
                address: draft.address,
                port: draft.port,
                credentials: draft.credentials,
                manufacturer: draft.info.manufacturer,
                model: draft.info.model,
                firmware_version: draft.info.firmware_version,
                serial_number: draft.info.serial_number,
                stream_uri: draft.stream_uri,
                location: String::new(),
                created_at: now,
                updated_at: now,
            },
        };

        self.persist(&record).await?;
        let is_update = records.insert(id.clone(), record.clone()).is_some();
        if is_update {
            debug!(camera_id = %id, "Refreshed camera record");
        } else {
            info!(camera_id = %id, endpoint = %record.endpoint(), model = %record.model, "Registered new camera");
        }
        Ok(record)
    }

    /// Operator edits of display metadata. `None` when the id is unknown.
    pub async fn update_display(
        &self,
        id: &str,
        display_name: Option<String>,
        location: Option<String>,
    ) -> Result<Option<CameraRecord>> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get(id) else {
            return Ok(None);
        };

        let mut record = existing.clone();
        if let Some(name) = display_name {
            record.display_name = name;
        }
        if let Some(location) = location {
            record.location = location;
        }
        record.updated_at = next_update_time(existing.updated_at, Utc::now());

        self.persist(&record).await?;
        records.insert(id.to_string(), record.clone());
        Ok(Some(record))
    }

    /// Explicit removal; the only way a record ever leaves the directory.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let deleted = self.store.delete_camera(id).await?;
        let removed = records.remove(id).is_some();
        if removed {
            info!(camera_id = %id, "Removed camera from directory");
        }
        Ok(removed || deleted)
    }

    async fn persist(&self, record: &CameraRecord) -> Result<()> {
        if self.store.add_or_update_camera(record).await? {
            Ok(())
        } else {
            Err(CameraError::storage(format!("store refused camera record '{}'", record.id)))
        }
    }
}

/// Strictly later than `previous`, even when the clock has not advanced.
fn next_update_time(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn default_display_name(info: &DeviceInfo, address: &str) -> String {
    if info.model.is_empty() {
        address.to_string()
    } else {
        format!("{} ({})", info.model, address)
    }
}
