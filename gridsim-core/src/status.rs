//! The persisted device-status file.
//!
//! One JSON document holds the per-type id counters, every device record,
//! and the remote-registration idempotency fields. Every write is a
//! whole-file rewrite. The supervisor and each worker process all
//! read-modify-write this same file, so concurrent writers race
//! last-writer-wins; that matches the original system and is deliberately
//! not papered over with locking here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device_types::DeviceType;
use crate::error::StoreError;
use crate::models::DeviceStatus;

pub const STATUS_FILE: &str = "device_status.json";

/// One row of the `devices` map. The `cumulocity_*` fields are written by
/// workers when they register with the remote platform; the supervisor
/// carries them through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulocity_registered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulocity_device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulocity_registered_at: Option<String>,
}

impl PersistedDevice {
    pub fn new(device_type: DeviceType, status: DeviceStatus, created_at: String) -> Self {
        Self {
            device_type,
            status,
            created_at,
            cumulocity_registered: None,
            cumulocity_device_name: None,
            cumulocity_registered_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusFile {
    #[serde(default)]
    pub counters: HashMap<String, u32>,
    #[serde(default)]
    pub devices: HashMap<String, PersistedDevice>,
}

impl StatusFile {
    /// Older files keyed counters by display name ("PV", "Heat Pump",
    /// "Main Grid"); fold those into the current type-id keys, keeping the
    /// higher count when both exist.
    pub fn migrate_legacy_counters(&mut self) {
        for ty in DeviceType::ALL {
            if let Some(legacy) = self.counters.remove(ty.display()) {
                let slot = self.counters.entry(ty.type_id().to_string()).or_insert(0);
                *slot = (*slot).max(legacy);
            }
        }
    }
}

/// Registration idempotency record for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub registered: bool,
    pub device_name: Option<String>,
    pub registered_at: Option<String>,
}

/// Handle on the status file. Cheap to clone; every operation re-reads the
/// file so separate processes observe each other's writes.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or empty file reads as an empty state.
    pub fn load(&self) -> Result<StatusFile, StoreError> {
        if !self.path.exists() {
            return Ok(StatusFile::default());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(StatusFile::default());
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, file: &StatusFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    /// Current registration record for a device, if it has one.
    pub fn registration(&self, device_id: &str) -> Result<Option<Registration>, StoreError> {
        let file = self.load()?;
        Ok(file.devices.get(device_id).map(|d| Registration {
            registered: d.cumulocity_registered.unwrap_or(false),
            device_name: d.cumulocity_device_name.clone(),
            registered_at: d.cumulocity_registered_at.clone(),
        }))
    }

    /// Persist a successful registration so later sessions skip the publish.
    /// Creates the device row if the worker got there before the supervisor
    /// wrote one.
    pub fn mark_registered(
        &self,
        device_id: &str,
        device_name: &str,
        registered_at: &str,
    ) -> Result<(), StoreError> {
        let mut file = self.load()?;
        if !file.devices.contains_key(device_id) {
            let device_type = DeviceType::from_device_id(device_id)
                .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;
            file.devices.insert(
                device_id.to_string(),
                PersistedDevice::new(
                    device_type,
                    DeviceStatus::Active,
                    chrono::Utc::now().to_rfc3339(),
                ),
            );
        }
        if let Some(entry) = file.devices.get_mut(device_id) {
            entry.cumulocity_registered = Some(true);
            entry.cumulocity_device_name = Some(device_name.to_string());
            entry.cumulocity_registered_at = Some(registered_at.to_string());
        }
        self.save(&file)
    }
}
