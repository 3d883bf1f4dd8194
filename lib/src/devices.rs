//! Persistent registry of learned devices.
//!
//! The registry owns `devices.json`, a single object keyed by lowercase
//! hex sender id. Mutations rewrite the file atomically; the per-telegram
//! `rssi`/`last_seen` refresh deliberately stays in memory so radio
//! traffic doesn't wear out flash storage.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::util::write_json_atomic;

/// EEP value for devices created before their profile is known; a later
/// teach-in fills in the real one.
pub const PENDING_EEP: &str = "pending";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} already exists")]
    Duplicate(String),
    #[error("no device with id {0}")]
    NoSuchDevice(String),
    #[error("couldn't read device file: {0}")]
    ReadFileError(tokio::io::Error),
    #[error("couldn't write device file: {0}")]
    WriteFileError(tokio::io::Error),
    #[error("couldn't parse device file: {0}")]
    ParseError(serde_json::Error),
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub eep: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Partial update applied by the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub eep: Option<String>,
    pub manufacturer: Option<String>,
    pub enabled: Option<bool>,
}

pub struct DeviceRegistry {
    path: PathBuf,
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    /// Load the registry, starting empty if the file doesn't exist yet.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let devices: HashMap<String, Device> = match fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(RegistryError::ParseError)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(RegistryError::ReadFileError(e)),
        };
        info!("loaded {} devices from {}", devices.len(), path.display());
        Ok(DeviceRegistry { path, devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Devices sorted by id.
    pub fn list(&self) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self.devices.values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Add a device. Existing entries are not overwritten, except those
    /// still waiting for their profile.
    pub async fn add(
        &mut self,
        id: &str,
        name: &str,
        eep: &str,
        manufacturer: &str,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.devices.get(id)
            && existing.eep != PENDING_EEP
        {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        self.devices.insert(
            id.to_string(),
            Device {
                id: id.to_string(),
                name: name.to_string(),
                eep: eep.to_string(),
                manufacturer: manufacturer.to_string(),
                enabled: true,
                created_at: Utc::now(),
                rssi: None,
                last_seen: None,
            },
        );
        self.save().await
    }

    pub async fn update(&mut self, id: &str, update: DeviceUpdate) -> Result<(), RegistryError> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::NoSuchDevice(id.to_string()))?;
        if let Some(name) = update.name {
            device.name = name;
        }
        if let Some(eep) = update.eep {
            device.eep = eep;
        }
        if let Some(manufacturer) = update.manufacturer {
            device.manufacturer = manufacturer;
        }
        if let Some(enabled) = update.enabled {
            device.enabled = enabled;
        }
        self.save().await
    }

    pub async fn remove(&mut self, id: &str) -> Result<Device, RegistryError> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| RegistryError::NoSuchDevice(id.to_string()))?;
        self.save().await?;
        Ok(device)
    }

    /// Refresh liveness info in memory only; the next mutating operation
    /// carries it to disk as a side effect.
    pub fn update_last_seen(&mut self, id: &str, rssi: Option<i32>) {
        if let Some(device) = self.devices.get_mut(id) {
            device.rssi = rssi;
            device.last_seen = Some(Utc::now());
        }
    }

    async fn save(&self) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, &self.devices)
            .await
            .map_err(RegistryError::WriteFileError)
    }
}
