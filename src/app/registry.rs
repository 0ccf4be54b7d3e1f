use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::models::Device;

const STORE_VERSION: u32 = 1;

/// Durable backing for the registry. `save` must be durable when it returns.
pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<Vec<Device>, AppError>;
    fn save(&self, devices: &[Device]) -> Result<(), AppError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDevices {
    version: u32,
    devices: Vec<Device>,
}

/// JSON file store. Writes go to a temp file in the same directory, are
/// fsynced, then renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Device>, AppError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| AppError::storage(format!("Failed to read device store: {err}"), ""))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| AppError::storage(format!("Failed to parse device store: {err}"), ""))?;
        // A bare array is accepted as well as the versioned envelope.
        let devices = if value.is_array() {
            serde_json::from_value::<Vec<Device>>(value)
        } else {
            serde_json::from_value::<StoredDevices>(value).map(|stored| stored.devices)
        }
        .map_err(|err| AppError::storage(format!("Invalid device store: {err}"), ""))?;
        Ok(devices)
    }

    fn save(&self, devices: &[Device]) -> Result<(), AppError> {
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)
            .map_err(|err| AppError::storage(format!("Failed to create store dir: {err}"), ""))?;

        let payload = serde_json::to_string_pretty(&StoredDevices {
            version: STORE_VERSION,
            devices: devices.to_vec(),
        })
        .map_err(|err| AppError::storage(format!("Failed to serialize devices: {err}"), ""))?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|err| AppError::storage(format!("Failed to create temp file: {err}"), ""))?;
        file.write_all(payload.as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(|err| AppError::storage(format!("Failed to write devices: {err}"), ""))?;
        file.persist(&self.path)
            .map_err(|err| AppError::storage(format!("Failed to replace device store: {err}"), ""))?;
        Ok(())
    }
}

/// Non-durable store backing `DeviceRegistry::in_memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<Vec<Device>>,
}

impl MemoryStore {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }
}

impl DeviceStore for MemoryStore {
    fn load(&self) -> Result<Vec<Device>, AppError> {
        self.devices
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| AppError::storage("Memory store lock poisoned", ""))
    }

    fn save(&self, devices: &[Device]) -> Result<(), AppError> {
        let mut guard = self
            .devices
            .lock()
            .map_err(|_| AppError::storage("Memory store lock poisoned", ""))?;
        *guard = devices.to_vec();
        Ok(())
    }
}

/// Known devices, most recently used first, unique by address.
///
/// Writers hold the lock across the store write, so readers observe either the
/// state before a mutation or after it has been persisted.
pub struct DeviceRegistry {
    store: Box<dyn DeviceStore>,
    capacity: usize,
    devices: RwLock<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn open(store: Box<dyn DeviceStore>, capacity: usize) -> Result<Self, AppError> {
        let capacity = capacity.max(1);
        let loaded = store.load()?;
        let mut devices: Vec<Device> = Vec::with_capacity(loaded.len().min(capacity));
        for device in loaded {
            if devices.iter().any(|existing| existing.address == device.address) {
                warn!(address = %device.address, "dropping duplicate stored device");
                continue;
            }
            devices.push(device);
        }
        devices.truncate(capacity);
        Ok(Self {
            store,
            capacity,
            devices: RwLock::new(devices),
        })
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self {
            store: Box::new(MemoryStore::default()),
            capacity: capacity.max(1),
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn mutate(
        &self,
        trace_id: &str,
        change: impl FnOnce(&mut Vec<Device>),
    ) -> Result<(), AppError> {
        let mut guard = self
            .devices
            .write()
            .map_err(|_| AppError::system("Device registry lock poisoned", trace_id))?;
        let mut next = guard.clone();
        change(&mut next);
        self.store
            .save(&next)
            .map_err(|err| AppError::storage(err.error, trace_id))?;
        *guard = next;
        Ok(())
    }

    /// Replaces any entry with the same address, moves it to the front and
    /// evicts the least recently used entries beyond capacity.
    pub fn upsert(&self, device: Device, trace_id: &str) -> Result<(), AppError> {
        let capacity = self.capacity;
        debug!(trace_id = %trace_id, address = %device.address, "registry upsert");
        self.mutate(trace_id, move |devices| {
            devices.retain(|existing| existing.address != device.address);
            devices.insert(0, device);
            devices.truncate(capacity);
        })
    }

    pub fn remove(&self, address: &str, trace_id: &str) -> Result<bool, AppError> {
        if !self.contains(address) {
            return Ok(false);
        }
        self.mutate(trace_id, |devices| {
            devices.retain(|existing| existing.address != address);
        })?;
        Ok(true)
    }

    pub fn clear(&self, trace_id: &str) -> Result<(), AppError> {
        self.mutate(trace_id, Vec::clear)
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn get(&self, address: &str) -> Option<Device> {
        self.devices
            .read()
            .ok()?
            .iter()
            .find(|device| device.address == address)
            .cloned()
    }
}
