//! Best-effort key-value persistence for connection configuration.
//!
//! Storage is always optional: every failure degrades to `false`/`None`
//! rather than surfacing an error, so a missing or broken backend never
//! breaks connectivity.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

/// Pluggable storage backend.
pub trait StorageAdapter: Send + Sync {
    /// Fetch the raw value for a key.
    fn get(&self, key: &str) -> Option<String>;
    /// Store a raw value. Returns `true` if the write succeeded.
    fn set(&self, key: &str, value: &str) -> bool;
    /// Remove a key. Missing keys are fine.
    fn remove(&self, key: &str);
}

/// Save a value as JSON. Returns `true` if the operation succeeded.
pub fn save<T: Serialize>(storage: &dyn StorageAdapter, key: &str, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => storage.set(key, &json),
        Err(_) => false,
    }
}

/// Load a JSON value. Returns `None` if the key is missing or malformed.
pub fn load<T: DeserializeOwned>(storage: &dyn StorageAdapter, key: &str) -> Option<T> {
    let json = storage.get(key)?;
    serde_json::from_str(&json).ok()
}

/// In-memory storage, the default when nothing persistent is available.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(key.to_string(), value.to_string());
                true
            }
            Err(_) => false,
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// File-backed storage under the platform config directory:
/// - Linux: `~/.config/phoenix-realtime/`
/// - macOS: `~/Library/Application Support/phoenix-realtime/`
/// - Windows: `%APPDATA%\phoenix-realtime\`
pub struct FileStorage {
    app_dir: &'static str,
}

impl FileStorage {
    pub fn new() -> Self {
        Self {
            app_dir: "phoenix-realtime",
        }
    }

    fn file_path(&self, key: &str) -> Option<std::path::PathBuf> {
        let config_dir = dirs::config_dir()?;
        let app_dir = config_dir.join(self.app_dir);
        if !app_dir.exists() {
            std::fs::create_dir_all(&app_dir).ok()?;
        }
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        Some(app_dir.join(format!("{}.json", safe_key)))
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return false;
        };
        std::fs::write(path, value).is_ok()
    }

    fn remove(&self, key: &str) {
        if let Some(path) = self.file_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        name: String,
        count: u32,
    }

    #[test]
    fn memory_storage_round_trips_typed_values() {
        let storage = MemoryStorage::new();
        let blob = Blob {
            name: "lobby".into(),
            count: 3,
        };
        assert!(save(&storage, "blob", &blob));
        assert_eq!(load::<Blob>(&storage, "blob"), Some(blob));
    }

    #[test]
    fn missing_key_loads_as_none() {
        let storage = MemoryStorage::new();
        assert_eq!(load::<Blob>(&storage, "nope"), None);
    }

    #[test]
    fn malformed_value_degrades_to_none() {
        let storage = MemoryStorage::new();
        storage.set("blob", "{not json");
        assert_eq!(load::<Blob>(&storage, "blob"), None);
    }

    #[test]
    fn remove_clears_the_key() {
        let storage = MemoryStorage::new();
        storage.set("k", "v");
        storage.remove("k");
        assert_eq!(storage.get("k"), None);
    }
}
