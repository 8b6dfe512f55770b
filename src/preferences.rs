//! Local preference scratch space.
//!
//! Small JSON key-value file holding UI preferences such as the account list
//! sort order. Not synced anywhere; wiped on sign-out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CrmError;
use crate::queries::SortConfig;

const SORT_CONFIG_KEY: &str = "sortConfig";

pub struct PreferenceStore {
    path: Option<PathBuf>,
    values: Mutex<HashMap<String, Value>>,
}

impl PreferenceStore {
    /// Preferences that live only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or start) the preference file at `path`.
    ///
    /// A corrupt file is discarded rather than failing startup.
    pub fn open(path: &Path) -> Result<Self, CrmError> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match serde_json::from_str::<HashMap<String, Value>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!(
                        "Discarding unreadable preferences at {}: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            values: Mutex::new(values),
        })
    }

    /// Default location: ~/.medrep/preferences.json
    pub fn default_path() -> Result<PathBuf, CrmError> {
        Ok(crate::util::medrep_dir()?.join("preferences.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock();
        let value = values.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                log::warn!("Ignoring malformed preference '{}': {}", key, e);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CrmError> {
        let value = serde_json::to_value(value)
            .map_err(|e| CrmError::Validation(format!("Unserializable preference: {}", e)))?;
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    pub fn remove(&self, key: &str) -> Result<(), CrmError> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }

    pub fn sort_config(&self) -> SortConfig {
        self.get(SORT_CONFIG_KEY).unwrap_or_default()
    }

    pub fn set_sort_config(&self, config: &SortConfig) -> Result<(), CrmError> {
        self.set(SORT_CONFIG_KEY, config)
    }

    /// Drop every preference, in memory and on disk.
    pub fn clear(&self) -> Result<(), CrmError> {
        let mut values = self.values.lock();
        values.clear();
        if let Some(path) = &self.path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn persist(&self, values: &HashMap<String, Value>) -> Result<(), CrmError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| CrmError::Io(format!("Serialize error: {}", e)))?;
        crate::util::atomic_write_str(path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{SortDirection, SortKey};
    use tempfile::TempDir;

    #[test]
    fn test_sort_config_defaults_when_unset() {
        let store = PreferenceStore::in_memory();
        assert_eq!(store.sort_config(), SortConfig::default());
    }

    #[test]
    fn test_preferences_persist_across_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prefs").join("preferences.json");

        let store = PreferenceStore::open(&path).unwrap();
        let sort = SortConfig {
            key: SortKey::Stage,
            direction: SortDirection::Descending,
        };
        store.set_sort_config(&sort).unwrap();
        store.set("lastRegion", &"North").unwrap();

        let reopened = PreferenceStore::open(&path).unwrap();
        assert_eq!(reopened.sort_config(), sort);
        assert_eq!(reopened.get::<String>("lastRegion").as_deref(), Some("North"));
    }

    #[test]
    fn test_clear_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("preferences.json");
        let store = PreferenceStore::open(&path).unwrap();
        store.set("lastRegion", &"East").unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.get::<String>("lastRegion").is_none());
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("preferences.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = PreferenceStore::open(&path).unwrap();
        assert_eq!(store.sort_config(), SortConfig::default());
    }
}
