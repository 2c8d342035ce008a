//! Persistent key/value state of the agent
//!
//! Holds the agent credentials and the serialized cache. The file is
//! rewritten atomically (temp file then rename) on every save.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const KEY_AGENT_UUID: &str = "agent_uuid";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_CACHE: &str = "cache";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is corrupted: {source}")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON key/value store backed by a file
#[derive(Debug)]
pub struct State {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl State {
    /// State that lives only in memory, used when no state file is configured.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(Map::new()),
        }
    }

    /// Load the state file. A missing file yields an empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut values = Map::new();

        if path.exists() {
            let content = std::fs::read(&path)
                .with_context(|| format!("Failed to read state file {:?}", path))?;

            if !content.is_empty() {
                values = serde_json::from_slice(&content).map_err(|source| StateError::Corrupted {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }

        debug!(path = ?path, keys = values.len(), "Loaded state");

        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    /// Load the state file, starting fresh when it is corrupted.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match Self::load(&path) {
            Ok(state) => Ok(state),
            Err(e) if e.downcast_ref::<StateError>().is_some() => {
                warn!(error = %e, "Failed to load persisted state, starting fresh");
                Ok(Self {
                    path: Some(path),
                    values: Mutex::new(Map::new()),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a key. Returns `None` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = {
            let values = self.lock();
            match values.get(key) {
                Some(value) => value.clone(),
                None => return Ok(None),
            }
        };

        let decoded = serde_json::from_value(value)
            .with_context(|| format!("Failed to decode state key {}", key))?;

        Ok(Some(decoded))
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get::<String>(key)?.filter(|v| !v.is_empty()))
    }

    /// Set a key and persist the state.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)
            .with_context(|| format!("Failed to encode state key {}", key))?;

        self.lock().insert(key.to_string(), encoded);
        self.save()
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        self.save()
    }

    /// Write the state to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let values = self.lock();
            serde_json::to_vec(&*values).context("Failed to serialize state")?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        file.write_all(&json).context("Failed to write state data")?;
        file.sync_all().context("Failed to sync state file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        // A poisoned lock only means a panic happened while holding it; the map is still usable.
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = State::load(&path).unwrap();
        state.set(KEY_AGENT_UUID, &"agent-1").unwrap();
        state.set(KEY_PASSWORD, &"secret").unwrap();

        let reloaded = State::load(&path).unwrap();
        assert_eq!(reloaded.get_string(KEY_AGENT_UUID).unwrap().as_deref(), Some("agent-1"));
        assert_eq!(reloaded.get_string(KEY_PASSWORD).unwrap().as_deref(), Some("secret"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupted_state_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = State::load(&path).unwrap_err();
        assert!(err.downcast_ref::<StateError>().is_some());

        let state = State::load_or_default(&path).unwrap();
        assert!(state.get_string(KEY_AGENT_UUID).unwrap().is_none());
    }

    #[test]
    fn test_in_memory_state_does_not_touch_disk() {
        let state = State::in_memory();
        state.set("key", &42).unwrap();
        assert_eq!(state.get::<i32>("key").unwrap(), Some(42));

        state.delete("key").unwrap();
        assert_eq!(state.get::<i32>("key").unwrap(), None);
        assert!(state.path().is_none());
    }
}
