//! Workflow State and Checkpoint Persistence
//!
//! [`WorkflowState`] is the named-value bag attached to one flow instance.
//! It is the only handler-visible data that survives suspension.
//!
//! [`InstanceCheckpoint`] wraps a whole instance so it can be written to
//! `{state_dir}/{instance_id}.state` after every processed message and
//! restored after a restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, StateError};
use crate::execution::instance::FlowInstance;
use crate::flow::model::InstanceId;

/// File extension used for checkpoint files.
const STATE_EXTENSION: &str = "state";

/// Checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct StateEntry {
    value: Value,
    /// State handler that first wrote the key
    owner: String,
}

/// Per-instance mapping of name to value.
///
/// Each key belongs to the state that first wrote it. Later handlers may
/// read it but an attempt to overwrite it from another state is rejected.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkflowState {
    entries: BTreeMap<String, StateEntry>,
}

impl WorkflowState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `key` on behalf of the state handler `owner`.
    pub fn set<T: Serialize>(&mut self, owner: &str, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value)?;

        if let Some(existing) = self.entries.get_mut(key) {
            if existing.owner != owner {
                return Err(StateError::NotOwner {
                    key: key.to_string(),
                    owner: existing.owner.clone(),
                    writer: owner.to_string(),
                });
            }
            existing.value = value;
            return Ok(());
        }

        self.entries.insert(
            key.to_string(),
            StateEntry {
                value,
                owner: owner.to_string(),
            },
        );
        Ok(())
    }

    /// Reads and decodes `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.entries
            .get(key)
            .map(|entry| serde_json::from_value(entry.value.clone()))
            .transpose()
    }

    /// Returns the raw value stored under `key`.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Returns the state that owns `key`.
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|entry| entry.owner.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the stored keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// A serialized flow instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstanceCheckpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub instance: FlowInstance,
}

impl InstanceCheckpoint {
    pub fn new(instance: FlowInstance) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            instance,
        }
    }

    /// Writes the checkpoint to `{dir}/{instance_id}.state`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, EngineError> {
        fs::create_dir_all(dir)?;

        let path = Self::path_for(dir, self.instance.id);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Checkpoint(format!("Failed to encode checkpoint: {}", e)))?;

        // Write-then-rename so a crash never leaves a truncated checkpoint.
        let tmp = path.with_extension("state.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved checkpoint for {} to {}", self.instance.id, path.display());
        Ok(path)
    }

    /// Loads the checkpoint of `id` from `dir`.
    pub fn load(dir: &Path, id: InstanceId) -> Result<Self, EngineError> {
        let path = Self::path_for(dir, id);
        let content = fs::read_to_string(&path)?;

        let checkpoint: InstanceCheckpoint = serde_json::from_str(&content).map_err(|e| {
            EngineError::Checkpoint(format!(
                "Failed to parse checkpoint '{}': {}",
                path.display(),
                e
            ))
        })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "Unsupported checkpoint version {} in '{}'",
                checkpoint.version,
                path.display()
            )));
        }

        info!("Loaded checkpoint for {} from {}", id, path.display());
        Ok(checkpoint)
    }

    /// Lists the instance ids that have a checkpoint in `dir`.
    pub fn list(dir: &Path) -> Result<Vec<InstanceId>, EngineError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(InstanceId::parse)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes the checkpoint of `id`, if present.
    pub fn delete(dir: &Path, id: InstanceId) -> Result<(), EngineError> {
        let path = Self::path_for(dir, id);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Deleted checkpoint: {}", path.display());
        }
        Ok(())
    }

    fn path_for(dir: &Path, id: InstanceId) -> PathBuf {
        dir.join(format!("{}.{}", id, STATE_EXTENSION))
    }
}
