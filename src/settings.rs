//! Persisted settings: one JSON object, merged on write.
//!
//! Holds the active engine directory, the saved engine-install list, extra
//! model directories, and arbitrary user keys. Merge is read-modify-write
//! with last-writer-wins per top-level key; a single writer is assumed.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        SettingsStore { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings document. Missing or unreadable files yield an
    /// empty document so a corrupt settings file never wedges startup.
    pub fn load(&self) -> Map<String, Value> {
        let Ok(raw) = std::fs::read(&self.path) else {
            return Map::new();
        };
        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "settings file is not a JSON object; ignoring");
                Map::new()
            }
        }
    }

    /// Merge `updates` into the stored document and write it back.
    pub fn save(&self, updates: Map<String, Value>) -> Result<()> {
        let mut settings = self.load();
        for (key, value) in updates {
            settings.insert(key, value);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create settings dir {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&Value::Object(settings))?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("write settings at {}", self.path.display()))?;
        Ok(())
    }

    /// Set one key. `Value::Null` clears the key's effect for readers that
    /// treat null as absent (the active engine dir does).
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut updates = Map::new();
        updates.insert(key.to_string(), value);
        self.save(updates)
    }

    /// The active engine directory: `comfyui_dir` if set, else the builtin.
    pub fn active_engine_dir(&self, builtin: &Path) -> PathBuf {
        match self.load().get("comfyui_dir") {
            Some(Value::String(dir)) if !dir.is_empty() => PathBuf::from(dir),
            _ => builtin.to_path_buf(),
        }
    }

    pub fn saved_engine_dirs(&self) -> Vec<String> {
        self.string_list("saved_comfyui_dirs")
    }

    pub fn extra_model_dirs(&self) -> Vec<String> {
        self.string_list("extra_model_dirs")
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.load().get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------- Unit tests ----------
