//! Key-value persistence for ensemble state

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Durable key-value store for small JSON documents
pub trait PreferenceStore: Send + Sync {
    /// Read the value stored under `key`
    ///
    /// `Ok(None)` means the key was never written. An error means the
    /// backing data exists but could not be read or parsed.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key`
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Preferences kept in a single JSON object on disk
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?
        {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!(
                "Expected a JSON object in {}, found {}",
                self.path.display(),
                kind_of(&other)
            )),
        }
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        // A corrupt file is replaced rather than blocking every later write
        let mut all = self.read_all().unwrap_or_default();
        all.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(&Value::Object(all))?;
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process preferences, used by tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self
            .values
            .read()
            .map_err(|_| anyhow!("preferences lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| anyhow!("preferences lock poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_preferences_round_trip() {
        let dir = TempDir::new().unwrap();
        let prefs = FilePreferences::new(dir.path().join("nested/prefs.json"));

        assert!(prefs.get("missing").unwrap().is_none());
        prefs.set("a", json!({"x": 1.0})).unwrap();
        prefs.set("b", json!(true)).unwrap();

        let reopened = FilePreferences::new(prefs.path());
        assert_eq!(reopened.get("a").unwrap(), Some(json!({"x": 1.0})));
        assert_eq!(reopened.get("b").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_corrupt_file_is_an_error_then_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{not json").unwrap();

        let prefs = FilePreferences::new(&path);
        assert!(prefs.get("a").is_err());

        prefs.set("a", json!(1)).unwrap();
        assert_eq!(prefs.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_non_object_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        let err = FilePreferences::new(&path).get("a").unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_memory_preferences() {
        let prefs = MemoryPreferences::new();
        assert!(prefs.get("k").unwrap().is_none());
        prefs.set("k", json!("v")).unwrap();
        assert_eq!(prefs.get("k").unwrap(), Some(json!("v")));
    }
}
