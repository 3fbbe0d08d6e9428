//! User settings and their key/value store.
//!
//! The observers never write settings. They read a snapshot at install and
//! receive fresh snapshots through `updateSettings` messages.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const AUTO_CONTINUE_KEY: &str = "autoContinueEnabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auto_continue_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_continue_enabled: true,
        }
    }
}

/// Base directory for persisted state: `~/.chat-autopilot`
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chat-autopilot")
}

pub struct SettingsStore {
    path: PathBuf,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        Self {
            path: state_dir().join("settings.json"),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_all(&self) -> anyhow::Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let value: Value = serde_json::from_str(&json)
            .with_context(|| format!("Malformed settings file {}", self.path.display()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("Settings file {} is not a JSON object", self.path.display()),
        }
    }

    /// Read `key`, falling back to `default` when it is unset.
    pub fn get(&self, key: &str, default: Value) -> anyhow::Result<Value> {
        Ok(self.read_all()?.remove(key).unwrap_or(default))
    }

    pub fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut all = self.read_all()?;
        all.insert(key.to_string(), value);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&Value::Object(all))?)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))?;
        Ok(())
    }

    pub fn load_settings(&self) -> anyhow::Result<Settings> {
        let enabled = self.get(AUTO_CONTINUE_KEY, Value::Bool(true))?;
        Ok(Settings {
            auto_continue_enabled: enabled.as_bool().unwrap_or(true),
        })
    }

    pub fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        self.set(AUTO_CONTINUE_KEY, Value::Bool(settings.auto_continue_enabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("settings.json"));
        assert_eq!(store.load_settings().unwrap(), Settings::default());
        assert_eq!(store.get("other", Value::from(3)).unwrap(), Value::from(3));
    }

    #[test]
    fn set_then_get_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::with_path(dir.path().join("nested").join("settings.json"));
        store.set("theme", Value::from("dark")).unwrap();
        store
            .save_settings(&Settings {
                auto_continue_enabled: false,
            })
            .unwrap();
        assert!(!store.load_settings().unwrap().auto_continue_enabled);
        assert_eq!(store.get("theme", Value::Null).unwrap(), Value::from("dark"));
    }

    #[test]
    fn non_object_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1,2]").unwrap();
        assert!(SettingsStore::with_path(path).load_settings().is_err());
    }

    #[test]
    fn settings_wire_shape_is_camel_case() {
        let json = serde_json::to_string(&Settings::default()).unwrap();
        assert_eq!(json, r#"{"autoContinueEnabled":true}"#);
    }
}
