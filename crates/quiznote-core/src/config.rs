//! Immutable store configuration.
//!
//! A config is built once from defaults plus optional JSON overrides and then
//! handed to the store by value. Overrides go through [`deep_merge`], which
//! never mutates its inputs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_DATABASE_NAME: &str = "quiznote";
pub const DEFAULT_SCHEMA_VERSION: i64 = 3;

/// Stored setting keys shared by the store and its callers.
pub mod setting_keys {
    pub const AUTO_SAVE: &str = "autoSave";
    pub const AUTO_SAVE_DELAY: &str = "autoSaveDelay";
    pub const COPY_PREFIX: &str = "copyPrefix";
    pub const COPY_SUFFIX: &str = "copySuffix";
    pub const AI_PROMPT_PREFIX: &str = "aiPromptPrefix";
    pub const AI_PROMPT_SUFFIX: &str = "aiPromptSuffix";
    pub const AI_CHAT_ID: &str = "aiChatId";
    pub const EXPORT_FORMAT: &str = "exportFormat";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuizNoteConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub defaults: SettingDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database identity; the file on disk is `<data_dir>/<name>.sqlite3`.
    pub name: String,
    pub version: i64,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub operation_timeout_ms: u64,
    pub busy_timeout_ms: u64,
}

/// Fallback values for settings that were never written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingDefaults {
    pub auto_save: bool,
    pub auto_save_delay_ms: u64,
    pub copy_prefix: String,
    pub copy_suffix: String,
    pub ai_prompt_prefix: String,
    pub ai_prompt_suffix: String,
    pub ai_chat_id: String,
    pub export_format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DATABASE_NAME.to_string(),
            version: DEFAULT_SCHEMA_VERSION,
            data_dir: PathBuf::from("."),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { operation_timeout_ms: 5_000, busy_timeout_ms: 5_000 }
    }
}

impl Default for SettingDefaults {
    fn default() -> Self {
        Self {
            auto_save: true,
            auto_save_delay_ms: 1_000,
            copy_prefix: String::new(),
            copy_suffix: String::new(),
            ai_prompt_prefix: String::new(),
            ai_prompt_suffix: String::new(),
            ai_chat_id: String::new(),
            export_format: "docx".to_string(),
        }
    }
}

impl SettingDefaults {
    /// Defaults keyed the way settings are stored.
    #[must_use]
    pub fn to_setting_map(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (setting_keys::AUTO_SAVE.to_string(), Value::Bool(self.auto_save)),
            (setting_keys::AUTO_SAVE_DELAY.to_string(), Value::from(self.auto_save_delay_ms)),
            (setting_keys::COPY_PREFIX.to_string(), Value::String(self.copy_prefix.clone())),
            (setting_keys::COPY_SUFFIX.to_string(), Value::String(self.copy_suffix.clone())),
            (
                setting_keys::AI_PROMPT_PREFIX.to_string(),
                Value::String(self.ai_prompt_prefix.clone()),
            ),
            (
                setting_keys::AI_PROMPT_SUFFIX.to_string(),
                Value::String(self.ai_prompt_suffix.clone()),
            ),
            (setting_keys::AI_CHAT_ID.to_string(), Value::String(self.ai_chat_id.clone())),
            (setting_keys::EXPORT_FORMAT.to_string(), Value::String(self.export_format.clone())),
        ])
    }
}

impl QuizNoteConfig {
    /// Return a new config with `overrides` deep-merged over this one.
    ///
    /// # Errors
    /// Returns an error when the merged document does not describe a valid config.
    pub fn merged(&self, overrides: &Value) -> Result<Self, ConfigError> {
        let base = serde_json::to_value(self)?;
        let merged: Self = serde_json::from_value(deep_merge(&base, overrides))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Load overrides from a JSON file and merge them over the defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let overrides: Value = serde_json::from_str(&raw)?;
        Self::default().merged(&overrides)
    }

    /// Path of the SQLite file for the configured identity.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        database_path(&self.database.data_dir, &self.database.name)
    }

    /// # Errors
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database_name(&self.database.name)?;
        if self.database.version < 1 {
            return Err(ConfigError::Invalid(format!(
                "database.version must be >= 1, got {}",
                self.database.version
            )));
        }
        if self.storage.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "storage.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[must_use]
pub fn database_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.sqlite3"))
}

/// # Errors
/// Returns an error when `name` is empty or could escape the data directory.
pub fn validate_database_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("invalid database name: {name:?}")))
    }
}

/// Merge `overlay` into `base`, recursing through objects. Any non-object
/// overlay value replaces the base value outright, arrays included.
#[must_use]
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let next = match base_map.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}
