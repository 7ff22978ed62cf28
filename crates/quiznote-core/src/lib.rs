use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub mod config;
pub mod keys;

pub use config::{
    deep_merge, setting_keys, ConfigError, DatabaseConfig, QuizNoteConfig, SettingDefaults,
    StorageConfig,
};
pub use keys::{mistake_key, note_key, split_note_key, Granularity, KeyError, RecordKey, ScopeKey};

/// One note per `(scope, record)` pair. `content` is opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Note {
    pub primary_key: String,
    pub scope_key: ScopeKey,
    pub record_key: RecordKey,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Cumulative wrong-attempt count for one question.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MistakeCounter {
    pub primary_key: String,
    pub scope_key: ScopeKey,
    pub record_key: RecordKey,
    pub question_ordinal: u32,
    pub count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Process-wide key/value pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A note supplied by a bulk import. A missing `created_at` means "now".
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NoteImport {
    pub scope_key: ScopeKey,
    pub record_key: RecordKey,
    pub content: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchFailure {
    pub key: String,
    pub error: String,
}

/// Per-item outcome of a best-effort batch operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchReport {
    pub succeeded: usize,
    /// Keys that matched nothing; not counted as failures.
    pub missing: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded + self.missing + self.failures.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record_failure(&mut self, key: impl Into<String>, error: impl ToString) {
        self.failures.push(BatchFailure { key: key.into(), error: error.to_string() });
    }
}
