//! SQLite persistence for notes, mistake counters and settings.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::time::Duration;

use quiznote_core::config::{database_path, validate_database_name};
use quiznote_core::{
    mistake_key, note_key, split_note_key, BatchReport, Granularity, KeyError, MistakeCounter,
    Note, NoteImport, RecordKey, ScopeKey, Setting,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{format_description, OffsetDateTime, UtcOffset};
use tracing::{debug, error, info, warn};

pub mod schema;

pub use schema::{MigrationOutcome, SchemaStatus, LATEST_SCHEMA_VERSION};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Fixed-width so that lexical order in SQL equals chronological order.
const TIMESTAMP_FORMAT: &str =
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage operation `{operation}` failed: {message}")]
    StorageIo { operation: &'static str, message: String },
    #[error("schema migration failed: {0}")]
    SchemaMigration(String),
    #[error("store is not initialized; call open() first")]
    NotInitialized,
    #[error("invalid key: {0}")]
    Validation(#[from] KeyError),
}

impl StoreError {
    pub fn io(operation: &'static str, err: impl Display) -> Self {
        Self::StorageIo { operation, message: err.to_string() }
    }

    /// Whether the caller should treat the whole feature as degraded rather
    /// than retrying the single operation.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::NotInitialized)
    }
}

trait OperationContext<T> {
    fn during(self, operation: &'static str) -> StoreResult<T>;
}

impl<T> OperationContext<T> for rusqlite::Result<T> {
    fn during(self, operation: &'static str) -> StoreResult<T> {
        self.map_err(|err| {
            error!(operation, error = %err, "storage operation failed");
            StoreError::io(operation, err)
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityImportSummary {
    pub imported_notes: usize,
    pub skipped_notes: usize,
    pub imported_mistakes: usize,
    pub skipped_mistakes: usize,
    pub imported_settings: usize,
    pub skipped_settings: usize,
}

pub struct SqliteStore {
    conn: Connection,
    target_version: i64,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it to
    /// `target_version`.
    ///
    /// # Errors
    /// Returns [`StoreError::StorageUnavailable`] when the file cannot be
    /// opened or configured and [`StoreError::SchemaMigration`] when the schema
    /// cannot be brought to `target_version`.
    pub fn open(path: &Path, target_version: i64) -> StoreResult<Self> {
        Self::open_with_busy_timeout(path, target_version, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open the database identity `name` under `data_dir`.
    ///
    /// # Errors
    /// Same as [`SqliteStore::open`], plus `StorageUnavailable` for a name that
    /// cannot be used as a file name.
    pub fn open_identity(
        data_dir: &Path,
        name: &str,
        target_version: i64,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        validate_database_name(name)
            .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
        Self::open_with_busy_timeout(&database_path(data_dir, name), target_version, busy_timeout)
    }

    /// # Errors
    /// Same as [`SqliteStore::open`].
    pub fn open_with_busy_timeout(
        path: &Path,
        target_version: i64,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::StorageUnavailable(format!(
                    "failed to create data directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let mut conn = Connection::open(path).map_err(|err| {
            StoreError::StorageUnavailable(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .and_then(|()| conn.busy_timeout(busy_timeout))
            .map_err(|err| {
                StoreError::StorageUnavailable(format!("failed to configure sqlite pragmas: {err}"))
            })?;

        let outcome = schema::migrate(&mut conn, target_version)?;
        info!(
            path = %path.display(),
            from_version = outcome.from_version,
            to_version = outcome.to_version,
            applied = outcome.applied_versions.len(),
            "opened note store"
        );

        Ok(Self { conn, target_version })
    }

    #[must_use]
    pub fn target_version(&self) -> i64 {
        self.target_version
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        schema::schema_status(&self.conn, self.target_version)
    }

    /// Insert the note or overwrite its content, keeping the original `created_at`.
    ///
    /// # Errors
    /// Returns `StorageIo` when the write fails.
    pub fn upsert_note(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
        content: &str,
    ) -> StoreResult<Note> {
        let now = now_timestamp()?;
        let row = self
            .conn
            .query_row(
                "INSERT INTO notes(primary_key, scope_key, record_key, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(primary_key) DO UPDATE SET
                   content = excluded.content,
                   updated_at = excluded.updated_at
                 RETURNING primary_key, scope_key, record_key, content, created_at, updated_at",
                params![note_key(scope, record), scope.token(), record.as_str(), content, now],
                NoteRow::from_row,
            )
            .during("upsert_note")?;
        row.into_note()
    }

    /// # Errors
    /// Returns `StorageIo` when the read fails or the stored row is malformed.
    pub fn get_note(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<Option<Note>> {
        self.conn
            .query_row(
                "SELECT primary_key, scope_key, record_key, content, created_at, updated_at
                 FROM notes WHERE primary_key = ?1",
                params![note_key(scope, record)],
                NoteRow::from_row,
            )
            .optional()
            .during("get_note")?
            .map(NoteRow::into_note)
            .transpose()
    }

    /// Returns `false` when there was nothing to delete.
    ///
    /// # Errors
    /// Returns `StorageIo` when the delete fails.
    pub fn delete_note(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM notes WHERE primary_key = ?1", params![note_key(scope, record)])
            .during("delete_note")?;
        Ok(removed > 0)
    }

    /// Best-effort delete of many notes by primary key. Each key is its own
    /// statement; failures and malformed keys are collected per item.
    pub fn delete_notes<S: AsRef<str>>(&self, primary_keys: &[S]) -> BatchReport {
        let mut report = BatchReport::default();
        for primary_key in primary_keys {
            let primary_key = primary_key.as_ref();
            if let Err(err) = parse_note_key(primary_key) {
                warn!(primary_key, error = %err, "skipping malformed note key");
                report.record_failure(primary_key, err);
                continue;
            }
            match self.conn.execute("DELETE FROM notes WHERE primary_key = ?1", params![primary_key])
            {
                Ok(0) => report.missing += 1,
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    warn!(primary_key, error = %err, "failed to delete note");
                    report.record_failure(primary_key, err);
                }
            }
        }
        if !report.is_complete() {
            warn!(
                attempted = report.attempted(),
                failed = report.failures.len(),
                "batch note delete finished with failures"
            );
        }
        report
    }

    /// Rows that no longer decode are logged and left out of the result.
    ///
    /// # Errors
    /// Returns `StorageIo` when the scan fails.
    pub fn list_notes_by_scope(
        &self,
        scope: &ScopeKey,
        granularity: Granularity,
    ) -> StoreResult<Vec<Note>> {
        let rows = if granularity == Granularity::Exact {
            self.query_rows(
                "list_notes_by_scope",
                "SELECT primary_key, scope_key, record_key, content, created_at, updated_at
                 FROM notes WHERE scope_key = ?1
                 ORDER BY updated_at DESC, primary_key ASC",
                params![scope.token()],
                NoteRow::from_row,
            )?
        } else {
            self.query_rows(
                "list_notes_by_scope",
                "SELECT primary_key, scope_key, record_key, content, created_at, updated_at
                 FROM notes ORDER BY updated_at DESC, primary_key ASC",
                [],
                NoteRow::from_row,
            )?
        };

        let mut notes = Vec::new();
        for row in rows {
            let primary_key = row.primary_key.clone();
            match row.into_note() {
                Ok(note) if granularity.matches(scope, &note.scope_key) => notes.push(note),
                Ok(_) => {}
                Err(err) => warn!(primary_key, error = %err, "skipping undecodable note row"),
            }
        }
        debug!(scope = %scope, granularity = granularity.as_str(), count = notes.len(), "listed notes");
        Ok(notes)
    }

    /// Upsert many notes in one transaction. A supplied `created_at` is used
    /// for new rows; existing rows keep theirs.
    ///
    /// # Errors
    /// Returns `StorageIo` when the transaction cannot be started or committed.
    /// Per-note failures are reported in the returned [`BatchReport`].
    pub fn import_notes(&mut self, notes: &[NoteImport]) -> StoreResult<BatchReport> {
        let now = now_timestamp()?;
        let tx = self.conn.transaction().during("import_notes")?;
        let mut report = BatchReport::default();
        for note in notes {
            let primary_key = note_key(&note.scope_key, &note.record_key);
            let created_at = match note.created_at {
                Some(created_at) => format_timestamp(created_at)?,
                None => now.clone(),
            };
            let result = tx.execute(
                "INSERT INTO notes(primary_key, scope_key, record_key, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(primary_key) DO UPDATE SET
                   content = excluded.content,
                   updated_at = excluded.updated_at",
                params![
                    primary_key,
                    note.scope_key.token(),
                    note.record_key.as_str(),
                    note.content,
                    created_at,
                    now
                ],
            );
            match result {
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    warn!(primary_key = %primary_key, error = %err, "failed to import note");
                    report.record_failure(primary_key, err);
                }
            }
        }
        tx.commit().during("import_notes")?;
        info!(imported = report.succeeded, failed = report.failures.len(), "imported notes");
        Ok(report)
    }

    /// Atomically bump the counter, creating it at 1. Returns the new count.
    ///
    /// # Errors
    /// Returns `StorageIo` when the write fails.
    pub fn increment_mistake(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
        question_ordinal: u32,
    ) -> StoreResult<u32> {
        let now = now_timestamp()?;
        let count = self
            .conn
            .query_row(
                "INSERT INTO mistakes(
                   primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 ON CONFLICT(primary_key) DO UPDATE SET
                   count = mistakes.count + 1,
                   question_ordinal = excluded.question_ordinal,
                   updated_at = excluded.updated_at
                 RETURNING count",
                params![
                    mistake_key(scope, record),
                    scope.token(),
                    record.as_str(),
                    question_ordinal,
                    now
                ],
                |row| row.get::<_, i64>(0),
            )
            .during("increment_mistake")?;
        u32::try_from(count).map_err(|err| StoreError::io("increment_mistake", err))
    }

    /// # Errors
    /// Returns `StorageIo` when the read fails or the stored row is malformed.
    pub fn get_mistake(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
    ) -> StoreResult<Option<MistakeCounter>> {
        self.conn
            .query_row(
                "SELECT primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                 FROM mistakes WHERE primary_key = ?1",
                params![mistake_key(scope, record)],
                MistakeRow::from_row,
            )
            .optional()
            .during("get_mistake")?
            .map(MistakeRow::into_counter)
            .transpose()
    }

    /// Delete the counter. Returns `false` when there was none.
    ///
    /// # Errors
    /// Returns `StorageIo` when the delete fails.
    pub fn reset_mistake(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM mistakes WHERE primary_key = ?1",
                params![mistake_key(scope, record)],
            )
            .during("reset_mistake")?;
        Ok(removed > 0)
    }

    /// Rows that no longer decode are logged and left out of the result.
    ///
    /// # Errors
    /// Returns `StorageIo` when the scan fails.
    pub fn list_mistakes_by_scope(
        &self,
        scope: &ScopeKey,
        granularity: Granularity,
    ) -> StoreResult<Vec<MistakeCounter>> {
        let rows = if granularity == Granularity::Exact {
            self.query_rows(
                "list_mistakes_by_scope",
                "SELECT primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                 FROM mistakes WHERE scope_key = ?1
                 ORDER BY updated_at DESC, primary_key ASC",
                params![scope.token()],
                MistakeRow::from_row,
            )?
        } else {
            self.query_rows(
                "list_mistakes_by_scope",
                "SELECT primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                 FROM mistakes ORDER BY updated_at DESC, primary_key ASC",
                [],
                MistakeRow::from_row,
            )?
        };

        let mut counters = Vec::new();
        for row in rows {
            let primary_key = row.primary_key.clone();
            match row.into_counter() {
                Ok(counter) if granularity.matches(scope, &counter.scope_key) => {
                    counters.push(counter);
                }
                Ok(_) => {}
                Err(err) => warn!(primary_key, error = %err, "skipping undecodable mistake row"),
            }
        }
        Ok(counters)
    }

    /// # Errors
    /// Returns `StorageIo` when the read fails or the stored value is not JSON.
    pub fn get_setting(&self, key: &str, default: Value) -> StoreResult<Value> {
        Ok(self.load_setting_value(key)?.unwrap_or(default))
    }

    /// Typed read. A stored value that does not deserialize as `T` is treated
    /// like an absent one.
    ///
    /// # Errors
    /// Returns `StorageIo` when the read fails.
    pub fn get_setting_as<T: DeserializeOwned>(&self, key: &str, default: T) -> StoreResult<T> {
        let Some(value) = self.load_setting_value(key)? else {
            return Ok(default);
        };
        match serde_json::from_value(value) {
            Ok(typed) => Ok(typed),
            Err(err) => {
                warn!(key, error = %err, "stored setting has unexpected type; using default");
                Ok(default)
            }
        }
    }

    /// # Errors
    /// Returns `StorageIo` when the write fails.
    pub fn set_setting(&self, key: &str, value: &Value) -> StoreResult<Setting> {
        let value_json =
            serde_json::to_string(value).map_err(|err| StoreError::io("set_setting", err))?;
        let updated_at = now_utc_millis()?;
        self.conn
            .execute(
                "INSERT INTO settings(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![key, value_json, format_timestamp(updated_at)?],
            )
            .during("set_setting")?;
        Ok(Setting { key: key.to_string(), value: value.clone(), updated_at })
    }

    /// # Errors
    /// Returns `StorageIo` when the delete fails.
    pub fn delete_setting(&self, key: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .during("delete_setting")?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns `StorageIo` when the scan fails or a stored value is not JSON.
    pub fn list_all_settings(&self) -> StoreResult<BTreeMap<String, Value>> {
        let rows = self.query_rows(
            "list_all_settings",
            "SELECT key, value_json FROM settings ORDER BY key ASC",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        rows.into_iter()
            .map(|(key, value_json)| Ok((key, decode_setting_value(&value_json)?)))
            .collect()
    }

    /// Stored settings laid over `defaults`.
    ///
    /// # Errors
    /// Same as [`SqliteStore::list_all_settings`].
    pub fn resolved_settings(
        &self,
        defaults: &BTreeMap<String, Value>,
    ) -> StoreResult<BTreeMap<String, Value>> {
        let mut resolved = defaults.clone();
        resolved.extend(self.list_all_settings()?);
        Ok(resolved)
    }

    /// Remove every note, mistake counter and setting in one transaction.
    ///
    /// # Errors
    /// Returns `StorageIo` when any delete fails; nothing is removed in that case.
    pub fn clear_all(&mut self) -> StoreResult<()> {
        let has_mistakes = schema::table_exists(&self.conn, "mistakes")?;
        let tx = self.conn.transaction().during("clear_all")?;
        tx.execute("DELETE FROM notes", []).during("clear_all")?;
        tx.execute("DELETE FROM settings", []).during("clear_all")?;
        if has_mistakes {
            tx.execute("DELETE FROM mistakes", []).during("clear_all")?;
        }
        tx.commit().during("clear_all")?;
        info!("cleared all stored records");
        Ok(())
    }

    /// Copy notes, mistake counters and settings from an older database
    /// identity. Rows already present here are kept; rows that no longer
    /// decode are skipped.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when the legacy file is missing or cannot
    /// be opened and `StorageIo` when reading or writing fails.
    pub fn import_from_identity(&mut self, legacy_path: &Path) -> StoreResult<IdentityImportSummary> {
        if !legacy_path.exists() {
            return Err(StoreError::StorageUnavailable(format!(
                "legacy database does not exist: {}",
                legacy_path.display()
            )));
        }
        let legacy = Connection::open_with_flags(legacy_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| {
                StoreError::StorageUnavailable(format!(
                    "failed to open legacy database {}: {err}",
                    legacy_path.display()
                ))
            })?;

        let legacy_notes = if schema::table_exists(&legacy, "notes")? {
            query_rows(
                &legacy,
                "import_from_identity",
                "SELECT primary_key, scope_key, record_key, content, created_at, updated_at FROM notes",
                [],
                NoteRow::from_row,
            )?
        } else {
            Vec::new()
        };
        let legacy_mistakes = if schema::table_exists(&legacy, "mistakes")?
            && schema::table_exists(&self.conn, "mistakes")?
        {
            query_rows(
                &legacy,
                "import_from_identity",
                "SELECT primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                 FROM mistakes",
                [],
                MistakeRow::from_row,
            )?
        } else {
            Vec::new()
        };
        let legacy_settings = if schema::table_exists(&legacy, "settings")? {
            query_rows(
                &legacy,
                "import_from_identity",
                "SELECT key, value_json, updated_at FROM settings",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )?
        } else {
            Vec::new()
        };

        let mut summary = IdentityImportSummary::default();
        let tx = self.conn.transaction().during("import_from_identity")?;

        for row in legacy_notes {
            let Ok(note) = row.into_note() else {
                summary.skipped_notes += 1;
                continue;
            };
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO notes(
                       primary_key, scope_key, record_key, content, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        note_key(&note.scope_key, &note.record_key),
                        note.scope_key.token(),
                        note.record_key.as_str(),
                        note.content,
                        format_timestamp(note.created_at)?,
                        format_timestamp(note.updated_at)?
                    ],
                )
                .during("import_from_identity")?;
            if inserted > 0 {
                summary.imported_notes += 1;
            } else {
                summary.skipped_notes += 1;
            }
        }

        for row in legacy_mistakes {
            let Ok(counter) = row.into_counter() else {
                summary.skipped_mistakes += 1;
                continue;
            };
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO mistakes(
                       primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        mistake_key(&counter.scope_key, &counter.record_key),
                        counter.scope_key.token(),
                        counter.record_key.as_str(),
                        counter.question_ordinal,
                        counter.count,
                        format_timestamp(counter.created_at)?,
                        format_timestamp(counter.updated_at)?
                    ],
                )
                .during("import_from_identity")?;
            if inserted > 0 {
                summary.imported_mistakes += 1;
            } else {
                summary.skipped_mistakes += 1;
            }
        }

        for (key, value_json, updated_at) in legacy_settings {
            if decode_setting_value(&value_json).is_err() {
                summary.skipped_settings += 1;
                continue;
            }
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO settings(key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value_json, updated_at],
                )
                .during("import_from_identity")?;
            if inserted > 0 {
                summary.imported_settings += 1;
            } else {
                summary.skipped_settings += 1;
            }
        }

        tx.commit().during("import_from_identity")?;
        info!(
            legacy = %legacy_path.display(),
            notes = summary.imported_notes,
            mistakes = summary.imported_mistakes,
            settings = summary.imported_settings,
            "imported legacy identity"
        );
        Ok(summary)
    }

    fn load_setting_value(&self, key: &str) -> StoreResult<Option<Value>> {
        self.conn
            .query_row("SELECT value_json FROM settings WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .during("get_setting")?
            .map(|value_json| decode_setting_value(&value_json))
            .transpose()
    }

    fn query_rows<T, P, F>(
        &self,
        operation: &'static str,
        sql: &str,
        params: P,
        map: F,
    ) -> StoreResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_rows(&self.conn, operation, sql, params, map)
    }
}

struct NoteRow {
    primary_key: String,
    scope_key: String,
    record_key: String,
    content: String,
    created_at: String,
    updated_at: String,
}

impl NoteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            primary_key: row.get(0)?,
            scope_key: row.get(1)?,
            record_key: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_note(self) -> StoreResult<Note> {
        Ok(Note {
            scope_key: decode_scope(&self.scope_key)?,
            record_key: decode_record(self.record_key)?,
            primary_key: self.primary_key,
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct MistakeRow {
    primary_key: String,
    scope_key: String,
    record_key: String,
    question_ordinal: i64,
    count: i64,
    created_at: String,
    updated_at: String,
}

impl MistakeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            primary_key: row.get(0)?,
            scope_key: row.get(1)?,
            record_key: row.get(2)?,
            question_ordinal: row.get(3)?,
            count: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_counter(self) -> StoreResult<MistakeCounter> {
        Ok(MistakeCounter {
            scope_key: decode_scope(&self.scope_key)?,
            record_key: decode_record(self.record_key)?,
            primary_key: self.primary_key,
            question_ordinal: u32::try_from(self.question_ordinal)
                .map_err(|err| StoreError::io("decode_mistake", err))?,
            count: u32::try_from(self.count).map_err(|err| StoreError::io("decode_mistake", err))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Split and validate a note primary key.
///
/// # Errors
/// Returns `Validation` when the key does not split into a scope token and a
/// record key.
pub fn parse_note_key(primary_key: &str) -> StoreResult<(ScopeKey, RecordKey)> {
    let (scope, record) = split_note_key(primary_key)
        .ok_or_else(|| KeyError::UnrecognizedScope(primary_key.to_string()))?;
    Ok((ScopeKey::parse(scope)?, RecordKey::new(record)?))
}

fn query_rows<T, P, F>(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: P,
    map: F,
) -> StoreResult<Vec<T>>
where
    P: rusqlite::Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql).during(operation)?;
    let rows = stmt.query_map(params, map).during(operation)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().during(operation)
}

fn decode_scope(raw: &str) -> StoreResult<ScopeKey> {
    ScopeKey::parse(raw).map_err(|err| StoreError::io("decode_row", err))
}

fn decode_record(raw: String) -> StoreResult<RecordKey> {
    RecordKey::new(raw).map_err(|err| StoreError::io("decode_row", err))
}

fn decode_setting_value(value_json: &str) -> StoreResult<Value> {
    serde_json::from_str(value_json).map_err(|err| StoreError::io("decode_setting", err))
}

fn now_utc_millis() -> StoreResult<OffsetDateTime> {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(u32::from(now.millisecond()) * 1_000_000)
        .map_err(|err| StoreError::io("timestamp", err))
}

pub(crate) fn now_timestamp() -> StoreResult<String> {
    format_timestamp(now_utc_millis()?)
}

fn format_timestamp(value: OffsetDateTime) -> StoreResult<String> {
    let format =
        format_description::parse(TIMESTAMP_FORMAT).map_err(|err| StoreError::io("timestamp", err))?;
    value.to_offset(UtcOffset::UTC).format(&format).map_err(|err| StoreError::io("timestamp", err))
}

fn parse_timestamp(value: &str) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| StoreError::io("decode_row", format!("invalid timestamp {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::{anyhow, Result};
    use serde_json::json;

    use super::*;

    fn memory_store() -> Result<SqliteStore> {
        Ok(SqliteStore::open(Path::new(":memory:"), LATEST_SCHEMA_VERSION)?)
    }

    fn scope(course: &str, class: &str, assignment: &str) -> Result<ScopeKey> {
        Ok(ScopeKey::assignment(course, class, assignment)?)
    }

    fn record(value: &str) -> Result<RecordKey> {
        Ok(RecordKey::new(value)?)
    }

    #[test]
    fn upsert_is_idempotent_and_preserves_created_at() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let record = record("q12")?;

        let first = store.upsert_note(&scope, &record, "first draft")?;
        let second = store.upsert_note(&scope, &record, "second draft")?;

        assert_eq!(first.primary_key, "101_5_9001_q12");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let stored = store.get_note(&scope, &record)?.ok_or_else(|| anyhow!("note missing"))?;
        assert_eq!(stored, second);
        assert_eq!(stored.content, "second draft");
        assert_eq!(store.list_notes_by_scope(&scope, Granularity::All)?.len(), 1);
        Ok(())
    }

    #[test]
    fn notes_are_isolated_by_scope_and_record() -> Result<()> {
        let store = memory_store()?;
        let s1 = scope("101", "5", "9001")?;
        let s2 = scope("101", "5", "9002")?;
        let r1 = record("q1")?;
        let r2 = record("q2")?;

        store.upsert_note(&s1, &r1, "s1 r1")?;
        store.upsert_note(&s1, &r2, "s1 r2")?;
        store.upsert_note(&s2, &r1, "s2 r1")?;

        for (scope, record, expected) in [(&s1, &r1, "s1 r1"), (&s1, &r2, "s1 r2"), (&s2, &r1, "s2 r1")] {
            let note = store.get_note(scope, record)?.ok_or_else(|| anyhow!("note missing"))?;
            assert_eq!(note.content, expected);
        }
        assert!(store.get_note(&s2, &r2)?.is_none());
        Ok(())
    }

    #[test]
    fn mistake_counters_do_not_collide_with_notes() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let record = record("q3")?;

        store.upsert_note(&scope, &record, "note")?;
        store.increment_mistake(&scope, &record, 3)?;

        assert_eq!(store.get_note(&scope, &record)?.map(|note| note.content), Some("note".to_string()));
        assert!(store.delete_note(&scope, &record)?);
        assert_eq!(store.get_mistake(&scope, &record)?.map(|counter| counter.count), Some(1));
        Ok(())
    }

    #[test]
    fn mistake_counter_increments_and_resets() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let record = record("q7")?;

        assert_eq!(store.increment_mistake(&scope, &record, 7)?, 1);
        assert_eq!(store.increment_mistake(&scope, &record, 7)?, 2);
        assert_eq!(store.increment_mistake(&scope, &record, 7)?, 3);

        let counter = store.get_mistake(&scope, &record)?.ok_or_else(|| anyhow!("counter missing"))?;
        assert_eq!(counter.count, 3);
        assert_eq!(counter.question_ordinal, 7);
        assert_eq!(counter.primary_key, "101_5_9001_q7_mistake");

        assert!(store.reset_mistake(&scope, &record)?);
        assert!(store.get_mistake(&scope, &record)?.is_none());
        assert!(!store.reset_mistake(&scope, &record)?);
        assert_eq!(store.increment_mistake(&scope, &record, 7)?, 1);
        Ok(())
    }

    #[test]
    fn scope_fan_out_selects_course_and_class() -> Result<()> {
        let store = memory_store()?;
        let anchor = scope("c1", "k1", "a1")?;
        let fixtures = [
            anchor.clone(),
            scope("c1", "k1", "a2")?,
            scope("c1", "k2", "a1")?,
            scope("c2", "k1", "a1")?,
        ];
        let record = record("q1")?;
        for fixture in &fixtures {
            store.upsert_note(fixture, &record, &fixture.token())?;
            store.increment_mistake(fixture, &record, 1)?;
        }
        store.upsert_note(&ScopeKey::from_page_path("/work/view"), &record, "page note")?;

        let count = |granularity| -> Result<usize> {
            Ok(store.list_notes_by_scope(&anchor, granularity)?.len())
        };
        assert_eq!(count(Granularity::Exact)?, 1);
        assert_eq!(count(Granularity::Class)?, 2);
        assert_eq!(count(Granularity::Course)?, 3);
        assert_eq!(count(Granularity::All)?, 5);

        let class_mistakes = store.list_mistakes_by_scope(&anchor, Granularity::Class)?;
        assert_eq!(class_mistakes.len(), 2);
        assert!(class_mistakes.iter().all(|counter| counter.scope_key.class_id() == Some("k1")));

        let page = ScopeKey::from_page_path("/work/view");
        assert_eq!(store.list_notes_by_scope(&page, Granularity::Course)?.len(), 1);
        Ok(())
    }

    #[test]
    fn listings_skip_rows_that_no_longer_decode() -> Result<()> {
        let store = memory_store()?;
        let good = scope("101", "5", "9001")?;
        let record = record("q1")?;
        store.upsert_note(&good, &record, "kept")?;
        store.increment_mistake(&good, &record, 1)?;

        let stamp = "2024-01-02T03:04:05.000Z";
        store.conn.execute(
            "INSERT INTO notes(primary_key, scope_key, record_key, content, created_at, updated_at)
             VALUES ('1_0_5_9001_q1', '1_0_5_9001', 'q1', 'corrupt', ?1, ?1)",
            params![stamp],
        )?;
        store.conn.execute(
            "INSERT INTO mistakes(primary_key, scope_key, record_key, question_ordinal, count, created_at, updated_at)
             VALUES ('1_0_5_9001_q1_mistake', '1_0_5_9001', 'q1', 1, 1, ?1, ?1)",
            params![stamp],
        )?;

        let notes = store.list_notes_by_scope(&good, Granularity::All)?;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "kept");
        assert_eq!(store.list_notes_by_scope(&good, Granularity::Course)?.len(), 1);
        assert_eq!(store.list_mistakes_by_scope(&good, Granularity::All)?.len(), 1);
        Ok(())
    }

    #[test]
    fn listings_are_ordered_by_updated_at_then_key() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        for name in ["q1", "q2", "q3", "q4"] {
            store.upsert_note(&scope, &record(name)?, name)?;
        }
        store.upsert_note(&scope, &record("q1")?, "edited")?;

        let notes = store.list_notes_by_scope(&scope, Granularity::Exact)?;
        assert_eq!(notes.len(), 4);
        assert!(notes.windows(2).all(|pair| {
            pair[0].updated_at > pair[1].updated_at
                || (pair[0].updated_at == pair[1].updated_at
                    && pair[0].primary_key < pair[1].primary_key)
        }));
        Ok(())
    }

    #[test]
    fn settings_fall_back_to_defaults() -> Result<()> {
        let store = memory_store()?;

        assert_eq!(store.get_setting("autoSaveDelay", json!(1000))?, json!(1000));
        store.set_setting("autoSaveDelay", &json!(250))?;
        assert_eq!(store.get_setting("autoSaveDelay", json!(1000))?, json!(250));
        assert_eq!(store.get_setting_as::<u64>("autoSaveDelay", 1000)?, 250);

        store.set_setting("autoSave", &json!("yes please"))?;
        assert!(store.get_setting_as::<bool>("autoSave", true)?);

        assert!(store.delete_setting("autoSaveDelay")?);
        assert!(!store.delete_setting("autoSaveDelay")?);
        assert_eq!(store.get_setting("autoSaveDelay", json!(1000))?, json!(1000));
        Ok(())
    }

    #[test]
    fn resolved_settings_overlay_stored_values_on_defaults() -> Result<()> {
        let store = memory_store()?;
        store.set_setting("copyPrefix", &json!(">> "))?;
        store.set_setting("custom", &json!({"nested": [1, 2]}))?;

        let defaults =
            BTreeMap::from([("copyPrefix".to_string(), json!("")), ("autoSave".to_string(), json!(true))]);
        let resolved = store.resolved_settings(&defaults)?;

        assert_eq!(resolved.get("copyPrefix"), Some(&json!(">> ")));
        assert_eq!(resolved.get("autoSave"), Some(&json!(true)));
        assert_eq!(resolved.get("custom"), Some(&json!({"nested": [1, 2]})));
        assert_eq!(store.list_all_settings()?.len(), 2);
        Ok(())
    }

    #[test]
    fn batch_delete_counts_missing_keys_as_no_ops() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let mut keys = Vec::new();
        for index in 1..=5 {
            let record = record(&format!("q{index}"))?;
            keys.push(store.upsert_note(&scope, &record, "x")?.primary_key);
        }
        keys.push("101_5_9001_q99".to_string());

        let report = store.delete_notes(&keys);

        assert_eq!(report.succeeded, 5);
        assert_eq!(report.missing, 1);
        assert!(report.is_complete());
        assert!(store.list_notes_by_scope(&scope, Granularity::Exact)?.is_empty());
        Ok(())
    }

    #[test]
    fn batch_delete_collects_per_item_failures() -> Result<()> {
        let store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        for name in ["q1", "q2", "q3"] {
            store.upsert_note(&scope, &record(name)?, "x")?;
        }
        store.conn.execute_batch(
            "CREATE TEMP TRIGGER pin_q2 BEFORE DELETE ON notes
             WHEN old.primary_key = '101_5_9001_q2'
             BEGIN SELECT RAISE(ABORT, 'pinned'); END;",
        )?;

        let report =
            store.delete_notes(&["101_5_9001_q1", "101_5_9001_q2", "not a key", "101_5_9001_q3"]);

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].key, "101_5_9001_q2");
        assert_eq!(report.failures[1].key, "not a key");
        let left = store.list_notes_by_scope(&scope, Granularity::Exact)?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record_key.as_str(), "q2");
        Ok(())
    }

    #[test]
    fn import_notes_keeps_supplied_and_existing_created_at() -> Result<()> {
        let mut store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let existing = store.upsert_note(&scope, &record("q1")?, "local")?;
        let imported_at = OffsetDateTime::parse("2024-03-01T08:30:00.250Z", &Rfc3339)?;

        let report = store.import_notes(&[
            NoteImport {
                scope_key: scope.clone(),
                record_key: record("q1")?,
                content: "imported".to_string(),
                created_at: Some(imported_at),
            },
            NoteImport {
                scope_key: scope.clone(),
                record_key: record("q2")?,
                content: "new".to_string(),
                created_at: Some(imported_at),
            },
        ])?;

        assert_eq!(report.succeeded, 2);
        let q1 = store.get_note(&scope, &record("q1")?)?.ok_or_else(|| anyhow!("q1 missing"))?;
        assert_eq!(q1.content, "imported");
        assert_eq!(q1.created_at, existing.created_at);
        let q2 = store.get_note(&scope, &record("q2")?)?.ok_or_else(|| anyhow!("q2 missing"))?;
        assert_eq!(q2.created_at, imported_at);
        Ok(())
    }

    #[test]
    fn clear_all_removes_every_record() -> Result<()> {
        let mut store = memory_store()?;
        let scope = scope("101", "5", "9001")?;
        let record = record("q1")?;
        store.upsert_note(&scope, &record, "x")?;
        store.increment_mistake(&scope, &record, 1)?;
        store.set_setting("autoSave", &json!(false))?;

        store.clear_all()?;

        assert!(store.list_notes_by_scope(&scope, Granularity::All)?.is_empty());
        assert!(store.list_mistakes_by_scope(&scope, Granularity::All)?.is_empty());
        assert!(store.list_all_settings()?.is_empty());
        Ok(())
    }

    #[test]
    fn reopen_returns_previously_saved_note() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scope = scope("101", "5", "9001")?;
        let record = record("q12")?;
        {
            let store =
                SqliteStore::open_identity(dir.path(), "quiznote", LATEST_SCHEMA_VERSION, DEFAULT_BUSY_TIMEOUT)?;
            store.upsert_note(&scope, &record, "survives restart")?;
        }

        let store =
            SqliteStore::open_identity(dir.path(), "quiznote", LATEST_SCHEMA_VERSION, DEFAULT_BUSY_TIMEOUT)?;
        let note = store.get_note(&scope, &record)?.ok_or_else(|| anyhow!("note missing"))?;
        assert_eq!(note.content, "survives restart");
        assert!(dir.path().join("quiznote.sqlite3").exists());
        Ok(())
    }

    #[test]
    fn upgrade_from_v1_keeps_existing_notes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("legacy.sqlite3");
        let scope = scope("101", "5", "9001")?;
        let record = record("q1")?;
        {
            let store = SqliteStore::open(&path, 1)?;
            store.upsert_note(&scope, &record, "from v1")?;
            assert!(store.increment_mistake(&scope, &record, 1).is_err());
        }

        let store = SqliteStore::open(&path, LATEST_SCHEMA_VERSION)?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert_eq!(store.get_note(&scope, &record)?.map(|note| note.content), Some("from v1".to_string()));
        assert_eq!(store.increment_mistake(&scope, &record, 1)?, 1);
        Ok(())
    }

    #[test]
    fn opening_newer_database_with_older_target_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("quiznote.sqlite3");
        drop(SqliteStore::open(&path, LATEST_SCHEMA_VERSION)?);

        let result = SqliteStore::open(&path, 1);
        assert!(matches!(result, Err(StoreError::SchemaMigration(_))));
        Ok(())
    }

    #[test]
    fn unreachable_directory_reports_storage_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory")?;

        let result = SqliteStore::open(&blocker.join("nested").join("db.sqlite3"), 1);
        let Err(err) = result else {
            return Err(anyhow!("open under a regular file should fail"));
        };
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
        assert!(err.is_unavailable());

        let bad_name =
            SqliteStore::open_identity(dir.path(), "../escape", LATEST_SCHEMA_VERSION, DEFAULT_BUSY_TIMEOUT);
        assert!(matches!(bad_name, Err(StoreError::StorageUnavailable(_))));
        Ok(())
    }

    #[test]
    fn import_from_identity_keeps_existing_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let scope = scope("101", "5", "9001")?;
        let legacy_path = database_path(dir.path(), "quiznote-legacy");
        {
            let legacy = SqliteStore::open(&legacy_path, LATEST_SCHEMA_VERSION)?;
            legacy.upsert_note(&scope, &record("q1")?, "old q1")?;
            legacy.upsert_note(&scope, &record("q2")?, "old q2")?;
            legacy.increment_mistake(&scope, &record("q2")?, 2)?;
            legacy.increment_mistake(&scope, &record("q2")?, 2)?;
            legacy.set_setting("autoSave", &json!(false))?;
            legacy.set_setting("copyPrefix", &json!("old"))?;
        }

        let mut store = SqliteStore::open(&dir.path().join("quiznote.sqlite3"), LATEST_SCHEMA_VERSION)?;
        store.upsert_note(&scope, &record("q1")?, "new q1")?;
        store.set_setting("copyPrefix", &json!("new"))?;

        let summary = store.import_from_identity(&legacy_path)?;

        assert_eq!(
            summary,
            IdentityImportSummary {
                imported_notes: 1,
                skipped_notes: 1,
                imported_mistakes: 1,
                skipped_mistakes: 0,
                imported_settings: 1,
                skipped_settings: 1,
            }
        );
        let q1 = store.get_note(&scope, &record("q1")?)?.ok_or_else(|| anyhow!("q1 missing"))?;
        assert_eq!(q1.content, "new q1");
        assert_eq!(store.get_mistake(&scope, &record("q2")?)?.map(|counter| counter.count), Some(2));
        assert_eq!(store.get_setting("copyPrefix", Value::Null)?, json!("new"));
        assert_eq!(store.get_setting("autoSave", Value::Null)?, json!(false));

        let missing = store.import_from_identity(&dir.path().join("nope.sqlite3"));
        assert!(matches!(missing, Err(StoreError::StorageUnavailable(_))));
        Ok(())
    }

    #[test]
    fn parse_note_key_round_trips_codec_output() -> Result<()> {
        let scope = ScopeKey::from_page_path("/mooc/work");
        let record = record("q4")?;
        assert_eq!(parse_note_key(&note_key(&scope, &record))?, (scope, record));
        assert!(matches!(parse_note_key("q4"), Err(StoreError::Validation(_))));
        Ok(())
    }

    #[test]
    fn timestamps_are_fixed_width_utc() -> Result<()> {
        let value = OffsetDateTime::parse("2024-03-01T08:30:00Z", &Rfc3339)?;
        assert_eq!(format_timestamp(value)?, "2024-03-01T08:30:00.000Z");
        assert_eq!(now_timestamp()?.len(), "2024-03-01T08:30:00.000Z".len());
        Ok(())
    }

    #[test]
    fn concurrent_increments_are_not_lost() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("quiznote.sqlite3");
        drop(SqliteStore::open(&path, LATEST_SCHEMA_VERSION)?);

        let threads = 4;
        let increments_per_thread = 25;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let path = path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&path, LATEST_SCHEMA_VERSION)?;
                let scope = scope("101", "5", "9001")?;
                let record = record("q1")?;
                for _ in 0..increments_per_thread {
                    store.increment_mistake(&scope, &record, 1)?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("increment thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&path, LATEST_SCHEMA_VERSION)?;
        let counter = store
            .get_mistake(&scope("101", "5", "9001")?, &record("q1")?)?
            .ok_or_else(|| anyhow!("counter missing"))?;
        assert_eq!(counter.count, threads * increments_per_thread);
        Ok(())
    }
}
