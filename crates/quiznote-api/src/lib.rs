//! Async handle over the SQLite note store.
//!
//! [`NoteStore`] is created unopened. Every operation is forwarded to the
//! store thread and bounded by `storage.operation_timeout_ms`. Before
//! [`NoteStore::open`] succeeds operations fail with
//! [`StoreError::NotInitialized`]; after a failed open they fail with
//! [`StoreError::StorageUnavailable`] so callers can degrade the feature.

use std::collections::BTreeMap;
use std::time::Duration;

use quiznote_core::config::{database_path, validate_database_name};
use quiznote_core::{
    BatchReport, Granularity, MistakeCounter, Note, NoteImport, QuizNoteConfig, RecordKey,
    ScopeKey, Setting,
};
use quiznote_store_sqlite::{IdentityImportSummary, SchemaStatus, SqliteStore, StoreResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod autosave;
mod executor;

pub use autosave::{AutoSavePolicy, AutoSaver};
pub use quiznote_store_sqlite::StoreError;

use executor::{ExecutorError, OpenRequest, StoreExecutor};

pub const API_CONTRACT_VERSION: &str = "api.v1";

enum HandleState {
    NotOpened,
    Unavailable(String),
    Ready(StoreExecutor),
}

pub struct NoteStore {
    config: QuizNoteConfig,
    state: RwLock<HandleState>,
}

impl NoteStore {
    #[must_use]
    pub fn new(config: QuizNoteConfig) -> Self {
        Self { config, state: RwLock::new(HandleState::NotOpened) }
    }

    #[must_use]
    pub fn config(&self) -> &QuizNoteConfig {
        &self.config
    }

    /// Open the configured database identity and migrate it to the configured
    /// schema version. Opening an already open handle does nothing.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` or `SchemaMigration` when the database
    /// cannot be opened; the handle then stays unavailable until the next
    /// successful `open`.
    pub async fn open(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if matches!(*state, HandleState::Ready(_)) {
            return Ok(());
        }

        let request = OpenRequest {
            data_dir: self.config.database.data_dir.clone(),
            name: self.config.database.name.clone(),
            target_version: self.config.database.version,
            busy_timeout: Duration::from_millis(self.config.storage.busy_timeout_ms),
        };
        let opened = match tokio::time::timeout(self.operation_timeout(), StoreExecutor::open(request))
            .await
        {
            Ok(Ok(opened)) => opened,
            Ok(Err(err)) => Err(StoreError::StorageUnavailable(err.to_string())),
            Err(_) => Err(StoreError::StorageUnavailable(format!(
                "open timed out after {} ms",
                self.config.storage.operation_timeout_ms
            ))),
        };

        match opened {
            Ok(executor) => {
                info!(name = %self.config.database.name, "note store ready");
                *state = HandleState::Ready(executor);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "note store unavailable; persistence is degraded");
                *state = HandleState::Unavailable(err.to_string());
                Err(err)
            }
        }
    }

    /// Close the connection. Later operations fail with `NotInitialized`.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write().await, HandleState::NotOpened);
        if let HandleState::Ready(executor) = previous {
            executor.shutdown().await;
            info!("note store closed");
        }
    }

    pub async fn is_available(&self) -> bool {
        matches!(*self.state.read().await, HandleState::Ready(_))
    }

    /// # Errors
    /// See [`SqliteStore::upsert_note`].
    pub async fn upsert_note(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
        content: impl Into<String>,
    ) -> StoreResult<Note> {
        let (scope, record, content) = (scope.clone(), record.clone(), content.into());
        self.run("upsert_note", move |store| store.upsert_note(&scope, &record, &content)).await
    }

    /// # Errors
    /// See [`SqliteStore::get_note`].
    pub async fn get_note(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<Option<Note>> {
        let (scope, record) = (scope.clone(), record.clone());
        self.run("get_note", move |store| store.get_note(&scope, &record)).await
    }

    /// # Errors
    /// See [`SqliteStore::delete_note`].
    pub async fn delete_note(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<bool> {
        let (scope, record) = (scope.clone(), record.clone());
        self.run("delete_note", move |store| store.delete_note(&scope, &record)).await
    }

    /// Per-key failures are reported in the [`BatchReport`], never as an error.
    ///
    /// # Errors
    /// Returns an error only when the store itself cannot be reached.
    pub async fn delete_notes(&self, primary_keys: Vec<String>) -> StoreResult<BatchReport> {
        self.run("delete_notes", move |store| Ok(store.delete_notes(&primary_keys))).await
    }

    /// # Errors
    /// See [`SqliteStore::list_notes_by_scope`].
    pub async fn list_notes_by_scope(
        &self,
        scope: &ScopeKey,
        granularity: Granularity,
    ) -> StoreResult<Vec<Note>> {
        let scope = scope.clone();
        self.run("list_notes_by_scope", move |store| store.list_notes_by_scope(&scope, granularity))
            .await
    }

    /// # Errors
    /// See [`SqliteStore::import_notes`].
    pub async fn import_notes(&self, notes: Vec<NoteImport>) -> StoreResult<BatchReport> {
        self.run("import_notes", move |store| store.import_notes(&notes)).await
    }

    /// # Errors
    /// See [`SqliteStore::increment_mistake`].
    pub async fn increment_mistake(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
        question_ordinal: u32,
    ) -> StoreResult<u32> {
        let (scope, record) = (scope.clone(), record.clone());
        self.run("increment_mistake", move |store| {
            store.increment_mistake(&scope, &record, question_ordinal)
        })
        .await
    }

    /// # Errors
    /// See [`SqliteStore::get_mistake`].
    pub async fn get_mistake(
        &self,
        scope: &ScopeKey,
        record: &RecordKey,
    ) -> StoreResult<Option<MistakeCounter>> {
        let (scope, record) = (scope.clone(), record.clone());
        self.run("get_mistake", move |store| store.get_mistake(&scope, &record)).await
    }

    /// # Errors
    /// See [`SqliteStore::reset_mistake`].
    pub async fn reset_mistake(&self, scope: &ScopeKey, record: &RecordKey) -> StoreResult<bool> {
        let (scope, record) = (scope.clone(), record.clone());
        self.run("reset_mistake", move |store| store.reset_mistake(&scope, &record)).await
    }

    /// # Errors
    /// See [`SqliteStore::list_mistakes_by_scope`].
    pub async fn list_mistakes_by_scope(
        &self,
        scope: &ScopeKey,
        granularity: Granularity,
    ) -> StoreResult<Vec<MistakeCounter>> {
        let scope = scope.clone();
        self.run("list_mistakes_by_scope", move |store| {
            store.list_mistakes_by_scope(&scope, granularity)
        })
        .await
    }

    /// # Errors
    /// See [`SqliteStore::get_setting`].
    pub async fn get_setting(&self, key: &str, default: Value) -> StoreResult<Value> {
        let key = key.to_string();
        self.run("get_setting", move |store| store.get_setting(&key, default)).await
    }

    /// # Errors
    /// See [`SqliteStore::get_setting_as`].
    pub async fn get_setting_as<T>(&self, key: &str, default: T) -> StoreResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.run("get_setting", move |store| store.get_setting_as(&key, default)).await
    }

    /// # Errors
    /// See [`SqliteStore::set_setting`].
    pub async fn set_setting(&self, key: &str, value: Value) -> StoreResult<Setting> {
        let key = key.to_string();
        self.run("set_setting", move |store| store.set_setting(&key, &value)).await
    }

    /// # Errors
    /// See [`SqliteStore::delete_setting`].
    pub async fn delete_setting(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.run("delete_setting", move |store| store.delete_setting(&key)).await
    }

    /// # Errors
    /// See [`SqliteStore::list_all_settings`].
    pub async fn list_all_settings(&self) -> StoreResult<BTreeMap<String, Value>> {
        self.run("list_all_settings", |store| store.list_all_settings()).await
    }

    /// Stored settings over the configured defaults.
    ///
    /// # Errors
    /// See [`SqliteStore::resolved_settings`].
    pub async fn resolved_settings(&self) -> StoreResult<BTreeMap<String, Value>> {
        let defaults = self.config.defaults.to_setting_map();
        self.run("resolved_settings", move |store| store.resolved_settings(&defaults)).await
    }

    /// # Errors
    /// See [`SqliteStore::clear_all`].
    pub async fn clear_all(&self) -> StoreResult<()> {
        self.run("clear_all", |store| store.clear_all()).await
    }

    /// # Errors
    /// See [`SqliteStore::schema_status`].
    pub async fn schema_status(&self) -> StoreResult<SchemaStatus> {
        self.run("schema_status", |store| store.schema_status()).await
    }

    /// Copy records from the older identity `old_name` in the same data
    /// directory.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` for an unusable or missing identity, see
    /// also [`SqliteStore::import_from_identity`].
    pub async fn import_from_identity(&self, old_name: &str) -> StoreResult<IdentityImportSummary> {
        validate_database_name(old_name)
            .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
        let legacy_path = database_path(&self.config.database.data_dir, old_name);
        self.run("import_from_identity", move |store| store.import_from_identity(&legacy_path))
            .await
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.storage.operation_timeout_ms)
    }

    /// A job that outlives its timeout still runs to completion on the store
    /// thread; only the caller stops waiting for it.
    async fn run<F, T>(&self, operation: &'static str, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut SqliteStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (executor_id, outcome) = {
            let state = self.state.read().await;
            let executor = match &*state {
                HandleState::NotOpened => return Err(StoreError::NotInitialized),
                HandleState::Unavailable(reason) => {
                    return Err(StoreError::StorageUnavailable(reason.clone()))
                }
                HandleState::Ready(executor) => executor,
            };
            (executor.id(), tokio::time::timeout(self.operation_timeout(), executor.run(op)).await)
        };

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(operation, error = %err, "store executor stopped; persistence is degraded");
                Err(self.mark_stopped(executor_id, &err).await)
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.config.storage.operation_timeout_ms,
                    "store operation timed out"
                );
                Err(StoreError::io(
                    operation,
                    format!("timed out after {} ms", self.config.storage.operation_timeout_ms),
                ))
            }
        }
    }

    /// Replace a dead executor with `Unavailable`. An executor opened after
    /// `executor_id` died is left alone.
    async fn mark_stopped(&self, executor_id: u64, err: &ExecutorError) -> StoreError {
        let reason = err.to_string();
        let mut state = self.state.write().await;
        let is_current =
            matches!(&*state, HandleState::Ready(executor) if executor.id() == executor_id);
        if is_current {
            let previous =
                std::mem::replace(&mut *state, HandleState::Unavailable(reason.clone()));
            drop(state);
            if let HandleState::Ready(executor) = previous {
                executor.shutdown().await;
            }
        }
        StoreError::StorageUnavailable(reason)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use serde_json::json;

    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> QuizNoteConfig {
        let mut config = QuizNoteConfig::default();
        config.database.data_dir = dir.path().to_path_buf();
        config
    }

    fn scope() -> Result<ScopeKey> {
        Ok(ScopeKey::assignment("101", "5", "9001")?)
    }

    fn record(value: &str) -> Result<RecordKey> {
        Ok(RecordKey::new(value)?)
    }

    #[tokio::test]
    async fn operations_before_open_report_not_initialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = NoteStore::new(config_in(&dir));

        let result = store.get_note(&scope()?, &record("q1")?).await;
        assert!(matches!(result, Err(StoreError::NotInitialized)));
        assert!(!store.is_available().await);
        Ok(())
    }

    #[tokio::test]
    async fn open_upsert_close_reopen_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config_in(&dir);
        {
            let store = NoteStore::new(config.clone());
            store.open().await?;
            store.open().await?;
            store.upsert_note(&scope()?, &record("q12")?, "persisted").await?;
            store.close().await;
            let closed = store.get_note(&scope()?, &record("q12")?).await;
            assert!(matches!(closed, Err(StoreError::NotInitialized)));
        }

        let store = NoteStore::new(config);
        store.open().await?;
        let note =
            store.get_note(&scope()?, &record("q12")?).await?.ok_or_else(|| anyhow!("note missing"))?;
        assert_eq!(note.content, "persisted");
        Ok(())
    }

    #[tokio::test]
    async fn failed_open_degrades_to_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not directory")?;
        let mut config = config_in(&dir);
        config.database.data_dir = blocker.join("nested");
        let store = NoteStore::new(config);

        let opened = store.open().await;
        assert!(matches!(opened, Err(StoreError::StorageUnavailable(_))));
        assert!(!store.is_available().await);

        let result = store.set_setting("autoSave", json!(true)).await;
        let Err(err) = result else {
            return Err(anyhow!("operations on an unavailable store should fail"));
        };
        assert!(err.is_unavailable());
        Ok(())
    }

    #[tokio::test]
    async fn slow_operation_times_out_as_storage_io() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config_in(&dir);
        config.storage.operation_timeout_ms = 50;
        let store = NoteStore::new(config);
        store.open().await?;

        let result = store
            .run("slow_probe", |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .await;

        let Err(StoreError::StorageIo { operation, message }) = result else {
            return Err(anyhow!("expected a storage I/O timeout"));
        };
        assert_eq!(operation, "slow_probe");
        assert!(message.contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn crashed_store_thread_degrades_to_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = NoteStore::new(config_in(&dir));
        store.open().await?;
        store.upsert_note(&scope()?, &record("q1")?, "before crash").await?;

        let crashed = store
            .run("crashing_job", |_| -> StoreResult<()> { panic!("job failure") })
            .await;
        assert!(matches!(crashed, Err(StoreError::StorageUnavailable(_))));
        assert!(!store.is_available().await);

        let after = store.get_note(&scope()?, &record("q1")?).await;
        assert!(matches!(after, Err(StoreError::StorageUnavailable(_))));

        store.open().await?;
        let note = store
            .get_note(&scope()?, &record("q1")?)
            .await?
            .ok_or_else(|| anyhow!("note missing after reopen"))?;
        assert_eq!(note.content, "before crash");
        Ok(())
    }

    #[tokio::test]
    async fn resolved_settings_use_configured_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = config_in(&dir);
        config.defaults.export_format = "md".to_string();
        let store = NoteStore::new(config);
        store.open().await?;
        store.set_setting("copyPrefix", json!("Q: ")).await?;

        let resolved = store.resolved_settings().await?;
        assert_eq!(resolved.get("exportFormat"), Some(&json!("md")));
        assert_eq!(resolved.get("copyPrefix"), Some(&json!("Q: ")));
        assert_eq!(resolved.get("autoSave"), Some(&json!(true)));
        Ok(())
    }

    #[tokio::test]
    async fn import_from_identity_reads_sibling_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut legacy_config = config_in(&dir);
        legacy_config.database.name = "quiznote-legacy".to_string();
        let legacy = NoteStore::new(legacy_config);
        legacy.open().await?;
        legacy.upsert_note(&scope()?, &record("q1")?, "legacy").await?;
        legacy.increment_mistake(&scope()?, &record("q1")?, 1).await?;
        legacy.close().await;

        let store = NoteStore::new(config_in(&dir));
        store.open().await?;
        let summary = store.import_from_identity("quiznote-legacy").await?;

        assert_eq!(summary.imported_notes, 1);
        assert_eq!(summary.imported_mistakes, 1);
        let notes = store.list_notes_by_scope(&scope()?, Granularity::All).await?;
        assert_eq!(notes.len(), 1);
        assert!(store.import_from_identity("../outside").await.is_err());
        Ok(())
    }
}
