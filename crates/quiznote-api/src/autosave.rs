//! Debounced note saving for a single editor.
//!
//! Each [`AutoSaver::schedule`] call replaces the pending content and restarts
//! the delay, so a burst of keystrokes produces one write once typing pauses.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quiznote_core::{setting_keys, Note, RecordKey, ScopeKey, SettingDefaults};
use quiznote_store_sqlite::{StoreError, StoreResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::NoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSavePolicy {
    pub enabled: bool,
    pub delay: Duration,
}

impl AutoSavePolicy {
    #[must_use]
    pub fn from_defaults(defaults: &SettingDefaults) -> Self {
        Self {
            enabled: defaults.auto_save,
            delay: Duration::from_millis(defaults.auto_save_delay_ms),
        }
    }

    /// Stored `autoSave` / `autoSaveDelay` settings over the configured
    /// defaults. A store that cannot be read yields the defaults.
    pub async fn load(store: &NoteStore) -> Self {
        let defaults = &store.config().defaults;
        let enabled = store
            .get_setting_as(setting_keys::AUTO_SAVE, defaults.auto_save)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed to read autoSave setting; using default");
                defaults.auto_save
            });
        let delay_ms = store
            .get_setting_as(setting_keys::AUTO_SAVE_DELAY, defaults.auto_save_delay_ms)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed to read autoSaveDelay setting; using default");
                defaults.auto_save_delay_ms
            });
        Self { enabled, delay: Duration::from_millis(delay_ms) }
    }
}

pub struct AutoSaver {
    store: Arc<NoteStore>,
    scope: ScopeKey,
    record: RecordKey,
    policy: AutoSavePolicy,
    pending: Arc<Mutex<Option<String>>>,
    timer: Mutex<Option<JoinHandle<StoreResult<Option<Note>>>>>,
}

impl AutoSaver {
    #[must_use]
    pub fn new(
        store: Arc<NoteStore>,
        scope: ScopeKey,
        record: RecordKey,
        policy: AutoSavePolicy,
    ) -> Self {
        Self {
            store,
            scope,
            record,
            policy,
            pending: Arc::new(Mutex::new(None)),
            timer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn policy(&self) -> AutoSavePolicy {
        self.policy
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Remember `content` and restart the save timer. With auto-save disabled
    /// the content only waits for [`AutoSaver::flush`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, content: impl Into<String>) {
        *self.pending.lock() = Some(content.into());

        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        if !self.policy.enabled {
            return;
        }

        let store = Arc::clone(&self.store);
        let scope = self.scope.clone();
        let record = self.record.clone();
        let pending = Arc::clone(&self.pending);
        let delay = self.policy.delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(content) = pending.lock().take() else {
                return Ok(None);
            };
            match store.upsert_note(&scope, &record, content).await {
                Ok(note) => {
                    debug!(primary_key = %note.primary_key, "auto-saved note");
                    Ok(Some(note))
                }
                Err(err) => {
                    warn!(scope = %scope, record = %record, error = %err, "auto-save failed");
                    Err(err)
                }
            }
        }));
    }

    /// Save pending content now. When a timer has already picked the content
    /// up, wait for that save and return its outcome instead.
    ///
    /// # Errors
    /// Returns the store error when the immediate save, or the timer's save it
    /// waited for, fails.
    pub async fn flush(&self) -> StoreResult<Option<Note>> {
        let timer = self.timer.lock().take();
        let content = self.pending.lock().take();
        match (content, timer) {
            (Some(content), timer) => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                self.store.upsert_note(&self.scope, &self.record, content).await.map(Some)
            }
            (None, Some(timer)) => timer
                .await
                .map_err(|err| StoreError::io("auto_save", format!("auto-save task failed: {err}")))?,
            (None, None) => Ok(None),
        }
    }

    /// Drop pending content without saving it.
    pub fn cancel(&self) -> Option<String> {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.pending.lock().take()
    }
}
