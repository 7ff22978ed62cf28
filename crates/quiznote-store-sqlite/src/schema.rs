//! Versioned, additive schema management.
//!
//! Each [`MigrationStep`] only creates tables or indexes, always with
//! `IF NOT EXISTS`. On open, every step newer than the on-disk version and no
//! newer than the requested target runs inside one immediate transaction,
//! together with its `schema_migrations` row. A verification pass then checks
//! that every object promised by the applied steps exists and re-runs the
//! owning step when one is missing.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{now_timestamp, StoreError};

pub const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notes (
  primary_key TEXT PRIMARY KEY NOT NULL,
  scope_key TEXT NOT NULL,
  record_key TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY NOT NULL,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notes_scope_key ON notes(scope_key);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mistakes (
  primary_key TEXT PRIMARY KEY NOT NULL,
  scope_key TEXT NOT NULL,
  record_key TEXT NOT NULL,
  question_ordinal INTEGER NOT NULL CHECK (question_ordinal >= 0),
  count INTEGER NOT NULL CHECK (count >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mistakes_scope_key ON mistakes(scope_key);
";

const MIGRATION_003_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes(updated_at);
CREATE INDEX IF NOT EXISTS idx_mistakes_updated_at ON mistakes(updated_at);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaObject {
    Table(&'static str),
    Index(&'static str),
}

impl SchemaObject {
    fn kind(self) -> &'static str {
        match self {
            Self::Table(_) => "table",
            Self::Index(_) => "index",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Table(name) | Self::Index(name) => name,
        }
    }
}

#[derive(Debug)]
pub struct MigrationStep {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub creates: &'static [SchemaObject],
}

pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        description: "notes and settings",
        sql: MIGRATION_001_SQL,
        creates: &[
            SchemaObject::Table("notes"),
            SchemaObject::Table("settings"),
            SchemaObject::Index("idx_notes_scope_key"),
        ],
    },
    MigrationStep {
        version: 2,
        description: "mistake counters",
        sql: MIGRATION_002_SQL,
        creates: &[SchemaObject::Table("mistakes"), SchemaObject::Index("idx_mistakes_scope_key")],
    },
    MigrationStep {
        version: 3,
        description: "updated_at ordering indexes",
        sql: MIGRATION_003_SQL,
        creates: &[
            SchemaObject::Index("idx_notes_updated_at"),
            SchemaObject::Index("idx_mistakes_updated_at"),
        ],
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub latest_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from_version: i64,
    pub to_version: i64,
    pub applied_versions: Vec<i64>,
    /// Steps whose objects were missing despite being recorded as applied.
    pub repaired_versions: Vec<i64>,
}

/// Bring the schema up to `target_version` atomically.
///
/// # Errors
/// Returns [`StoreError::SchemaMigration`] when the target is unsupported, the
/// on-disk schema is newer than the target, or any step fails. Nothing from a
/// failed run is committed.
pub fn migrate(conn: &mut Connection, target_version: i64) -> Result<MigrationOutcome, StoreError> {
    check_target_version(target_version)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| migration_error("failed to start migration transaction", &err))?;

    tx.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .map_err(|err| migration_error("failed to apply schema_migrations table", &err))?;

    let from_version = current_schema_version(&tx)?;
    if from_version > target_version {
        return Err(StoreError::SchemaMigration(format!(
            "on-disk schema version {from_version} is newer than requested version {target_version}"
        )));
    }

    let mut applied_versions = Vec::new();
    for step in pending_steps(from_version, target_version) {
        tx.execute_batch(step.sql).map_err(|err| {
            migration_error(&format!("failed to apply migration v{}", step.version), &err)
        })?;
        record_schema_version(&tx, step.version)?;
        info!(version = step.version, description = step.description, "applied schema migration");
        applied_versions.push(step.version);
    }

    let mut repaired_versions = Vec::new();
    for step in MIGRATIONS.iter().filter(|step| step.version <= target_version) {
        if missing_objects(&tx, step)?.is_empty() {
            continue;
        }
        warn!(version = step.version, "schema objects missing; re-running migration step");
        tx.execute_batch(step.sql).map_err(|err| {
            migration_error(&format!("failed to repair migration v{}", step.version), &err)
        })?;
        let still_missing = missing_objects(&tx, step)?;
        if !still_missing.is_empty() {
            return Err(StoreError::SchemaMigration(format!(
                "migration v{} did not create {}",
                step.version,
                still_missing.join(", ")
            )));
        }
        repaired_versions.push(step.version);
    }

    tx.commit().map_err(|err| migration_error("failed to commit migration", &err))?;

    Ok(MigrationOutcome {
        from_version,
        to_version: target_version,
        applied_versions,
        repaired_versions,
    })
}

/// Report current and target versions without changing anything.
///
/// # Errors
/// Returns an error when schema metadata cannot be read.
pub fn schema_status(conn: &Connection, target_version: i64) -> Result<SchemaStatus, StoreError> {
    let current_version = if table_exists(conn, "schema_migrations")? {
        current_schema_version(conn)?
    } else {
        0
    };
    let pending_versions = pending_steps(current_version, target_version)
        .map(|step| step.version)
        .collect::<Vec<_>>();

    Ok(SchemaStatus {
        current_version,
        target_version,
        latest_version: LATEST_SCHEMA_VERSION,
        pending_versions,
    })
}

/// # Errors
/// Returns an error when the existence query fails.
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    object_exists(conn, "table", table_name)
}

fn check_target_version(target_version: i64) -> Result<(), StoreError> {
    if (1..=LATEST_SCHEMA_VERSION).contains(&target_version) {
        Ok(())
    } else {
        Err(StoreError::SchemaMigration(format!(
            "unsupported schema version {target_version}; this build supports 1..={LATEST_SCHEMA_VERSION}"
        )))
    }
}

fn pending_steps(from_version: i64, target_version: i64) -> impl Iterator<Item = &'static MigrationStep> {
    MIGRATIONS
        .iter()
        .filter(move |step| step.version > from_version && step.version <= target_version)
}

fn missing_objects(conn: &Connection, step: &MigrationStep) -> Result<Vec<&'static str>, StoreError> {
    let mut missing = Vec::new();
    for object in step.creates {
        if !object_exists(conn, object.kind(), object.name())? {
            missing.push(object.name());
        }
    }
    Ok(missing)
}

fn object_exists(conn: &Connection, kind: &str, name: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2 LIMIT 1",
            params![kind, name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|err| migration_error("failed to inspect sqlite_master", &err))?;
    Ok(exists.is_some())
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|err| migration_error("failed to read schema version", &err))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_timestamp()?],
    )
    .map_err(|err| migration_error(&format!("failed to record migration version {version}"), &err))?;
    Ok(())
}

fn migration_error(context: &str, err: &rusqlite::Error) -> StoreError {
    StoreError::SchemaMigration(format!("{context}: {err}"))
}
