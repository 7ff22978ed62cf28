use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quiznote_api::NoteStore;
use quiznote_core::{Granularity, NoteImport, QuizNoteConfig, RecordKey, ScopeKey};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "qn")]
#[command(about = "QuizNote storage CLI")]
struct Cli {
    /// JSON config file merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Database identity; the file is `<data-dir>/<name>.sqlite3`.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    schema_version: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
    Mistake {
        #[command(subcommand)]
        command: MistakeCommand,
    },
    Setting {
        #[command(subcommand)]
        command: SettingCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    ClearAll {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    ImportIdentity {
        #[arg(long = "from")]
        from_name: String,
    },
}

#[derive(Debug, Subcommand)]
enum NoteCommand {
    Put {
        #[command(flatten)]
        target: RecordArgs,
        #[arg(long)]
        content: String,
    },
    Get(RecordArgs),
    Delete(RecordArgs),
    DeleteMany {
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
    List(ListArgs),
    Import {
        /// JSON array of `{scope_key, record_key, content, created_at?}`.
        #[arg(long = "in")]
        input: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum MistakeCommand {
    Incr {
        #[command(flatten)]
        target: RecordArgs,
        #[arg(long)]
        ordinal: u32,
    },
    Get(RecordArgs),
    Reset(RecordArgs),
    List(ListArgs),
}

#[derive(Debug, Subcommand)]
enum SettingCommand {
    Get {
        #[arg(long)]
        key: String,
        /// JSON value returned when the key was never set.
        #[arg(long, default_value = "null")]
        default: String,
    },
    Set {
        #[arg(long)]
        key: String,
        /// JSON value; bare words are stored as strings.
        #[arg(long)]
        value: String,
    },
    Delete {
        #[arg(long)]
        key: String,
    },
    List {
        /// Include configured defaults for keys that were never set.
        #[arg(long, default_value_t = false)]
        resolved: bool,
    },
}

#[derive(Debug, Args)]
struct ScopeArgs {
    /// Serialized scope token, e.g. `101_5_9001` or `page_2p`.
    #[arg(long)]
    scope: Option<String>,
    #[arg(long)]
    course: Option<String>,
    #[arg(long)]
    class: Option<String>,
    #[arg(long)]
    assignment: Option<String>,
    /// Fallback when any of course/class/assignment is missing.
    #[arg(long)]
    page_path: Option<String>,
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    record: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum, default_value_t = GranularityArg::Exact)]
    granularity: GranularityArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GranularityArg {
    Exact,
    Course,
    Class,
    All,
}

impl GranularityArg {
    fn into_granularity(self) -> Granularity {
        match self {
            Self::Exact => Granularity::Exact,
            Self::Course => Granularity::Course,
            Self::Class => Granularity::Class,
            Self::All => Granularity::All,
        }
    }
}

impl ScopeArgs {
    fn resolve(&self) -> Result<ScopeKey> {
        if let Some(token) = &self.scope {
            return ScopeKey::parse(token).with_context(|| format!("invalid --scope {token:?}"));
        }
        if let (Some(course), Some(class), Some(assignment)) =
            (&self.course, &self.class, &self.assignment)
        {
            return ScopeKey::assignment(course.as_str(), class.as_str(), assignment.as_str())
                .context("invalid assignment scope");
        }
        let page_path = self.page_path.as_deref().ok_or_else(|| {
            anyhow!("pass --scope, all of --course/--class/--assignment, or --page-path")
        })?;
        Ok(ScopeKey::derive(
            self.course.as_deref(),
            self.class.as_deref(),
            self.assignment.as_deref(),
            page_path,
        ))
    }
}

impl RecordArgs {
    fn resolve(&self) -> Result<(ScopeKey, RecordKey)> {
        let record = RecordKey::new(self.record.as_str())
            .with_context(|| format!("invalid --record {:?}", self.record))?;
        Ok((self.scope.resolve()?, record))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(cli: &Cli) -> Result<QuizNoteConfig> {
    let base = match &cli.config {
        Some(path) => QuizNoteConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => QuizNoteConfig::default(),
    };

    let mut database = Map::new();
    if let Some(data_dir) = &cli.data_dir {
        database.insert(
            "data_dir".to_string(),
            Value::String(data_dir.to_string_lossy().into_owned()),
        );
    }
    if let Some(name) = &cli.name {
        database.insert("name".to_string(), json!(name));
    }
    if let Some(version) = cli.schema_version {
        database.insert("version".to_string(), json!(version));
    }
    base.merged(&json!({ "database": database })).context("invalid configuration")
}

/// Plain words are accepted as JSON strings so `--value docx` works unquoted.
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let store = NoteStore::new(config);
    store.open().await.context("failed to open note store")?;
    let result = match cli.command {
        Command::Db { command } => run_db(command, &store).await,
        Command::Note { command } => run_note(command, &store).await,
        Command::Mistake { command } => run_mistake(command, &store).await,
        Command::Setting { command } => run_setting(command, &store).await,
    };
    store.close().await;
    result
}

async fn run_db(command: DbCommand, store: &NoteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status().await?;
            emit_json(json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "latest_version": status.latest_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::ClearAll { yes } => {
            if !yes {
                bail!("refusing to clear all records without --yes");
            }
            store.clear_all().await?;
            emit_json(json!({ "cleared": true }))
        }
        DbCommand::ImportIdentity { from_name } => {
            let summary = store
                .import_from_identity(&from_name)
                .await
                .with_context(|| format!("failed to import identity {from_name}"))?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize import summary")?)
        }
    }
}

async fn run_note(command: NoteCommand, store: &NoteStore) -> Result<()> {
    match command {
        NoteCommand::Put { target, content } => {
            let (scope, record) = target.resolve()?;
            let note = store.upsert_note(&scope, &record, content).await?;
            emit_json(serde_json::to_value(&note).context("failed to serialize note")?)
        }
        NoteCommand::Get(target) => {
            let (scope, record) = target.resolve()?;
            let note = store.get_note(&scope, &record).await?;
            emit_json(json!({ "found": note.is_some(), "note": note }))
        }
        NoteCommand::Delete(target) => {
            let (scope, record) = target.resolve()?;
            let deleted = store.delete_note(&scope, &record).await?;
            emit_json(json!({ "deleted": deleted }))
        }
        NoteCommand::DeleteMany { keys } => {
            let report = store.delete_notes(keys).await?;
            emit_json(serde_json::to_value(&report).context("failed to serialize batch report")?)
        }
        NoteCommand::List(args) => {
            let scope = args.scope.resolve()?;
            let granularity = args.granularity.into_granularity();
            let notes = store.list_notes_by_scope(&scope, granularity).await?;
            emit_json(json!({
                "scope": scope,
                "granularity": granularity,
                "notes": notes
            }))
        }
        NoteCommand::Import { input } => {
            let body = fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let notes: Vec<NoteImport> = serde_json::from_str(&body)
                .with_context(|| format!("invalid note import file {}", input.display()))?;
            let report = store.import_notes(notes).await?;
            emit_json(serde_json::to_value(&report).context("failed to serialize batch report")?)
        }
    }
}

async fn run_mistake(command: MistakeCommand, store: &NoteStore) -> Result<()> {
    match command {
        MistakeCommand::Incr { target, ordinal } => {
            let (scope, record) = target.resolve()?;
            let count = store.increment_mistake(&scope, &record, ordinal).await?;
            emit_json(json!({
                "primary_key": quiznote_core::mistake_key(&scope, &record),
                "count": count
            }))
        }
        MistakeCommand::Get(target) => {
            let (scope, record) = target.resolve()?;
            let counter = store.get_mistake(&scope, &record).await?;
            emit_json(json!({ "found": counter.is_some(), "mistake": counter }))
        }
        MistakeCommand::Reset(target) => {
            let (scope, record) = target.resolve()?;
            let reset = store.reset_mistake(&scope, &record).await?;
            emit_json(json!({ "reset": reset }))
        }
        MistakeCommand::List(args) => {
            let scope = args.scope.resolve()?;
            let granularity = args.granularity.into_granularity();
            let mistakes = store.list_mistakes_by_scope(&scope, granularity).await?;
            emit_json(json!({
                "scope": scope,
                "granularity": granularity,
                "mistakes": mistakes
            }))
        }
    }
}

async fn run_setting(command: SettingCommand, store: &NoteStore) -> Result<()> {
    match command {
        SettingCommand::Get { key, default } => {
            let value = store.get_setting(&key, parse_json_arg(&default)).await?;
            emit_json(json!({ "key": key, "value": value }))
        }
        SettingCommand::Set { key, value } => {
            let setting = store.set_setting(&key, parse_json_arg(&value)).await?;
            emit_json(serde_json::to_value(&setting).context("failed to serialize setting")?)
        }
        SettingCommand::Delete { key } => {
            let deleted = store.delete_setting(&key).await?;
            emit_json(json!({ "key": key, "deleted": deleted }))
        }
        SettingCommand::List { resolved } => {
            let settings = if resolved {
                store.resolved_settings().await?
            } else {
                store.list_all_settings().await?
            };
            emit_json(json!({ "resolved": resolved, "settings": settings }))
        }
    }
}
