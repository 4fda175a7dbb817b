use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scope_kernel_core::{
    CancellationFlag, ScopeDiagnostics, ScopePathBuilder, ScopePathProjection, ScopeToken,
};
use scope_kernel_store_sqlite::{
    BackfillConfig, SqliteRecordStore, LATEST_SCHEMA_VERSION,
};
use serde_json::Value;
use uuid::Uuid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_MAX_BATCHES: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "Scope Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./scope_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    Scope {
        #[command(subcommand)]
        command: ScopeCommand,
    },
    Backfill {
        #[command(subcommand)]
        command: BackfillCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long)]
    content: String,
    /// Legacy metadata bag as a JSON object, e.g. '{"agentId": "..."}'.
    #[arg(long, default_value = "{}")]
    metadata_json: String,
}

#[derive(Debug, Subcommand)]
enum ScopeCommand {
    Resolve(ScopeResolveArgs),
}

#[derive(Debug, Args)]
struct ScopeResolveArgs {
    #[arg(long)]
    tenant: Option<Uuid>,
    #[arg(long)]
    app: Option<Uuid>,
    #[arg(long)]
    persona: Option<Uuid>,
    #[arg(long)]
    agent: Option<Uuid>,
    #[arg(long)]
    conversation: Option<Uuid>,
    #[arg(long)]
    plan: Option<Uuid>,
    #[arg(long)]
    project: Option<Uuid>,
    #[arg(long)]
    world: Option<Uuid>,
}

#[derive(Debug, Subcommand)]
enum BackfillCommand {
    Run(BackfillRunArgs),
}

#[derive(Debug, Args)]
struct BackfillRunArgs {
    /// YAML file with `dual_write_enabled` and `batch_size`.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dual_write: Option<bool>,
    #[arg(long, default_value_t = DEFAULT_MAX_BATCHES)]
    max_batches: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteRecordStore::open(&cli.db)?;
            run_db(&command, &mut store)
        }
        Command::Record { command } => {
            let mut store = SqliteRecordStore::open(&cli.db)?;
            store.migrate()?;
            run_record(&command, &mut store)
        }
        Command::Scope { command } => run_scope(&command),
        Command::Backfill { command } => {
            let mut store = SqliteRecordStore::open(&cli.db)?;
            store.migrate()?;
            run_backfill(&command, &mut store)
        }
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let current = store.schema_version()?;
            emit_json(&serde_json::json!({
                "cli_contract_version": CLI_CONTRACT_VERSION,
                "current_version": current,
                "target_version": LATEST_SCHEMA_VERSION,
                "up_to_date": current == LATEST_SCHEMA_VERSION,
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_version()?;
            if args.dry_run {
                return emit_json(&serde_json::json!({
                    "dry_run": true,
                    "current_version": before,
                    "target_version": LATEST_SCHEMA_VERSION,
                }));
            }
            store.migrate()?;
            let after = store.schema_version()?;
            emit_json(&serde_json::json!({
                "dry_run": false,
                "before_version": before,
                "after_version": after,
                "target_version": LATEST_SCHEMA_VERSION,
            }))
        }
    }
}

fn run_record(command: &RecordCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let metadata = parse_metadata_object(&args.metadata_json)?;
            let record_id = store.insert_legacy_record(&args.content, None, &metadata)?;
            emit_json(&serde_json::json!({
                "record_id": record_id.to_string(),
                "unscoped_count": store.count_unscoped()?,
            }))
        }
    }
}

fn run_scope(command: &ScopeCommand) -> Result<()> {
    match command {
        ScopeCommand::Resolve(args) => {
            let token = ScopeToken {
                tenant: args.tenant,
                app: args.app,
                persona: args.persona,
                agent: args.agent,
                conversation: args.conversation,
                plan: args.plan,
                project: args.project,
                world: args.world,
            };
            let Some(path) = ScopePathBuilder::try_build(&token) else {
                return emit_json(&serde_json::json!({ "resolved": false }));
            };

            let projection = ScopePathProjection::from_path(&path).ok();
            emit_json(&serde_json::json!({
                "resolved": true,
                "canonical": path.canonical(),
                "principal_type": path.principal().principal_type.as_str(),
                "principal_id": projection.as_ref().and_then(|p| p.principal_id),
                "segments": path.segments(),
                "projectable": projection.is_some(),
            }))
        }
    }
}

fn run_backfill(command: &BackfillCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        BackfillCommand::Run(args) => {
            let mut config = load_backfill_config(args.config.as_deref())?;
            if let Some(batch_size) = args.batch_size {
                config.batch_size = batch_size;
            }
            if let Some(dual_write) = args.dual_write {
                config.dual_write_enabled = dual_write;
            }

            let diagnostics = ScopeDiagnostics::new();
            let cancel = CancellationFlag::new();
            let report =
                store.run_backfill_to_completion(&config, &diagnostics, &cancel, args.max_batches)?;
            emit_json(&serde_json::json!({
                "config": config,
                "report": report,
                "diagnostics": diagnostics.snapshot(),
                "unscoped_remaining": store.count_unscoped()?,
            }))
        }
    }
}

fn load_backfill_config(path: Option<&std::path::Path>) -> Result<BackfillConfig> {
    let Some(path) = path else {
        return Ok(BackfillConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn parse_metadata_object(raw: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw).context("metadata is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("metadata must be a JSON object, got: {other}"),
    }
}

fn emit_json(value: &Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
