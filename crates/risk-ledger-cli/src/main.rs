use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use risk_ledger_api::{
    load_policy, CompareRequest, LedgerCompareRequest, PeriodUpdate, RiskLedgerApi, StoreBackend,
    StoreConfig,
};
use risk_ledger_core::RawRiskRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Risk ledger CLI")]
struct Cli {
    #[arg(long, default_value = "json")]
    store: StoreBackend,

    /// Ledger directory for `json`; database file or directory for `sqlite`.
    #[arg(long, default_value = "./risk_ledger")]
    path: PathBuf,

    /// YAML decay policy; built-in thresholds when omitted.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest one period of extracted risks into a project ledger.
    Ingest(IngestArgs),
    /// Print a project's ledger.
    Show(ProjectArgs),
    /// List projects with a stored ledger.
    Projects,
    /// Compare period updates read from a file, oldest first.
    Compare(CompareArgs),
    /// Compare the periods recorded in a project's ledger.
    CompareLedger(CompareLedgerArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    project: String,
    /// JSON array of risk records, or an object with `records` and optional
    /// `period` / `update_text`.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    period: Option<String>,
    #[arg(long)]
    update_text: Option<String>,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[arg(long)]
    project: String,
}

#[derive(Debug, Args)]
struct CompareArgs {
    /// JSON array of updates, or an object with an `updates` array.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct CompareLedgerArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    last_n: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestInput {
    Records(Vec<RawRiskRecord>),
    Update(PeriodUpdate),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompareInput {
    Updates(Vec<PeriodUpdate>),
    Request(CompareRequest),
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
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(data: &T) -> Result<()> {
    emit_json(serde_json::to_value(data).context("failed to serialize command output")?)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse input JSON {}", path.display()))
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut api = RiskLedgerApi::new(StoreConfig::new(cli.store, cli.path));
    if let Some(policy_path) = &cli.policy {
        api = api.with_policy(load_policy(policy_path)?)?;
    }
    debug!(backend = api.store_config().backend.as_str(), "opened risk ledger api");

    match cli.command {
        Command::Ingest(args) => run_ingest(&api, args),
        Command::Show(args) => emit(&api.show_ledger(&args.project)?),
        Command::Projects => {
            emit_json(serde_json::json!({ "projects": api.list_projects()? }))
        }
        Command::Compare(args) => run_compare(&api, &args),
        Command::CompareLedger(args) => emit(
            &api.compare_ledger(&args.project, LedgerCompareRequest { last_n: args.last_n })?,
        ),
        Command::Db { command } => run_db(&api, command),
    }
}

fn run_ingest(api: &RiskLedgerApi, args: IngestArgs) -> Result<()> {
    let mut update = match read_json::<IngestInput>(&args.input)? {
        IngestInput::Records(records) => PeriodUpdate { records, ..PeriodUpdate::default() },
        IngestInput::Update(update) => update,
    };
    if args.period.is_some() {
        update.period = args.period;
    }
    if args.update_text.is_some() {
        update.update_text = args.update_text;
    }
    emit(&api.ingest(&args.project, update)?)
}

fn run_compare(api: &RiskLedgerApi, args: &CompareArgs) -> Result<()> {
    let request = match read_json::<CompareInput>(&args.input)? {
        CompareInput::Updates(updates) => CompareRequest { updates },
        CompareInput::Request(request) => request,
    };
    emit(&api.compare_updates(request)?)
}

fn run_db(api: &RiskLedgerApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "backend": status.backend,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty() && status.stale_ledgers.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy,
                "ledger_schema_version": status.ledger_schema_version,
                "stale_ledgers": status.stale_ledgers
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Export(args) => emit(&api.export(&args.out)?),
        DbCommand::Import(args) => emit(&api.import(&args.input, args.skip_existing)?),
    }
}
