//! Embedded command surface for the migration ledger.
//!
//! Hosts that run migration bundles can drive the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_ledger_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_ledger`] for execution against an existing [`ScriptLedger`].
//!
//! Every command prints pretty JSON on stdout. Versioned payloads carry a
//! `contract_version` field matching a schema under `contracts/v1/schemas`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use migration_ledger_core::{
    script_file_name, BundleVersion, LedgerError, RecordedRun, RunReason, RunVerdict,
    ScriptLedger, ScriptRecord, ScriptRecordRow, ScriptRecordStore,
};
use migration_ledger_store_sqlite::SqliteLedgerStore;
use serde::Serialize;
use tracing::debug;

pub const RUN_VERDICT_CONTRACT_VERSION: &str = "run_verdict.v1";
pub const RECORDED_RUN_CONTRACT_VERSION: &str = "recorded_run.v1";
pub const SCRIPT_HISTORY_CONTRACT_VERSION: &str = "script_history.v1";

#[derive(Debug, Parser)]
#[command(name = "mledger")]
#[command(about = "Migration script run ledger")]
pub struct Cli {
    #[arg(long, default_value = "./migration_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Bundle {
        #[command(subcommand)]
        command: BundleCommand,
    },
    Script {
        #[command(subcommand)]
        command: ScriptCommand,
    },
    /// Scan active records for ledger anomalies.
    Check,
}

#[derive(Debug, Subcommand)]
pub enum BundleCommand {
    Register(BundleVersionArgs),
    Retire(BundleVersionArgs),
    List(BundleListArgs),
}

#[derive(Debug, Args)]
pub struct BundleVersionArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    version: String,
}

#[derive(Debug, Args)]
pub struct BundleListArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    include_retired: bool,
}

#[derive(Debug, Subcommand)]
pub enum ScriptCommand {
    ShouldRun(ShouldRunArgs),
    Record(RecordArgs),
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct ShouldRunArgs {
    #[arg(long)]
    bundle: String,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    dialect: String,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    bundle: String,
    #[arg(long)]
    version: String,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    dialect: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    bundle: String,
    #[arg(long)]
    file_name: String,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_ledger_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_ledger_with_db(db_path: &Path, command: Command) -> Result<()> {
    let store = SqliteLedgerStore::open(db_path)?;
    store.migrate()?;
    debug!(db = %db_path.display(), "opened ledger database");
    run_ledger(command, &ScriptLedger::new(store))
}

/// Executes a parsed command against an existing ledger.
///
/// # Errors
/// Returns an error when validation or persistence fails, or when an
/// integrity check reports an unhealthy ledger.
pub fn run_ledger<S>(command: Command, ledger: &ScriptLedger<S>) -> Result<()>
where
    S: ScriptRecordStore,
{
    match command {
        Command::Bundle { command } => run_bundle(command, ledger),
        Command::Script { command } => run_script(command, ledger),
        Command::Check => {
            let report = ledger.check_integrity()?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.healthy {
                return Err(anyhow!(
                    "ledger integrity check failed: {}",
                    report
                        .issues
                        .iter()
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }

            Ok(())
        }
    }
}

fn run_bundle<S>(command: BundleCommand, ledger: &ScriptLedger<S>) -> Result<()>
where
    S: ScriptRecordStore,
{
    match command {
        BundleCommand::Register(args) => {
            let version = ledger.register_bundle_version(&args.name, &args.version)?;
            println!("{}", serde_json::to_string_pretty(&version)?);
            Ok(())
        }
        BundleCommand::Retire(args) => {
            let version = ledger.retire_bundle_version(&args.name, &args.version)?;
            println!("{}", serde_json::to_string_pretty(&version)?);
            Ok(())
        }
        BundleCommand::List(args) => {
            let versions: Vec<BundleVersion> =
                ledger.list_bundle_versions(&args.name, args.include_retired)?;
            println!("{}", serde_json::to_string_pretty(&versions)?);
            Ok(())
        }
    }
}

fn run_script<S>(command: ScriptCommand, ledger: &ScriptLedger<S>) -> Result<()>
where
    S: ScriptRecordStore,
{
    match command {
        ScriptCommand::ShouldRun(args) => {
            let verdict = ledger.evaluate(&args.bundle, &args.file, &args.dialect);
            let payload = build_run_verdict_payload(&args.bundle, &args.file, &args.dialect, &verdict);
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        ScriptCommand::Record(args) => {
            let recorded = ledger
                .record_run(&args.bundle, &args.version, &args.file, &args.dialect)
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            let payload = build_recorded_run_payload(recorded);
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        ScriptCommand::History(args) => {
            let records = ledger.history(&args.bundle, &args.file_name)?;
            let payload = ScriptHistoryPayload {
                contract_version: SCRIPT_HISTORY_CONTRACT_VERSION.to_string(),
                bundle_name: args.bundle,
                script_file_name: args.file_name,
                records,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    code: String,
    message: String,
}

impl From<&LedgerError> for ErrorPayload {
    fn from(err: &LedgerError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunVerdictPayload {
    contract_version: String,
    bundle_name: String,
    script_file_name: Option<String>,
    dialect: String,
    verdict: String,
    should_run: bool,
    reason: Option<String>,
    current_hash: Option<String>,
    active_records: Vec<ScriptRecord>,
    error: Option<ErrorPayload>,
}

fn build_run_verdict_payload(
    bundle_name: &str,
    file_path: &Path,
    dialect: &str,
    verdict: &RunVerdict,
) -> RunVerdictPayload {
    let (reason, current_hash) = match verdict {
        RunVerdict::MustRun(RunReason::NeverRun) => (Some("never_run"), None),
        RunVerdict::MustRun(RunReason::ContentChanged { current_hash, .. }) => {
            (Some("content_changed"), Some(current_hash.as_str().to_string()))
        }
        RunVerdict::MustRun(RunReason::AmbiguousHistory { .. }) => {
            (Some("ambiguous_history"), None)
        }
        RunVerdict::UpToDate(record) => (None, Some(record.content_hash.as_str().to_string())),
        RunVerdict::Unevaluable(_) => (None, None),
    };

    RunVerdictPayload {
        contract_version: RUN_VERDICT_CONTRACT_VERSION.to_string(),
        bundle_name: bundle_name.to_string(),
        script_file_name: script_file_name(file_path).ok(),
        dialect: dialect.to_string(),
        verdict: verdict.as_str().to_string(),
        should_run: verdict.should_run(),
        reason: reason.map(str::to_string),
        current_hash,
        active_records: verdict.prior_records().to_vec(),
        error: match verdict {
            RunVerdict::Unevaluable(err) => Some(ErrorPayload::from(err)),
            _ => None,
        },
    }
}

#[derive(Debug, Serialize)]
pub struct RecordedRunPayload {
    contract_version: String,
    record: ScriptRecord,
    bundle: BundleVersion,
    superseded: Vec<ScriptRecord>,
}

fn build_recorded_run_payload(recorded: RecordedRun) -> RecordedRunPayload {
    RecordedRunPayload {
        contract_version: RECORDED_RUN_CONTRACT_VERSION.to_string(),
        record: recorded.record,
        bundle: recorded.bundle,
        superseded: recorded.superseded,
    }
}

#[derive(Debug, Serialize)]
pub struct ScriptHistoryPayload {
    contract_version: String,
    bundle_name: String,
    script_file_name: String,
    records: Vec<ScriptRecordRow>,
}
