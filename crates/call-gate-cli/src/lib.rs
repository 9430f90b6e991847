//! Embedded call gate command surface for host runtimes.
//!
//! Hosts embed admission behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteCallStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use call_gate_core::{
    format_millis_rfc3339, normalize, normalize_for_dedup, AdmissionEngine, AttemptOutcome,
    AttemptRecord, CallDirection, CallEvent, CallScreener, ContactRule, IdempotencyGuard,
    ObserverSource, RuleStore, ScreeningDecision, Verdict,
};
use call_gate_store_sqlite::SqliteCallStore;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CALL_GATE_LOG";
const MAX_REDUNDANT_OBSERVERS: usize = 16;

#[derive(Debug, Parser)]
#[command(name = "cg")]
#[command(about = "Call gate admission CLI")]
pub struct Cli {
    #[arg(long, default_value = "./call_gate.sqlite3")]
    db: PathBuf,

    /// Log engine decisions to stderr.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Rule {
        #[command(subcommand)]
        command: RuleCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Evaluate a dial attempt without recording anything.
    Check(NumberArgs),
    Record(RecordArgs),
    /// Run the full observer flow for one call, optionally delivered redundantly.
    Dial(DialArgs),
    History(HistoryArgs),
    Normalize(NormalizeArgs),
}

#[derive(Debug, Subcommand)]
pub enum RuleCommand {
    Set(RuleSetArgs),
    Show(NumberArgs),
    List,
    Delete(NumberArgs),
    ManageAll(ManageAllArgs),
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
pub struct NumberArgs {
    #[arg(long)]
    number: String,
}

#[derive(Debug, Args)]
pub struct RuleSetArgs {
    #[arg(long)]
    number: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, action = ArgAction::Set)]
    managed: Option<bool>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    window_hours: Option<u32>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct ManageAllArgs {
    #[arg(long, action = ArgAction::Set)]
    managed: bool,
}

#[derive(Debug, Args)]
pub struct SettingsSetArgs {
    #[arg(long, action = ArgAction::Set)]
    redirect_enabled: Option<bool>,
    #[arg(long)]
    redirect_number: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    number: String,
    #[arg(long)]
    outcome: OutcomeArg,
    #[arg(long)]
    helper: Option<String>,
}

#[derive(Debug, Args)]
pub struct DialArgs {
    #[arg(long)]
    number: String,
    #[arg(long, value_enum, default_value_t = SourceArg::UserDial)]
    source: SourceArg,
    /// Number of observers reporting the same call concurrently.
    #[arg(long, default_value_t = 1)]
    redundant: usize,
    #[arg(long)]
    incoming: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    limit: Option<usize>,
    /// Filter by number digits or contact name.
    #[arg(long)]
    search: Option<String>,
}

#[derive(Debug, Args)]
pub struct NormalizeArgs {
    #[arg(long)]
    number: String,
    #[arg(long)]
    dedup: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Success,
    Blocked,
    Redirected,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceArg {
    OutgoingBroadcast,
    CallScreening,
    ActiveCall,
    UserDial,
}

impl From<SourceArg> for ObserverSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::OutgoingBroadcast => Self::OutgoingBroadcast,
            SourceArg::CallScreening => Self::CallScreening,
            SourceArg::ActiveCall => Self::ActiveCall,
            SourceArg::UserDial => Self::UserDial,
        }
    }
}

#[derive(Debug, Serialize)]
struct VerdictPayload {
    contract_version: &'static str,
    number: String,
    #[serde(flatten)]
    verdict: Verdict,
}

#[derive(Debug, Serialize)]
struct AttemptPayload {
    id: i64,
    phone_key: String,
    number: String,
    name: Option<String>,
    outcome: &'static str,
    helper_number: Option<String>,
    call_type: &'static str,
    call_type_code: i64,
    occurred_at: String,
    occurred_at_ms: i64,
}

#[derive(Debug, Serialize)]
struct HistoryPayload {
    contract_version: &'static str,
    records: Vec<AttemptPayload>,
}

#[derive(Debug, Serialize)]
struct DialPayload {
    contract_version: &'static str,
    number: String,
    decisions: Vec<ScreeningDecision>,
}

#[derive(Debug, Serialize)]
struct NormalizePayload {
    raw: String,
    normalized: String,
    mode: &'static str,
}

/// Installs the stderr `fmt` subscriber; later calls are no-ops.
pub fn init_logging(debug: bool) {
    let fallback = if debug { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.debug);
    match cli.command {
        Command::Normalize(args) => run_normalize(&args),
        command => run_with_db(&cli.db, command),
    }
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let store = SqliteCallStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &Arc::new(store))
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or evaluation fails.
pub fn run_command(command: Command, store: &Arc<SqliteCallStore>) -> Result<()> {
    match command {
        Command::Rule { command } => run_rule(command, store),
        Command::Settings { command } => run_settings(command, store),
        Command::Check(args) => {
            let engine = AdmissionEngine::from_store(Arc::clone(store));
            let verdict = engine.evaluate(&args.number)?;
            print_json(&VerdictPayload {
                contract_version: "verdict.v1",
                number: normalize(&args.number),
                verdict,
            })
        }
        Command::Record(args) => {
            let outcome = match (args.outcome, args.helper) {
                (OutcomeArg::Success, _) => AttemptOutcome::Success,
                (OutcomeArg::Blocked, _) => AttemptOutcome::Blocked,
                (OutcomeArg::Redirected, Some(helper)) if !normalize(&helper).is_empty() => {
                    AttemptOutcome::Redirected { helper }
                }
                (OutcomeArg::Redirected, _) => {
                    return Err(anyhow!("--helper <number> is required for redirected outcomes"));
                }
            };

            let engine = AdmissionEngine::from_store(Arc::clone(store));
            let record = engine.record_outcome(&args.number, &outcome)?;
            let names = rule_names(store)?;
            print_json(&attempt_payload(&record, &names)?)
        }
        Command::Dial(args) => run_dial(&args, store),
        Command::History(args) => run_history(&args, store),
        Command::Normalize(args) => run_normalize(&args),
    }
}

fn run_rule(command: RuleCommand, store: &SqliteCallStore) -> Result<()> {
    match command {
        RuleCommand::Set(args) => {
            let number = normalize(&args.number);
            let mut rule = match store.rule_for(&number)? {
                Some(existing) => existing,
                None => ContactRule::new(&number, args.name.clone().unwrap_or_else(|| number.clone())),
            };

            if let Some(name) = args.name {
                rule.name = name;
            }
            if let Some(managed) = args.managed {
                rule.is_managed = managed;
            }
            if let Some(limit) = args.limit {
                rule.call_limit = limit;
            }
            if let Some(window_hours) = args.window_hours {
                rule.time_window_hours = window_hours;
            }
            if let Some(notes) = args.notes {
                rule.notes = if notes.trim().is_empty() { None } else { Some(notes) };
            }

            store.upsert_rule(&rule)?;
            print_json(&rule)
        }
        RuleCommand::Show(args) => {
            let number = normalize(&args.number);
            let rule = store
                .rule_for(&number)?
                .ok_or_else(|| anyhow!("no contact rule for {number}"))?;
            print_json(&rule)
        }
        RuleCommand::List => print_json(&store.list_rules()?),
        RuleCommand::Delete(args) => {
            let number = normalize(&args.number);
            let deleted = store.delete_rule(&number)?;
            print_json(&serde_json::json!({ "number": number, "deleted": deleted }))
        }
        RuleCommand::ManageAll(args) => {
            let updated = store.set_all_managed(args.managed)?;
            print_json(&serde_json::json!({ "is_managed": args.managed, "updated": updated }))
        }
    }
}

fn run_settings(command: SettingsCommand, store: &SqliteCallStore) -> Result<()> {
    match command {
        SettingsCommand::Show => print_json(&store.get_settings()?),
        SettingsCommand::Set(args) => {
            if args.redirect_enabled.is_none() && args.redirect_number.is_none() {
                return Err(anyhow!(
                    "at least one of --redirect-enabled or --redirect-number is required"
                ));
            }
            if let Some(enabled) = args.redirect_enabled {
                store.set_redirect_enabled(enabled)?;
            }
            if let Some(number) = args.redirect_number.as_deref() {
                store.set_redirect_number(number)?;
            }
            print_json(&store.get_settings()?)
        }
    }
}

fn run_dial(args: &DialArgs, store: &Arc<SqliteCallStore>) -> Result<()> {
    if args.redundant == 0 || args.redundant > MAX_REDUNDANT_OBSERVERS {
        return Err(anyhow!(
            "--redundant must be between 1 and {MAX_REDUNDANT_OBSERVERS}"
        ));
    }

    let screener = CallScreener::new(
        AdmissionEngine::from_store(Arc::clone(store)),
        IdempotencyGuard::default(),
    );
    let event = CallEvent {
        raw_number: args.number.clone(),
        direction: if args.incoming {
            CallDirection::Incoming
        } else {
            CallDirection::Outgoing
        },
        source: args.source.into(),
    };

    let decisions = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..args.redundant)
            .map(|_| scope.spawn(|| screener.screen(&event)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(anyhow!("observer thread panicked")),
            })
            .collect::<Result<Vec<_>>>()
    })?;

    debug!(
        event = "dial.completed",
        observers = decisions.len(),
        number = %normalize(&args.number),
    );
    print_json(&DialPayload {
        contract_version: "dial.v1",
        number: normalize(&args.number),
        decisions,
    })
}

fn run_history(args: &HistoryArgs, store: &SqliteCallStore) -> Result<()> {
    print_json(&collect_history(args, store)?)
}

fn collect_history(args: &HistoryArgs, store: &SqliteCallStore) -> Result<HistoryPayload> {
    let names = rule_names(store)?;
    let needle = args.search.as_deref().map(str::trim).unwrap_or_default();
    let needle_digits = normalize(needle);
    let needle_lower = needle.to_lowercase();

    let mut records = Vec::new();
    for record in store.list_attempts(None)? {
        if args.limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }

        let matches = needle.is_empty()
            || (!needle_digits.is_empty() && record.number.contains(&needle_digits))
            || names
                .get(&record.number)
                .is_some_and(|name| name.to_lowercase().contains(&needle_lower));
        if !matches {
            continue;
        }

        records.push(attempt_payload(&record, &names)?);
    }

    Ok(HistoryPayload {
        contract_version: "history.v1",
        records,
    })
}

fn run_normalize(args: &NormalizeArgs) -> Result<()> {
    let (normalized, mode) = if args.dedup {
        (normalize_for_dedup(&args.number), "dedup")
    } else {
        (normalize(&args.number), "identity")
    };
    print_json(&NormalizePayload {
        raw: args.number.clone(),
        normalized,
        mode,
    })
}

fn rule_names(store: &SqliteCallStore) -> Result<BTreeMap<String, String>> {
    Ok(store
        .list_rules()?
        .into_iter()
        .map(|rule| (rule.phone_number, rule.name))
        .collect())
}

fn attempt_payload(
    record: &AttemptRecord,
    names: &BTreeMap<String, String>,
) -> Result<AttemptPayload> {
    let phone_key = record.phone_key();
    let (number, outcome) = AttemptOutcome::parse_key(&phone_key);

    Ok(AttemptPayload {
        id: record.id,
        name: names.get(&number).cloned(),
        outcome: outcome.as_str(),
        helper_number: outcome.helper().map(str::to_string),
        call_type: record.call_type.as_str(),
        call_type_code: record.call_type.code(),
        occurred_at: format_millis_rfc3339(record.timestamp_ms)?,
        occurred_at_ms: record.timestamp_ms,
        phone_key,
        number,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
