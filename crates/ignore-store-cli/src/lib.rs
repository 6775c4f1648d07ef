//! Embedded command surface for the ignore-rule store.
//!
//! Hosts can drive the store through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a single [`Command`] against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteIgnoreStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ignore_store_core::{
    now_utc, parse_expires, ConvergenceStrategy, EngineConfig, OpContext, Rule, RuleChange,
    RuleDraft, RuleId, TraceId, TraceKeys,
};
use ignore_store_sqlite::{
    ConvergenceCheck, ConvergenceReport, ConvergenceStatus, HeadValue, IssueSeverity, RuleCache,
    RuleWatcher, SqliteIgnoreStore, TraceRecord, TraceTable,
};

#[derive(Debug, Parser)]
#[command(name = "ignorectl")]
#[command(about = "Ignore-rule store CLI")]
pub struct Cli {
    #[arg(long, default_value = "./ignore_store.sqlite3")]
    db: PathBuf,

    /// JSON engine configuration; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    strategy: Option<StrategyArg>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    max_batches: Option<usize>,

    /// Deadline for the whole command, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Traces {
        #[command(subcommand)]
        command: TracesCommand,
    },
    Backfill {
        #[command(subcommand)]
        command: BackfillCommand,
    },
    Reconcile(JsonArgs),
    Status(JsonArgs),
    Check(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum RulesCommand {
    Create(RuleCreateArgs),
    List(RuleListArgs),
    Update(RuleUpdateArgs),
    Delete(RuleDeleteArgs),
    Coverage(RuleCoverageArgs),
}

#[derive(Debug, Args)]
pub struct RuleCreateArgs {
    #[arg(long)]
    author: String,
    /// URL-encoded query, e.g. `model=Pixel&os=Android`.
    #[arg(long)]
    query: String,
    /// RFC3339 UTC timestamp or a relative duration such as `7d`.
    #[arg(long)]
    expires: String,
    #[arg(long, default_value = "")]
    note: String,
}

#[derive(Debug, Args)]
pub struct RuleListArgs {
    #[arg(long)]
    json: bool,
    #[arg(long)]
    expired_only: bool,
}

#[derive(Debug, Args)]
pub struct RuleUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    updated_by: String,
    #[arg(long)]
    query: String,
    #[arg(long)]
    expires: String,
    #[arg(long, default_value = "")]
    note: String,
}

#[derive(Debug, Args)]
pub struct RuleDeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct RuleCoverageArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum TracesCommand {
    Record(TraceRecordArgs),
    Show(TraceShowArgs),
}

#[derive(Debug, Args)]
pub struct TraceRecordArgs {
    /// `key=value`; repeat for each key.
    #[arg(long = "key", required = true)]
    keys: Vec<String>,
    #[arg(long, requires = "digest")]
    commit: Option<String>,
    #[arg(long, requires = "commit")]
    digest: Option<String>,
}

#[derive(Debug, Args)]
pub struct TraceShowArgs {
    #[arg(long)]
    trace_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum BackfillCommand {
    Run(JsonArgs),
    Schedule(BackfillScheduleArgs),
}

#[derive(Debug, Args)]
pub struct BackfillScheduleArgs {
    #[arg(long, default_value_t = 60_000)]
    interval_ms: u64,
    /// Number of sweeps before exiting.
    #[arg(long, default_value_t = 1)]
    runs: u32,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    PushDown,
    PullThenPush,
}

impl From<StrategyArg> for ConvergenceStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::PushDown => Self::PushDown,
            StrategyArg::PullThenPush => Self::PullThenPush,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => load_engine_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy.into();
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(max_batches) = cli.max_batches {
        config.max_batches_per_run = Some(max_batches);
    }

    let ctx = match cli.timeout_ms {
        Some(timeout) => OpContext::with_timeout(Duration::from_millis(timeout)),
        None => OpContext::background(),
    };

    run_with_db(&cli.db, config, &ctx, cli.command)
}

/// Executes one command against the `SQLite` DB at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(
    db_path: &Path,
    config: EngineConfig,
    ctx: &OpContext,
    command: Command,
) -> Result<()> {
    let mut store = SqliteIgnoreStore::open_with_config(db_path, config)?;
    store.migrate()?;

    if let Command::Backfill {
        command: BackfillCommand::Schedule(args),
    } = &command
    {
        return run_backfill_schedule(db_path, args, ctx, &mut store);
    }

    run_command(command, ctx, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or convergence fails, and
/// when `check` finds the store unhealthy.
pub fn run_command(command: Command, ctx: &OpContext, store: &mut SqliteIgnoreStore) -> Result<()> {
    match command {
        Command::Rules { command } => run_rules(command, ctx, store),
        Command::Traces { command } => run_traces(command, store),
        Command::Backfill { command } => match command {
            BackfillCommand::Run(args) => {
                let report = store.run_backfill(ctx)?;
                print_report("backfill", &report, args.json)
            }
            BackfillCommand::Schedule(_) => Err(anyhow!(
                "backfill schedule needs a database path; use run_with_db"
            )),
        },
        Command::Reconcile(args) => {
            let report = store.reconcile(ctx)?;
            print_report("reconcile", &report, args.json)
        }
        Command::Status(args) => {
            let status = store.convergence_status()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Command::Check(args) => {
            let check = store.convergence_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "ignore state consistency check failed: {}",
                    check
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

fn run_rules(command: RulesCommand, ctx: &OpContext, store: &mut SqliteIgnoreStore) -> Result<()> {
    match command {
        RulesCommand::Create(args) => {
            let draft = RuleDraft {
                author: args.author,
                expires: parse_expires(&args.expires, now_utc())?,
                query: args.query,
                note: args.note,
            };
            let write = store.create_rule(ctx, &draft)?;
            println!("{}", serde_json::to_string_pretty(&write)?);
            Ok(())
        }
        RulesCommand::List(args) => {
            let now = now_utc();
            let rules: Vec<Rule> = store
                .list_rules(ctx)?
                .into_iter()
                .filter(|rule| !args.expired_only || rule.is_expired(now))
                .collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                print_rules_table(&rules)?;
            }
            Ok(())
        }
        RulesCommand::Update(args) => {
            let change = RuleChange {
                id: parse_rule_id(&args.id)?,
                updated_by: args.updated_by,
                expires: parse_expires(&args.expires, now_utc())?,
                query: args.query,
                note: args.note,
            };
            let write = store.update_rule(ctx, &change)?;
            println!("{}", serde_json::to_string_pretty(&write)?);
            Ok(())
        }
        RulesCommand::Delete(args) => {
            let deletion = store.delete_rule(ctx, parse_rule_id(&args.id)?)?;
            println!("{}", serde_json::to_string_pretty(&deletion)?);
            Ok(())
        }
        RulesCommand::Coverage(args) => {
            let coverage = store.rule_coverage(ctx, parse_rule_id(&args.id)?)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&coverage)?);
            } else {
                println!(
                    "rule_id={} matched_traces={} exclusive_traces={}",
                    coverage.rule_id, coverage.matched_traces, coverage.exclusive_traces
                );
            }
            Ok(())
        }
    }
}

fn run_traces(command: TracesCommand, store: &mut SqliteIgnoreStore) -> Result<()> {
    match command {
        TracesCommand::Record(args) => {
            let keys = parse_trace_keys(&args.keys)?;
            let head = match (args.commit, args.digest) {
                (Some(commit_id), Some(digest)) => Some(HeadValue { commit_id, digest }),
                (None, None) => None,
                _ => return Err(anyhow!("--commit and --digest must be given together")),
            };
            let trace_id = store.record_trace(&TraceRecord { keys, head })?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "trace_id": trace_id }))?
            );
            Ok(())
        }
        TracesCommand::Show(args) => {
            let trace_id = TraceId(args.trace_id);
            let mut states = serde_json::Map::new();
            for table in TraceTable::ALL {
                let state = store.trace_state(table, &trace_id)?;
                states.insert(
                    table.as_str().to_string(),
                    state.map_or(serde_json::Value::Null, |value| {
                        serde_json::Value::String(value.as_str().to_string())
                    }),
                );
            }
            if states.values().all(serde_json::Value::is_null) {
                return Err(anyhow!("trace {trace_id} not found"));
            }

            if args.json {
                let payload = serde_json::json!({ "trace_id": trace_id, "states": states });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                let rendered = states
                    .iter()
                    .map(|(table, state)| format!("{table}={}", state.as_str().unwrap_or("absent")))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("trace_id={trace_id} {rendered}");
            }
            Ok(())
        }
    }
}

/// Runs `args.runs` backfill sweeps spaced by `args.interval_ms`.
///
/// With `rule_cache` enabled, a [`RuleWatcher`] keeps the shared cache warm
/// between sweeps.
fn run_backfill_schedule(
    db_path: &Path,
    args: &BackfillScheduleArgs,
    ctx: &OpContext,
    store: &mut SqliteIgnoreStore,
) -> Result<()> {
    if args.runs == 0 {
        return Err(anyhow!("--runs must be >= 1"));
    }

    let watcher = if store.config().rule_cache {
        let cache = store.rule_cache().unwrap_or_else(|| Arc::new(RuleCache::new()));
        store.attach_rule_cache(Arc::clone(&cache));
        Some(RuleWatcher::spawn(
            db_path,
            cache,
            Duration::from_millis(store.config().rule_watch_interval_ms),
            store.config().busy_timeout_ms,
        )?)
    } else {
        None
    };

    let interval = Duration::from_millis(args.interval_ms);
    for run in 1..=args.runs {
        let report = store.run_backfill(ctx)?;
        tracing::info!(
            run,
            runs = args.runs,
            rows_written = report.rows_written,
            complete = report.complete,
            "scheduled backfill run finished"
        );
        print_report("backfill", &report, false)?;
        if run < args.runs {
            std::thread::sleep(interval);
        }
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    Ok(())
}

fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading engine config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("engine config {} is not valid JSON", path.display()))?;
    Ok(EngineConfig::from_json(&value)?)
}

fn parse_rule_id(raw: &str) -> Result<RuleId> {
    Ok(raw.parse::<RuleId>()?)
}

fn parse_trace_keys(raw: &[String]) -> Result<TraceKeys> {
    let mut keys = TraceKeys::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(anyhow!("trace key {pair:?} must be key=value"));
        };
        if key.is_empty() {
            return Err(anyhow!("trace key {pair:?} has an empty name"));
        }
        if keys.insert(key.to_string(), value.to_string()).is_some() {
            return Err(anyhow!("trace key {key:?} given more than once"));
        }
    }
    Ok(keys)
}

fn print_report(label: &str, report: &ConvergenceReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!(
            "{label} strategy={} batches={} rows_scanned={} rows_written={} traces_written={} values_at_head_written={} complete={}",
            report.strategy.as_str(),
            report.batches,
            report.rows_scanned,
            report.rows_written,
            report.traces_written,
            report.values_at_head_written,
            if report.complete { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn print_rules_table(rules: &[Rule]) -> Result<()> {
    let now = now_utc();
    println!(
        "{:<26} {:<24} {:<20} {:<7} query",
        "rule_id", "created_by", "expires", "expired"
    );
    println!("{}", "-".repeat(100));
    for rule in rules {
        println!(
            "{:<26} {:<24} {:<20} {:<7} {}",
            rule.id,
            rule.created_by,
            ignore_store_core::format_rfc3339(rule.expires)?,
            if rule.is_expired(now) { "yes" } else { "no" },
            rule.query
        );
    }
    Ok(())
}

fn print_status(status: &ConvergenceStatus) {
    println!(
        "contract={} rules={} rules_revision={} cross_table_mismatches={}",
        status.contract_version,
        status.rules,
        status.rules_revision,
        status.cross_table_mismatches
    );
    for table in &status.tables {
        println!(
            "table={} rows={} unknown={} ignored={} not_ignored={}",
            table.table.as_str(),
            table.rows,
            table.unknown,
            table.ignored,
            table.not_ignored
        );
    }
}

fn print_check(check: &ConvergenceCheck) {
    println!("contract={}", check.contract_version);
    print_status(&check.status);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IssueSeverity::Warning => "warning",
                    IssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
    if !check.mismatch_sample.is_empty() {
        let sample = check
            .mismatch_sample
            .iter()
            .map(TraceId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        println!("mismatch_sample={sample}");
        println!("hint=run `ignorectl reconcile` to recompute both tables");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::manual_let_else)]

    use super::*;
    use ignore_store_core::TriState;
    use rusqlite::Connection;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ignorectl-{label}-{}.sqlite3", ulid::Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[test]
    fn parse_trace_keys_accepts_pairs() {
        let keys = must(parse_trace_keys(&[
            "os=Android".to_string(),
            "name=a=b".to_string(),
        ]));
        assert_eq!(keys.get("os").map(String::as_str), Some("Android"));
        assert_eq!(keys.get("name").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn parse_trace_keys_rejects_malformed_pairs() {
        assert!(parse_trace_keys(&["os".to_string()]).is_err());
        assert!(parse_trace_keys(&["=Android".to_string()]).is_err());
        assert!(parse_trace_keys(&["os=a".to_string(), "os=b".to_string()]).is_err());
    }

    #[test]
    fn strategy_flag_overrides_config_file() {
        let db = temp_db_path("config");
        let config_path = std::env::temp_dir().join(format!(
            "ignorectl-config-{}.json",
            ulid::Ulid::new()
        ));
        must(
            std::fs::write(&config_path, r#"{"strategy":"push_down","batch_size":3}"#)
                .map_err(anyhow::Error::from),
        );

        let cli = must(
            Cli::try_parse_from([
                "ignorectl",
                "--db",
                &db.display().to_string(),
                "--config",
                &config_path.display().to_string(),
                "--strategy",
                "pull-then-push",
                "status",
            ])
            .map_err(anyhow::Error::from),
        );
        assert!(matches!(cli.strategy, Some(StrategyArg::PullThenPush)));
        let loaded = must(load_engine_config(&config_path));
        assert_eq!(loaded.strategy, ConvergenceStrategy::PushDown);
        assert_eq!(loaded.batch_size, 3);
        must(run_cli(cli));

        let _ = std::fs::remove_file(&config_path);
        remove_db(&db);
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let config_path = std::env::temp_dir().join(format!(
            "ignorectl-bad-config-{}.json",
            ulid::Ulid::new()
        ));
        must(
            std::fs::write(&config_path, r#"{"batch_size":0}"#).map_err(anyhow::Error::from),
        );
        assert!(load_engine_config(&config_path).is_err());
        let _ = std::fs::remove_file(&config_path);
    }

    #[test]
    fn create_record_backfill_flow_resolves_flags() {
        let db = temp_db_path("flow");
        let db_arg = db.display().to_string();

        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "traces", "record", "--key", "os=Android",
            "--key", "model=Pixel", "--commit", "c1", "--digest", "d1",
        ]));
        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "traces", "record", "--key", "os=iOS",
            "--commit", "c1", "--digest", "d2",
        ]));
        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "rules", "create", "--author",
            "alice@example.com", "--query", "os=Android", "--expires", "7d",
        ]));
        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "--strategy", "push-down", "backfill", "run",
        ]));
        must(execute_cli(&["ignorectl", "--db", &db_arg, "check"]));

        let store = must(SqliteIgnoreStore::open(&db));
        let android = must(TraceId::from_keys(&must(parse_trace_keys(&[
            "os=Android".to_string(),
            "model=Pixel".to_string(),
        ])))
        .map_err(anyhow::Error::from));
        let ios = must(TraceId::from_keys(&must(parse_trace_keys(&["os=iOS".to_string()])))
            .map_err(anyhow::Error::from));
        for table in TraceTable::ALL {
            assert_eq!(must(store.trace_state(table, &android)), Some(TriState::True));
            assert_eq!(must(store.trace_state(table, &ios)), Some(TriState::False));
        }
        let rules = must(store.list_rules(&OpContext::background()));
        assert_eq!(rules.len(), 1);

        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "rules", "delete", "--id",
            &rules[0].id.to_string(),
        ]));
        for table in TraceTable::ALL {
            assert_eq!(must(store.trace_state(table, &android)), Some(TriState::False));
        }

        drop(store);
        remove_db(&db);
    }

    #[test]
    fn update_of_unknown_rule_fails() {
        let db = temp_db_path("update-missing");
        let db_arg = db.display().to_string();
        let missing = RuleId::generate().to_string();

        let result = execute_cli(&[
            "ignorectl", "--db", &db_arg, "rules", "update", "--id", &missing,
            "--updated-by", "bob@example.com", "--query", "os=Android", "--expires", "1d",
        ]);
        let err = match result {
            Ok(()) => panic!("expected not found"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ignore_store_core::IgnoreError>(),
            Some(ignore_store_core::IgnoreError::NotFound(_))
        ));

        remove_db(&db);
    }

    #[test]
    fn check_fails_on_cross_table_mismatch() {
        let db = temp_db_path("check");
        let db_arg = db.display().to_string();

        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "traces", "record", "--key", "os=Android",
            "--commit", "c1", "--digest", "d1",
        ]));
        must(execute_cli(&["ignorectl", "--db", &db_arg, "backfill", "run"]));
        must(execute_cli(&["ignorectl", "--db", &db_arg, "check", "--json"]));

        let conn = must(Connection::open(&db).map_err(anyhow::Error::from));
        must(
            conn.execute_batch("UPDATE values_at_head SET matches_any_ignore_rule = 'true';")
                .map_err(anyhow::Error::from),
        );
        drop(conn);

        assert!(execute_cli(&["ignorectl", "--db", &db_arg, "check"]).is_err());
        must(execute_cli(&["ignorectl", "--db", &db_arg, "reconcile"]));
        must(execute_cli(&["ignorectl", "--db", &db_arg, "check"]));

        remove_db(&db);
    }

    #[test]
    fn backfill_schedule_runs_requested_sweeps() {
        let db = temp_db_path("schedule");
        let db_arg = db.display().to_string();

        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "traces", "record", "--key", "os=Android",
        ]));
        must(execute_cli(&[
            "ignorectl", "--db", &db_arg, "--batch-size", "1", "--max-batches", "1",
            "backfill", "schedule", "--interval-ms", "1", "--runs", "3",
        ]));

        let store = must(SqliteIgnoreStore::open(&db));
        let status = must(store.convergence_status());
        assert!(status.tables.iter().all(|table| table.unknown == 0));
        drop(store);

        assert!(execute_cli(&[
            "ignorectl", "--db", &db_arg, "backfill", "schedule", "--runs", "0",
        ])
        .is_err());

        remove_db(&db);
    }
}
