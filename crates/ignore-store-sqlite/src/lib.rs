#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ignore_store_core::{
    compile, format_rfc3339, live_predicates, matches_any, parse_rfc3339_utc, CompiledCondition,
    ConvergenceStrategy, EngineConfig, IgnoreError, OpContext, Rule, RuleChange, RuleDraft,
    RuleId, RuleQuery, TraceId, TraceKeys, TriState,
};
use rayon::prelude::*;
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};

const IGNORE_MIGRATION_VERSION: i64 = 1;

/// Default `SQLITE_MAX_VARIABLE_NUMBER` of the bundled library.
const MAX_BOUND_PARAMETERS: usize = 32_766;

const SCHEMA_IGNORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS ignore_rules (
  rule_id TEXT PRIMARY KEY,
  created_by TEXT NOT NULL,
  updated_by TEXT NOT NULL,
  expires TEXT NOT NULL,
  query TEXT NOT NULL,
  note TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ignore_rules_revision (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  revision INTEGER NOT NULL
);

INSERT OR IGNORE INTO ignore_rules_revision(singleton, revision) VALUES (1, 0);

CREATE TRIGGER IF NOT EXISTS trg_ignore_rules_revision_insert
AFTER INSERT ON ignore_rules
BEGIN
  UPDATE ignore_rules_revision SET revision = revision + 1 WHERE singleton = 1;
END;

CREATE TRIGGER IF NOT EXISTS trg_ignore_rules_revision_update
AFTER UPDATE ON ignore_rules
BEGIN
  UPDATE ignore_rules_revision SET revision = revision + 1 WHERE singleton = 1;
END;

CREATE TRIGGER IF NOT EXISTS trg_ignore_rules_revision_delete
AFTER DELETE ON ignore_rules
BEGIN
  UPDATE ignore_rules_revision SET revision = revision + 1 WHERE singleton = 1;
END;

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  keys TEXT NOT NULL CHECK (json_valid(keys)),
  matches_any_ignore_rule TEXT NOT NULL DEFAULT 'unknown' CHECK (
    matches_any_ignore_rule IN ('unknown', 'true', 'false')
  )
);

CREATE INDEX IF NOT EXISTS idx_traces_ignore_state
  ON traces(matches_any_ignore_rule, trace_id);

CREATE TABLE IF NOT EXISTS values_at_head (
  trace_id TEXT PRIMARY KEY,
  most_recent_commit_id TEXT NOT NULL,
  digest TEXT NOT NULL,
  keys TEXT NOT NULL CHECK (json_valid(keys)),
  matches_any_ignore_rule TEXT NOT NULL DEFAULT 'unknown' CHECK (
    matches_any_ignore_rule IN ('unknown', 'true', 'false')
  ),
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_values_at_head_ignore_state
  ON values_at_head(matches_any_ignore_rule, trace_id);
";

/// The two projections carrying the derived flag.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceTable {
    Traces,
    ValuesAtHead,
}

impl TraceTable {
    pub const ALL: [Self; 2] = [Self::Traces, Self::ValuesAtHead];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::ValuesAtHead => "values_at_head",
        }
    }
}

pub struct SqliteIgnoreStore {
    conn: Connection,
    config: EngineConfig,
    rule_cache: Option<Arc<RuleCache>>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub strategy: ConvergenceStrategy,
    pub batches: usize,
    pub rows_scanned: usize,
    pub rows_written: usize,
    pub traces_written: usize,
    pub values_at_head_written: usize,
    pub complete: bool,
}

impl ConvergenceReport {
    fn record(&mut self, table: TraceTable, outcome: &BatchOutcome) {
        self.batches += 1;
        self.rows_scanned += outcome.scanned;
        self.rows_written += outcome.written;
        match table {
            TraceTable::Traces => self.traces_written += outcome.written,
            TraceTable::ValuesAtHead => self.values_at_head_written += outcome.written,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.batches += other.batches;
        self.rows_scanned += other.rows_scanned;
        self.rows_written += other.rows_written;
        self.traces_written += other.traces_written;
        self.values_at_head_written += other.values_at_head_written;
        self.complete = self.complete && other.complete;
    }

    fn finished(strategy: ConvergenceStrategy) -> Self {
        Self {
            strategy,
            complete: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RuleWrite {
    pub rule: Rule,
    pub convergence: ConvergenceReport,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RuleDeletion {
    pub rule_id: RuleId,
    pub deleted: bool,
    pub convergence: ConvergenceReport,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RuleCoverage {
    pub rule_id: RuleId,
    pub matched_traces: usize,
    pub exclusive_traces: usize,
}

/// Head-of-tree observation for a trace, written by ingestion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct HeadValue {
    pub commit_id: String,
    pub digest: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TraceRecord {
    pub keys: TraceKeys,
    pub head: Option<HeadValue>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TableStatus {
    pub table: TraceTable,
    pub rows: usize,
    pub unknown: usize,
    pub ignored: usize,
    pub not_ignored: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConvergenceStatus {
    pub contract_version: String,
    pub rules: usize,
    pub rules_revision: i64,
    pub tables: Vec<TableStatus>,
    pub cross_table_mismatches: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConvergenceIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConvergenceCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: ConvergenceStatus,
    pub issues: Vec<ConvergenceIssue>,
    pub mismatch_sample: Vec<TraceId>,
}

/// Rows a convergence job visits.
#[derive(Debug, Clone)]
enum Scope {
    Unknown,
    All,
    Matching(RuleQuery),
}

impl Scope {
    fn compile(&self, arg_start: usize) -> CompiledCondition {
        match self {
            Self::Unknown => CompiledCondition {
                sql: "matches_any_ignore_rule = 'unknown'".to_string(),
                args: Vec::new(),
                next_placeholder: arg_start,
            },
            Self::All => CompiledCondition {
                sql: "TRUE".to_string(),
                args: Vec::new(),
                next_placeholder: arg_start,
            },
            Self::Matching(query) => compile(std::slice::from_ref(query), arg_start),
        }
    }

    fn admits(&self, row: &PulledRow) -> bool {
        match self {
            Self::Unknown => row.state == TriState::Unknown,
            Self::All => true,
            Self::Matching(query) => query.matches(&row.keys),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Effect {
    /// Additive: rows in scope become True, nothing flips to False.
    MarkTrue,
    /// Rows in scope take the value of the current live rule set.
    Recompute,
}

#[derive(Debug, Clone)]
struct ConvergenceJob {
    label: &'static str,
    scope: Scope,
    effect: Effect,
}

impl ConvergenceJob {
    /// Rows a batch selects: the scope, minus rows a MarkTrue job has nothing
    /// left to do for.
    fn row_filter(&self, arg_start: usize) -> CompiledCondition {
        let mut filter = self.scope.compile(arg_start);
        if self.effect == Effect::MarkTrue {
            filter.sql = format!("{} AND matches_any_ignore_rule != 'true'", filter.sql);
        }
        filter
    }

    /// The row filter, or `None` when it cannot share a statement with
    /// `reserved` other parameters.
    fn bounded_row_filter(&self, reserved: usize) -> Option<CompiledCondition> {
        let filter = self.row_filter(reserved + 1);
        (reserved + filter.args.len() <= MAX_BOUND_PARAMETERS).then_some(filter)
    }
}

#[derive(Debug, Clone, Default)]
struct BatchOutcome {
    scanned: usize,
    written: usize,
    last_trace_id: Option<String>,
}

#[derive(Debug, Clone)]
struct PulledRow {
    trace_id: String,
    keys: TraceKeys,
    state: TriState,
}

impl SqliteIgnoreStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let conn = open_connection(path, config.busy_timeout_ms)?;
        let rule_cache = config.rule_cache.then(|| Arc::new(RuleCache::new()));

        Ok(Self {
            conn,
            config,
            rule_cache,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_IGNORE_V1)
            .context("failed to apply ignore schema")?;

        let now = format_rfc3339(ignore_store_core::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![IGNORE_MIGRATION_VERSION, now],
            )
            .context("failed to register ignore schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_strategy(&mut self, strategy: ConvergenceStrategy) {
        self.config.strategy = strategy;
    }

    /// Shares `cache` with this handle (e.g. one kept warm by a [`RuleWatcher`]).
    pub fn attach_rule_cache(&mut self, cache: Arc<RuleCache>) {
        self.rule_cache = Some(cache);
    }

    #[must_use]
    pub fn rule_cache(&self) -> Option<Arc<RuleCache>> {
        self.rule_cache.clone()
    }

    /// Persists a new rule, then marks every trace its query matches.
    ///
    /// The query is validated before anything is written. Once the rule row
    /// commits it stays, even if the follow-up trace update fails; re-running
    /// the convergence is idempotent.
    pub fn create_rule(&mut self, ctx: &OpContext, draft: &RuleDraft) -> Result<RuleWrite> {
        let query = draft.validate()?;
        ctx.check("create ignore rule")?;

        let rule = Rule {
            id: RuleId::generate(),
            created_by: draft.author.clone(),
            updated_by: draft.author.clone(),
            expires: draft.expires,
            query,
            note: draft.note.clone(),
        };
        let expires = format_rfc3339(rule.expires)?;
        let serialized = rule.query.serialize();

        run_batch(
            &mut self.conn,
            self.config.busy_retries,
            "insert ignore rule",
            |tx| {
                tx.execute(
                    "INSERT INTO ignore_rules(rule_id, created_by, updated_by, expires, query, note)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        rule.id.to_string(),
                        rule.created_by,
                        rule.updated_by,
                        expires,
                        serialized,
                        rule.note
                    ],
                )
                .context("failed to insert ignore rule")?;
                Ok(())
            },
        )?;

        let convergence = self.converge(
            ctx,
            &ConvergenceJob {
                label: "mark traces for created rule",
                scope: Scope::Matching(rule.query.clone()),
                effect: Effect::MarkTrue,
            },
            None,
        )?;

        tracing::info!(
            rule_id = %rule.id,
            query = %rule.query,
            strategy = convergence.strategy.as_str(),
            rows_written = convergence.rows_written,
            "ignore rule created"
        );

        Ok(RuleWrite { rule, convergence })
    }

    /// All rules, soonest expiry first.
    pub fn list_rules(&self, ctx: &OpContext) -> Result<Vec<Rule>> {
        ctx.check("list ignore rules")?;
        let rules = match &self.rule_cache {
            Some(cache) => cache.rules(&self.conn)?.as_ref().clone(),
            None => load_rules(&self.conn)?,
        };
        Ok(rules)
    }

    pub fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        select_rule(&self.conn, id)
    }

    /// Replaces a rule's mutable fields.
    ///
    /// When the normalized query changed, traces that matched the old query
    /// are recomputed against the current rules (which already include the
    /// new query), then traces matching the new query are marked.
    pub fn update_rule(&mut self, ctx: &OpContext, change: &RuleChange) -> Result<RuleWrite> {
        let query = change.validate()?;
        ctx.check("update ignore rule")?;

        let expires = format_rfc3339(change.expires)?;
        let serialized = query.serialize();

        let previous = run_batch(
            &mut self.conn,
            self.config.busy_retries,
            "update ignore rule",
            |tx| {
                let Some(existing) = select_rule(tx, change.id)? else {
                    return Err(IgnoreError::NotFound(format!("ignore rule {}", change.id)).into());
                };
                tx.execute(
                    "UPDATE ignore_rules
                     SET updated_by = ?2, expires = ?3, query = ?4, note = ?5
                     WHERE rule_id = ?1",
                    params![
                        change.id.to_string(),
                        change.updated_by,
                        expires,
                        serialized,
                        change.note
                    ],
                )
                .context("failed to update ignore rule")?;
                Ok(existing)
            },
        )?;

        let rule = Rule {
            id: previous.id,
            created_by: previous.created_by.clone(),
            updated_by: change.updated_by.clone(),
            expires: change.expires,
            query,
            note: change.note.clone(),
        };

        let mut convergence = ConvergenceReport::finished(self.config.strategy);
        if !previous.query.same_predicate(&rule.query) {
            convergence = self.converge(
                ctx,
                &ConvergenceJob {
                    label: "recompute traces matching replaced query",
                    scope: Scope::Matching(previous.query.clone()),
                    effect: Effect::Recompute,
                },
                None,
            )?;
            let marked = self.converge(
                ctx,
                &ConvergenceJob {
                    label: "mark traces for updated rule",
                    scope: Scope::Matching(rule.query.clone()),
                    effect: Effect::MarkTrue,
                },
                None,
            )?;
            convergence.absorb(&marked);
        }

        tracing::info!(
            rule_id = %rule.id,
            query = %rule.query,
            predicate_changed = !previous.query.same_predicate(&rule.query),
            rows_written = convergence.rows_written,
            "ignore rule updated"
        );

        Ok(RuleWrite { rule, convergence })
    }

    /// Removes a rule and recomputes the traces it matched. Deleting an
    /// unknown id succeeds without touching anything.
    pub fn delete_rule(&mut self, ctx: &OpContext, id: RuleId) -> Result<RuleDeletion> {
        ctx.check("delete ignore rule")?;

        let removed = run_batch(
            &mut self.conn,
            self.config.busy_retries,
            "delete ignore rule",
            |tx| {
                let existing = select_rule(tx, id)?;
                if existing.is_some() {
                    tx.execute(
                        "DELETE FROM ignore_rules WHERE rule_id = ?1",
                        params![id.to_string()],
                    )
                    .context("failed to delete ignore rule")?;
                }
                Ok(existing)
            },
        )?;

        let Some(rule) = removed else {
            tracing::debug!(rule_id = %id, "delete of absent ignore rule ignored");
            return Ok(RuleDeletion {
                rule_id: id,
                deleted: false,
                convergence: ConvergenceReport::finished(self.config.strategy),
            });
        };

        let convergence = self.converge(
            ctx,
            &ConvergenceJob {
                label: "recompute traces matching deleted rule",
                scope: Scope::Matching(rule.query),
                effect: Effect::Recompute,
            },
            None,
        )?;

        tracing::info!(
            rule_id = %id,
            rows_written = convergence.rows_written,
            "ignore rule deleted"
        );

        Ok(RuleDeletion {
            rule_id: id,
            deleted: true,
            convergence,
        })
    }

    /// Resolves Unknown rows in both tables against the current rule set,
    /// stopping after `max_batches_per_run` non-empty batches.
    pub fn run_backfill(&mut self, ctx: &OpContext) -> Result<ConvergenceReport> {
        let limit = self.config.max_batches_per_run;
        self.run_backfill_with_limit(ctx, limit)
    }

    pub fn run_backfill_with_limit(
        &mut self,
        ctx: &OpContext,
        max_batches: Option<usize>,
    ) -> Result<ConvergenceReport> {
        let report = self.converge(
            ctx,
            &ConvergenceJob {
                label: "backfill unknown ignore state",
                scope: Scope::Unknown,
                effect: Effect::Recompute,
            },
            max_batches,
        )?;

        if report.complete {
            tracing::info!(
                batches = report.batches,
                rows_written = report.rows_written,
                "backfill sweep complete"
            );
        } else {
            tracing::warn!(
                batches = report.batches,
                rows_written = report.rows_written,
                "backfill sweep stopped at batch limit; unknown rows remain"
            );
        }

        Ok(report)
    }

    /// Recomputes every row in both tables; writes only rows whose flag is
    /// wrong for the current rules.
    pub fn reconcile(&mut self, ctx: &OpContext) -> Result<ConvergenceReport> {
        let report = self.converge(
            ctx,
            &ConvergenceJob {
                label: "reconcile ignore state",
                scope: Scope::All,
                effect: Effect::Recompute,
            },
            None,
        )?;
        tracing::info!(
            rows_scanned = report.rows_scanned,
            rows_written = report.rows_written,
            "reconcile complete"
        );
        Ok(report)
    }

    /// Counts head traces the rule matches, and those no other live rule covers.
    pub fn rule_coverage(&self, ctx: &OpContext, id: RuleId) -> Result<RuleCoverage> {
        let rules = load_rules(&self.conn)?;
        let Some(rule) = rules.iter().find(|rule| rule.id == id) else {
            return Err(IgnoreError::NotFound(format!("ignore rule {id}")).into());
        };
        let others: Vec<Rule> = rules
            .iter()
            .filter(|candidate| candidate.id != id)
            .cloned()
            .collect();
        let others = live_predicates(&others);

        let mut coverage = RuleCoverage {
            rule_id: id,
            matched_traces: 0,
            exclusive_traces: 0,
        };
        if rule.query.is_empty() {
            return Ok(coverage);
        }

        let filter = ConvergenceJob {
            label: "rule coverage",
            scope: Scope::Matching(rule.query.clone()),
            effect: Effect::Recompute,
        }
        .bounded_row_filter(1);
        let mut cursor = String::new();
        loop {
            ctx.check("rule coverage")?;
            let rows = pull_rows(
                &self.conn,
                TraceTable::ValuesAtHead,
                &cursor,
                filter.as_ref(),
                self.config.batch_size,
            )?;
            for row in &rows {
                if rule.query.matches(&row.keys) {
                    coverage.matched_traces += 1;
                    if !matches_any(&row.keys, &others) {
                        coverage.exclusive_traces += 1;
                    }
                }
            }
            match rows.last() {
                Some(last) if rows.len() == self.config.batch_size => {
                    cursor.clone_from(&last.trace_id);
                }
                _ => break,
            }
        }

        Ok(coverage)
    }

    /// Ingestion-side write: inserts the trace with an Unknown flag.
    ///
    /// An existing trace keeps its flag; a head row only has its commit and
    /// digest refreshed.
    pub fn record_trace(&mut self, record: &TraceRecord) -> Result<TraceId> {
        let trace_id = TraceId::from_keys(&record.keys)?;
        let keys_json =
            serde_json::to_string(&record.keys).context("failed to serialize trace keys")?;

        run_batch(
            &mut self.conn,
            self.config.busy_retries,
            "record trace",
            |tx| {
                tx.execute(
                    "INSERT INTO traces(trace_id, keys) VALUES (?1, ?2)
                     ON CONFLICT(trace_id) DO NOTHING",
                    params![trace_id.as_str(), keys_json],
                )
                .context("failed to insert trace")?;

                if let Some(head) = &record.head {
                    tx.execute(
                        "INSERT INTO values_at_head(trace_id, most_recent_commit_id, digest, keys)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(trace_id) DO UPDATE SET
                           most_recent_commit_id = excluded.most_recent_commit_id,
                           digest = excluded.digest",
                        params![trace_id.as_str(), head.commit_id, head.digest, keys_json],
                    )
                    .context("failed to upsert values_at_head row")?;
                }
                Ok(())
            },
        )?;

        Ok(trace_id)
    }

    pub fn trace_state(&self, table: TraceTable, trace_id: &TraceId) -> Result<Option<TriState>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT matches_any_ignore_rule FROM {} WHERE trace_id = ?1",
                    table.as_str()
                ),
                params![trace_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {} state", table.as_str()))?;

        raw.map(|value| {
            TriState::parse(&value).ok_or_else(|| anyhow!("invalid stored ignore state: {value}"))
        })
        .transpose()
    }

    pub fn convergence_status(&self) -> Result<ConvergenceStatus> {
        let rules: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ignore_rules", [], |row| row.get(0))
            .context("failed to count ignore rules")?;

        let mut tables = Vec::with_capacity(TraceTable::ALL.len());
        for table in TraceTable::ALL {
            tables.push(table_status(&self.conn, table)?);
        }

        let mismatches: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM values_at_head head
                 JOIN traces trace ON trace.trace_id = head.trace_id
                 WHERE head.matches_any_ignore_rule != 'unknown'
                   AND trace.matches_any_ignore_rule != 'unknown'
                   AND head.matches_any_ignore_rule != trace.matches_any_ignore_rule",
                [],
                |row| row.get(0),
            )
            .context("failed to count cross-table mismatches")?;

        Ok(ConvergenceStatus {
            contract_version: "convergence_status.v1".to_string(),
            rules: to_count(rules)?,
            rules_revision: rules_revision(&self.conn)?,
            tables,
            cross_table_mismatches: to_count(mismatches)?,
        })
    }

    pub fn convergence_check(&self) -> Result<ConvergenceCheck> {
        let status = self.convergence_status()?;
        let mut issues = Vec::new();

        let unknown: usize = status.tables.iter().map(|table| table.unknown).sum();
        if unknown > 0 {
            issues.push(ConvergenceIssue {
                code: "unknown_rows".to_string(),
                severity: IssueSeverity::Warning,
                message: format!("{unknown} rows await a backfill sweep"),
            });
        }

        if status.cross_table_mismatches > 0 {
            issues.push(ConvergenceIssue {
                code: "cross_table_mismatch".to_string(),
                severity: IssueSeverity::Error,
                message: format!(
                    "traces and values_at_head disagree for {} traces",
                    status.cross_table_mismatches
                ),
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT head.trace_id
             FROM values_at_head head
             JOIN traces trace ON trace.trace_id = head.trace_id
             WHERE head.matches_any_ignore_rule != 'unknown'
               AND trace.matches_any_ignore_rule != 'unknown'
               AND head.matches_any_ignore_rule != trace.matches_any_ignore_rule
             ORDER BY head.trace_id ASC
             LIMIT 25",
        )?;
        let rows = stmt.query_map([], |row| Ok(TraceId(row.get(0)?)))?;
        let mismatch_sample = collect_rows(rows)?;

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Error);

        Ok(ConvergenceCheck {
            contract_version: "convergence_check.v1".to_string(),
            healthy,
            status,
            issues,
            mismatch_sample,
        })
    }

    /// Drives one job over both tables, one batch per table per round.
    fn converge(
        &mut self,
        ctx: &OpContext,
        job: &ConvergenceJob,
        max_batches: Option<usize>,
    ) -> Result<ConvergenceReport> {
        let strategy = self.config.strategy;
        let mut report = ConvergenceReport {
            strategy,
            ..ConvergenceReport::default()
        };

        if matches!(&job.scope, Scope::Matching(query) if query.is_empty()) {
            report.complete = true;
            return Ok(report);
        }

        let cache = self.rule_cache.clone();
        let batch_size = self.config.batch_size;
        let retries = self.config.busy_retries;
        let mut cursors: Vec<(TraceTable, Option<String>)> = TraceTable::ALL
            .iter()
            .map(|table| (*table, Some(String::new())))
            .collect();

        let mut capped = false;
        'rounds: loop {
            let mut progressed = false;
            for (table, cursor) in &mut cursors {
                let Some(position) = cursor.clone() else {
                    continue;
                };
                if max_batches.is_some_and(|limit| report.batches >= limit) {
                    capped = true;
                    break 'rounds;
                }
                ctx.check(job.label)?;

                let table = *table;
                let outcome = run_batch(&mut self.conn, retries, job.label, |tx| {
                    let rules = match job.effect {
                        Effect::Recompute => live_rule_set(tx, cache.as_deref())?,
                        Effect::MarkTrue => Vec::new(),
                    };
                    match strategy {
                        ConvergenceStrategy::PushDown => {
                            push_down_batch(tx, table, job, &rules, &position, batch_size)
                        }
                        ConvergenceStrategy::PullThenPush => {
                            pull_then_push_batch(tx, table, job, &rules, &position, batch_size)
                        }
                    }
                })?;

                if outcome.scanned > 0 {
                    tracing::debug!(
                        job = job.label,
                        table = table.as_str(),
                        scanned = outcome.scanned,
                        written = outcome.written,
                        "convergence batch committed"
                    );
                    report.record(table, &outcome);
                }
                *cursor = if outcome.scanned < batch_size {
                    None
                } else {
                    outcome.last_trace_id
                };
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        report.complete = !capped || !has_pending_rows(&self.conn, job, &cursors)?;
        Ok(report)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Read-through cache of the rule list keyed on the rule revision counter.
///
/// Every read compares the stored revision with the cached one, so a reader
/// never sees a rule list older than the last committed rule change.
#[derive(Debug, Default)]
pub struct RuleCache {
    state: RwLock<Option<(i64, Arc<Vec<Rule>>)>>,
}

impl RuleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn revision(&self) -> Option<i64> {
        self.state
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(revision, _)| *revision))
    }

    pub fn rules(&self, conn: &Connection) -> Result<Arc<Vec<Rule>>> {
        let revision = rules_revision(conn)?;
        {
            let guard = self
                .state
                .read()
                .map_err(|_| anyhow!("rule cache lock poisoned"))?;
            if let Some((cached_revision, rules)) = guard.as_ref() {
                if *cached_revision == revision {
                    return Ok(Arc::clone(rules));
                }
            }
        }

        let rules = Arc::new(load_rules(conn)?);
        if rules_revision(conn)? == revision {
            let mut guard = self
                .state
                .write()
                .map_err(|_| anyhow!("rule cache lock poisoned"))?;
            *guard = Some((revision, Arc::clone(&rules)));
        }
        Ok(rules)
    }

    /// Reloads when the stored revision moved; returns whether it did.
    pub fn refresh(&self, conn: &Connection) -> Result<bool> {
        let before = self.revision();
        self.rules(conn)?;
        Ok(self.revision() != before)
    }
}

/// Background thread keeping a [`RuleCache`] warm from its own connection.
pub struct RuleWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RuleWatcher {
    pub fn spawn(
        path: &Path,
        cache: Arc<RuleCache>,
        interval: Duration,
        busy_timeout_ms: u64,
    ) -> Result<Self> {
        let conn = open_connection(path, busy_timeout_ms)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("ignore-rule-watcher".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    match cache.refresh(&conn) {
                        Ok(true) => {
                            tracing::debug!(revision = ?cache.revision(), "rule cache refreshed");
                        }
                        Ok(false) => {}
                        Err(err) => tracing::warn!(error = %err, "rule cache refresh failed"),
                    }
                    std::thread::sleep(interval);
                }
            })
            .context("failed to spawn rule watcher thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("rule watcher thread panicked");
            }
        }
    }
}

impl Drop for RuleWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
    .context("failed to configure sqlite pragmas")?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
        .context("failed to configure sqlite busy timeout")?;

    Ok(conn)
}

/// Runs `body` in its own IMMEDIATE transaction, retrying busy/locked
/// failures `retries` times before surfacing `StoreUnavailable`.
fn run_batch<T>(
    conn: &mut Connection,
    retries: u32,
    stage: &str,
    mut body: impl FnMut(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0_u32;
    loop {
        match attempt_batch(conn, &mut body) {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < retries => {
                attempt += 1;
                tracing::debug!(stage, attempt, "store busy; retrying batch");
                std::thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
            }
            Err(err) if is_busy(&err) => {
                return Err(IgnoreError::StoreUnavailable(format!(
                    "{stage}: {err:#} (after {retries} retries)"
                ))
                .into());
            }
            Err(err) => return Err(err.context(format!("{stage} failed"))),
        }
    }
}

fn attempt_batch<T>(
    conn: &mut Connection,
    body: &mut impl FnMut(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn push_down_batch(
    tx: &Transaction<'_>,
    table: TraceTable,
    job: &ConvergenceJob,
    rules: &[RuleQuery],
    cursor: &str,
    batch_size: usize,
) -> Result<BatchOutcome> {
    let name = table.as_str();

    let scope = job.row_filter(3);
    let target_condition = match job.effect {
        Effect::MarkTrue => None,
        Effect::Recompute => Some(compile(rules, scope.next_placeholder)),
    };
    let parameters = 2
        + scope.args.len()
        + target_condition
            .as_ref()
            .map_or(0, |condition| condition.args.len());
    if parameters > MAX_BOUND_PARAMETERS {
        tracing::debug!(
            job = job.label,
            table = name,
            parameters,
            "rule set exceeds bound parameter limit; evaluating batch in process"
        );
        return pull_then_push_batch(tx, table, job, rules, cursor, batch_size);
    }

    let window_scope = job.row_filter(2);
    let mut window_params = vec![SqlValue::Text(cursor.to_string())];
    window_params.extend(window_scope.args.iter().cloned().map(SqlValue::Text));
    let (scanned, upper): (i64, Option<String>) = tx
        .query_row(
            &format!(
                "SELECT COUNT(*), MAX(trace_id) FROM (
                   SELECT trace_id FROM {name}
                   WHERE trace_id > ?1 AND {}
                   ORDER BY trace_id ASC
                   LIMIT {batch_size}
                 )",
                window_scope.sql
            ),
            params_from_iter(window_params.iter()),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .with_context(|| format!("failed to select {name} batch window"))?;

    let Some(upper) = upper else {
        return Ok(BatchOutcome::default());
    };

    let (target, target_args) = match target_condition {
        None => ("'true'".to_string(), Vec::new()),
        Some(condition) => (
            format!("(CASE WHEN {} THEN 'true' ELSE 'false' END)", condition.sql),
            condition.args,
        ),
    };

    let mut update_params = vec![
        SqlValue::Text(cursor.to_string()),
        SqlValue::Text(upper.clone()),
    ];
    update_params.extend(scope.args.into_iter().map(SqlValue::Text));
    update_params.extend(target_args.into_iter().map(SqlValue::Text));

    let written = tx
        .execute(
            &format!(
                "UPDATE {name} SET matches_any_ignore_rule = {target}
                 WHERE trace_id > ?1 AND trace_id <= ?2
                   AND {}
                   AND matches_any_ignore_rule != {target}",
                scope.sql
            ),
            params_from_iter(update_params.iter()),
        )
        .with_context(|| format!("failed to update {name} batch"))?;

    Ok(BatchOutcome {
        scanned: to_count(scanned)?,
        written,
        last_trace_id: Some(upper),
    })
}

fn pull_then_push_batch(
    tx: &Transaction<'_>,
    table: TraceTable,
    job: &ConvergenceJob,
    rules: &[RuleQuery],
    cursor: &str,
    batch_size: usize,
) -> Result<BatchOutcome> {
    let filter = job.bounded_row_filter(1);
    let rows = pull_rows(tx, table, cursor, filter.as_ref(), batch_size)?;

    let changes: Vec<(&str, TriState)> = rows
        .par_iter()
        .filter(|row| job.scope.admits(row))
        .filter_map(|row| {
            let next = match job.effect {
                Effect::MarkTrue => TriState::True,
                Effect::Recompute => TriState::from_match(matches_any(&row.keys, rules)),
            };
            (next != row.state).then_some((row.trace_id.as_str(), next))
        })
        .collect();

    let mut update = tx.prepare(&format!(
        "UPDATE {} SET matches_any_ignore_rule = ?2 WHERE trace_id = ?1",
        table.as_str()
    ))?;
    for (trace_id, state) in &changes {
        update
            .execute(params![trace_id, state.as_str()])
            .with_context(|| format!("failed to write ignore state for {trace_id}"))?;
    }

    Ok(BatchOutcome {
        scanned: rows.len(),
        written: changes.len(),
        last_trace_id: rows.last().map(|row| row.trace_id.clone()),
    })
}

/// Next keyset page of `table` after `cursor`; `filter` numbers its
/// placeholders from `?2`.
fn pull_rows(
    conn: &Connection,
    table: TraceTable,
    cursor: &str,
    filter: Option<&CompiledCondition>,
    batch_size: usize,
) -> Result<Vec<PulledRow>> {
    let mut params = vec![SqlValue::Text(cursor.to_string())];
    let filter_sql = filter.map_or_else(String::new, |filter| {
        params.extend(filter.args.iter().cloned().map(SqlValue::Text));
        format!(" AND {}", filter.sql)
    });
    let mut stmt = conn.prepare(&format!(
        "SELECT trace_id, keys, matches_any_ignore_rule
         FROM {}
         WHERE trace_id > ?1{filter_sql}
         ORDER BY trace_id ASC
         LIMIT {batch_size}",
        table.as_str()
    ))?;
    let rows = stmt.query_map(params_from_iter(params.iter()), parse_pulled_row)?;
    collect_rows(rows)
}

/// Whether any table still holds rows the job would select past its cursor.
fn has_pending_rows(
    conn: &Connection,
    job: &ConvergenceJob,
    cursors: &[(TraceTable, Option<String>)],
) -> Result<bool> {
    let filter = job.bounded_row_filter(1);
    for (table, cursor) in cursors {
        let Some(position) = cursor else {
            continue;
        };
        let mut params = vec![SqlValue::Text(position.clone())];
        let filter_sql = filter.as_ref().map_or_else(String::new, |filter| {
            params.extend(filter.args.iter().cloned().map(SqlValue::Text));
            format!(" AND {}", filter.sql)
        });
        let pending: bool = conn
            .query_row(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM {} WHERE trace_id > ?1{filter_sql})",
                    table.as_str()
                ),
                params_from_iter(params.iter()),
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look ahead in {}", table.as_str()))?;
        if pending {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_pulled_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PulledRow> {
    let trace_id: String = row.get(0)?;
    let keys_raw: String = row.get(1)?;
    let state_raw: String = row.get(2)?;

    let keys: TraceKeys = serde_json::from_str(&keys_raw).map_err(|err| {
        invalid_data(1, format!("invalid keys JSON for trace {trace_id}: {err}"))
    })?;
    let state = TriState::parse(&state_raw)
        .ok_or_else(|| invalid_data(2, format!("invalid ignore state: {state_raw}")))?;

    Ok(PulledRow {
        trace_id,
        keys,
        state,
    })
}

fn live_rule_set(conn: &Connection, cache: Option<&RuleCache>) -> Result<Vec<RuleQuery>> {
    let rules = match cache {
        Some(cache) => cache.rules(conn)?,
        None => Arc::new(load_rules(conn)?),
    };
    Ok(live_predicates(&rules))
}

fn load_rules(conn: &Connection) -> Result<Vec<Rule>> {
    let mut stmt = conn.prepare(
        "SELECT rule_id, created_by, updated_by, expires, query, note
         FROM ignore_rules",
    )?;
    let rows = stmt.query_map([], parse_rule_row)?;
    let mut rules = collect_rows(rows)?;
    rules.sort_by(|lhs, rhs| lhs.expires.cmp(&rhs.expires).then(lhs.id.cmp(&rhs.id)));
    Ok(rules)
}

fn select_rule(conn: &Connection, id: RuleId) -> Result<Option<Rule>> {
    let rule = conn
        .query_row(
            "SELECT rule_id, created_by, updated_by, expires, query, note
             FROM ignore_rules
             WHERE rule_id = ?1",
            params![id.to_string()],
            parse_rule_row,
        )
        .optional()
        .with_context(|| format!("failed to read ignore rule {id}"))?;
    Ok(rule)
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rule> {
    let id_raw: String = row.get(0)?;
    let expires_raw: String = row.get(3)?;
    let query_raw: String = row.get(4)?;

    let id = id_raw
        .parse::<RuleId>()
        .map_err(|err| invalid_data(0, err.to_string()))?;
    let expires = parse_rfc3339_utc(&expires_raw).map_err(|err| invalid_data(3, err.to_string()))?;
    let query = RuleQuery::parse(&query_raw)
        .map_err(|err| invalid_data(4, err.to_string()))?
        .normalized();

    Ok(Rule {
        id,
        created_by: row.get(1)?,
        updated_by: row.get(2)?,
        expires,
        query,
        note: row.get(5)?,
    })
}

fn rules_revision(conn: &Connection) -> Result<i64> {
    let revision = conn
        .query_row(
            "SELECT revision FROM ignore_rules_revision WHERE singleton = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read ignore rule revision")?;
    Ok(revision.unwrap_or(0))
}

fn table_status(conn: &Connection, table: TraceTable) -> Result<TableStatus> {
    let mut status = TableStatus {
        table,
        rows: 0,
        unknown: 0,
        ignored: 0,
        not_ignored: 0,
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT matches_any_ignore_rule, COUNT(*) FROM {} GROUP BY matches_any_ignore_rule",
        table.as_str()
    ))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let state_raw: String = row.get(0)?;
        let count = to_count(row.get(1)?)?;
        status.rows += count;
        match TriState::parse(&state_raw) {
            Some(TriState::Unknown) => status.unknown += count,
            Some(TriState::True) => status.ignored += count,
            Some(TriState::False) => status.not_ignored += count,
            None => return Err(anyhow!("invalid stored ignore state: {state_raw}")),
        }
    }

    Ok(status)
}

fn to_count(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("invalid row count: {value}"))
}

fn invalid_data(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
