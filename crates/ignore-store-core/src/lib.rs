//! Domain model for ignore rules and the derived "matches any ignore rule"
//! annotation carried by traces.
//!
//! This crate is storage-agnostic: it parses and normalizes rule queries,
//! compiles them into `SQLite` filter fragments, and evaluates them in process
//! against a trace's key/value map. Both evaluation paths treat a trace that
//! lacks a predicate key as not matching.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;
use url::form_urlencoded;

/// Full parameter set of a trace.
pub type TraceKeys = BTreeMap<String, String>;

/// Column holding the JSON-encoded [`TraceKeys`] in every trace table.
pub const KEYS_COLUMN: &str = "keys";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IgnoreError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RuleId(pub Ulid);

impl RuleId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = IgnoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| IgnoreError::Validation(format!("invalid rule id {value}: {err}")))
    }
}

/// Content-derived trace identifier, stable for the lifetime of a trace.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    /// Derives the identifier from the canonical (key-sorted) JSON encoding
    /// of the trace keys.
    ///
    /// # Errors
    /// Returns [`IgnoreError::Validation`] when the keys cannot be encoded.
    pub fn from_keys(keys: &TraceKeys) -> Result<Self, IgnoreError> {
        let encoded = serde_json::to_vec(keys)
            .map_err(|err| IgnoreError::Validation(format!("failed to encode trace keys: {err}")))?;
        Ok(Self(hex::encode(Sha256::digest(&encoded))))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tri-state "matches any ignore rule" annotation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    Unknown,
    True,
    False,
}

impl TriState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::True => "true",
            Self::False => "false",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "true" => Some(Self::True),
            "false" => Some(Self::False),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_match(matched: bool) -> Self {
        if matched {
            Self::True
        } else {
            Self::False
        }
    }

    #[must_use]
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A rule query: key to the set of allowed values.
///
/// A trace satisfies the query iff every key in the query is present in the
/// trace and its value is one of the allowed values. A query with zero keys
/// is satisfied by every trace; rules carrying such a query are dropped by
/// [`live_predicates`] because an empty rule matches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct RuleQuery(BTreeMap<String, Vec<String>>);

impl RuleQuery {
    #[must_use]
    pub fn from_map(map: BTreeMap<String, Vec<String>>) -> Self {
        Self(map)
    }

    /// Parses the URL-encoded wire form (`k1=v1&k1=v2&k2=v3`).
    ///
    /// Value order is preserved as written; call [`RuleQuery::normalize`]
    /// for a deterministic form.
    ///
    /// # Errors
    /// Returns [`IgnoreError::InvalidQuery`] for malformed percent escapes,
    /// `;` separators, empty keys, or escapes that decode to invalid UTF-8.
    pub fn parse(wire: &str) -> Result<Self, IgnoreError> {
        validate_wire_form(wire)?;

        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in wire.split('&').filter(|pair| !pair.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(raw_key, wire)?;
            if key.is_empty() {
                return Err(IgnoreError::InvalidQuery(format!(
                    "empty key in query {wire:?}"
                )));
            }
            let value = decode_component(raw_value, wire)?;
            map.entry(key).or_default().push(value);
        }

        Ok(Self(map))
    }

    /// Sorts and deduplicates each key's value set.
    pub fn normalize(&mut self) {
        for values in self.0.values_mut() {
            values.sort();
            values.dedup();
        }
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Encodes the query in normalized (sorted, deduplicated) wire form.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.0 {
            let mut sorted: Vec<&String> = values.iter().collect();
            sorted.sort();
            sorted.dedup();
            for value in sorted {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    #[must_use]
    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Conjunction of key-membership terms; a missing key never matches.
    #[must_use]
    pub fn matches(&self, keys: &TraceKeys) -> bool {
        self.0.iter().all(|(key, allowed)| {
            keys.get(key)
                .is_some_and(|value| allowed.iter().any(|candidate| candidate == value))
        })
    }

    /// Equality after normalization, used to decide whether an update
    /// changed a rule's predicate.
    #[must_use]
    pub fn same_predicate(&self, other: &Self) -> bool {
        self.serialize() == other.serialize()
    }
}

impl Display for RuleQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// Form-decodes one key or value; the decoded bytes must be valid UTF-8.
fn decode_component(raw: &str, wire: &str) -> Result<String, IgnoreError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| {
            IgnoreError::InvalidQuery(format!("query {wire:?} does not decode to valid UTF-8"))
        })
}

fn validate_wire_form(wire: &str) -> Result<(), IgnoreError> {
    if wire.contains(';') {
        return Err(IgnoreError::InvalidQuery(format!(
            "query {wire:?} uses ';' as a separator; use '&'"
        )));
    }

    let bytes = wire.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let well_formed = bytes
                .get(index + 1..index + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !well_formed {
                return Err(IgnoreError::InvalidQuery(format!(
                    "malformed percent escape at byte {index} in {wire:?}"
                )));
            }
            index += 3;
        } else {
            index += 1;
        }
    }

    Ok(())
}

/// Compiled filter condition plus positional arguments.
///
/// `args[i]` binds to placeholder `?{arg_start + i}`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompiledCondition {
    pub sql: String,
    pub args: Vec<String>,
    pub next_placeholder: usize,
}

/// Compiles predicates into one `SQLite` boolean expression over the JSON
/// [`KEYS_COLUMN`] of the row being filtered.
///
/// Each model becomes a parenthesized conjunction of
/// `EXISTS (SELECT 1 FROM json_each(keys) WHERE key = ? AND value IN (..))`
/// terms in key order; models are joined with `OR`. The `EXISTS` form is
/// never NULL, so a missing key evaluates to false. No models compile to
/// `FALSE`; a model with zero keys compiles to `TRUE`.
#[must_use]
pub fn compile(models: &[RuleQuery], arg_start: usize) -> CompiledCondition {
    let mut next = arg_start;
    let mut args = Vec::new();
    let mut disjuncts = Vec::with_capacity(models.len());

    for model in models {
        if model.is_empty() {
            disjuncts.push("TRUE".to_string());
            continue;
        }

        let mut terms = Vec::with_capacity(model.len());
        for (key, values) in model.iter() {
            let key_slot = next;
            next += 1;
            args.push(key.clone());

            let mut sorted: Vec<&String> = values.iter().collect();
            sorted.sort();
            sorted.dedup();
            let mut slots = Vec::with_capacity(sorted.len());
            for value in sorted {
                slots.push(format!("?{next}"));
                next += 1;
                args.push(value.clone());
            }

            terms.push(format!(
                "EXISTS (SELECT 1 FROM json_each({KEYS_COLUMN}) WHERE json_each.key = ?{key_slot} AND json_each.value IN ({}))",
                slots.join(", ")
            ));
        }
        disjuncts.push(format!("({})", terms.join(" AND ")));
    }

    let sql = match disjuncts.len() {
        0 => "FALSE".to_string(),
        1 => disjuncts.remove(0),
        _ => format!("({})", disjuncts.join(" OR ")),
    };

    CompiledCondition {
        sql,
        args,
        next_placeholder: next,
    }
}

/// In-process counterpart of [`compile`]: true on the first matching model.
#[must_use]
pub fn matches_any(keys: &TraceKeys, models: &[RuleQuery]) -> bool {
    models.iter().any(|model| model.matches(keys))
}

/// Predicates of the rules that can match something.
#[must_use]
pub fn live_predicates(rules: &[Rule]) -> Vec<RuleQuery> {
    rules
        .iter()
        .filter(|rule| !rule.query.is_empty())
        .map(|rule| rule.query.clone())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub created_by: String,
    pub updated_by: String,
    #[serde(with = "rfc3339_utc")]
    pub expires: OffsetDateTime,
    pub query: RuleQuery,
    pub note: String,
}

impl Rule {
    /// Expired rules stay active; expiry only flags them for review.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires <= now
    }
}

/// Input for creating a rule. `query` is the raw wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDraft {
    pub author: String,
    #[serde(with = "rfc3339_utc")]
    pub expires: OffsetDateTime,
    pub query: String,
    pub note: String,
}

impl RuleDraft {
    /// Validates the draft and returns its normalized query.
    ///
    /// # Errors
    /// Returns [`IgnoreError::InvalidQuery`] for an unparseable query and
    /// [`IgnoreError::Validation`] for a missing author or non-UTC expiry.
    pub fn validate(&self) -> Result<RuleQuery, IgnoreError> {
        require_principal("author", &self.author)?;
        require_utc("expires", self.expires)?;
        Ok(RuleQuery::parse(&self.query)?.normalized())
    }
}

/// Full replacement of a rule's mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleChange {
    pub id: RuleId,
    pub updated_by: String,
    #[serde(with = "rfc3339_utc")]
    pub expires: OffsetDateTime,
    pub query: String,
    pub note: String,
}

impl RuleChange {
    /// Validates the change and returns its normalized query.
    ///
    /// # Errors
    /// Same conditions as [`RuleDraft::validate`].
    pub fn validate(&self) -> Result<RuleQuery, IgnoreError> {
        require_principal("updated_by", &self.updated_by)?;
        require_utc("expires", self.expires)?;
        Ok(RuleQuery::parse(&self.query)?.normalized())
    }
}

fn require_principal(field: &str, value: &str) -> Result<(), IgnoreError> {
    if value.trim().is_empty() {
        return Err(IgnoreError::Validation(format!(
            "{field} MUST be provided for every rule write"
        )));
    }
    Ok(())
}

fn require_utc(field: &str, value: OffsetDateTime) -> Result<(), IgnoreError> {
    if value.offset() != UtcOffset::UTC {
        return Err(IgnoreError::Validation(format!(
            "{field} MUST be UTC (offset Z)"
        )));
    }
    Ok(())
}

/// Operation context: optional deadline and shared cancellation flag.
///
/// Engine loops call [`OpContext::check`] before each batch, so only
/// already-committed batches take effect when the context expires.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl OpContext {
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::default().with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// # Errors
    /// Returns [`IgnoreError::Cancelled`] once the cancel flag is set and
    /// [`IgnoreError::DeadlineExceeded`] once the deadline has passed.
    pub fn check(&self, stage: &str) -> Result<(), IgnoreError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Err(IgnoreError::Cancelled(stage.to_string()));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(IgnoreError::DeadlineExceeded(stage.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStrategy {
    /// The store evaluates the compiled rule set inside the UPDATE.
    PushDown,
    /// Rows are fetched, matched in process, and only changed flags written.
    #[default]
    PullThenPush,
}

impl ConvergenceStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PushDown => "push_down",
            Self::PullThenPush => "pull_then_push",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push_down" => Some(Self::PushDown),
            "pull_then_push" => Some(Self::PullThenPush),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_batches_per_run: Option<usize>,
    pub strategy: ConvergenceStrategy,
    pub busy_retries: u32,
    pub busy_timeout_ms: u64,
    pub rule_cache: bool,
    pub rule_watch_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 25_000,
            max_batches_per_run: Some(200),
            strategy: ConvergenceStrategy::default(),
            busy_retries: 3,
            busy_timeout_ms: 5_000,
            rule_cache: false,
            rule_watch_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`IgnoreError::Configuration`] when a bound is zero.
    pub fn validate(&self) -> Result<(), IgnoreError> {
        if self.batch_size == 0 {
            return Err(IgnoreError::Configuration(
                "batch_size MUST be >= 1".to_string(),
            ));
        }
        if self.max_batches_per_run == Some(0) {
            return Err(IgnoreError::Configuration(
                "max_batches_per_run MUST be >= 1 when set".to_string(),
            ));
        }
        if self.rule_watch_interval_ms == 0 {
            return Err(IgnoreError::Configuration(
                "rule_watch_interval_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`IgnoreError::Configuration`] when decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, IgnoreError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            IgnoreError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`IgnoreError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IgnoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IgnoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IgnoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IgnoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IgnoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IgnoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Resolves a rule expiry given either as RFC3339 UTC or as a relative
/// duration `<n><unit>` (`s`, `m`, `h`, `d`, `w`) from `now`.
///
/// # Errors
/// Returns [`IgnoreError::Validation`] for unrecognized input or overflow.
pub fn parse_expires(raw: &str, now: OffsetDateTime) -> Result<OffsetDateTime, IgnoreError> {
    let raw = raw.trim();
    if raw.contains('T') {
        return parse_rfc3339_utc(raw);
    }

    let split = raw
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(raw.len());
    let (amount_raw, unit) = raw.split_at(split);
    let amount: i64 = amount_raw.parse().map_err(|_| {
        IgnoreError::Validation(format!(
            "expires {raw:?} must be RFC3339 or <n><unit> with unit in s,m,h,d,w"
        ))
    })?;
    let unit_seconds: i64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => {
            return Err(IgnoreError::Validation(format!(
                "unsupported duration unit {unit:?} in expires {raw:?}"
            )))
        }
    };

    amount
        .checked_mul(unit_seconds)
        .and_then(|seconds| now.checked_add(Duration::seconds(seconds)))
        .ok_or_else(|| IgnoreError::Validation(format!("expires {raw:?} is out of range")))
}

/// Serde adapter storing timestamps as RFC3339 UTC strings.
pub mod rfc3339_utc {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted =
            super::format_rfc3339(*value).map_err(<S::Error as serde::ser::Error>::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails for non-RFC3339 or non-UTC input.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(<D::Error as serde::de::Error>::custom)
    }
}
