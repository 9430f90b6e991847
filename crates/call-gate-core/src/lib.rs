use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_CALL_LIMIT: u32 = 2;
pub const DEFAULT_TIME_WINDOW_HOURS: u32 = 1;
pub const DEFAULT_GUARD_TTL: Duration = Duration::from_secs(5);
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Blocked attempts tolerated past `call_limit` before escalating to redirect.
pub const BLOCKED_GRACE_ATTEMPTS: u64 = 2;

const BLOCKED_PREFIX: &str = "blocked_";
const REDIRECTED_PREFIX: &str = "redirected_";
const REDIRECT_SEPARATOR: &str = "_to_";
const COUNTRY_CODE: &str = "91";
const NATIONAL_NUMBER_LEN: usize = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Canonical identity key for a dialed number.
///
/// Keeps decimal digits only, then drops a leading `91` country code or
/// keeps the trailing ten digits of longer strings. Short numbers pass
/// through untouched, and input without digits maps to the empty key.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    national_form(&digits)
}

/// Variant of [`normalize`] used when grouping history entries: a leading
/// `+` survives for short numbers and `+91` is treated as a country code.
#[must_use]
pub fn normalize_for_dedup(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix('+') else {
        return normalize(trimmed);
    };

    let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
    if let Some(national) = digits.strip_prefix(COUNTRY_CODE) {
        return last_digits(national, NATIONAL_NUMBER_LEN).to_string();
    }
    if digits.len() + 1 > NATIONAL_NUMBER_LEN {
        return last_digits(&digits, NATIONAL_NUMBER_LEN).to_string();
    }
    format!("+{digits}")
}

fn national_form(digits: &str) -> String {
    if digits.len() > NATIONAL_NUMBER_LEN {
        let national = digits.strip_prefix(COUNTRY_CODE).unwrap_or(digits);
        return last_digits(national, NATIONAL_NUMBER_LEN).to_string();
    }
    digits.to_string()
}

fn last_digits(digits: &str, len: usize) -> &str {
    &digits[digits.len().saturating_sub(len)..]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Incoming,
    Outgoing,
    Missed,
    Blocked,
    Redirected,
}

impl CallType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Missed => "missed",
            Self::Blocked => "blocked",
            Self::Redirected => "redirected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            "missed" => Some(Self::Missed),
            "blocked" => Some(Self::Blocked),
            "redirected" => Some(Self::Redirected),
            _ => None,
        }
    }

    /// Numeric code stored alongside each ledger row.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Incoming => 1,
            Self::Outgoing => 2,
            Self::Missed => 3,
            Self::Blocked => 100,
            Self::Redirected => 101,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Incoming),
            2 => Some(Self::Outgoing),
            3 => Some(Self::Missed),
            100 => Some(Self::Blocked),
            101 => Some(Self::Redirected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Blocked,
    Redirected { helper: String },
}

impl AttemptOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Blocked => "blocked",
            Self::Redirected { .. } => "redirected",
        }
    }

    #[must_use]
    pub fn call_type(&self) -> CallType {
        match self {
            Self::Success => CallType::Outgoing,
            Self::Blocked => CallType::Blocked,
            Self::Redirected { .. } => CallType::Redirected,
        }
    }

    #[must_use]
    pub fn helper(&self) -> Option<&str> {
        match self {
            Self::Redirected { helper } => Some(helper),
            Self::Success | Self::Blocked => None,
        }
    }

    /// Legacy single-string ledger key: `<n>`, `blocked_<n>` or
    /// `redirected_<n>_to_<helper>`.
    #[must_use]
    pub fn phone_key(&self, number: &str) -> String {
        match self {
            Self::Success => number.to_string(),
            Self::Blocked => format!("{BLOCKED_PREFIX}{number}"),
            Self::Redirected { helper } => {
                format!("{REDIRECTED_PREFIX}{number}{REDIRECT_SEPARATOR}{helper}")
            }
        }
    }

    /// Splits a legacy ledger key into the original number and its outcome.
    #[must_use]
    pub fn parse_key(key: &str) -> (String, Self) {
        if let Some(number) = key.strip_prefix(BLOCKED_PREFIX) {
            return (number.to_string(), Self::Blocked);
        }

        if let Some(rest) = key.strip_prefix(REDIRECTED_PREFIX) {
            let (number, helper) = rest.split_once(REDIRECT_SEPARATOR).unwrap_or((rest, ""));
            return (
                number.to_string(),
                Self::Redirected {
                    helper: helper.to_string(),
                },
            );
        }

        (key.to_string(), Self::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRule {
    pub phone_number: String,
    pub name: String,
    pub is_managed: bool,
    pub call_limit: u32,
    pub time_window_hours: u32,
    pub notes: Option<String>,
}

impl ContactRule {
    /// Unmanaged rule with default limits, keyed by the normalized number.
    #[must_use]
    pub fn new(phone_number: &str, name: impl Into<String>) -> Self {
        Self {
            phone_number: normalize(phone_number),
            name: name.into(),
            is_managed: false,
            call_limit: DEFAULT_CALL_LIMIT,
            time_window_hours: DEFAULT_TIME_WINDOW_HOURS,
            notes: None,
        }
    }

    /// Validates a rule before it is stored.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the number is not in
    /// normalized form or the limit/window are zero.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.phone_number.is_empty() {
            return Err(GateError::Validation(
                "phone_number MUST contain at least one digit".to_string(),
            ));
        }

        if normalize(&self.phone_number) != self.phone_number {
            return Err(GateError::Validation(format!(
                "phone_number MUST be normalized (got {})",
                self.phone_number
            )));
        }

        if self.call_limit == 0 {
            return Err(GateError::Validation(
                "call_limit MUST be >= 1".to_string(),
            ));
        }

        if self.time_window_hours == 0 {
            return Err(GateError::Validation(
                "time_window_hours MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn window_millis(&self) -> i64 {
        i64::from(self.time_window_hours).saturating_mul(MILLIS_PER_HOUR)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttemptRecord {
    pub id: i64,
    pub number: String,
    pub outcome: AttemptOutcome,
    pub timestamp_ms: i64,
    pub call_type: CallType,
}

impl AttemptRecord {
    #[must_use]
    pub fn phone_key(&self) -> String {
        self.outcome.phone_key(&self.number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttemptRecordInput {
    pub number: String,
    pub outcome: AttemptOutcome,
    pub timestamp_ms: i64,
    pub call_type: CallType,
}

impl AttemptRecordInput {
    #[must_use]
    pub fn new(number: &str, outcome: AttemptOutcome, timestamp_ms: i64) -> Self {
        let call_type = outcome.call_type();
        Self {
            number: number.to_string(),
            outcome,
            timestamp_ms,
            call_type,
        }
    }

    /// Validates a ledger row before append.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the call type contradicts the
    /// outcome or the timestamp is negative.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.timestamp_ms < 0 {
            return Err(GateError::Validation(
                "timestamp_ms MUST be >= 0".to_string(),
            ));
        }

        let consistent = match self.outcome {
            AttemptOutcome::Success => matches!(
                self.call_type,
                CallType::Outgoing | CallType::Incoming | CallType::Missed
            ),
            AttemptOutcome::Blocked => self.call_type == CallType::Blocked,
            AttemptOutcome::Redirected { .. } => self.call_type == CallType::Redirected,
        };
        if !consistent {
            return Err(GateError::Validation(format!(
                "call_type {} is not valid for outcome {}",
                self.call_type.as_str(),
                self.outcome.as_str()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    NotManaged,
    UnderLimit,
    OverLimitBlocking,
    OverLimitRedirecting,
}

impl VerdictReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotManaged => "not_managed",
            Self::UnderLimit => "under_limit",
            Self::OverLimitBlocking => "over_limit_blocking",
            Self::OverLimitRedirecting => "over_limit_redirecting",
        }
    }
}

impl Display for VerdictReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Verdict {
    pub can_call: bool,
    pub should_redirect: bool,
    pub reason: VerdictReason,
    /// 1-based position of this attempt in the window; 0 when unmanaged.
    pub attempt_number: u32,
}

impl Verdict {
    #[must_use]
    pub fn not_managed() -> Self {
        Self {
            can_call: true,
            should_redirect: false,
            reason: VerdictReason::NotManaged,
            attempt_number: 0,
        }
    }
}

/// Three-tier policy over the counts inside the current window.
///
/// `redirect_enabled` only feeds `should_redirect` in the redirect tier.
#[must_use]
pub fn decide(rule: &ContactRule, successful: u32, blocked: u32, redirect_enabled: bool) -> Verdict {
    let total = u64::from(successful) + u64::from(blocked);
    let attempt_number = u32::try_from(total + 1).unwrap_or(u32::MAX);
    let limit = u64::from(rule.call_limit);

    if u64::from(successful) < limit {
        Verdict {
            can_call: true,
            should_redirect: false,
            reason: VerdictReason::UnderLimit,
            attempt_number,
        }
    } else if total < limit + BLOCKED_GRACE_ATTEMPTS {
        Verdict {
            can_call: false,
            should_redirect: false,
            reason: VerdictReason::OverLimitBlocking,
            attempt_number,
        }
    } else {
        Verdict {
            can_call: false,
            should_redirect: redirect_enabled,
            reason: VerdictReason::OverLimitRedirecting,
            attempt_number,
        }
    }
}

pub trait RuleStore: Send + Sync {
    /// # Errors
    /// Returns [`GateError::Storage`] when the rule cannot be read.
    fn rule_for(&self, number: &str) -> Result<Option<ContactRule>, GateError>;

    /// # Errors
    /// Returns [`GateError::Validation`] for invalid rules and
    /// [`GateError::Storage`] when the write fails.
    fn upsert_rule(&self, rule: &ContactRule) -> Result<(), GateError>;

    /// # Errors
    /// Returns [`GateError::Storage`] when rules cannot be read.
    fn list_rules(&self) -> Result<Vec<ContactRule>, GateError>;

    /// # Errors
    /// Returns [`GateError::Storage`] when the delete fails.
    fn delete_rule(&self, number: &str) -> Result<bool, GateError>;

    /// # Errors
    /// Returns [`GateError::Storage`] when the update fails.
    fn set_all_managed(&self, is_managed: bool) -> Result<usize, GateError>;
}

pub trait AttemptLedger: Send + Sync {
    /// Successful attempts for exactly `number` with `timestamp_ms >= since_ms`.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the ledger cannot be queried.
    fn count_successful_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError>;

    /// Blocked attempts for exactly `number` with `timestamp_ms >= since_ms`.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the ledger cannot be queried.
    fn count_blocked_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError>;

    /// # Errors
    /// Returns [`GateError::Validation`] for inconsistent rows and
    /// [`GateError::Storage`] when the insert fails.
    fn append(&self, input: &AttemptRecordInput) -> Result<AttemptRecord, GateError>;

    /// # Errors
    /// Returns [`GateError::Storage`] when the ledger cannot be read.
    fn all_records(&self) -> Result<Vec<AttemptRecord>, GateError>;
}

pub trait SettingsProvider: Send + Sync {
    /// # Errors
    /// Returns [`GateError::Storage`] when settings cannot be read.
    fn redirect_enabled(&self) -> Result<bool, GateError>;

    /// # Errors
    /// Returns [`GateError::Storage`] when settings cannot be read.
    fn redirect_number(&self) -> Result<String, GateError>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        now_millis()
    }
}

/// Settable clock for deterministic evaluation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        let _ = self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct AdmissionEngine {
    rules: Arc<dyn RuleStore>,
    ledger: Arc<dyn AttemptLedger>,
    settings: Arc<dyn SettingsProvider>,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    #[must_use]
    pub fn new(
        rules: Arc<dyn RuleStore>,
        ledger: Arc<dyn AttemptLedger>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            rules,
            ledger,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wires every collaborator to one store that provides all three contracts.
    #[must_use]
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: RuleStore + AttemptLedger + SettingsProvider + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Classifies an attempt to call `raw_number` as allow, block or redirect.
    ///
    /// Reads only; the caller records the outcome after acting on the verdict.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the rule, ledger or settings reads
    /// fail. No verdict is guessed on failure.
    pub fn evaluate(&self, raw_number: &str) -> Result<Verdict, GateError> {
        let number = normalize(raw_number);

        let rule = match self.rules.rule_for(&number)? {
            Some(rule) if rule.is_managed => rule,
            _ => {
                debug!(event = "evaluate.not_managed", number = %number);
                return Ok(Verdict::not_managed());
            }
        };

        let window_start = self.clock.now_millis().saturating_sub(rule.window_millis());
        let successful = self.ledger.count_successful_since(&number, window_start)?;
        let blocked = self.ledger.count_blocked_since(&number, window_start)?;

        let mut verdict = decide(&rule, successful, blocked, false);
        if verdict.reason == VerdictReason::OverLimitRedirecting {
            verdict.should_redirect = self.settings.redirect_enabled()?;
        }

        debug!(
            event = "evaluate.verdict",
            number = %number,
            successful,
            blocked,
            call_limit = rule.call_limit,
            window_start,
            reason = %verdict.reason,
            attempt = verdict.attempt_number,
            can_call = verdict.can_call,
            should_redirect = verdict.should_redirect,
        );
        Ok(verdict)
    }

    /// Appends the single ledger record for a decided attempt.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the append fails.
    pub fn record_outcome(
        &self,
        number: &str,
        outcome: &AttemptOutcome,
    ) -> Result<AttemptRecord, GateError> {
        let outcome = match outcome {
            AttemptOutcome::Redirected { helper } => AttemptOutcome::Redirected {
                helper: normalize(helper),
            },
            other => other.clone(),
        };
        let input = AttemptRecordInput::new(&normalize(number), outcome, self.clock.now_millis());
        let record = self.ledger.append(&input)?;

        info!(
            event = "outcome.recorded",
            id = record.id,
            number = %record.number,
            outcome = record.outcome.as_str(),
            key = %record.phone_key(),
        );
        Ok(record)
    }

    /// # Errors
    /// Returns [`GateError::Storage`] when settings cannot be read.
    pub fn redirect_number(&self) -> Result<String, GateError> {
        self.settings.redirect_number()
    }
}

/// Short-lived, process-wide set of numbers an observer has already decided.
///
/// Each insertion gets its own generation; the deferred removal spawned for
/// an insertion only removes that generation, so a later re-mark keeps its
/// full lifetime. Expiry is also checked on access, which keeps the guard
/// correct when no tokio runtime is available to run removal tasks.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    state: Arc<GuardState>,
}

#[derive(Debug)]
struct GuardState {
    ttl: Duration,
    next_generation: AtomicU64,
    entries: Mutex<HashMap<String, GuardEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct GuardEntry {
    generation: u64,
    expires_at: Instant,
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_GUARD_TTL)
    }
}

impl IdempotencyGuard {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(GuardState {
                ttl,
                next_generation: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    pub fn mark_processed(&self, number: &str) {
        let generation = {
            let mut entries = self.state.lock();
            self.state.insert(&mut entries, number)
        };
        debug!(event = "guard.marked", number = %number, generation);
        self.schedule_removal(number, generation);
    }

    /// Atomically marks `number` unless a live entry already exists.
    ///
    /// Returns `true` when this call claimed the number.
    pub fn try_mark(&self, number: &str) -> bool {
        self.try_claim(number).is_some()
    }

    /// Like [`Self::try_mark`], returning the generation of the new entry so
    /// the claimant can [`release`](Self::release) it.
    pub fn try_claim(&self, number: &str) -> Option<u64> {
        let generation = {
            let mut entries = self.state.lock();
            if entries
                .get(number)
                .is_some_and(|entry| entry.expires_at > Instant::now())
            {
                debug!(event = "guard.hit", number = %number);
                return None;
            }
            self.state.insert(&mut entries, number)
        };
        debug!(event = "guard.claimed", number = %number, generation);
        self.schedule_removal(number, generation);
        Some(generation)
    }

    /// Drops the entry for `number` if it still belongs to `generation`.
    pub fn release(&self, number: &str, generation: u64) {
        self.state.remove_generation(number, generation);
    }

    #[must_use]
    pub fn is_processed(&self, number: &str) -> bool {
        self.state
            .lock()
            .get(number)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_removal(&self, number: &str, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let state = Arc::clone(&self.state);
        let number = number.to_string();
        drop(handle.spawn(async move {
            tokio::time::sleep(state.ttl).await;
            state.remove_generation(&number, generation);
        }));
    }
}

impl GuardState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, GuardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, entries: &mut HashMap<String, GuardEntry>, number: &str) -> u64 {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            number.to_string(),
            GuardEntry {
                generation,
                expires_at: now + self.ttl,
            },
        );
        generation
    }

    fn remove_generation(&self, number: &str, generation: u64) {
        let mut entries = self.lock();
        if entries
            .get(number)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(number);
            debug!(event = "guard.expired", number = %number, generation);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Host entry points that may each report the same physical call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObserverSource {
    OutgoingBroadcast,
    CallScreening,
    ActiveCall,
    UserDial,
}

impl ObserverSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutgoingBroadcast => "outgoing_broadcast",
            Self::CallScreening => "call_screening",
            Self::ActiveCall => "active_call",
            Self::UserDial => "user_dial",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallEvent {
    pub raw_number: String,
    pub direction: CallDirection,
    pub source: ObserverSource,
}

impl CallEvent {
    #[must_use]
    pub fn outgoing(raw_number: impl Into<String>, source: ObserverSource) -> Self {
        Self {
            raw_number: raw_number.into(),
            direction: CallDirection::Outgoing,
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScreeningAction {
    /// Not an outgoing attempt; nothing was decided or recorded.
    PassThrough,
    /// Another observer already decided this attempt.
    AlreadyHandled,
    Allow,
    Block,
    Redirect { helper: String },
}

impl ScreeningAction {
    /// Whether the observer should let the original call proceed.
    #[must_use]
    pub fn permits_call(&self) -> bool {
        matches!(self, Self::PassThrough | Self::AlreadyHandled | Self::Allow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScreeningDecision {
    pub number: String,
    pub source: ObserverSource,
    #[serde(flatten)]
    pub action: ScreeningAction,
    pub verdict: Option<Verdict>,
    pub record: Option<AttemptRecord>,
}

/// Single consumer for every observer's view of a call: dedups through the
/// guard, evaluates, records exactly one outcome and marks the helper.
#[derive(Clone)]
pub struct CallScreener {
    engine: AdmissionEngine,
    guard: IdempotencyGuard,
}

impl CallScreener {
    #[must_use]
    pub fn new(engine: AdmissionEngine, guard: IdempotencyGuard) -> Self {
        Self { engine, guard }
    }

    #[must_use]
    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    #[must_use]
    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Decides one observer's report of a call.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when evaluation or recording fails.
    /// The guard claim is released so another observer can decide.
    pub fn screen(&self, event: &CallEvent) -> Result<ScreeningDecision, GateError> {
        let number = normalize(&event.raw_number);
        let decision = |action: ScreeningAction,
                        verdict: Option<Verdict>,
                        record: Option<AttemptRecord>| ScreeningDecision {
            number: number.clone(),
            source: event.source,
            action,
            verdict,
            record,
        };

        if event.direction == CallDirection::Incoming {
            return Ok(decision(ScreeningAction::PassThrough, None, None));
        }

        let Some(generation) = self.guard.try_claim(&number) else {
            info!(
                event = "screen.already_handled",
                source = event.source.as_str(),
                number = %number,
            );
            return Ok(decision(ScreeningAction::AlreadyHandled, None, None));
        };

        // An undecided claim must not make other observers wave the call through.
        let (action, verdict, record) = match self.decide_claimed(&number, event.source) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.guard.release(&number, generation);
                warn!(
                    event = "screen.failed",
                    source = event.source.as_str(),
                    number = %number,
                    error = %err,
                );
                return Err(err);
            }
        };
        Ok(decision(action, Some(verdict), Some(record)))
    }

    fn decide_claimed(
        &self,
        number: &str,
        source: ObserverSource,
    ) -> Result<(ScreeningAction, Verdict, AttemptRecord), GateError> {
        let verdict = self.engine.evaluate(number)?;
        if verdict.can_call {
            let record = self.engine.record_outcome(number, &AttemptOutcome::Success)?;
            return Ok((ScreeningAction::Allow, verdict, record));
        }

        if verdict.should_redirect {
            let helper = self.engine.redirect_number()?;
            let helper_key = normalize(&helper);
            if helper_key.is_empty() {
                warn!(
                    event = "screen.redirect_without_helper",
                    number = %number,
                    "redirect enabled but no dialable helper number configured; blocking",
                );
            } else {
                let record = self.engine.record_outcome(
                    number,
                    &AttemptOutcome::Redirected {
                        helper: helper.clone(),
                    },
                )?;
                self.guard.mark_processed(&helper_key);
                info!(
                    event = "screen.redirect",
                    source = source.as_str(),
                    number = %number,
                    attempt = verdict.attempt_number,
                );
                return Ok((
                    ScreeningAction::Redirect {
                        helper: helper.trim().to_string(),
                    },
                    verdict,
                    record,
                ));
            }
        }

        let record = self.engine.record_outcome(number, &AttemptOutcome::Blocked)?;
        info!(
            event = "screen.block",
            source = source.as_str(),
            number = %number,
            attempt = verdict.attempt_number,
        );
        Ok((ScreeningAction::Block, verdict, record))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RedirectSettings {
    pub redirect_enabled: bool,
    pub redirect_number: String,
}

/// Process-local store; useful for hosts without durable storage and tests.
#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    rules: RwLock<BTreeMap<String, ContactRule>>,
    records: RwLock<Vec<AttemptRecord>>,
    settings: RwLock<RedirectSettings>,
}

impl InMemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_redirect_enabled(&self, enabled: bool) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .redirect_enabled = enabled;
    }

    pub fn set_redirect_number(&self, number: &str) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .redirect_number = number.trim().to_string();
    }

    fn count_since(&self, number: &str, since_ms: i64, outcome: &AttemptOutcome) -> u32 {
        let count = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| {
                record.number == number
                    && &record.outcome == outcome
                    && record.timestamp_ms >= since_ms
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

impl RuleStore for InMemoryCallStore {
    fn rule_for(&self, number: &str) -> Result<Option<ContactRule>, GateError> {
        Ok(self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(number)
            .cloned())
    }

    fn upsert_rule(&self, rule: &ContactRule) -> Result<(), GateError> {
        rule.validate()?;
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rule.phone_number.clone(), rule.clone());
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<ContactRule>, GateError> {
        let mut rules: Vec<ContactRule> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        rules.sort_by(|lhs, rhs| {
            lhs.name
                .cmp(&rhs.name)
                .then_with(|| lhs.phone_number.cmp(&rhs.phone_number))
        });
        Ok(rules)
    }

    fn delete_rule(&self, number: &str) -> Result<bool, GateError> {
        Ok(self
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(number)
            .is_some())
    }

    fn set_all_managed(&self, is_managed: bool) -> Result<usize, GateError> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.values_mut() {
            rule.is_managed = is_managed;
        }
        Ok(rules.len())
    }
}

impl AttemptLedger for InMemoryCallStore {
    fn count_successful_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
        Ok(self.count_since(number, since_ms, &AttemptOutcome::Success))
    }

    fn count_blocked_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
        Ok(self.count_since(number, since_ms, &AttemptOutcome::Blocked))
    }

    fn append(&self, input: &AttemptRecordInput) -> Result<AttemptRecord, GateError> {
        input.validate()?;
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = i64::try_from(records.len())
            .map_err(|_| GateError::Storage("ledger id space exhausted".to_string()))?
            + 1;
        let record = AttemptRecord {
            id,
            number: input.number.clone(),
            outcome: input.outcome.clone(),
            timestamp_ms: input.timestamp_ms,
            call_type: input.call_type,
        };
        records.push(record.clone());
        Ok(record)
    }

    fn all_records(&self) -> Result<Vec<AttemptRecord>, GateError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

impl SettingsProvider for InMemoryCallStore {
    fn redirect_enabled(&self) -> Result<bool, GateError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .redirect_enabled)
    }

    fn redirect_number(&self) -> Result<String, GateError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .redirect_number
            .clone())
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

/// Formats epoch milliseconds as an RFC3339 UTC timestamp.
///
/// # Errors
/// Returns [`GateError::Validation`] when the value is out of range or
/// formatting fails.
pub fn format_millis_rfc3339(millis: i64) -> Result<String, GateError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| GateError::Validation(format!("timestamp out of range: {err}")))?
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| GateError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NOW: i64 = 1_770_000_000_000;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn managed_rule(number: &str) -> ContactRule {
        let mut rule = ContactRule::new(number, "Fixture");
        rule.is_managed = true;
        rule
    }

    fn fixture_engine(store: &Arc<InMemoryCallStore>) -> (AdmissionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = AdmissionEngine::from_store(Arc::clone(store)).with_clock(clock.clone());
        (engine, clock)
    }

    fn append_at(store: &InMemoryCallStore, number: &str, outcome: AttemptOutcome, at: i64) {
        let _ = must_ok(store.append(&AttemptRecordInput::new(number, outcome, at)));
    }

    struct FailingStore;

    impl RuleStore for FailingStore {
        fn rule_for(&self, number: &str) -> Result<Option<ContactRule>, GateError> {
            Ok(Some(managed_rule(number)))
        }
        fn upsert_rule(&self, _rule: &ContactRule) -> Result<(), GateError> {
            Ok(())
        }
        fn list_rules(&self) -> Result<Vec<ContactRule>, GateError> {
            Ok(Vec::new())
        }
        fn delete_rule(&self, _number: &str) -> Result<bool, GateError> {
            Ok(false)
        }
        fn set_all_managed(&self, _is_managed: bool) -> Result<usize, GateError> {
            Ok(0)
        }
    }

    impl AttemptLedger for FailingStore {
        fn count_successful_since(&self, _number: &str, _since_ms: i64) -> Result<u32, GateError> {
            Err(GateError::Storage("disk unavailable".to_string()))
        }
        fn count_blocked_since(&self, _number: &str, _since_ms: i64) -> Result<u32, GateError> {
            Ok(0)
        }
        fn append(&self, _input: &AttemptRecordInput) -> Result<AttemptRecord, GateError> {
            Err(GateError::Storage("disk unavailable".to_string()))
        }
        fn all_records(&self) -> Result<Vec<AttemptRecord>, GateError> {
            Ok(Vec::new())
        }
    }

    impl SettingsProvider for FailingStore {
        fn redirect_enabled(&self) -> Result<bool, GateError> {
            Ok(false)
        }
        fn redirect_number(&self) -> Result<String, GateError> {
            Ok(String::new())
        }
    }

    #[test]
    fn normalize_strips_formatting_and_country_code() {
        assert_eq!(normalize("+91 98765-43210"), "9876543210");
        assert_eq!(normalize("(555) 123-4567"), "5551234567");
        assert_eq!(normalize("001 555 123 4567"), "5551234567");
        assert_eq!(normalize("5551234"), "5551234");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("call me"), "");
    }

    #[test]
    fn normalize_for_dedup_keeps_short_plus_numbers() {
        assert_eq!(normalize_for_dedup("+91 98765 43210"), "9876543210");
        assert_eq!(normalize_for_dedup("+1 555 123 4567"), "5551234567");
        assert_eq!(normalize_for_dedup("+112"), "+112");
        assert_eq!(normalize_for_dedup("919876543210"), "9876543210");
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(raw in "[0-9 +()-]{0,24}") {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert!(once.len() <= NATIONAL_NUMBER_LEN);
        }
    }

    #[test]
    fn redirect_key_round_trips_to_original_number() {
        let outcome = AttemptOutcome::Redirected {
            helper: "9998888".to_string(),
        };
        let key = outcome.phone_key("5551234");
        assert_eq!(key, "redirected_5551234_to_9998888");

        let (number, parsed) = AttemptOutcome::parse_key(&key);
        assert_eq!(number, "5551234");
        assert_eq!(parsed, outcome);

        assert_eq!(
            AttemptOutcome::parse_key("blocked_5551234"),
            ("5551234".to_string(), AttemptOutcome::Blocked)
        );
        assert_eq!(
            AttemptOutcome::parse_key("5551234"),
            ("5551234".to_string(), AttemptOutcome::Success)
        );
    }

    #[test]
    fn decide_walks_allow_block_redirect_tiers() {
        let rule = managed_rule("5551234");
        let tiers: Vec<_> = [(0, 0), (1, 0), (2, 0), (2, 1), (2, 2), (2, 5)]
            .into_iter()
            .map(|(successful, blocked)| decide(&rule, successful, blocked, true))
            .map(|verdict| (verdict.reason, verdict.attempt_number))
            .collect();

        assert_eq!(
            tiers,
            vec![
                (VerdictReason::UnderLimit, 1),
                (VerdictReason::UnderLimit, 2),
                (VerdictReason::OverLimitBlocking, 3),
                (VerdictReason::OverLimitBlocking, 4),
                (VerdictReason::OverLimitRedirecting, 5),
                (VerdictReason::OverLimitRedirecting, 8),
            ]
        );
    }

    #[test]
    fn unmanaged_contacts_are_always_allowed() {
        let store = Arc::new(InMemoryCallStore::new());
        let mut rule = managed_rule("5551234");
        rule.is_managed = false;
        must_ok(store.upsert_rule(&rule));
        for _ in 0..6 {
            append_at(&store, "5551234", AttemptOutcome::Success, NOW - 10);
            append_at(&store, "5551234", AttemptOutcome::Blocked, NOW - 10);
        }
        let (engine, _) = fixture_engine(&store);

        let verdict = must_ok(engine.evaluate("555-1234"));
        assert_eq!(verdict, Verdict::not_managed());

        let unknown = must_ok(engine.evaluate("0000000"));
        assert!(unknown.can_call);
        assert_eq!(unknown.reason, VerdictReason::NotManaged);
    }

    #[test]
    fn five_call_scenario_escalates_to_redirect() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        store.set_redirect_enabled(true);
        store.set_redirect_number("999-8888");
        let (engine, clock) = fixture_engine(&store);

        let mut seen = Vec::new();
        for _ in 0..5 {
            let verdict = must_ok(engine.evaluate("5551234"));
            let outcome = if verdict.can_call {
                AttemptOutcome::Success
            } else if verdict.should_redirect {
                AttemptOutcome::Redirected {
                    helper: must_ok(engine.redirect_number()),
                }
            } else {
                AttemptOutcome::Blocked
            };
            let _ = must_ok(engine.record_outcome("5551234", &outcome));
            seen.push((verdict.can_call, verdict.should_redirect, verdict.attempt_number));
            clock.advance(Duration::from_secs(60));
        }

        assert_eq!(
            seen,
            vec![
                (true, false, 1),
                (true, false, 2),
                (false, false, 3),
                (false, false, 4),
                (false, true, 5),
            ]
        );

        let keys: Vec<String> = must_ok(store.all_records())
            .iter()
            .map(AttemptRecord::phone_key)
            .collect();
        assert_eq!(keys.last().map(String::as_str), Some("redirected_5551234_to_9998888"));
    }

    #[test]
    fn redirect_tier_reports_disabled_setting() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        append_at(&store, "5551234", AttemptOutcome::Success, NOW - 1);
        append_at(&store, "5551234", AttemptOutcome::Success, NOW - 1);
        append_at(&store, "5551234", AttemptOutcome::Blocked, NOW - 1);
        append_at(&store, "5551234", AttemptOutcome::Blocked, NOW - 1);
        let (engine, _) = fixture_engine(&store);

        let verdict = must_ok(engine.evaluate("5551234"));
        assert_eq!(verdict.reason, VerdictReason::OverLimitRedirecting);
        assert!(!verdict.can_call);
        assert!(!verdict.should_redirect);
    }

    #[test]
    fn attempts_outside_window_do_not_count() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        let window = managed_rule("5551234").window_millis();
        append_at(&store, "5551234", AttemptOutcome::Success, NOW - window - 1);
        append_at(&store, "5551234", AttemptOutcome::Blocked, NOW - window - 1);
        append_at(&store, "5551234", AttemptOutcome::Success, NOW - window);

        assert_eq!(must_ok(store.count_successful_since("5551234", NOW - window)), 1);
        assert_eq!(must_ok(store.count_blocked_since("5551234", NOW - window)), 0);

        let (engine, _) = fixture_engine(&store);
        let verdict = must_ok(engine.evaluate("5551234"));
        assert_eq!(verdict.reason, VerdictReason::UnderLimit);
        assert_eq!(verdict.attempt_number, 2);
    }

    #[test]
    fn storage_failure_is_not_turned_into_a_verdict() {
        let engine = AdmissionEngine::from_store(Arc::new(FailingStore));
        let err = match engine.evaluate("5551234") {
            Ok(verdict) => panic!("expected storage error, got {verdict:?}"),
            Err(err) => err,
        };
        assert_eq!(err, GateError::Storage("disk unavailable".to_string()));
        assert!(engine
            .record_outcome("5551234", &AttemptOutcome::Success)
            .is_err());
    }

    #[test]
    fn record_outcome_normalizes_number_and_helper() {
        let store = Arc::new(InMemoryCallStore::new());
        let (engine, _) = fixture_engine(&store);

        let record = must_ok(engine.record_outcome(
            "+91 98765 43210",
            &AttemptOutcome::Redirected {
                helper: "(999) 888".to_string(),
            },
        ));
        assert_eq!(record.phone_key(), "redirected_9876543210_to_999888");
        assert_eq!(record.call_type, CallType::Redirected);
        assert_eq!(record.timestamp_ms, NOW);
    }

    #[test]
    fn rule_validation_rejects_zero_limits() {
        let mut rule = ContactRule::new("5551234", "Zero");
        rule.call_limit = 0;
        assert!(rule.validate().is_err());

        let mut rule = ContactRule::new("5551234", "Zero");
        rule.time_window_hours = 0;
        assert!(rule.validate().is_err());

        assert!(ContactRule::new("no digits", "Empty").validate().is_err());
    }

    #[test]
    fn append_rejects_inconsistent_call_type() {
        let store = InMemoryCallStore::new();
        let mut input = AttemptRecordInput::new("5551234", AttemptOutcome::Blocked, NOW);
        input.call_type = CallType::Outgoing;
        assert!(store.append(&input).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_expires_after_ttl_but_not_before() {
        let guard = IdempotencyGuard::default();
        guard.mark_processed("5551234");
        assert!(guard.is_processed("5551234"));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(guard.is_processed("5551234"));

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert!(!guard.is_processed("5551234"));
        assert!(guard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_removal_does_not_evict_later_mark() {
        let guard = IdempotencyGuard::default();
        guard.mark_processed("5551234");

        tokio::time::advance(Duration::from_secs(3)).await;
        guard.mark_processed("5551234");

        tokio::time::advance(Duration::from_millis(2_500)).await;
        tokio::task::yield_now().await;
        assert!(guard.is_processed("5551234"));

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!guard.is_processed("5551234"));
    }

    #[tokio::test(start_paused = true)]
    async fn try_mark_claims_once_until_expiry() {
        let guard = IdempotencyGuard::new(Duration::from_secs(1));
        assert!(guard.try_mark("5551234"));
        assert!(!guard.try_mark("5551234"));
        assert!(guard.try_mark("9998888"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(guard.try_mark("5551234"));
    }

    #[test]
    fn guard_without_runtime_expires_lazily() {
        let guard = IdempotencyGuard::new(Duration::from_millis(20));
        guard.mark_processed("5551234");
        assert!(guard.is_processed("5551234"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!guard.is_processed("5551234"));
    }

    fn fixture_screener(store: &Arc<InMemoryCallStore>) -> CallScreener {
        let (engine, _) = fixture_engine(store);
        CallScreener::new(engine, IdempotencyGuard::default())
    }

    #[test]
    fn redundant_observers_record_a_single_attempt() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        let screener = fixture_screener(&store);

        let first = must_ok(screener.screen(&CallEvent::outgoing(
            "555-1234",
            ObserverSource::UserDial,
        )));
        let second = must_ok(screener.screen(&CallEvent::outgoing(
            "5551234",
            ObserverSource::CallScreening,
        )));

        assert_eq!(first.action, ScreeningAction::Allow);
        assert_eq!(second.action, ScreeningAction::AlreadyHandled);
        assert!(second.action.permits_call());
        assert_eq!(must_ok(store.all_records()).len(), 1);
    }

    #[test]
    fn concurrent_observers_decide_exactly_once() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        let screener = fixture_screener(&store);
        let sources = [
            ObserverSource::OutgoingBroadcast,
            ObserverSource::CallScreening,
            ObserverSource::ActiveCall,
            ObserverSource::UserDial,
        ];

        let decisions: Vec<ScreeningDecision> = std::thread::scope(|scope| {
            let handles: Vec<_> = sources
                .iter()
                .map(|source| {
                    let screener = screener.clone();
                    scope.spawn(move || screener.screen(&CallEvent::outgoing("5551234", *source)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => must_ok(result),
                    Err(err) => panic!("observer thread panicked: {err:?}"),
                })
                .collect()
        });

        let decided = decisions
            .iter()
            .filter(|decision| decision.action != ScreeningAction::AlreadyHandled)
            .count();
        assert_eq!(decided, 1);
        assert!(decisions.iter().all(|decision| decision.action.permits_call()));
        assert_eq!(must_ok(store.all_records()).len(), 1);
    }

    #[test]
    fn redirect_marks_helper_and_blank_helper_blocks() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        for outcome in [
            AttemptOutcome::Success,
            AttemptOutcome::Success,
            AttemptOutcome::Blocked,
            AttemptOutcome::Blocked,
        ] {
            append_at(&store, "5551234", outcome, NOW - 5);
        }
        store.set_redirect_enabled(true);

        let blank = fixture_screener(&store);
        let decision = must_ok(blank.screen(&CallEvent::outgoing("5551234", ObserverSource::ActiveCall)));
        assert_eq!(decision.action, ScreeningAction::Block);
        assert_eq!(
            decision.record.map(|record| record.outcome),
            Some(AttemptOutcome::Blocked)
        );

        store.set_redirect_number("999 8888");
        let screener = fixture_screener(&store);
        let decision = must_ok(screener.screen(&CallEvent::outgoing("5551234", ObserverSource::UserDial)));
        assert_eq!(
            decision.action,
            ScreeningAction::Redirect {
                helper: "999 8888".to_string()
            }
        );
        assert!(screener.guard().is_processed("9998888"));

        let helper_call = must_ok(screener.screen(&CallEvent::outgoing(
            "9998888",
            ObserverSource::CallScreening,
        )));
        assert_eq!(helper_call.action, ScreeningAction::AlreadyHandled);
    }

    struct FlakyLedger {
        inner: Arc<InMemoryCallStore>,
        failures_left: AtomicU64,
    }

    impl AttemptLedger for FlakyLedger {
        fn count_successful_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(GateError::Storage("transient".to_string()));
            }
            self.inner.count_successful_since(number, since_ms)
        }
        fn count_blocked_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
            self.inner.count_blocked_since(number, since_ms)
        }
        fn append(&self, input: &AttemptRecordInput) -> Result<AttemptRecord, GateError> {
            self.inner.append(input)
        }
        fn all_records(&self) -> Result<Vec<AttemptRecord>, GateError> {
            self.inner.all_records()
        }
    }

    #[test]
    fn failed_decision_releases_claim_for_next_observer() {
        let store = Arc::new(InMemoryCallStore::new());
        let mut rule = managed_rule("5551234");
        rule.call_limit = 1;
        must_ok(store.upsert_rule(&rule));
        append_at(&store, "5551234", AttemptOutcome::Success, NOW - 10);

        let ledger = Arc::new(FlakyLedger {
            inner: Arc::clone(&store),
            failures_left: AtomicU64::new(1),
        });
        let engine = AdmissionEngine::new(store.clone(), ledger, store.clone())
            .with_clock(Arc::new(ManualClock::new(NOW)));
        let screener = CallScreener::new(engine, IdempotencyGuard::default());

        let first = screener.screen(&CallEvent::outgoing("5551234", ObserverSource::UserDial));
        assert_eq!(first, Err(GateError::Storage("transient".to_string())));
        assert!(!screener.guard().is_processed("5551234"));

        let second = must_ok(screener.screen(&CallEvent::outgoing(
            "5551234",
            ObserverSource::CallScreening,
        )));
        assert_eq!(second.action, ScreeningAction::Block);
        assert!(!second.action.permits_call());

        let outcomes: Vec<AttemptOutcome> = must_ok(store.all_records())
            .into_iter()
            .map(|record| record.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Success, AttemptOutcome::Blocked]);
    }

    #[test]
    fn release_ignores_a_newer_generation() {
        let guard = IdempotencyGuard::default();
        let stale = guard.try_claim("5551234");
        guard.mark_processed("5551234");

        if let Some(generation) = stale {
            guard.release("5551234", generation);
        }
        assert!(stale.is_some());
        assert!(guard.is_processed("5551234"));
    }

    #[test]
    fn helper_without_digits_blocks_instead_of_redirecting() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        for outcome in [
            AttemptOutcome::Success,
            AttemptOutcome::Success,
            AttemptOutcome::Blocked,
            AttemptOutcome::Blocked,
        ] {
            append_at(&store, "5551234", outcome, NOW - 5);
        }
        store.set_redirect_enabled(true);
        store.set_redirect_number("ext");

        let screener = fixture_screener(&store);
        let decision = must_ok(screener.screen(&CallEvent::outgoing("5551234", ObserverSource::UserDial)));
        assert_eq!(decision.action, ScreeningAction::Block);
        assert_eq!(
            decision.record.map(|record| record.phone_key()),
            Some("blocked_5551234".to_string())
        );
        assert!(!screener.guard().is_processed(""));
    }

    #[test]
    fn incoming_calls_pass_through_without_records() {
        let store = Arc::new(InMemoryCallStore::new());
        must_ok(store.upsert_rule(&managed_rule("5551234")));
        let screener = fixture_screener(&store);

        let decision = must_ok(screener.screen(&CallEvent {
            raw_number: "5551234".to_string(),
            direction: CallDirection::Incoming,
            source: ObserverSource::CallScreening,
        }));
        assert_eq!(decision.action, ScreeningAction::PassThrough);
        assert!(must_ok(store.all_records()).is_empty());
        assert!(!screener.guard().is_processed("5551234"));
    }

    #[test]
    fn format_millis_is_rfc3339_utc() {
        assert_eq!(must_ok(format_millis_rfc3339(0)), "1970-01-01T00:00:00Z");
    }
}
