#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use call_gate_core::{
    AttemptLedger, AttemptOutcome, AttemptRecord, AttemptRecordInput, CallType, ContactRule,
    GateError, RedirectSettings, RuleStore, SettingsProvider,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

const CALL_GATE_MIGRATION_VERSION: i64 = 1;
const SETTING_REDIRECT_ENABLED: &str = "redirect_enabled";
const SETTING_REDIRECT_NUMBER: &str = "redirect_number";

const SCHEMA_CALL_GATE_V1: &str = r"
CREATE TABLE IF NOT EXISTS contact_rules (
  phone_number TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  is_managed INTEGER NOT NULL DEFAULT 0 CHECK (is_managed IN (0, 1)),
  call_limit INTEGER NOT NULL DEFAULT 2 CHECK (call_limit >= 1),
  time_window_hours INTEGER NOT NULL DEFAULT 1 CHECK (time_window_hours >= 1)
);

CREATE TABLE IF NOT EXISTS call_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  phone_key TEXT NOT NULL,
  number TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('success', 'blocked', 'redirected')),
  helper_number TEXT CHECK (
    (outcome = 'redirected' AND helper_number IS NOT NULL)
    OR (outcome <> 'redirected' AND helper_number IS NULL)
  ),
  call_type INTEGER NOT NULL,
  occurred_at_ms INTEGER NOT NULL CHECK (occurred_at_ms >= 0)
);

CREATE TRIGGER IF NOT EXISTS trg_call_attempts_no_update
BEFORE UPDATE ON call_attempts
BEGIN
  SELECT RAISE(FAIL, 'call_attempts is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_call_attempts_window
  ON call_attempts(number, outcome, occurred_at_ms);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
";

pub struct SqliteCallStore {
    conn: Mutex<Connection>,
}

impl SqliteCallStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at_ms INTEGER NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_CALL_GATE_V1)
            .context("failed to apply call gate schema")?;

        // Rule tables written before notes existed get the column added in place.
        if !table_has_column(&conn, "contact_rules", "notes")? {
            conn.execute_batch("ALTER TABLE contact_rules ADD COLUMN notes TEXT;")
                .context("failed to add contact_rules.notes")?;
            info!(event = "migrate.add_column", table = "contact_rules", column = "notes");
        }
        ensure_table_has_columns(
            &conn,
            "contact_rules",
            &[
                "phone_number",
                "name",
                "is_managed",
                "call_limit",
                "time_window_hours",
                "notes",
            ],
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at_ms) VALUES (?1, ?2)",
            params![CALL_GATE_MIGRATION_VERSION, call_gate_core::now_millis()],
        )
        .context("failed to register call gate schema migration")?;

        Ok(())
    }

    pub fn get_rule(&self, number: &str) -> Result<Option<ContactRule>> {
        self.lock()
            .query_row(
                "SELECT phone_number, name, is_managed, call_limit, time_window_hours, notes
                 FROM contact_rules
                 WHERE phone_number = ?1",
                params![number],
                parse_rule_row,
            )
            .optional()
            .with_context(|| format!("failed to load contact rule for {number}"))
    }

    pub fn put_rule(&self, rule: &ContactRule) -> Result<()> {
        rule.validate()
            .map_err(|err| anyhow!("rule validation failed: {err}"))?;

        self.lock()
            .execute(
                "INSERT INTO contact_rules(phone_number, name, is_managed, call_limit, time_window_hours, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(phone_number) DO UPDATE SET
                   name = excluded.name,
                   is_managed = excluded.is_managed,
                   call_limit = excluded.call_limit,
                   time_window_hours = excluded.time_window_hours,
                   notes = excluded.notes",
                params![
                    rule.phone_number,
                    rule.name,
                    bool_to_sql(rule.is_managed),
                    i64::from(rule.call_limit),
                    i64::from(rule.time_window_hours),
                    rule.notes,
                ],
            )
            .with_context(|| format!("failed to upsert contact rule for {}", rule.phone_number))?;

        debug!(event = "rule.upserted", number = %rule.phone_number, managed = rule.is_managed);
        Ok(())
    }

    pub fn list_contact_rules(&self) -> Result<Vec<ContactRule>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT phone_number, name, is_managed, call_limit, time_window_hours, notes
                 FROM contact_rules
                 ORDER BY name ASC, phone_number ASC",
            )
            .context("failed to prepare contact rule listing")?;
        let rows = stmt.query_map([], parse_rule_row)?;
        collect_rows(rows)
    }

    pub fn remove_rule(&self, number: &str) -> Result<bool> {
        let deleted = self
            .lock()
            .execute(
                "DELETE FROM contact_rules WHERE phone_number = ?1",
                params![number],
            )
            .with_context(|| format!("failed to delete contact rule for {number}"))?;
        Ok(deleted > 0)
    }

    pub fn set_managed_for_all(&self, is_managed: bool) -> Result<usize> {
        let updated = self
            .lock()
            .execute(
                "UPDATE contact_rules SET is_managed = ?1",
                params![bool_to_sql(is_managed)],
            )
            .context("failed to update managed flag on contact rules")?;
        info!(event = "rules.set_all_managed", managed = is_managed, updated);
        Ok(updated)
    }

    pub fn append_attempt(&self, input: &AttemptRecordInput) -> Result<AttemptRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("attempt validation failed: {err}"))?;

        let phone_key = input.outcome.phone_key(&input.number);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO call_attempts(phone_key, number, outcome, helper_number, call_type, occurred_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                phone_key,
                input.number,
                input.outcome.as_str(),
                input.outcome.helper(),
                input.call_type.code(),
                input.timestamp_ms,
            ],
        )
        .with_context(|| format!("failed to append call attempt {phone_key}"))?;

        Ok(AttemptRecord {
            id: conn.last_insert_rowid(),
            number: input.number.clone(),
            outcome: input.outcome.clone(),
            timestamp_ms: input.timestamp_ms,
            call_type: input.call_type,
        })
    }

    pub fn count_attempts_since(
        &self,
        number: &str,
        outcome: &AttemptOutcome,
        since_ms: i64,
    ) -> Result<u32> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*)
                 FROM call_attempts
                 WHERE number = ?1 AND outcome = ?2 AND occurred_at_ms >= ?3",
                params![number, outcome.as_str(), since_ms],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {} attempts for {number}", outcome.as_str()))?;

        u32::try_from(count).context("attempt count exceeds u32 range")
    }

    /// Ledger rows newest first, optionally capped at `limit`.
    pub fn list_attempts(&self, limit: Option<usize>) -> Result<Vec<AttemptRecord>> {
        let limit = match limit {
            Some(value) => i64::try_from(value).context("limit exceeds i64 range")?,
            None => -1,
        };

        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, number, outcome, helper_number, call_type, occurred_at_ms
                 FROM call_attempts
                 ORDER BY occurred_at_ms DESC, id DESC
                 LIMIT ?1",
            )
            .context("failed to prepare attempt listing")?;
        let rows = stmt.query_map(params![limit], parse_attempt_row)?;
        collect_rows(rows)
    }

    pub fn get_settings(&self) -> Result<RedirectSettings> {
        let enabled = match self.read_setting(SETTING_REDIRECT_ENABLED)? {
            Some(value) => parse_bool_setting(&value)?,
            None => false,
        };
        let number = self.read_setting(SETTING_REDIRECT_NUMBER)?.unwrap_or_default();

        Ok(RedirectSettings {
            redirect_enabled: enabled,
            redirect_number: number,
        })
    }

    pub fn set_redirect_enabled(&self, enabled: bool) -> Result<()> {
        self.write_setting(SETTING_REDIRECT_ENABLED, if enabled { "true" } else { "false" })
    }

    pub fn set_redirect_number(&self, number: &str) -> Result<()> {
        self.write_setting(SETTING_REDIRECT_NUMBER, number.trim())
    }

    fn read_setting(&self, key: &str) -> Result<Option<String>> {
        self.lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read setting {key}"))
    }

    fn write_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO settings(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("failed to write setting {key}"))?;
        info!(event = "settings.updated", key, value);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.lock()
    }
}

impl RuleStore for SqliteCallStore {
    fn rule_for(&self, number: &str) -> Result<Option<ContactRule>, GateError> {
        self.get_rule(number).map_err(to_gate_error)
    }

    fn upsert_rule(&self, rule: &ContactRule) -> Result<(), GateError> {
        rule.validate()?;
        self.put_rule(rule).map_err(to_gate_error)
    }

    fn list_rules(&self) -> Result<Vec<ContactRule>, GateError> {
        self.list_contact_rules().map_err(to_gate_error)
    }

    fn delete_rule(&self, number: &str) -> Result<bool, GateError> {
        self.remove_rule(number).map_err(to_gate_error)
    }

    fn set_all_managed(&self, is_managed: bool) -> Result<usize, GateError> {
        self.set_managed_for_all(is_managed).map_err(to_gate_error)
    }
}

impl AttemptLedger for SqliteCallStore {
    fn count_successful_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
        self.count_attempts_since(number, &AttemptOutcome::Success, since_ms)
            .map_err(to_gate_error)
    }

    fn count_blocked_since(&self, number: &str, since_ms: i64) -> Result<u32, GateError> {
        self.count_attempts_since(number, &AttemptOutcome::Blocked, since_ms)
            .map_err(to_gate_error)
    }

    fn append(&self, input: &AttemptRecordInput) -> Result<AttemptRecord, GateError> {
        input.validate()?;
        self.append_attempt(input).map_err(to_gate_error)
    }

    fn all_records(&self) -> Result<Vec<AttemptRecord>, GateError> {
        let mut records = self.list_attempts(None).map_err(to_gate_error)?;
        records.sort_by_key(|record| record.id);
        Ok(records)
    }
}

impl SettingsProvider for SqliteCallStore {
    fn redirect_enabled(&self) -> Result<bool, GateError> {
        self.get_settings()
            .map(|settings| settings.redirect_enabled)
            .map_err(to_gate_error)
    }

    fn redirect_number(&self) -> Result<String, GateError> {
        self.get_settings()
            .map(|settings| settings.redirect_number)
            .map_err(to_gate_error)
    }
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRule> {
    let is_managed: i64 = row.get(2)?;
    let call_limit: i64 = row.get(3)?;
    let time_window_hours: i64 = row.get(4)?;

    Ok(ContactRule {
        phone_number: row.get(0)?,
        name: row.get(1)?,
        is_managed: is_managed != 0,
        call_limit: u32::try_from(call_limit)
            .map_err(|_| conversion_error(3, format!("call_limit out of range: {call_limit}")))?,
        time_window_hours: u32::try_from(time_window_hours).map_err(|_| {
            conversion_error(4, format!("time_window_hours out of range: {time_window_hours}"))
        })?,
        notes: row.get(5)?,
    })
}

fn parse_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let outcome_raw: String = row.get(2)?;
    let helper: Option<String> = row.get(3)?;
    let outcome = match (outcome_raw.as_str(), helper) {
        ("success", _) => AttemptOutcome::Success,
        ("blocked", _) => AttemptOutcome::Blocked,
        ("redirected", Some(helper)) => AttemptOutcome::Redirected { helper },
        (other, _) => {
            return Err(conversion_error(2, format!("invalid outcome: {other}")));
        }
    };

    let call_type_code: i64 = row.get(4)?;
    let call_type = CallType::from_code(call_type_code)
        .ok_or_else(|| conversion_error(4, format!("invalid call_type code: {call_type_code}")))?;

    Ok(AttemptRecord {
        id: row.get(0)?,
        number: row.get(1)?,
        outcome,
        timestamp_ms: row.get(5)?,
        call_type,
    })
}

fn parse_bool_setting(value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(anyhow!("invalid boolean setting value: {other}")),
    }
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_has_column(conn: &Connection, table_name: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table_name)?
        .iter()
        .any(|candidate| candidate == column))
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }
    Ok(available)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let available = table_columns(conn, table_name)?;
    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "call gate schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_gate_error(err: anyhow::Error) -> GateError {
    GateError::Storage(format!("{err:#}"))
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
