//! Audit & Determinism Store
//!
//! Append-only persistence of every market decision, approved or blocked,
//! together with the inputs it was computed from.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE audit_records (
//!     decision_id TEXT PRIMARY KEY,
//!     trace_id TEXT NOT NULL,
//!     contest_id TEXT NOT NULL,
//!     market_type TEXT NOT NULL,
//!     inputs_fingerprint TEXT NOT NULL,
//!     decision_version INTEGER NOT NULL,
//!     release_status TEXT NOT NULL,
//!     created_at INTEGER NOT NULL,   -- unix seconds
//!     expires_at INTEGER NOT NULL,   -- unix seconds
//!     record_json TEXT NOT NULL
//! ) WITHOUT ROWID;
//! ```
//!
//! Immutability is enforced by the database, not by this module: a
//! `BEFORE UPDATE` trigger aborts every update and a `BEFORE DELETE` trigger
//! aborts any delete of a record whose retention has not expired. Any other
//! connection opened on the same file hits the same triggers.
//!
//! Every connection this module opens also carries a SQLite authorizer that
//! refuses, at statement preparation time, any UPDATE of `audit_records` and
//! any attempt to drop, alter or add triggers to it, so the triggers cannot be
//! removed through the store itself.

use crate::decision::bundle::{DecisionBundle, DecisionVersion, MarketDecision};
use crate::decision::fingerprint::InputsFingerprint;
use crate::models::{ContestMetadata, ContestRequest, LeagueBaseline, MarketInput, MarketType};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema with immutability triggers
const SCHEMA_VERSION: u32 = 1;

const AUDIT_TABLE: &str = "audit_records";

// =============================================================================
// RECORDS
// =============================================================================

/// Inputs a decision was computed from, kept so the decision can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditInputs {
    pub contest: ContestMetadata,
    pub baseline: LeagueBaseline,
    pub market: MarketInput,
}

/// Immutable copy of a market decision plus retention metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub decision: MarketDecision,
    pub inputs: AuditInputs,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(decision: MarketDecision, inputs: AuditInputs, retention_days: i64) -> Self {
        let created_at = decision.debug.computed_at;
        Self {
            decision,
            inputs,
            created_at,
            expires_at: created_at + Duration::days(retention_days),
        }
    }

    /// One record per decision of the bundle, each carrying its own market's
    /// inputs. Decisions without a matching market in the request are skipped.
    pub fn for_bundle(
        bundle: &DecisionBundle,
        request: &ContestRequest,
        retention_days: i64,
    ) -> Vec<AuditRecord> {
        bundle
            .decisions
            .iter()
            .filter_map(|decision| {
                let market = request
                    .markets
                    .iter()
                    .find(|m| m.market_type == decision.market_type)?;
                Some(AuditRecord::new(
                    decision.clone(),
                    AuditInputs {
                        contest: request.contest.clone(),
                        baseline: request.baseline.clone(),
                        market: market.clone(),
                    },
                    retention_days,
                ))
            })
            .collect()
    }

    pub fn trace_id(&self) -> Uuid {
        self.decision.debug.trace_id
    }

    pub fn fingerprint(&self) -> &InputsFingerprint {
        &self.decision.debug.inputs_fingerprint
    }
}

/// Outcome of comparing every stored decision that shares a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeterminismReport {
    pub contest_id: String,
    pub inputs_fingerprint: InputsFingerprint,
    pub records_compared: usize,
    /// Decisions whose input-scoped fields differ from the earliest record.
    pub divergent: Vec<Uuid>,
}

impl DeterminismReport {
    pub fn is_deterministic(&self) -> bool {
        self.divergent.is_empty()
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Append-and-read audit sink.
pub trait AuditLog: Send + Sync {
    /// Persist all records of one bundle, or none of them.
    fn append_bundle(&self, records: &[AuditRecord]) -> Result<(), AuditError>;

    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.append_bundle(std::slice::from_ref(record))
    }

    fn find_by_trace(&self, trace_id: Uuid) -> Result<Vec<AuditRecord>, AuditError>;

    /// Records for one contest with the given fingerprint, oldest first.
    fn find_history(
        &self,
        contest_id: &str,
        fingerprint: &InputsFingerprint,
    ) -> Result<Vec<AuditRecord>, AuditError>;

    fn find_by_contest(&self, contest_id: &str) -> Result<Vec<AuditRecord>, AuditError>;

    /// Highest decision version ever stored.
    fn latest_version(&self) -> Result<Option<DecisionVersion>, AuditError>;

    /// True iff every stored decision for this fingerprint has identical
    /// input-scoped fields.
    fn verify_determinism(
        &self,
        contest_id: &str,
        fingerprint: &InputsFingerprint,
    ) -> Result<DeterminismReport, AuditError> {
        let history = self.find_history(contest_id, fingerprint)?;
        let mut divergent = Vec::new();
        if let Some((first, rest)) = history.split_first() {
            let expected = first.decision.determinism_key();
            for record in rest {
                if record.decision.determinism_key() != expected {
                    divergent.push(record.decision.decision_id);
                }
            }
        }
        if !divergent.is_empty() {
            warn!(
                contest = %contest_id,
                fingerprint = %fingerprint.short(),
                divergent = divergent.len(),
                "non-deterministic decisions for identical inputs"
            );
        }
        Ok(DeterminismReport {
            contest_id: contest_id.to_string(),
            inputs_fingerprint: fingerprint.clone(),
            records_compared: history.len(),
            divergent,
        })
    }
}

// =============================================================================
// SQLITE STORE
// =============================================================================

/// SQLite-backed audit log.
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
    read_only: bool,
}

impl AuditStore {
    /// Open (or create) a writable store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            read_only: false,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            read_only: false,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an existing store with a read-only connection.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.authorizer(Some(guard_audit_table));
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            read_only: true,
        })
    }

    fn initialize_schema(&self) -> Result<(), AuditError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current_version {
            None => {
                Self::create_schema_v1(&conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created audit store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Audit store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Audit store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        // Installed after the schema exists so that the triggers themselves
        // could be created.
        conn.authorizer(Some(guard_audit_table));
        Ok(())
    }

    fn create_schema_v1(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_records (
                decision_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                contest_id TEXT NOT NULL,
                market_type TEXT NOT NULL,
                inputs_fingerprint TEXT NOT NULL,
                decision_version INTEGER NOT NULL,
                release_status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                record_json TEXT NOT NULL
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_audit_trace
                ON audit_records(trace_id);
            CREATE INDEX IF NOT EXISTS idx_audit_contest
                ON audit_records(contest_id, decision_version);
            CREATE INDEX IF NOT EXISTS idx_audit_fingerprint
                ON audit_records(contest_id, inputs_fingerprint, decision_version);

            CREATE TRIGGER IF NOT EXISTS audit_records_no_update
            BEFORE UPDATE ON audit_records
            BEGIN
                SELECT RAISE(ABORT, 'audit records are immutable');
            END;

            CREATE TRIGGER IF NOT EXISTS audit_records_retention
            BEFORE DELETE ON audit_records
            WHEN OLD.expires_at > CAST(strftime('%s', 'now') AS INTEGER)
            BEGIN
                SELECT RAISE(ABORT, 'audit records are retained until expiry');
            END;
        "#,
        )?;
        Ok(())
    }

    /// Run a raw statement on the store's own connection.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, AuditError> {
        let conn = self.conn.lock();
        Ok(conn.execute(sql, [])?)
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }

    /// Summary counts for operators.
    pub fn stats(&self) -> Result<AuditStoreStats, AuditError> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"SELECT
                COUNT(*),
                COUNT(DISTINCT trace_id),
                COUNT(DISTINCT contest_id),
                COALESCE(SUM(release_status = 'APPROVED'), 0),
                COALESCE(SUM(release_status = 'PENDING_REVIEW'), 0),
                COALESCE(SUM(release_status LIKE 'BLOCKED_%'), 0),
                MAX(decision_version)
            FROM audit_records"#,
            [],
            |row| {
                Ok(AuditStoreStats {
                    total_records: row.get::<_, i64>(0)? as u64,
                    bundles: row.get::<_, i64>(1)? as u64,
                    contests: row.get::<_, i64>(2)? as u64,
                    approved: row.get::<_, i64>(3)? as u64,
                    pending_review: row.get::<_, i64>(4)? as u64,
                    blocked: row.get::<_, i64>(5)? as u64,
                    latest_version: row
                        .get::<_, Option<i64>>(6)?
                        .map(|v| DecisionVersion(v as u64)),
                })
            },
        )
        .map_err(AuditError::from)
    }
}

/// SQLite authorizer for store connections.
///
/// Denies updates to audit rows, schema changes to the audit table and its
/// triggers, and `writable_schema`. Deletes are left to the retention trigger,
/// which can see `expires_at`.
fn guard_audit_table(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Update { table_name, .. }
        | AuthAction::DropTable { table_name }
        | AuthAction::AlterTable { table_name, .. }
        | AuthAction::DropTrigger { table_name, .. }
        | AuthAction::DropTempTrigger { table_name, .. }
        | AuthAction::CreateTrigger { table_name, .. }
        | AuthAction::CreateTempTrigger { table_name, .. }
            if table_name.eq_ignore_ascii_case(AUDIT_TABLE) =>
        {
            Authorization::Deny
        }
        AuthAction::Pragma { pragma_name, .. }
            if pragma_name.eq_ignore_ascii_case("writable_schema") =>
        {
            Authorization::Deny
        }
        _ => Authorization::Allow,
    }
}

impl AuditLog for AuditStore {
    fn append_bundle(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        if self.read_only {
            return Err(AuditError::ReadOnly);
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            let decision = &record.decision;
            let decision_id = decision.decision_id.to_string();

            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM audit_records WHERE decision_id = ?",
                    [&decision_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if exists {
                return Err(AuditError::AlreadyExists(decision_id));
            }

            let json = serde_json::to_string(record)?;
            tx.execute(
                r#"INSERT INTO audit_records (
                    decision_id, trace_id, contest_id, market_type, inputs_fingerprint,
                    decision_version, release_status, created_at, expires_at, record_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    decision_id,
                    decision.debug.trace_id.to_string(),
                    decision.contest_id,
                    decision.market_type.as_str(),
                    decision.debug.inputs_fingerprint.as_str(),
                    decision.debug.decision_version.0 as i64,
                    decision.release_status.as_str(),
                    record.created_at.timestamp(),
                    record.expires_at.timestamp(),
                    json,
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            trace_id = %records[0].trace_id(),
            records = records.len(),
            "appended audit records"
        );
        Ok(())
    }

    fn find_by_trace(&self, trace_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.query_records(
            "SELECT record_json FROM audit_records WHERE trace_id = ? ORDER BY market_type",
            &[&trace_id.to_string()],
        )
    }

    fn find_history(
        &self,
        contest_id: &str,
        fingerprint: &InputsFingerprint,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.query_records(
            r#"SELECT record_json FROM audit_records
            WHERE contest_id = ? AND inputs_fingerprint = ?
            ORDER BY decision_version, decision_id"#,
            &[&contest_id, &fingerprint.as_str()],
        )
    }

    fn find_by_contest(&self, contest_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        self.query_records(
            r#"SELECT record_json FROM audit_records
            WHERE contest_id = ?
            ORDER BY decision_version, market_type"#,
            &[&contest_id],
        )
    }

    fn latest_version(&self) -> Result<Option<DecisionVersion>, AuditError> {
        let conn = self.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(decision_version) FROM audit_records", [], |row| {
                row.get(0)
            })?;
        Ok(max.map(|v| DecisionVersion(v as u64)))
    }
}

/// Statistics about the audit store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStoreStats {
    pub total_records: u64,
    pub bundles: u64,
    pub contests: u64,
    pub approved: u64,
    pub pending_review: u64,
    pub blocked: u64,
    pub latest_version: Option<DecisionVersion>,
}

/// Records grouped by market type, newest version last.
pub fn history_by_market(records: &[AuditRecord]) -> Vec<(MarketType, Vec<&AuditRecord>)> {
    MarketType::ALL
        .iter()
        .map(|mt| {
            (
                *mt,
                records
                    .iter()
                    .filter(|r| r.decision.market_type == *mt)
                    .collect::<Vec<_>>(),
            )
        })
        .filter(|(_, records)| !records.is_empty())
        .collect()
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from the audit log.
#[derive(Debug)]
pub enum AuditError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    AlreadyExists(String),
    ReadOnly,
    /// Sink temporarily unreachable.
    Unavailable(String),
}

impl AuditError {
    /// Worth retrying: the same write may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::AlreadyExists(id) => write!(f, "Audit record already exists: {}", id),
            Self::ReadOnly => write!(f, "Audit store is opened read-only"),
            Self::Unavailable(msg) => write!(f, "Audit sink unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AuditError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}
