//! Sqlite persistence: signal lifecycle rows, the append-only audit log,
//! and the per-business pulse gate.
//!
//! Reconciliation is read-modify-write, so the exclusive scope must start
//! before the reads: `begin_business_write` opens an IMMEDIATE transaction
//! first, and the gate check, state reads, and all writes for one pulse (or
//! operator edit) happen inside it. A second writer queues on the busy
//! handler instead of deciding against stale state.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::signal::{AuditEntry, AuditKind, Severity, SignalState, SignalStatus};

pub struct SignalStore {
    conn: Connection,
}

/// Audit row staged for a pulse write.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub signal_id: String,
    pub kind: AuditKind,
    pub actor: String,
    pub reason: String,
    pub before_json: Option<String>,
    pub after_json: Option<String>,
}

/// Everything one pulse persists, applied atomically.
#[derive(Debug, Default)]
pub struct PulseWrite {
    pub states: Vec<SignalState>,
    pub audits: Vec<AuditDraft>,
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

type StateRow = (
    String,         // business_id
    String,         // signal_id
    String,         // signal_type
    String,         // status
    String,         // severity
    String,         // title
    String,         // summary
    String,         // payload_json
    String,         // fingerprint
    String,         // detected_at
    String,         // last_seen_at
    Option<String>, // resolved_at
    Option<String>, // resolution_note
    String,         // updated_at
);

fn state_from_row(row: StateRow) -> Result<SignalState> {
    Ok(SignalState {
        business_id: row.0,
        signal_id: row.1,
        signal_type: row.2,
        status: SignalStatus::parse(&row.3)
            .ok_or_else(|| anyhow!("unknown status in store: {}", row.3))?,
        severity: Severity::parse(&row.4)
            .ok_or_else(|| anyhow!("unknown severity in store: {}", row.4))?,
        title: row.5,
        summary: row.6,
        payload_json: row.7,
        fingerprint: row.8,
        detected_at: ts_from_sql(&row.9)?,
        last_seen_at: ts_from_sql(&row.10)?,
        resolved_at: row.11.as_deref().map(ts_from_sql).transpose()?,
        resolution_note: row.12,
        updated_at: ts_from_sql(&row.13)?,
    })
}

const SELECT_STATE_COLS: &str = "business_id, signal_id, signal_type, status, severity, \
     title, summary, payload_json, fingerprint, detected_at, last_seen_at, \
     resolved_at, resolution_note, updated_at";

// Query helpers shared by the plain handle and the write transaction;
// `Transaction` derefs to `Connection`, so both call sites coerce.

fn query_last_pulse_at(conn: &Connection, business_id: &str) -> Result<Option<DateTime<Utc>>> {
    let mut stmt = conn.prepare("SELECT last_pulse_at FROM pulse_runs WHERE business_id = ?1")?;
    let mut rows = stmt.query_map(params![business_id], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(ts) => Ok(Some(ts_from_sql(&ts?)?)),
        None => Ok(None),
    }
}

fn query_states(conn: &Connection, business_id: &str) -> Result<Vec<SignalState>> {
    let sql = format!(
        "SELECT {} FROM signal_states WHERE business_id = ?1 ORDER BY signal_id",
        SELECT_STATE_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![business_id], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(state_from_row(row?)?);
    }
    Ok(out)
}

fn query_audit_entries(conn: &Connection, business_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, business_id, signal_id, kind, actor, reason, before_json, after_json, at
         FROM audit_log WHERE business_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![business_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let r = row?;
        out.push(AuditEntry {
            id: r.0,
            business_id: r.1,
            signal_id: r.2,
            kind: AuditKind::parse(&r.3)
                .ok_or_else(|| anyhow!("unknown audit kind in store: {}", r.3))?,
            actor: r.4,
            reason: r.5,
            before_json: r.6,
            after_json: r.7,
            at: ts_from_sql(&r.8)?,
        });
    }
    Ok(out)
}

fn query_transitions(
    conn: &Connection,
    business_id: &str,
    since: DateTime<Utc>,
) -> Result<BTreeMap<String, u32>> {
    let mut stmt = conn.prepare(
        "SELECT signal_id, COUNT(*) FROM audit_log
         WHERE business_id = ?1 AND at >= ?2
           AND kind IN ('signal_detected', 'signal_resolved', 'signal_status_changed')
         GROUP BY signal_id",
    )?;
    let rows = stmt.query_map(params![business_id, ts_to_sql(since)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (id, count) = row?;
        out.insert(id, count.max(0) as u32);
    }
    Ok(out)
}

fn upsert_state(conn: &Connection, state: &SignalState) -> Result<()> {
    conn.execute(
        "INSERT INTO signal_states (business_id, signal_id, signal_type, status, severity,
             title, summary, payload_json, fingerprint, detected_at, last_seen_at,
             resolved_at, resolution_note, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(business_id, signal_id) DO UPDATE SET
             signal_type = excluded.signal_type,
             status = excluded.status,
             severity = excluded.severity,
             title = excluded.title,
             summary = excluded.summary,
             payload_json = excluded.payload_json,
             fingerprint = excluded.fingerprint,
             detected_at = excluded.detected_at,
             last_seen_at = excluded.last_seen_at,
             resolved_at = excluded.resolved_at,
             resolution_note = excluded.resolution_note,
             updated_at = excluded.updated_at",
        params![
            state.business_id,
            state.signal_id,
            state.signal_type,
            state.status.as_str(),
            state.severity.as_str(),
            state.title,
            state.summary,
            state.payload_json,
            state.fingerprint,
            ts_to_sql(state.detected_at),
            ts_to_sql(state.last_seen_at),
            state.resolved_at.map(ts_to_sql),
            state.resolution_note,
            ts_to_sql(state.updated_at),
        ],
    )?;
    Ok(())
}

fn append_audit(
    conn: &Connection,
    business_id: &str,
    audit: &AuditDraft,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (business_id, signal_id, kind, actor, reason,
             before_json, after_json, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            business_id,
            audit.signal_id,
            audit.kind.as_str(),
            audit.actor,
            audit.reason,
            audit.before_json,
            audit.after_json,
            ts_to_sql(at),
        ],
    )?;
    Ok(())
}

impl SignalStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // A second writer waits for the lock instead of failing SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS signal_states (
                business_id TEXT NOT NULL,
                signal_id TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                status TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution_note TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (business_id, signal_id)
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                business_id TEXT NOT NULL,
                signal_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT NOT NULL,
                before_json TEXT,
                after_json TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_business_at
                ON audit_log(business_id, at);
            CREATE TABLE IF NOT EXISTS pulse_runs (
                business_id TEXT PRIMARY KEY,
                last_pulse_at TEXT NOT NULL
            );
            COMMIT;",
        )?;
        log(
            Level::Debug,
            Domain::Store,
            "store_ready",
            obj(&[("path", v_str(self.conn.path().unwrap_or(":memory:")))]),
        );
        Ok(())
    }

    pub fn last_pulse_at(&self, business_id: &str) -> Result<Option<DateTime<Utc>>> {
        query_last_pulse_at(&self.conn, business_id)
    }

    pub fn get_states(&self, business_id: &str) -> Result<Vec<SignalState>> {
        query_states(&self.conn, business_id)
    }

    pub fn get_state(&self, business_id: &str, signal_id: &str) -> Result<Option<SignalState>> {
        Ok(self
            .get_states(business_id)?
            .into_iter()
            .find(|s| s.signal_id == signal_id))
    }

    pub fn audit_entries(&self, business_id: &str) -> Result<Vec<AuditEntry>> {
        query_audit_entries(&self.conn, business_id)
    }

    /// Status transitions per signal since `since`, for flap detection.
    /// Counts detections, resolutions, and manual status changes; plain
    /// payload updates are not transitions.
    pub fn recent_status_transitions(
        &self,
        business_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, u32>> {
        query_transitions(&self.conn, business_id, since)
    }

    /// Open the exclusive read-modify-write scope for one business. The
    /// write lock is taken up front, so everything read through the returned
    /// handle is the state the previous writer committed.
    pub fn begin_business_write(&mut self) -> Result<BusinessWriteTxn<'_>> {
        Ok(BusinessWriteTxn {
            tx: self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?,
        })
    }

    /// Persist one pre-reconciled pulse in its own write scope.
    pub fn apply_pulse(
        &mut self,
        business_id: &str,
        pulse_at: DateTime<Utc>,
        write: &PulseWrite,
    ) -> Result<()> {
        let txn = self.begin_business_write()?;
        txn.apply(business_id, pulse_at, write)?;
        txn.commit()
    }
}

/// One business's exclusive write scope. Dropping without `commit` rolls
/// back, so an early return (gate skip, integrity failure) persists nothing.
pub struct BusinessWriteTxn<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl BusinessWriteTxn<'_> {
    pub fn last_pulse_at(&self, business_id: &str) -> Result<Option<DateTime<Utc>>> {
        query_last_pulse_at(&self.tx, business_id)
    }

    pub fn get_states(&self, business_id: &str) -> Result<Vec<SignalState>> {
        query_states(&self.tx, business_id)
    }

    pub fn get_state(&self, business_id: &str, signal_id: &str) -> Result<Option<SignalState>> {
        Ok(self
            .get_states(business_id)?
            .into_iter()
            .find(|s| s.signal_id == signal_id))
    }

    pub fn recent_status_transitions(
        &self,
        business_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, u32>> {
        query_transitions(&self.tx, business_id, since)
    }

    /// Stage one pulse's writes: state upserts, audit appends, gate bump.
    pub fn apply(
        &self,
        business_id: &str,
        pulse_at: DateTime<Utc>,
        write: &PulseWrite,
    ) -> Result<()> {
        for state in &write.states {
            upsert_state(&self.tx, state)?;
        }
        for audit in &write.audits {
            append_audit(&self.tx, business_id, audit, pulse_at)?;
        }
        self.tx.execute(
            "INSERT INTO pulse_runs (business_id, last_pulse_at) VALUES (?1, ?2)
             ON CONFLICT(business_id) DO UPDATE SET last_pulse_at = excluded.last_pulse_at",
            params![business_id, ts_to_sql(pulse_at)],
        )?;
        Ok(())
    }

    /// Operator path: one state mutation plus its audit entry.
    pub fn put_state_with_audit(
        &self,
        state: &SignalState,
        audit: &AuditDraft,
        at: DateTime<Utc>,
    ) -> Result<()> {
        upsert_state(&self.tx, state)?;
        append_audit(&self.tx, &state.business_id, audit, at)
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}
