//! Append-only audit log.
//!
//! The core writes every observation, signal, transition, risk change and
//! error here. It never reads the log back while trading; the read helpers
//! exist for the `status` command.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::risk::{PortfolioRiskState, RiskAlert};
use crate::strategy::{DropReason, FundingObservation, Signal, TransitionRecord};

/// One audit entry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Observation {
        observation: FundingObservation,
    },
    ObservationDropped {
        pair: String,
        timestamp: DateTime<Utc>,
        reason: DropReason,
    },
    SignalFired {
        signal: Signal,
    },
    /// A triggering signal that did not lead to an entry
    EntrySkipped {
        pair: String,
        at: DateTime<Utc>,
        reason: String,
    },
    Transition {
        record: TransitionRecord,
    },
    FundingAccrued {
        pair: String,
        amount: Decimal,
        funding_rate: Decimal,
        cumulative: Decimal,
        at: DateTime<Utc>,
    },
    RiskStateChange {
        cause: String,
        state: PortfolioRiskState,
        at: DateTime<Utc>,
    },
    Alert {
        alert: RiskAlert,
    },
    Error {
        pair: Option<String>,
        message: String,
        at: DateTime<Utc>,
    },
    EquitySnapshot {
        at: DateTime<Utc>,
        equity: Decimal,
        drawdown: Decimal,
        total_exposure: Decimal,
        open_positions: usize,
    },
}

impl AuditRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::Observation { .. } => "observation",
            AuditRecord::ObservationDropped { .. } => "observation_dropped",
            AuditRecord::SignalFired { .. } => "signal_fired",
            AuditRecord::EntrySkipped { .. } => "entry_skipped",
            AuditRecord::Transition { .. } => "transition",
            AuditRecord::FundingAccrued { .. } => "funding_accrued",
            AuditRecord::RiskStateChange { .. } => "risk_state_change",
            AuditRecord::Alert { .. } => "alert",
            AuditRecord::Error { .. } => "error",
            AuditRecord::EquitySnapshot { .. } => "equity_snapshot",
        }
    }

    pub fn pair(&self) -> Option<&str> {
        match self {
            AuditRecord::Observation { observation } => Some(&observation.pair),
            AuditRecord::ObservationDropped { pair, .. }
            | AuditRecord::EntrySkipped { pair, .. }
            | AuditRecord::FundingAccrued { pair, .. } => Some(pair),
            AuditRecord::SignalFired { signal } => Some(&signal.pair),
            AuditRecord::Transition { record } => Some(&record.pair),
            AuditRecord::Alert { alert } => alert.pair.as_deref(),
            AuditRecord::Error { pair, .. } => pair.as_deref(),
            AuditRecord::RiskStateChange { .. } | AuditRecord::EquitySnapshot { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::Observation { observation } => observation.timestamp,
            AuditRecord::ObservationDropped { timestamp, .. } => *timestamp,
            AuditRecord::SignalFired { signal } => signal.timestamp,
            AuditRecord::Transition { record } => record.at,
            AuditRecord::Alert { alert } => alert.timestamp,
            AuditRecord::EntrySkipped { at, .. }
            | AuditRecord::FundingAccrued { at, .. }
            | AuditRecord::RiskStateChange { at, .. }
            | AuditRecord::Error { at, .. }
            | AuditRecord::EquitySnapshot { at, .. } => *at,
        }
    }
}

/// Receiver of audit records. Implementations must not fail the caller:
/// write errors are logged and dropped.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Audit event as read back from the database.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub pair: Option<String>,
    pub payload: serde_json::Value,
}

/// Latest row of the equity history.
#[derive(Debug, Clone)]
pub struct EquityRow {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub drawdown: Decimal,
    pub total_exposure: Decimal,
    pub open_positions: i64,
}

/// SQLite-backed audit log.
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl SqliteAuditLog {
    /// Open (or create) the audit database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open audit database at {:?}", db_path.as_ref()))?;

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;

        info!("Audit log initialized at {:?}", db_path.as_ref());
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                pair TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_events(kind);

            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity TEXT NOT NULL,
                drawdown TEXT NOT NULL,
                total_exposure TEXT NOT NULL,
                open_positions INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON equity_snapshots(timestamp);
            "#,
        )
        .context("Failed to create audit schema")?;

        debug!("Audit schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.lock();

        if let AuditRecord::EquitySnapshot {
            at,
            equity,
            drawdown,
            total_exposure,
            open_positions,
        } = record
        {
            conn.execute(
                r#"
                INSERT INTO equity_snapshots (timestamp, equity, drawdown, total_exposure, open_positions)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    at.to_rfc3339(),
                    equity.to_string(),
                    drawdown.to_string(),
                    total_exposure.to_string(),
                    *open_positions as i64,
                ],
            )?;
            return Ok(());
        }

        let payload = serde_json::to_string(record).context("Failed to encode audit record")?;
        conn.execute(
            r#"
            INSERT INTO audit_events (timestamp, kind, pair, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.timestamp().to_rfc3339(),
                record.kind(),
                record.pair(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Most recent audit events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, kind, pair, payload
            FROM audit_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let events: Vec<StoredEvent> = stmt
            .query_map([limit as i64], |row| {
                let ts: String = row.get(0)?;
                let payload: String = row.get(3)?;
                Ok(StoredEvent {
                    timestamp: parse_timestamp(&ts),
                    kind: row.get(1)?,
                    pair: row.get(2)?,
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(events)
    }

    /// The last recorded equity snapshot, if any.
    pub fn latest_equity(&self) -> Result<Option<EquityRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                r#"
                SELECT timestamp, equity, drawdown, total_exposure, open_positions
                FROM equity_snapshots
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    let ts: String = row.get(0)?;
                    let equity: String = row.get(1)?;
                    let drawdown: String = row.get(2)?;
                    let exposure: String = row.get(3)?;
                    Ok(EquityRow {
                        timestamp: parse_timestamp(&ts),
                        equity: Decimal::from_str(&equity).unwrap_or_default(),
                        drawdown: Decimal::from_str(&drawdown).unwrap_or_default(),
                        total_exposure: Decimal::from_str(&exposure).unwrap_or_default(),
                        open_positions: row.get(4)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}

impl AuditSink for SqliteAuditLog {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.write(&record) {
            warn!(kind = record.kind(), error = %e, "Failed to write audit record");
        }
    }
}

fn parse_timestamp(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// In-memory audit log for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records of the given kind, in arrival order.
    pub fn of_kind(&self, kind: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind() == kind)
            .collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
