//! Atomic finalization of a unit: registry upsert, derived-record upsert, and
//! audit insert in one immediate transaction.
//!
//! Commits for the same unit serialize on a per-unit async lock; commits for
//! different units never wait on each other here. Upserts only enrich: a blank
//! incoming value never replaces a known one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::store::{decode_ts, encode_ts, Database};
use crate::types::{Classification, DerivedRecord, FieldSet, IngestResult, RunStatus};

const DERIVED_COLUMNS: &str = "natural_key, source_id, unit_key, fields, grade, workflow_class, quality, origin_run_id, evidence_ids, created_at, updated_at";
const REGISTRY_COLUMNS: &str = "source_id, unit_key, last_run_id, last_status, blocked, signal_location, evidence_count, first_seen_at, updated_at";

/// Everything needed to finalize one unit of work.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub run_id: String,
    pub source: String,
    pub unit_key: String,
    /// Status recorded on the registry row.
    pub status: RunStatus,
    pub fields: FieldSet,
    pub classification: Classification,
    pub quality: f64,
    pub evidence_ids: Vec<i64>,
}

/// The committed record as read back inside the transaction.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub record: DerivedRecord,
    /// False when this run's audit entry already existed (a replayed commit).
    pub audit_inserted: bool,
}

/// Per-unit registry row consumed by downstream readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub source: String,
    pub unit_key: String,
    pub last_run_id: String,
    pub last_status: RunStatus,
    pub blocked: bool,
    /// Where a human must act to clear a captcha block.
    pub signal_location: Option<String>,
    pub evidence_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One audit-log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: String,
    pub source: String,
    pub unit_key: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

type UnitLock = Arc<tokio::sync::Mutex<()>>;

/// Serializes and atomically applies unit commits.
pub struct CommitCoordinator {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    unit_locks: Mutex<HashMap<String, UnitLock>>,
}

impl CommitCoordinator {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            unit_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply the registry, derived-record, and audit writes as one transaction.
    pub async fn commit(&self, req: &CommitRequest) -> IngestResult<CommitReceipt> {
        let key = DerivedRecord::natural_key_for(&req.source, &req.unit_key);
        let lock = self.unit_lock(&key);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let result = self.db.with_tx(|tx| {
            upsert_registry(
                tx,
                RegistryWrite {
                    source: &req.source,
                    unit_key: &req.unit_key,
                    run_id: &req.run_id,
                    status: req.status,
                    blocked: false,
                    signal_location: None,
                    evidence_count: req.evidence_ids.len() as u32,
                },
                now,
            )?;
            let record = upsert_derived(tx, &key, req, now)?;
            let detail = serde_json::json!({
                "status": req.status,
                "grade": record.grade,
                "workflow_class": record.workflow_class,
                "evidence": req.evidence_ids.len(),
            })
            .to_string();
            let audit_inserted =
                insert_audit(tx, &req.run_id, &req.source, &req.unit_key, "commit", &detail, now)?;
            Ok(CommitReceipt {
                record,
                audit_inserted,
            })
        });

        match &result {
            Ok(receipt) => info!(
                run_id = %req.run_id,
                natural_key = %key,
                replay = !receipt.audit_inserted,
                "Unit committed"
            ),
            Err(e) => warn!(run_id = %req.run_id, natural_key = %key, "Commit rolled back: {e}"),
        }
        drop(_guard);
        drop(lock);
        self.prune_idle_locks();
        result
    }

    /// Record a captcha block on the registry so consumers see it, with its audit entry.
    pub async fn record_block(
        &self,
        run_id: &str,
        source: &str,
        unit_key: &str,
        signal_location: &str,
    ) -> IngestResult<()> {
        let key = DerivedRecord::natural_key_for(source, unit_key);
        let lock = self.unit_lock(&key);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        self.db.with_tx(|tx| {
            upsert_registry(
                tx,
                RegistryWrite {
                    source,
                    unit_key,
                    run_id,
                    status: RunStatus::CaptchaBlocked,
                    blocked: true,
                    signal_location: Some(signal_location),
                    evidence_count: 0,
                },
                now,
            )?;
            insert_audit(tx, run_id, source, unit_key, "captcha_blocked", signal_location, now)?;
            Ok(())
        })?;
        warn!(run_id, source, unit_key, signal = signal_location, "Unit marked captcha-blocked");
        drop(_guard);
        drop(lock);
        self.prune_idle_locks();
        Ok(())
    }

    pub fn registry_entry(&self, source: &str, unit_key: &str) -> IngestResult<Option<RegistryEntry>> {
        let sql = format!(
            "SELECT {REGISTRY_COLUMNS} FROM case_registry WHERE source_id = ?1 AND unit_key = ?2"
        );
        self.db.with_conn(|conn| {
            conn.query_row(&sql, params![source, unit_key], registry_from_row)
                .optional()
        })
    }

    pub fn derived_record(&self, source: &str, unit_key: &str) -> IngestResult<Option<DerivedRecord>> {
        let key = DerivedRecord::natural_key_for(source, unit_key);
        self.db.with_conn(|conn| read_derived(conn, &key))
    }

    pub fn audit_entries(&self, run_id: &str) -> IngestResult<Vec<AuditEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, source_id, unit_key, action, detail, created_at
                 FROM audit_log WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(AuditEntry {
                    run_id: row.get(0)?,
                    source: row.get(1)?,
                    unit_key: row.get(2)?,
                    action: row.get(3)?,
                    detail: row.get(4)?,
                    created_at: decode_ts(5, &created_at)?,
                })
            })?;
            rows.collect()
        })
    }

    fn unit_lock(&self, key: &str) -> UnitLock {
        let mut locks = self.unit_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn prune_idle_locks(&self) {
        let mut locks = self.unit_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

struct RegistryWrite<'a> {
    source: &'a str,
    unit_key: &'a str,
    run_id: &'a str,
    status: RunStatus,
    blocked: bool,
    signal_location: Option<&'a str>,
    evidence_count: u32,
}

fn upsert_registry(tx: &Transaction<'_>, w: RegistryWrite<'_>, now: DateTime<Utc>) -> IngestResult<()> {
    tx.execute(
        "INSERT INTO case_registry
            (source_id, unit_key, last_run_id, last_status, blocked, signal_location,
             evidence_count, first_seen_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT (source_id, unit_key) DO UPDATE SET
            last_run_id = excluded.last_run_id,
            last_status = excluded.last_status,
            blocked = excluded.blocked,
            signal_location = excluded.signal_location,
            evidence_count = MAX(case_registry.evidence_count, excluded.evidence_count),
            updated_at = excluded.updated_at",
        params![
            w.source,
            w.unit_key,
            w.run_id,
            w.status.as_str(),
            w.blocked,
            w.signal_location,
            w.evidence_count,
            encode_ts(now),
        ],
    )?;
    Ok(())
}

fn upsert_derived(
    tx: &Transaction<'_>,
    key: &str,
    req: &CommitRequest,
    now: DateTime<Utc>,
) -> IngestResult<DerivedRecord> {
    let existing = read_derived(tx, key)?;

    let merged = match existing {
        Some(mut current) => {
            merge_fields(&mut current.fields, req.fields.clone());
            current.grade = non_blank(req.classification.grade.clone()).or(current.grade);
            current.workflow_class =
                non_blank(req.classification.workflow_class.clone()).or(current.workflow_class);
            if req.quality > 0.0 {
                current.quality = req.quality;
            }
            current.origin_run_id = req.run_id.clone();
            current.evidence_ids.extend(req.evidence_ids.iter().copied());
            current.evidence_ids.sort_unstable();
            current.evidence_ids.dedup();
            current.updated_at = now;
            current
        }
        None => {
            let mut evidence_ids = req.evidence_ids.clone();
            evidence_ids.sort_unstable();
            evidence_ids.dedup();
            DerivedRecord {
                natural_key: key.to_string(),
                source: req.source.clone(),
                unit_key: req.unit_key.clone(),
                fields: req.fields.clone(),
                grade: non_blank(req.classification.grade.clone()),
                workflow_class: non_blank(req.classification.workflow_class.clone()),
                quality: req.quality.max(0.0),
                origin_run_id: req.run_id.clone(),
                evidence_ids,
                created_at: now,
                updated_at: now,
            }
        }
    };

    tx.execute(
        "INSERT INTO derived_records
            (natural_key, source_id, unit_key, fields, grade, workflow_class, quality,
             origin_run_id, evidence_ids, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (natural_key) DO UPDATE SET
            fields = excluded.fields,
            grade = excluded.grade,
            workflow_class = excluded.workflow_class,
            quality = excluded.quality,
            origin_run_id = excluded.origin_run_id,
            evidence_ids = excluded.evidence_ids,
            updated_at = excluded.updated_at",
        params![
            merged.natural_key,
            merged.source,
            merged.unit_key,
            serde_json::to_string(&merged.fields)?,
            merged.grade,
            merged.workflow_class,
            merged.quality,
            merged.origin_run_id,
            serde_json::to_string(&merged.evidence_ids)?,
            encode_ts(merged.created_at),
            encode_ts(merged.updated_at),
        ],
    )?;

    // Read our own write back through the transaction.
    Ok(read_derived(tx, key)?.unwrap_or(merged))
}

fn insert_audit(
    tx: &Transaction<'_>,
    run_id: &str,
    source: &str,
    unit_key: &str,
    action: &str,
    detail: &str,
    now: DateTime<Utc>,
) -> IngestResult<bool> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO audit_log (run_id, source_id, unit_key, action, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![run_id, source, unit_key, action, detail, encode_ts(now)],
    )?;
    Ok(inserted == 1)
}

fn read_derived(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<Option<DerivedRecord>> {
    let sql = format!("SELECT {DERIVED_COLUMNS} FROM derived_records WHERE natural_key = ?1");
    conn.query_row(&sql, params![key], derived_from_row).optional()
}

fn derived_from_row(row: &Row<'_>) -> rusqlite::Result<DerivedRecord> {
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    let fields: String = row.get(3)?;
    let evidence_ids: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(DerivedRecord {
        natural_key: row.get(0)?,
        source: row.get(1)?,
        unit_key: row.get(2)?,
        fields: serde_json::from_str(&fields).map_err(|e| json_err(3, e))?,
        grade: row.get(4)?,
        workflow_class: row.get(5)?,
        quality: row.get(6)?,
        origin_run_id: row.get(7)?,
        evidence_ids: serde_json::from_str(&evidence_ids).map_err(|e| json_err(8, e))?,
        created_at: decode_ts(9, &created_at)?,
        updated_at: decode_ts(10, &updated_at)?,
    })
}

fn registry_from_row(row: &Row<'_>) -> rusqlite::Result<RegistryEntry> {
    let status: String = row.get(3)?;
    let first_seen_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(RegistryEntry {
        source: row.get(0)?,
        unit_key: row.get(1)?,
        last_run_id: row.get(2)?,
        last_status: status.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        blocked: row.get(4)?,
        signal_location: row.get(5)?,
        evidence_count: row.get(6)?,
        first_seen_at: decode_ts(7, &first_seen_at)?,
        updated_at: decode_ts(8, &updated_at)?,
    })
}

/// Values that carry no information and must not replace a known value.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) => false,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Merge `incoming` into `current` without regressing known values to blank ones.
///
/// Nested objects merge recursively; keys are never removed.
pub fn merge_fields(current: &mut FieldSet, incoming: FieldSet) {
    for (key, value) in incoming {
        match (current.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_fields(existing, nested),
            (Some(existing), value) => {
                if !is_blank(&value) || is_blank(existing) {
                    *existing = value;
                }
            }
            (None, value) => {
                current.insert(key, value);
            }
        }
    }
}
