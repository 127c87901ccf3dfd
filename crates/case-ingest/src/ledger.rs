//! Durable record of every ingestion attempt.
//!
//! Rows are created `RUNNING`, mutated only through their own run id, and frozen
//! once terminal. Runs orphaned by a crashed process are reclaimed as
//! `FAILED_STALE` at startup so they never block idempotent retries.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::store::{decode_opt_ts, decode_ts, encode_ts, Database};
use crate::types::{IngestError, IngestResult, IngestionRun, RunCounts, RunStatus};

/// Default liveness window after which a `RUNNING` row is considered orphaned.
pub const DEFAULT_LIVENESS: Duration = Duration::from_secs(2 * 60 * 60);

const RUN_COLUMNS: &str =
    "run_id, source_id, unit_key, status, started_at, finished_at, processed, failed, notes";

/// Filter for the read-only run query surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub source: Option<String>,
    pub unit_key: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

/// Append-only ledger of ingestion runs.
pub struct RunLedger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl RunLedger {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Open a `RUNNING` row and return its globally unique id.
    pub fn start_run(&self, source: &str, unit_key: &str) -> IngestResult<String> {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let now = encode_ts(self.clock.now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ingestion_runs (run_id, source_id, unit_key, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, source, unit_key, RunStatus::Running.as_str(), now],
            )
        })?;
        info!(run_id = %run_id, source, unit_key, "Run started");
        Ok(run_id)
    }

    /// Append a note to a run that is still `RUNNING`.
    pub fn annotate(&self, run_id: &str, note: &str) -> IngestResult<()> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestion_runs
                 SET notes = CASE WHEN notes IS NULL OR notes = '' THEN ?2 ELSE notes || '; ' || ?2 END
                 WHERE run_id = ?1 AND status = ?3",
                params![run_id, note, RunStatus::Running.as_str()],
            )
        })?;
        if updated == 0 {
            return Err(self.not_running(run_id)?);
        }
        Ok(())
    }

    /// Transition a `RUNNING` row to a terminal status.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counts: RunCounts,
        notes: Option<&str>,
    ) -> IngestResult<()> {
        if !status.is_terminal() {
            return Err(IngestError::InvalidInput(format!(
                "cannot finish run {run_id} as {status}"
            )));
        }
        let now = encode_ts(self.clock.now());
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE ingestion_runs
                 SET status = ?2, finished_at = ?3, processed = ?4, failed = ?5,
                     notes = CASE
                        WHEN ?6 IS NULL THEN notes
                        WHEN notes IS NULL OR notes = '' THEN ?6
                        ELSE notes || '; ' || ?6
                     END
                 WHERE run_id = ?1 AND status = ?7",
                params![
                    run_id,
                    status.as_str(),
                    now,
                    counts.processed,
                    counts.failed,
                    notes,
                    RunStatus::Running.as_str(),
                ],
            )
        })?;
        if updated == 0 {
            return Err(self.not_running(run_id)?);
        }
        info!(
            run_id,
            status = %status,
            processed = counts.processed,
            failed = counts.failed,
            "Run finished"
        );
        Ok(())
    }

    /// Force every `RUNNING` row older than `liveness` to `FAILED_STALE`.
    ///
    /// Returns the reclaimed run ids. Call before any new run starts.
    pub fn reclaim_stale_runs(&self, liveness: Duration) -> IngestResult<Vec<String>> {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(liveness)
            .map_err(|e| IngestError::InvalidInput(format!("liveness window out of range: {e}")))?;
        let cutoff = encode_ts(now - window);
        let finished = encode_ts(now);
        let note = format!("reclaimed: no terminal status within {}s", liveness.as_secs());

        let reclaimed = self.db.with_tx(|tx| {
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT run_id FROM ingestion_runs
                     WHERE status = ?1 AND started_at < ?2
                     ORDER BY started_at",
                )?;
                let rows = stmt.query_map(params![RunStatus::Running.as_str(), cutoff], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for id in &ids {
                tx.execute(
                    "UPDATE ingestion_runs
                     SET status = ?2, finished_at = ?3,
                         notes = CASE WHEN notes IS NULL OR notes = '' THEN ?4 ELSE notes || '; ' || ?4 END
                     WHERE run_id = ?1 AND status = ?5",
                    params![
                        id,
                        RunStatus::FailedStale.as_str(),
                        finished,
                        note,
                        RunStatus::Running.as_str(),
                    ],
                )?;
            }
            Ok(ids)
        })?;

        for id in &reclaimed {
            warn!(run_id = %id, "Reclaimed stale run");
        }
        Ok(reclaimed)
    }

    pub fn get(&self, run_id: &str) -> IngestResult<Option<IngestionRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE run_id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, params![run_id], run_from_row).optional())
    }

    /// Runs matching `filter`, newest first.
    pub fn list(&self, filter: &RunFilter) -> IngestResult<Vec<IngestionRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM ingestion_runs
             WHERE (?1 IS NULL OR source_id = ?1)
               AND (?2 IS NULL OR unit_key = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?4"
        );
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    filter.source,
                    filter.unit_key,
                    filter.status.map(RunStatus::as_str),
                    limit
                ],
                run_from_row,
            )?;
            rows.collect()
        })
    }

    pub fn latest_for_unit(&self, source: &str, unit_key: &str) -> IngestResult<Option<IngestionRun>> {
        let mut runs = self.list(&RunFilter {
            source: Some(source.to_string()),
            unit_key: Some(unit_key.to_string()),
            status: None,
            limit: Some(1),
        })?;
        Ok(runs.pop())
    }

    fn not_running(&self, run_id: &str) -> IngestResult<IngestError> {
        Ok(match self.get(run_id)? {
            Some(run) => IngestError::RunAlreadyTerminal {
                run_id: run_id.to_string(),
                status: run.status,
            },
            None => IngestError::RunNotFound(run_id.to_string()),
        })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<IngestionRun> {
    let status: String = row.get(3)?;
    let status = status.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let started_at: String = row.get(4)?;
    Ok(IngestionRun {
        run_id: row.get(0)?,
        source: row.get(1)?,
        unit_key: row.get(2)?,
        status,
        started_at: decode_ts(4, &started_at)?,
        finished_at: decode_opt_ts(5, row.get(5)?)?,
        processed: row.get(6)?,
        failed: row.get(7)?,
        notes: row.get(8)?,
    })
}
