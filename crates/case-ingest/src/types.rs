//! Core data types for ingestion runs, evidence, and derived records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured fields produced from raw evidence. Semantics are owned by the producer.
pub type FieldSet = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    CaptchaBlocked,
    FailedStale,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
            RunStatus::CaptchaBlocked => "CAPTCHA_BLOCKED",
            RunStatus::FailedStale => "FAILED_STALE",
        }
    }

    /// Every status except `Running` is terminal and never changes again.
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Whether a scheduler should treat the run as having produced usable output.
    pub fn is_ok(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Partial)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            "CAPTCHA_BLOCKED" => Ok(RunStatus::CaptchaBlocked),
            "FAILED_STALE" => Ok(RunStatus::FailedStale),
            other => Err(IngestError::InvalidInput(format!("unknown run status: {other}"))),
        }
    }
}

/// Processed/failed sub-unit counts reported when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u32,
    pub failed: u32,
}

/// One attempt at a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: String,
    pub source: String,
    pub unit_key: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: u32,
    pub failed: u32,
    pub notes: Option<String>,
}

/// An immutable raw snapshot or document, content-addressed by SHA-256.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub source: String,
    pub unit_key: String,
    /// `results`, `detail`, `tab-<name>`, `document`, ...
    pub kind: String,
    /// Document family (e.g. `pdf`, `html`); `None` for page snapshots.
    pub family: Option<String>,
    pub filename: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
    pub run_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Grade and workflow class assigned by the classification collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub grade: Option<String>,
    pub workflow_class: Option<String>,
}

/// The business-facing record upserted at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    /// `<source>:<unit_key>`.
    pub natural_key: String,
    pub source: String,
    pub unit_key: String,
    pub fields: FieldSet,
    pub grade: Option<String>,
    pub workflow_class: Option<String>,
    pub quality: f64,
    /// Traceability back-reference, not ownership.
    pub origin_run_id: String,
    pub evidence_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DerivedRecord {
    pub fn natural_key_for(source: &str, unit_key: &str) -> String {
        format!("{source}:{unit_key}")
    }
}

/// Errors that can occur in the ingestion core.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is already terminal ({status})")]
    RunAlreadyTerminal { run_id: String, status: RunStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience result type.
pub type IngestResult<T> = Result<T, IngestError>;
