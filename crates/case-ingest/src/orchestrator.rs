//! Entry point for schedulers: open a run, drive it, close it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::automation::{
    AutomationConfig, AutomationState, CaseAutomation, HumanSignal, RunOutcome, SearchQuery,
    SessionFactory,
};
use crate::clock::Clock;
use crate::commit::CommitCoordinator;
use crate::evidence::EvidenceStore;
use crate::fetch::{FetchDriver, Fetcher};
use crate::governor::Governor;
use crate::ledger::{RunLedger, DEFAULT_LIVENESS};
use crate::producer::{Classifier, ProducerSet};
use crate::sources::{DriverKind, SourceProfile, SourceRegistry};
use crate::store::Database;
use crate::types::{IngestError, IngestResult, RunStatus};

const DB_FILE: &str = "ingest.db";
const EVIDENCE_DIR: &str = "evidence";

/// Terminal summary printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub processed: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Where a human must act; set on captcha-blocked runs.
    #[serde(default, rename = "signal", skip_serializing_if = "Option::is_none")]
    pub signal_location: Option<String>,
}

impl RunSummary {
    pub fn exit_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Storage-backed services shared by every run.
pub struct IngestCore {
    pub sources: Arc<SourceRegistry>,
    pub db: Arc<Database>,
    pub governor: Arc<Governor>,
    pub ledger: Arc<RunLedger>,
    pub evidence: Arc<EvidenceStore>,
    pub commit: Arc<CommitCoordinator>,
}

impl IngestCore {
    /// Open `<data_dir>/ingest.db` and `<data_dir>/evidence/`.
    pub fn open(data_dir: &Path, sources: SourceRegistry, clock: Arc<dyn Clock>) -> IngestResult<Self> {
        let db = Arc::new(Database::open(&data_dir.join(DB_FILE))?);
        Self::with_database(db, sources, data_dir.join(EVIDENCE_DIR), clock)
    }

    pub fn with_database(
        db: Arc<Database>,
        sources: SourceRegistry,
        evidence_root: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> IngestResult<Self> {
        let sources = Arc::new(sources);
        Ok(Self {
            governor: Arc::new(Governor::new(
                Arc::clone(&sources),
                Arc::clone(&db),
                Arc::clone(&clock),
            )),
            ledger: Arc::new(RunLedger::new(Arc::clone(&db), Arc::clone(&clock))),
            evidence: Arc::new(EvidenceStore::new(
                Arc::clone(&db),
                evidence_root,
                Arc::clone(&clock),
            )?),
            commit: Arc::new(CommitCoordinator::new(Arc::clone(&db), clock)),
            sources,
            db,
        })
    }
}

/// The pluggable pieces a deployment supplies.
pub struct Collaborators {
    pub sessions: Arc<dyn SessionFactory>,
    pub fetcher: Arc<dyn Fetcher>,
    pub producers: ProducerSet,
    pub classifier: Arc<dyn Classifier>,
    pub signal: Arc<dyn HumanSignal>,
}

pub struct Orchestrator {
    core: IngestCore,
    sessions: Arc<dyn SessionFactory>,
    automation: CaseAutomation,
    fetch: FetchDriver,
    liveness: Duration,
    reclaimed: OnceCell<Vec<String>>,
}

impl Orchestrator {
    pub fn new(core: IngestCore, collaborators: Collaborators, config: AutomationConfig) -> Self {
        let automation = CaseAutomation::new(
            Arc::clone(&core.governor),
            Arc::clone(&core.evidence),
            Arc::clone(&core.commit),
            collaborators.producers.clone(),
            Arc::clone(&collaborators.classifier),
            Arc::clone(&collaborators.signal),
            config,
        );
        let fetch = FetchDriver::new(
            Arc::clone(&core.governor),
            Arc::clone(&core.evidence),
            Arc::clone(&core.commit),
            collaborators.producers,
            collaborators.classifier,
            collaborators.signal,
            collaborators.fetcher,
            config,
        );
        Self {
            core,
            sessions: collaborators.sessions,
            automation,
            fetch,
            liveness: DEFAULT_LIVENESS,
            reclaimed: OnceCell::new(),
        }
    }

    /// Liveness window used by the startup reclamation.
    pub fn with_liveness(mut self, liveness: Duration) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn core(&self) -> &IngestCore {
        &self.core
    }

    /// Reclaim stale runs. Runs once per orchestrator; every run waits for it.
    pub async fn startup(&self) -> IngestResult<Vec<String>> {
        let reclaimed = self
            .reclaimed
            .get_or_try_init(|| async {
                let ids = self.core.ledger.reclaim_stale_runs(self.liveness)?;
                if !ids.is_empty() {
                    warn!(count = ids.len(), "Reclaimed stale runs at startup");
                }
                Ok::<_, IngestError>(ids)
            })
            .await?;
        Ok(reclaimed.clone())
    }

    /// Ingest one unit (e.g. one case number).
    pub async fn run_unit(&self, source: &str, unit_key: &str) -> IngestResult<RunSummary> {
        if unit_key.trim().is_empty() {
            return Err(IngestError::InvalidInput("unit key must not be empty".into()));
        }
        self.execute(source, SearchQuery::unit(unit_key.trim())).await
    }

    /// Sweep a date window, inclusive on both ends.
    pub async fn run_window(
        &self,
        source: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> IngestResult<RunSummary> {
        if start > end {
            return Err(IngestError::InvalidInput(format!(
                "window start {start} is after end {end}"
            )));
        }
        self.execute(source, SearchQuery::window(start, end)).await
    }

    async fn execute(&self, source: &str, query: SearchQuery) -> IngestResult<RunSummary> {
        let profile = self.core.sources.get(source)?.clone();
        self.startup().await?;

        let run_id = self.core.ledger.start_run(source, &query.unit_key)?;
        info!(run_id = %run_id, source, unit_key = %query.unit_key, driver = ?profile.driver, "Dispatching run");

        let outcome = match profile.driver {
            DriverKind::Portal => self.drive_portal(&run_id, &profile, &query).await,
            DriverKind::Fetch => self.fetch.drive(&run_id, &profile, &query).await,
        };

        let notes = outcome.joined_notes();
        self.core
            .ledger
            .finish_run(&run_id, outcome.status, outcome.counts, notes.as_deref())?;
        info!(
            run_id = %run_id,
            source,
            status = %outcome.status,
            state = %outcome.state,
            processed = outcome.counts.processed,
            failed = outcome.counts.failed,
            "Run finished"
        );

        Ok(RunSummary {
            run_id,
            status: outcome.status,
            processed: outcome.counts.processed,
            failed: outcome.counts.failed,
            notes,
            signal_location: outcome.signal_location,
        })
    }

    async fn drive_portal(&self, run_id: &str, profile: &SourceProfile, query: &SearchQuery) -> RunOutcome {
        let mut session = match self.sessions.open_session(profile).await {
            Ok(session) => session,
            Err(e) => {
                error!(run_id, source = %profile.id, "Could not open session: {e:#}");
                return RunOutcome::failed(AutomationState::Failed, format!("session: {e:#}"));
            }
        };
        let outcome = self.automation.drive(run_id, profile, query, session.as_mut()).await;
        if let Err(e) = session.close().await {
            warn!(run_id, "Session did not close cleanly: {e:#}");
        }
        outcome
    }
}
