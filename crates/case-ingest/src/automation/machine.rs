//! The per-run driver for portal sources.
//!
//! Every remote interaction asks the governor for a permit first and reports
//! its outcome afterwards. Errors are caught at state boundaries and turned
//! into a terminal status; evidence captured before a failure is kept.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use super::captcha::{HumanSignal, SignalOutcome};
use super::session::{DocumentLink, PageStatus, PortalSession, ResultRow, SearchQuery};
use super::{status_for, AutomationConfig, AutomationState, GatePoint, RunOutcome};
use crate::commit::{CommitCoordinator, CommitRequest};
use crate::evidence::EvidenceStore;
use crate::governor::{Admission, DenyReason, Governor};
use crate::producer::{Classifier, Harvest, ProducerSet};
use crate::sources::SourceProfile;
use crate::types::{Classification, IngestError, RunCounts, RunStatus};

/// Why a step stopped the walk.
enum Halt {
    Denied(DenyReason),
    Blocked(String),
    Error(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(e: anyhow::Error) -> Self {
        Halt::Error(e)
    }
}

impl From<IngestError> for Halt {
    fn from(e: IngestError) -> Self {
        Halt::Error(e.into())
    }
}

/// Drives portal sessions through the case protocol.
pub struct CaseAutomation {
    governor: Arc<Governor>,
    evidence: Arc<EvidenceStore>,
    commit: Arc<CommitCoordinator>,
    producers: ProducerSet,
    classifier: Arc<dyn Classifier>,
    signal: Arc<dyn HumanSignal>,
    config: AutomationConfig,
}

impl CaseAutomation {
    pub fn new(
        governor: Arc<Governor>,
        evidence: Arc<EvidenceStore>,
        commit: Arc<CommitCoordinator>,
        producers: ProducerSet,
        classifier: Arc<dyn Classifier>,
        signal: Arc<dyn HumanSignal>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            governor,
            evidence,
            commit,
            producers,
            classifier,
            signal,
            config,
        }
    }

    /// Walk one run to a terminal outcome. Never returns an error.
    pub async fn drive(
        &self,
        run_id: &str,
        profile: &SourceProfile,
        query: &SearchQuery,
        session: &mut dyn PortalSession,
    ) -> RunOutcome {
        let mut walk = Walk {
            machine: self,
            run_id,
            profile,
            query,
            session,
            state: AutomationState::Idle,
            counts: RunCounts::default(),
            notes: Vec::new(),
            evidence_ids: Vec::new(),
            seen_documents: HashSet::new(),
        };
        let result = walk.walk().await;
        walk.conclude(result).await
    }
}

/// Mutable context of one run.
struct Walk<'a> {
    machine: &'a CaseAutomation,
    run_id: &'a str,
    profile: &'a SourceProfile,
    query: &'a SearchQuery,
    session: &'a mut dyn PortalSession,
    state: AutomationState,
    counts: RunCounts,
    notes: Vec<String>,
    evidence_ids: Vec<i64>,
    /// Document references already queued this session.
    seen_documents: HashSet<String>,
}

impl Walk<'_> {
    fn enter(&mut self, state: AutomationState) {
        debug!(run_id = self.run_id, source = %self.profile.id, state = %state, "Entering state");
        self.state = state;
    }

    fn source(&self) -> &str {
        &self.profile.id
    }

    async fn walk(&mut self) -> Result<(), Halt> {
        self.enter(AutomationState::CaptchaGate(GatePoint::Entry));
        self.permit().await?;
        let step = self.machine.config.step_timeout;
        let opened = bounded(step, self.session.open()).await;
        let page = self.settle(opened).await?;
        self.gate(GatePoint::Entry, &page).await?;
        self.enter(AutomationState::PageLoaded);

        if bounded(step, self.session.has_terms()).await? {
            self.permit().await?;
            let accepted = bounded(step, self.session.accept_terms()).await;
            let page = self.settle(accepted).await?;
            self.gate(GatePoint::Entry, &page).await?;
        }
        self.enter(AutomationState::TermsAccepted);

        let found = self.search(self.query.clone()).await?;
        let mut rows = self.select_rows(found);
        self.enter(AutomationState::ResultsEvaluated);

        if rows.is_empty() && self.query.filtered {
            info!(
                run_id = self.run_id,
                source = self.source(),
                unit_key = %self.query.unit_key,
                "Filtered search returned no usable rows; retrying with show-all"
            );
            self.notes.push("show-all fallback".to_string());
            let found = self.search(self.query.unfiltered()).await?;
            rows = self.select_rows(found);
            self.enter(AutomationState::ResultsEvaluated);
        }

        if rows.is_empty() {
            if self.query.is_window() {
                self.notes.push("no results".to_string());
                return Ok(());
            }
            return Err(Halt::Error(anyhow!(
                "no result row matches {}",
                self.query.unit_key
            )));
        }

        for row in rows {
            match self.process_row(&row).await {
                Ok(()) => {}
                Err(Halt::Error(e)) => {
                    warn!(
                        run_id = self.run_id,
                        source = self.source(),
                        case_key = %row.case_key,
                        state = %self.state,
                        "Row failed: {e:#}"
                    );
                    self.counts.failed += 1;
                    self.notes.push(format!("{} failed at {}: {e:#}", row.case_key, self.state));
                }
                Err(halt) => return Err(halt),
            }
        }
        Ok(())
    }

    async fn search(&mut self, query: SearchQuery) -> Result<Vec<ResultRow>, Halt> {
        let step = self.machine.config.step_timeout;
        self.permit().await?;
        let submitted = bounded(step, self.session.submit_search(&query)).await;
        let page = self.settle(submitted).await?;
        self.gate(GatePoint::Entry, &page).await?;
        self.enter(AutomationState::SearchSubmitted);

        let html = bounded(step, self.session.html()).await?;
        let unit_key = self.query.unit_key.clone();
        self.store_snapshot(&unit_key, "results", &html)?;
        Ok(bounded(step, self.session.result_rows()).await?)
    }

    /// Window sweeps take every distinct row. Unit runs take only the row whose
    /// case key matches the unit, so another case is never recorded under it.
    fn select_rows(&self, rows: Vec<ResultRow>) -> Vec<ResultRow> {
        let mut seen = HashSet::new();
        let mut rows: Vec<ResultRow> = rows
            .into_iter()
            .filter(|r| seen.insert(r.case_key.clone()))
            .collect();
        if self.query.is_window() {
            return rows;
        }
        let wanted = self.query.unit_key.trim();
        match rows.iter().position(|r| r.case_key.trim().eq_ignore_ascii_case(wanted)) {
            Some(i) => vec![rows.swap_remove(i)],
            None => {
                if !rows.is_empty() {
                    debug!(
                        run_id = self.run_id,
                        unit_key = wanted,
                        rows = rows.len(),
                        "No result row matches the unit"
                    );
                }
                Vec::new()
            }
        }
    }

    async fn process_row(&mut self, row: &ResultRow) -> Result<(), Halt> {
        let step = self.machine.config.step_timeout;
        let case_key = if self.query.is_window() {
            row.case_key.clone()
        } else {
            self.query.unit_key.clone()
        };

        self.permit().await?;
        let opened = bounded(step, self.session.open_detail(row)).await;
        let page = self.settle(opened).await?;
        self.gate(GatePoint::Detail, &page).await?;

        let mut row_counts = RunCounts::default();
        let mut evidence_ids = Vec::new();
        let mut harvest = Harvest::default();
        let mut links = Vec::new();

        let html = bounded(step, self.session.html()).await?;
        evidence_ids.push(self.store_snapshot(&case_key, "detail", &html)?);
        self.produce(&case_key, html.as_bytes(), &mut harvest);
        self.discover_links(&mut links).await?;
        self.enter(AutomationState::DetailCaptured);

        let tabs = bounded(step, self.session.tabs()).await?;
        for tab in tabs {
            match self.walk_tab(&case_key, &tab, &mut harvest, &mut links).await {
                Ok(id) => evidence_ids.push(id),
                Err(Halt::Error(e)) => {
                    warn!(run_id = self.run_id, tab = %tab, state = %self.state, "Tab failed: {e:#}");
                    row_counts.failed += 1;
                    self.notes.push(format!("{case_key} tab '{tab}': {e:#}"));
                }
                Err(halt) => return Err(halt),
            }
        }
        self.enter(AutomationState::TabsWalked);

        for link in links {
            match self.harvest_document(&case_key, &link).await {
                Ok(id) => {
                    evidence_ids.push(id);
                    row_counts.processed += 1;
                }
                Err(Halt::Error(e)) => {
                    warn!(
                        run_id = self.run_id,
                        document = %link.reference,
                        state = %self.state,
                        "Document download failed: {e:#}"
                    );
                    row_counts.failed += 1;
                    self.notes.push(format!("{case_key} document '{}': {e:#}", link.label));
                }
                Err(halt) => return Err(halt),
            }
        }
        self.enter(AutomationState::DocumentsHarvested);

        // Everything captured so far is evidence regardless of what the commit does.
        self.evidence_ids.extend(evidence_ids.iter().copied());
        self.counts.processed += row_counts.processed;
        self.counts.failed += row_counts.failed;

        let classification = match self.machine.classifier.classify(&harvest.fields) {
            Ok(c) => c,
            Err(e) => {
                warn!(run_id = self.run_id, case_key = %case_key, "Classification failed: {e:#}");
                self.notes.push(format!("{case_key} classification: {e:#}"));
                Classification::default()
            }
        };
        let row_status = match status_for(row_counts) {
            RunStatus::Failed => RunStatus::Partial,
            status => status,
        };
        let quality = harvest.quality();
        self.machine
            .commit
            .commit(&CommitRequest {
                run_id: self.run_id.to_string(),
                source: self.profile.id.clone(),
                unit_key: case_key,
                status: row_status,
                fields: harvest.fields,
                classification,
                quality,
                evidence_ids,
            })
            .await?;
        self.counts.processed += 1;
        self.enter(AutomationState::Committed);
        Ok(())
    }

    async fn walk_tab(
        &mut self,
        case_key: &str,
        tab: &str,
        harvest: &mut Harvest,
        links: &mut Vec<DocumentLink>,
    ) -> Result<i64, Halt> {
        let step = self.machine.config.step_timeout;
        self.permit().await?;
        let opened = bounded(step, self.session.open_tab(tab)).await;
        let page = self.settle(opened).await?;
        self.gate(GatePoint::Detail, &page).await?;

        let html = bounded(step, self.session.html()).await?;
        let kind = format!("tab-{}", tab.trim().to_lowercase().replace(char::is_whitespace, "-"));
        let id = self.store_snapshot(case_key, &kind, &html)?;
        self.produce(case_key, html.as_bytes(), harvest);
        self.discover_links(links).await?;
        Ok(id)
    }

    /// Queue links not seen earlier in this session.
    async fn discover_links(&mut self, links: &mut Vec<DocumentLink>) -> Result<(), Halt> {
        let found = bounded(self.machine.config.step_timeout, self.session.document_links()).await?;
        for link in found {
            if self.seen_documents.insert(link.reference.clone()) {
                links.push(link);
            } else {
                debug!(run_id = self.run_id, document = %link.reference, "Skipping duplicate document link");
            }
        }
        Ok(())
    }

    async fn harvest_document(&mut self, case_key: &str, link: &DocumentLink) -> Result<i64, Halt> {
        self.permit().await?;
        let result = bounded(self.machine.config.document_timeout, self.session.download(link)).await;
        let doc = match result {
            Ok(doc) => doc,
            Err(e) => {
                self.report(0, false).await?;
                return Err(Halt::Error(e));
            }
        };
        self.report(doc.status, false).await?;
        if !(200..400).contains(&doc.status) {
            return Err(Halt::Error(anyhow!("HTTP {}", doc.status)));
        }
        let outcome = self.machine.evidence.put_document(
            self.source(),
            case_key,
            &doc.family,
            &doc.filename,
            Some(self.run_id),
            &doc.bytes,
        )?;
        Ok(outcome.record().id)
    }

    fn store_snapshot(&mut self, unit_key: &str, kind: &str, html: &str) -> Result<i64, Halt> {
        let outcome = self.machine.evidence.put_snapshot(
            &self.profile.id,
            unit_key,
            kind,
            Some(self.run_id),
            html.as_bytes(),
        )?;
        let id = outcome.record().id;
        if kind == "results" {
            self.evidence_ids.push(id);
        }
        Ok(id)
    }

    fn produce(&mut self, case_key: &str, raw: &[u8], harvest: &mut Harvest) {
        let producer = self.machine.producers.for_source(&self.profile.id);
        match producer.produce(&self.profile.id, case_key, raw) {
            Ok(production) => harvest.absorb(production),
            Err(e) => {
                warn!(run_id = self.run_id, case_key, state = %self.state, "Record producer failed: {e:#}");
                self.notes.push(format!("{case_key} producer: {e:#}"));
            }
        }
    }

    async fn permit(&mut self) -> Result<(), Halt> {
        match self.machine.governor.admit(&self.profile.id).await? {
            Admission::Granted => Ok(()),
            Admission::Denied(reason) => Err(Halt::Denied(reason)),
        }
    }

    async fn report(&mut self, status: u16, captcha: bool) -> Result<(), Halt> {
        self.machine
            .governor
            .report_result(&self.profile.id, status, captcha)
            .await?;
        Ok(())
    }

    /// Report a step's outcome to the governor and unwrap it.
    async fn settle(&mut self, result: anyhow::Result<PageStatus>) -> Result<PageStatus, Halt> {
        match result {
            Ok(page) => {
                self.report(page.status, page.captcha).await?;
                if !page.captcha && !(200..400).contains(&page.status) {
                    return Err(Halt::Error(anyhow!("HTTP {} at {}", page.status, page.url)));
                }
                Ok(page)
            }
            Err(e) => {
                self.report(0, false).await?;
                Err(Halt::Error(e))
            }
        }
    }

    /// Suspend on the human signal while a captcha is showing.
    async fn gate(&mut self, point: GatePoint, page: &PageStatus) -> Result<(), Halt> {
        if !page.captcha {
            return Ok(());
        }
        let resume = self.state;
        self.enter(AutomationState::CaptchaGate(point));
        let location = self.machine.signal.location(self.run_id);
        warn!(
            run_id = self.run_id,
            source = self.source(),
            url = %page.url,
            signal = %location,
            "Captcha interstitial; waiting for human"
        );

        let outcome = self
            .machine
            .signal
            .wait(self.run_id, self.machine.config.captcha_wait)
            .await?;
        match outcome {
            SignalOutcome::Resolved => {
                let still_there =
                    bounded(self.machine.config.step_timeout, self.session.captcha_present()).await?;
                if still_there {
                    self.notes.push("captcha still present after human signal".to_string());
                    return Err(Halt::Blocked(location));
                }
                self.machine.governor.clear_captcha(&self.profile.id).await?;
                info!(run_id = self.run_id, source = self.source(), "Captcha resolved; resuming");
                self.state = resume;
                Ok(())
            }
            SignalOutcome::Expired => Err(Halt::Blocked(location)),
        }
    }

    async fn conclude(mut self, result: Result<(), Halt>) -> RunOutcome {
        let mut signal_location = None;
        let status = match result {
            Ok(()) => {
                let status = status_for(self.counts);
                if status == RunStatus::Failed {
                    self.state = AutomationState::Failed;
                }
                status
            }
            Err(Halt::Denied(reason)) => {
                info!(run_id = self.run_id, state = %self.state, %reason, "Permit denied mid-run");
                self.notes.push(format!("permit denied: {reason}"));
                self.state = AutomationState::Failed;
                partial_or_failed(self.counts)
            }
            Err(Halt::Blocked(location)) => {
                warn!(run_id = self.run_id, state = %self.state, signal = %location, "Captcha wait expired");
                if let Err(e) = self
                    .machine
                    .commit
                    .record_block(self.run_id, &self.profile.id, &self.query.unit_key, &location)
                    .await
                {
                    error!(run_id = self.run_id, "Failed to record captcha block: {e}");
                    self.notes.push(format!("registry block not recorded: {e}"));
                }
                self.notes.push(format!("captcha blocked at {}", self.state));
                self.state = AutomationState::CaptchaBlocked;
                signal_location = Some(location);
                RunStatus::CaptchaBlocked
            }
            Err(Halt::Error(e)) => {
                error!(run_id = self.run_id, source = %self.profile.id, state = %self.state, "Automation failed: {e:#}");
                self.notes.push(format!("failed at {}: {e:#}", self.state));
                self.state = AutomationState::Failed;
                partial_or_failed(self.counts)
            }
        };

        RunOutcome {
            status,
            counts: self.counts,
            notes: self.notes,
            state: self.state,
            signal_location,
            evidence_ids: self.evidence_ids,
        }
    }
}

fn partial_or_failed(counts: RunCounts) -> RunStatus {
    if counts.processed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {}s", limit.as_secs())),
    }
}
