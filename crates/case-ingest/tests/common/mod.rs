//! Shared fixtures: a scripted portal, a counting fetcher, and an orchestrator harness.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use case_ingest::automation::{
    DocumentLink, DownloadedDocument, PageStatus, ResultRow, SearchQuery,
};
use case_ingest::producer::Production;
use case_ingest::*;

// ─────────────────────── scripted portal ───────────────────────

/// What the fake portal does. Every remote call is appended to the shared log.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub entry_captcha: bool,
    pub detail_captcha: bool,
    /// The captcha is still showing after the human signal resolves.
    pub captcha_persists: bool,
    pub terms: bool,
    pub filtered_rows: Vec<&'static str>,
    pub unfiltered_rows: Vec<&'static str>,
    pub tabs: Vec<&'static str>,
    /// Document names; every detail page and tab lists all of them.
    pub documents: Vec<&'static str>,
    pub failing_documents: HashSet<&'static str>,
    pub hanging_documents: HashSet<&'static str>,
    pub fail_search: bool,
}

impl Script {
    /// A well-behaved portal with one matching row, two tabs, and two documents.
    pub fn happy(unit: &'static str) -> Self {
        Self {
            terms: true,
            filtered_rows: vec![unit],
            unfiltered_rows: vec![unit],
            tabs: vec!["Parties", "Movements"],
            documents: vec!["petition.pdf", "ruling.pdf"],
            ..Self::default()
        }
    }
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct ScriptedSession {
    script: Script,
    log: CallLog,
    page: String,
    case: Option<String>,
    captcha_pending: bool,
    detail_gate_armed: bool,
}

impl ScriptedSession {
    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }

    fn page(&mut self, page: String) -> PageStatus {
        self.page = page.clone();
        PageStatus::ok(format!("https://portal.example/{page}"))
    }

    fn with_captcha(mut status: PageStatus, captcha: bool) -> PageStatus {
        status.captcha = captcha;
        status
    }
}

#[async_trait]
impl PortalSession for ScriptedSession {
    async fn open(&mut self) -> Result<PageStatus> {
        self.record("open".into());
        let status = self.page("entry".into());
        self.captcha_pending = self.script.entry_captcha;
        Ok(Self::with_captcha(status, self.script.entry_captcha))
    }

    async fn captcha_present(&mut self) -> Result<bool> {
        Ok(self.captcha_pending && self.script.captcha_persists)
    }

    async fn has_terms(&mut self) -> Result<bool> {
        Ok(self.script.terms)
    }

    async fn accept_terms(&mut self) -> Result<PageStatus> {
        self.record("terms".into());
        Ok(self.page("terms-accepted".into()))
    }

    async fn submit_search(&mut self, query: &SearchQuery) -> Result<PageStatus> {
        let mode = if query.filtered { "filtered" } else { "all" };
        self.record(format!("search:{mode}"));
        if self.script.fail_search {
            bail!("search form did not render");
        }
        Ok(self.page(format!("results-{mode}")))
    }

    async fn result_rows(&mut self) -> Result<Vec<ResultRow>> {
        let rows = if self.page == "results-filtered" {
            &self.script.filtered_rows
        } else {
            &self.script.unfiltered_rows
        };
        Ok(rows
            .iter()
            .map(|key| ResultRow {
                case_key: key.to_string(),
                href: format!("https://portal.example/case/{key}"),
            })
            .collect())
    }

    async fn open_detail(&mut self, row: &ResultRow) -> Result<PageStatus> {
        self.record(format!("detail:{}", row.case_key));
        self.case = Some(row.case_key.clone());
        let status = self.page(format!("detail-{}", row.case_key));
        let captcha = self.script.detail_captcha && !self.detail_gate_armed;
        self.detail_gate_armed = true;
        self.captcha_pending = captcha;
        Ok(Self::with_captcha(status, captcha))
    }

    async fn tabs(&mut self) -> Result<Vec<String>> {
        Ok(self.script.tabs.iter().map(|t| t.to_string()).collect())
    }

    async fn open_tab(&mut self, label: &str) -> Result<PageStatus> {
        self.record(format!("tab:{label}"));
        let case = self.case.clone().unwrap_or_default();
        Ok(self.page(format!("tab-{case}-{label}")))
    }

    async fn document_links(&mut self) -> Result<Vec<DocumentLink>> {
        let case = self.case.clone().unwrap_or_default();
        Ok(self
            .script
            .documents
            .iter()
            .map(|name| DocumentLink {
                reference: format!("https://portal.example/doc/{case}/{name}"),
                label: name.to_string(),
            })
            .collect())
    }

    async fn download(&mut self, link: &DocumentLink) -> Result<DownloadedDocument> {
        self.record(format!("download:{}", link.label));
        let name = link.label.as_str();
        if self.script.hanging_documents.contains(name) {
            return std::future::pending::<Result<DownloadedDocument>>().await;
        }
        if self.script.failing_documents.contains(name) {
            bail!("connection reset while downloading {name}");
        }
        Ok(DownloadedDocument {
            filename: name.to_string(),
            family: "pdf".into(),
            status: 200,
            bytes: format!("%PDF-1.4 {}", link.reference).into_bytes(),
        })
    }

    async fn html(&mut self) -> Result<String> {
        let case = self.case.clone().unwrap_or_default();
        Ok(format!(
            "<html><body data-page=\"{}\" data-case=\"{case}\"></body></html>",
            self.page
        ))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.record("close".into());
        Ok(())
    }
}

pub struct ScriptedFactory {
    pub script: Script,
    pub log: CallLog,
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open_session(&self, _profile: &SourceProfile) -> Result<Box<dyn PortalSession>> {
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            log: Arc::clone(&self.log),
            page: String::new(),
            case: None,
            captcha_pending: false,
            detail_gate_armed: false,
        }))
    }
}

// ─────────────────────── fetch + collaborators ───────────────────────

pub struct CountingFetcher {
    pub calls: AtomicUsize,
    pub status: u16,
    pub captcha: bool,
}

impl CountingFetcher {
    pub fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            status: 200,
            captcha: false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn get(&self, url: &str, _profile: &SourceProfile) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchResponse {
            final_url: url.to_string(),
            status: self.status,
            body: format!("<html><body data-case=\"{url}\"></body></html>").into_bytes(),
            captcha: self.captcha,
        })
    }
}

/// Pulls `data-case` out of the page so commits carry a recognizable field.
pub struct CaseAttrProducer;

impl RecordProducer for CaseAttrProducer {
    fn produce(&self, _source: &str, _unit_key: &str, raw: &[u8]) -> Result<Production> {
        let html = String::from_utf8_lossy(raw);
        let case = html
            .split("data-case=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap_or_default();
        let mut fields = FieldSet::new();
        fields.insert("case".into(), json!(case));
        fields.insert("bytes".into(), json!(raw.len()));
        Ok(Production {
            field_sets: vec![fields],
            quality: 0.9,
        })
    }
}

pub struct GradeA;

impl Classifier for GradeA {
    fn classify(&self, _fields: &FieldSet) -> Result<Classification> {
        Ok(Classification {
            grade: Some("A".into()),
            workflow_class: Some("monitor".into()),
        })
    }
}

// ─────────────────────── harness ───────────────────────

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
}

pub fn portal(id: &str, rpm: u32, quota: u32) -> SourceProfile {
    let mut profile = SourceProfile::new(id, rpm, quota);
    profile.entry_url = Some(format!("https://{id}.example/search"));
    profile
}

pub fn fetch_source(id: &str, rpm: u32, quota: u32) -> SourceProfile {
    let mut profile = SourceProfile::new(id, rpm, quota);
    profile.driver = DriverKind::Fetch;
    profile.url_template = Some(format!("https://{id}.example/cases/{{unit}}"));
    profile
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub log: CallLog,
    pub fetcher: Arc<CountingFetcher>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn core(&self) -> &IngestCore {
        self.orchestrator.core()
    }
}

pub struct HarnessBuilder {
    profiles: Vec<SourceProfile>,
    script: Script,
    signal: Arc<dyn HumanSignal>,
    fetcher: CountingFetcher,
    config: AutomationConfig,
}

pub fn harness(profiles: Vec<SourceProfile>) -> HarnessBuilder {
    HarnessBuilder {
        profiles,
        script: Script::default(),
        signal: Arc::new(case_ingest::automation::ResolvedSignal),
        fetcher: CountingFetcher::ok(),
        config: AutomationConfig::default(),
    }
}

impl HarnessBuilder {
    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    pub fn signal(mut self, signal: Arc<dyn HumanSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn fetcher(mut self, fetcher: CountingFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn document_timeout(mut self, timeout: Duration) -> Self {
        self.config.document_timeout = timeout;
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let registry = SourceRegistry::from_profiles(self.profiles).unwrap();
        let core = IngestCore::open(dir.path(), registry, clock.clone()).unwrap();

        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let fetcher = Arc::new(self.fetcher);
        let collaborators = Collaborators {
            sessions: Arc::new(ScriptedFactory {
                script: self.script,
                log: Arc::clone(&log),
            }),
            fetcher: fetcher.clone(),
            producers: ProducerSet::new(Arc::new(CaseAttrProducer)),
            classifier: Arc::new(GradeA),
            signal: self.signal,
        };
        let orchestrator = Orchestrator::new(core, collaborators, self.config);
        Harness {
            dir,
            clock,
            log,
            fetcher,
            orchestrator,
        }
    }
}
