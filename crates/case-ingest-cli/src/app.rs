//! Wiring of the core orchestrator to the command line's collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use case_ingest::{
    AdmissionState, AutomationConfig, Collaborators, IngestCore, Orchestrator, ProducerSet,
    SourceProfile, SourceRegistry, SystemClock, DEFAULT_LIVENESS,
};

use crate::browser::ChromiumSessions;
use crate::config::captcha_dir;
use crate::http::HttpFetcher;
use crate::producers::{HtmlSummaryProducer, UngradedClassifier};
use crate::signal::SentinelSignal;

/// Everything resolved from flags and environment before the core is opened.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub sources: PathBuf,
    pub headful: bool,
    pub automation: AutomationConfig,
    pub liveness: Duration,
}

impl Settings {
    pub fn new(home: PathBuf, sources: PathBuf) -> Self {
        Self {
            home,
            sources,
            headful: false,
            automation: AutomationConfig::default(),
            liveness: DEFAULT_LIVENESS,
        }
    }
}

/// Open the data directory and the storage-backed services.
pub fn open_core(settings: &Settings) -> Result<IngestCore> {
    let registry = SourceRegistry::load(&settings.sources)?;
    std::fs::create_dir_all(&settings.home)
        .with_context(|| format!("cannot create data directory {}", settings.home.display()))?;
    let core = IngestCore::open(&settings.home, registry, Arc::new(SystemClock))?;
    Ok(core)
}

/// Build an orchestrator backed by Chromium, reqwest, and sentinel files.
pub fn orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let core = open_core(settings)?;
    let collaborators = Collaborators {
        sessions: Arc::new(ChromiumSessions::new(settings.headful)),
        fetcher: Arc::new(HttpFetcher::new(settings.automation.step_timeout)),
        producers: ProducerSet::new(Arc::new(HtmlSummaryProducer)),
        classifier: Arc::new(UngradedClassifier),
        signal: Arc::new(SentinelSignal::new(captcha_dir(&settings.home))),
    };
    Ok(Orchestrator::new(core, collaborators, settings.automation).with_liveness(settings.liveness))
}

/// One line of the `sources` listing.
#[derive(Debug, Serialize)]
pub struct SourceOverview {
    #[serde(flatten)]
    pub profile: SourceProfile,
    pub admission: AdmissionState,
}

pub async fn source_overview(core: &IngestCore) -> Result<Vec<SourceOverview>> {
    let mut out = Vec::with_capacity(core.sources.len());
    for profile in core.sources.iter() {
        out.push(SourceOverview {
            profile: profile.clone(),
            admission: core.governor.snapshot(&profile.id).await?,
        });
    }
    Ok(out)
}
