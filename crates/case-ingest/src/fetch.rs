//! Fetch driver: one permitted GET per run for sources without an interactive portal.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::automation::captcha::{HumanSignal, SignalOutcome};
use crate::automation::{AutomationConfig, AutomationState, RunOutcome, SearchQuery};
use crate::commit::{CommitCoordinator, CommitRequest};
use crate::evidence::EvidenceStore;
use crate::governor::{Admission, Governor};
use crate::producer::{Classifier, Harvest, ProducerSet};
use crate::sources::SourceProfile;
use crate::types::{Classification, IngestResult, RunCounts, RunStatus};

/// Response to a single GET.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub final_url: String,
    pub status: u16,
    pub body: Vec<u8>,
    /// The body is a captcha interstitial rather than content.
    pub captcha: bool,
}

/// Plain HTTP access for fetch-driver sources.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// One GET, no retries. `profile` supplies the captcha marker.
    async fn get(&self, url: &str, profile: &SourceProfile) -> Result<FetchResponse>;
}

/// Fill `{unit}`, `{start}`, `{end}` in a source's URL template.
pub fn fill_template(template: &str, query: &SearchQuery) -> String {
    let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    let (start, end) = match query.window {
        Some((start, end)) => (start.to_string(), end.to_string()),
        None => (String::new(), String::new()),
    };
    template
        .replace("{unit}", &encode(&query.unit_key))
        .replace("{start}", &start)
        .replace("{end}", &end)
}

pub struct FetchDriver {
    governor: Arc<Governor>,
    evidence: Arc<EvidenceStore>,
    commit: Arc<CommitCoordinator>,
    producers: ProducerSet,
    classifier: Arc<dyn Classifier>,
    signal: Arc<dyn HumanSignal>,
    fetcher: Arc<dyn Fetcher>,
    config: AutomationConfig,
}

impl FetchDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        governor: Arc<Governor>,
        evidence: Arc<EvidenceStore>,
        commit: Arc<CommitCoordinator>,
        producers: ProducerSet,
        classifier: Arc<dyn Classifier>,
        signal: Arc<dyn HumanSignal>,
        fetcher: Arc<dyn Fetcher>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            governor,
            evidence,
            commit,
            producers,
            classifier,
            signal,
            fetcher,
            config,
        }
    }

    /// Fetch, store, produce, and commit one unit. Never returns an error.
    pub async fn drive(&self, run_id: &str, profile: &SourceProfile, query: &SearchQuery) -> RunOutcome {
        let Some(template) = profile.url_template.as_deref() else {
            return RunOutcome::failed(AutomationState::Failed, "fetch source has no url_template");
        };
        let url = fill_template(template, query);

        let response = match self.fetch(run_id, profile, &url).await {
            Ok(Fetched::Page(response)) => response,
            Ok(Fetched::Denied(reason)) => {
                info!(run_id, source = %profile.id, %reason, "Permit denied");
                return RunOutcome::failed(AutomationState::Failed, format!("permit denied: {reason}"));
            }
            Ok(Fetched::Blocked(location)) => return self.blocked(run_id, profile, query, location).await,
            Err(e) => {
                error!(run_id, source = %profile.id, url = %url, "Fetch failed: {e:#}");
                return RunOutcome::failed(AutomationState::Failed, format!("fetch failed: {e:#}"));
            }
        };

        match self.store_and_commit(run_id, profile, query, &response).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id, source = %profile.id, "Commit failed: {e}");
                RunOutcome::failed(AutomationState::Failed, format!("commit failed: {e}"))
            }
        }
    }

    async fn fetch(&self, run_id: &str, profile: &SourceProfile, url: &str) -> Result<Fetched> {
        let mut resolved_once = false;
        loop {
            if let Admission::Denied(reason) = self.governor.admit(&profile.id).await? {
                return Ok(Fetched::Denied(reason.to_string()));
            }
            let result = tokio::time::timeout(self.config.step_timeout, self.fetcher.get(url, profile)).await;
            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    self.governor.report_result(&profile.id, 0, false).await?;
                    return Err(e);
                }
                Err(_) => {
                    self.governor.report_result(&profile.id, 0, false).await?;
                    anyhow::bail!("timed out after {}s", self.config.step_timeout.as_secs());
                }
            };
            self.governor
                .report_result(&profile.id, response.status, response.captcha)
                .await?;

            if !response.captcha {
                if !(200..400).contains(&response.status) {
                    anyhow::bail!("HTTP {} from {}", response.status, response.final_url);
                }
                return Ok(Fetched::Page(response));
            }

            let location = self.signal.location(run_id);
            if resolved_once {
                return Ok(Fetched::Blocked(location));
            }
            warn!(run_id, source = %profile.id, signal = %location, "Captcha interstitial; waiting for human");
            match self.signal.wait(run_id, self.config.captcha_wait).await? {
                SignalOutcome::Resolved => {
                    self.governor.clear_captcha(&profile.id).await?;
                    resolved_once = true;
                }
                SignalOutcome::Expired => return Ok(Fetched::Blocked(location)),
            }
        }
    }

    async fn store_and_commit(
        &self,
        run_id: &str,
        profile: &SourceProfile,
        query: &SearchQuery,
        response: &FetchResponse,
    ) -> IngestResult<RunOutcome> {
        let stored = self.evidence.put_snapshot(
            &profile.id,
            &query.unit_key,
            "response",
            Some(run_id),
            &response.body,
        )?;
        let evidence_id = stored.record().id;

        let mut notes = Vec::new();
        let mut harvest = Harvest::default();
        match self
            .producers
            .for_source(&profile.id)
            .produce(&profile.id, &query.unit_key, &response.body)
        {
            Ok(production) => harvest.absorb(production),
            Err(e) => {
                warn!(run_id, source = %profile.id, "Record producer failed: {e:#}");
                notes.push(format!("producer: {e:#}"));
            }
        }
        let classification = self.classifier.classify(&harvest.fields).unwrap_or_else(|e| {
            warn!(run_id, "Classification failed: {e:#}");
            notes.push(format!("classification: {e:#}"));
            Classification::default()
        });

        let quality = harvest.quality();
        self.commit
            .commit(&CommitRequest {
                run_id: run_id.to_string(),
                source: profile.id.clone(),
                unit_key: query.unit_key.clone(),
                status: RunStatus::Success,
                fields: harvest.fields,
                classification,
                quality,
                evidence_ids: vec![evidence_id],
            })
            .await?;

        Ok(RunOutcome {
            status: RunStatus::Success,
            counts: RunCounts {
                processed: 1,
                failed: 0,
            },
            notes,
            state: AutomationState::Committed,
            signal_location: None,
            evidence_ids: vec![evidence_id],
        })
    }

    async fn blocked(
        &self,
        run_id: &str,
        profile: &SourceProfile,
        query: &SearchQuery,
        location: String,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::failed(AutomationState::CaptchaBlocked, "captcha blocked at fetch");
        outcome.status = RunStatus::CaptchaBlocked;
        if let Err(e) = self
            .commit
            .record_block(run_id, &profile.id, &query.unit_key, &location)
            .await
        {
            error!(run_id, "Failed to record captcha block: {e}");
            outcome.notes.push(format!("registry block not recorded: {e}"));
        }
        outcome.signal_location = Some(location);
        outcome
    }
}

enum Fetched {
    Page(FetchResponse),
    Denied(String),
    Blocked(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_fill_template_encodes_unit() {
        let q = SearchQuery::unit("0001234-56.2024/SP");
        assert_eq!(
            fill_template("https://x.example/case?id={unit}", &q),
            "https://x.example/case?id=0001234-56.2024%2FSP"
        );

        let w = SearchQuery::window(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 7).unwrap(),
        );
        assert_eq!(
            fill_template("https://x.example/cases?from={start}&to={end}", &w),
            "https://x.example/cases?from=2026-01-01&to=2026-01-07"
        );
    }
}
