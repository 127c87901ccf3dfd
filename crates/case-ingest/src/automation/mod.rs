//! Case automation: drives one portal session through a fixed protocol.
//!
//! `Idle → CaptchaGate(entry) → PageLoaded → TermsAccepted → SearchSubmitted →
//! ResultsEvaluated → CaptchaGate(detail) → DetailCaptured → TabsWalked →
//! DocumentsHarvested → Committed`, with `CaptchaBlocked` and `Failed` as
//! alternate terminals.

pub mod captcha;
pub mod machine;
pub mod session;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{RunCounts, RunStatus};

pub use captcha::{ChannelSignal, HumanSignal, ResolvedSignal, SignalOutcome};
pub use machine::CaseAutomation;
pub use session::{
    window_key, DocumentLink, DownloadedDocument, NoBrowser, PageStatus, PortalSession,
    ResultRow, SearchQuery, SessionFactory,
};

const DEFAULT_CAPTCHA_WAIT: Duration = Duration::from_secs(20 * 60);
const DEFAULT_DOCUMENT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeouts for the suspension points of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationConfig {
    /// Bounded wait for a human to clear a captcha.
    pub captcha_wait: Duration,
    /// Per-document download budget, independent of the run.
    pub document_timeout: Duration,
    /// Per navigation or click.
    pub step_timeout: Duration,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            captcha_wait: DEFAULT_CAPTCHA_WAIT,
            document_timeout: DEFAULT_DOCUMENT_TIMEOUT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Where a captcha gate sits in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePoint {
    Entry,
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "gate", rename_all = "snake_case")]
pub enum AutomationState {
    Idle,
    CaptchaGate(GatePoint),
    PageLoaded,
    TermsAccepted,
    SearchSubmitted,
    ResultsEvaluated,
    DetailCaptured,
    TabsWalked,
    DocumentsHarvested,
    Committed,
    CaptchaBlocked,
    Failed,
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationState::Idle => f.write_str("Idle"),
            AutomationState::CaptchaGate(GatePoint::Entry) => f.write_str("CaptchaGate(entry)"),
            AutomationState::CaptchaGate(GatePoint::Detail) => f.write_str("CaptchaGate(detail)"),
            AutomationState::PageLoaded => f.write_str("PageLoaded"),
            AutomationState::TermsAccepted => f.write_str("TermsAccepted"),
            AutomationState::SearchSubmitted => f.write_str("SearchSubmitted"),
            AutomationState::ResultsEvaluated => f.write_str("ResultsEvaluated"),
            AutomationState::DetailCaptured => f.write_str("DetailCaptured"),
            AutomationState::TabsWalked => f.write_str("TabsWalked"),
            AutomationState::DocumentsHarvested => f.write_str("DocumentsHarvested"),
            AutomationState::Committed => f.write_str("Committed"),
            AutomationState::CaptchaBlocked => f.write_str("CaptchaBlocked"),
            AutomationState::Failed => f.write_str("Failed"),
        }
    }
}

/// Terminal result of driving one run, ready for the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub notes: Vec<String>,
    /// Final machine state; `CaptchaBlocked` or `Failed` on the alternate paths.
    pub state: AutomationState,
    pub signal_location: Option<String>,
    pub evidence_ids: Vec<i64>,
}

impl RunOutcome {
    pub(crate) fn failed(state: AutomationState, note: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            counts: RunCounts::default(),
            notes: vec![note.into()],
            state,
            signal_location: None,
            evidence_ids: Vec::new(),
        }
    }

    pub fn joined_notes(&self) -> Option<String> {
        if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.join("; "))
        }
    }
}

/// Status for a run that captured `processed` items and lost `failed`.
pub(crate) fn status_for(counts: RunCounts) -> RunStatus {
    match (counts.processed, counts.failed) {
        (_, 0) => RunStatus::Success,
        (0, _) => RunStatus::Failed,
        _ => RunStatus::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_counts() {
        let c = |processed, failed| RunCounts { processed, failed };
        assert_eq!(status_for(c(3, 0)), RunStatus::Success);
        assert_eq!(status_for(c(3, 1)), RunStatus::Partial);
        assert_eq!(status_for(c(0, 2)), RunStatus::Failed);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(
            AutomationState::CaptchaGate(GatePoint::Detail).to_string(),
            "CaptchaGate(detail)"
        );
        assert_eq!(AutomationState::TabsWalked.to_string(), "TabsWalked");
    }
}
