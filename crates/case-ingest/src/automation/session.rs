//! Browser session abstraction driven by the case automation machine.
//!
//! A [`PortalSession`] is a single tab walking one portal; it is owned by one
//! run and never shared. Methods that navigate or click return a
//! [`PageStatus`] so the caller can report the outcome to the governor. Read
//! methods inspect the current DOM without touching the network.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::sources::SourceProfile;

/// Observable result of one remote interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatus {
    pub url: String,
    /// HTTP-like status; browsers that cannot see it report 200 on load.
    pub status: u16,
    /// A captcha interstitial is showing.
    pub captcha: bool,
}

impl PageStatus {
    pub fn ok(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            captcha: false,
        }
    }
}

/// What to search for on the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub unit_key: String,
    /// Inclusive date range for window sweeps.
    pub window: Option<(NaiveDate, NaiveDate)>,
    /// Whether the portal's narrowing filter is applied. The fallback pass clears it.
    pub filtered: bool,
}

impl SearchQuery {
    pub fn unit(unit_key: impl Into<String>) -> Self {
        Self {
            unit_key: unit_key.into(),
            window: None,
            filtered: true,
        }
    }

    pub fn window(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            unit_key: window_key(start, end),
            window: Some((start, end)),
            filtered: true,
        }
    }

    pub fn unfiltered(&self) -> Self {
        Self {
            filtered: false,
            ..self.clone()
        }
    }

    pub fn is_window(&self) -> bool {
        self.window.is_some()
    }
}

/// Unit key used for a date-window sweep.
pub fn window_key(start: NaiveDate, end: NaiveDate) -> String {
    format!("{start}..{end}")
}

/// One visible row on a results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Case identifier shown in the row.
    pub case_key: String,
    /// Link to the detail page.
    pub href: String,
}

/// A document reference discovered on a detail page or tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentLink {
    /// Stable reference; two links with the same reference are the same document.
    pub reference: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct DownloadedDocument {
    pub filename: String,
    /// `pdf`, `html`, ...
    pub family: String,
    pub status: u16,
    pub bytes: Vec<u8>,
}

/// A single portal session (one browser tab).
#[async_trait]
pub trait PortalSession: Send {
    /// Navigate to the portal entry page.
    async fn open(&mut self) -> Result<PageStatus>;
    /// Re-check the current page for a captcha interstitial.
    async fn captcha_present(&mut self) -> Result<bool>;
    /// Whether a terms/consent gate is showing.
    async fn has_terms(&mut self) -> Result<bool>;
    async fn accept_terms(&mut self) -> Result<PageStatus>;
    async fn submit_search(&mut self, query: &SearchQuery) -> Result<PageStatus>;
    async fn result_rows(&mut self) -> Result<Vec<ResultRow>>;
    async fn open_detail(&mut self, row: &ResultRow) -> Result<PageStatus>;
    /// Labels of the detail page's tabs.
    async fn tabs(&mut self) -> Result<Vec<String>>;
    async fn open_tab(&mut self, label: &str) -> Result<PageStatus>;
    async fn document_links(&mut self) -> Result<Vec<DocumentLink>>;
    async fn download(&mut self, link: &DocumentLink) -> Result<DownloadedDocument>;
    /// Full HTML of the current page.
    async fn html(&mut self) -> Result<String>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens portal sessions, one per run.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self, profile: &SourceProfile) -> Result<Box<dyn PortalSession>>;
}

/// A factory used when no browser is available. Portal runs fail; fetch runs still work.
pub struct NoBrowser;

#[async_trait]
impl SessionFactory for NoBrowser {
    async fn open_session(&self, profile: &SourceProfile) -> Result<Box<dyn PortalSession>> {
        Err(anyhow::anyhow!(
            "no browser available for portal source '{}'",
            profile.id
        ))
    }
}
