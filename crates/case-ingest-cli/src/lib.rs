//! case-ingest command line — Chromium portal sessions, HTTP fetching, and
//! sentinel-file captcha hand-off around the ingestion core.

pub mod app;
pub mod browser;
pub mod config;
pub mod http;
pub mod producers;
pub mod signal;

pub use app::{open_core, orchestrator, source_overview, Settings, SourceOverview};
pub use browser::{ChromiumPortal, ChromiumSessions};
pub use config::{resolve_home, resolve_sources};
pub use http::HttpFetcher;
pub use producers::{HtmlSummaryProducer, UngradedClassifier};
pub use signal::SentinelSignal;
