//! HTTP fetcher for fetch-driver sources.
//!
//! One GET per call. Retries are the governor's business, so a 5xx or 429 is
//! returned as-is and fed back into the source's success window.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};

use case_ingest::{FetchResponse, Fetcher, SourceProfile};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str, profile: &SourceProfile) -> Result<FetchResponse> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("reading body of {url} failed"))?
            .to_vec();

        let captcha = profile
            .portal
            .captcha_marker
            .as_deref()
            .map(|marker| has_marker(&body, marker))
            .unwrap_or(false);

        Ok(FetchResponse {
            final_url,
            status,
            body,
            captcha,
        })
    }
}

/// Whether an HTML body contains an element matching `marker`.
/// An unparsable selector never matches.
pub fn has_marker(body: &[u8], marker: &str) -> bool {
    let Ok(selector) = Selector::parse(marker) else {
        tracing::warn!(marker, "Invalid captcha marker selector");
        return false;
    };
    let html = Html::parse_document(&String::from_utf8_lossy(body));
    let found = html.select(&selector).next().is_some();
    found
}
