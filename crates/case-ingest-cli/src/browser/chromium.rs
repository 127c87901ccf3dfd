//! Chromium portal sessions using chromiumoxide.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use case_ingest::automation::{
    DocumentLink, DownloadedDocument, PageStatus, PortalSession, ResultRow, SearchQuery,
    SessionFactory,
};
use case_ingest::SourceProfile;

use super::{document_family, document_filename, find_chromium};

/// Post-click wait for any navigation the click triggered.
const CLICK_SETTLE: Duration = Duration::from_secs(10);

/// Opens one Chromium tab per run. The browser is launched on first use.
pub struct ChromiumSessions {
    headful: bool,
    browser: OnceCell<Browser>,
}

impl ChromiumSessions {
    pub fn new(headful: bool) -> Self {
        Self {
            headful,
            browser: OnceCell::new(),
        }
    }

    async fn browser(&self) -> Result<&Browser> {
        self.browser
            .get_or_try_init(|| async {
                let chrome_path = find_chromium().context(
                    "Chromium not found. Install Chrome/Chromium or set CASE_INGEST_CHROMIUM.",
                )?;

                let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
                builder = if self.headful {
                    builder.with_head()
                } else {
                    builder.arg("--headless=new")
                };
                let config = builder
                    .arg("--disable-gpu")
                    .arg("--no-sandbox")
                    .arg("--disable-dev-shm-usage")
                    .arg("--disable-extensions")
                    .build()
                    .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

                let (browser, mut handler) = Browser::launch(config)
                    .await
                    .context("failed to launch Chromium")?;

                tokio::spawn(async move {
                    while let Some(event) = handler.next().await {
                        let _ = event;
                    }
                });
                info!(headful = self.headful, "Chromium launched");
                Ok::<_, anyhow::Error>(browser)
            })
            .await
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessions {
    async fn open_session(&self, profile: &SourceProfile) -> Result<Box<dyn PortalSession>> {
        let page = self
            .browser()
            .await?
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        Ok(Box::new(ChromiumPortal {
            page,
            profile: profile.clone(),
        }))
    }
}

/// One Chromium tab walking one portal.
pub struct ChromiumPortal {
    page: Page,
    profile: SourceProfile,
}

#[derive(Deserialize)]
struct FetchedBlob {
    status: u16,
    content_type: Option<String>,
    disposition: Option<String>,
    body: String,
}

/// Quote a string as a JS literal.
fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn js_opt(s: Option<&str>) -> String {
    s.map(js_str).unwrap_or_else(|| "null".to_string())
}

impl ChromiumPortal {
    fn required<'a>(&self, name: &str, value: &'a Option<String>) -> Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| anyhow!("source '{}' has no portal.{name} selector", self.profile.id))
    }

    async fn eval<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow!("failed to convert JS result: {e:?}"))
    }

    async fn goto(&mut self, url: &str) -> Result<PageStatus> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        let _ = self.page.wait_for_navigation().await;
        self.status().await
    }

    async fn click(&mut self, selector: &str) -> Result<PageStatus> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
            js_str(selector)
        );
        if !self.eval::<bool>(&script).await? {
            bail!("element not found: {selector}");
        }
        let _ = tokio::time::timeout(CLICK_SETTLE, self.page.wait_for_navigation()).await;
        self.status().await
    }

    async fn status(&mut self) -> Result<PageStatus> {
        let url = self
            .page
            .url()
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        Ok(PageStatus {
            url,
            // chromiumoxide doesn't easily expose the document status
            status: 200,
            captcha: self.captcha_present().await?,
        })
    }
}

#[async_trait]
impl PortalSession for ChromiumPortal {
    async fn open(&mut self) -> Result<PageStatus> {
        let url = self
            .profile
            .entry_url
            .clone()
            .ok_or_else(|| anyhow!("source '{}' has no entry_url", self.profile.id))?;
        self.goto(&url).await
    }

    async fn captcha_present(&mut self) -> Result<bool> {
        let Some(marker) = self.profile.portal.captcha_marker.as_deref() else {
            return Ok(false);
        };
        self.eval(&format!("document.querySelector({}) !== null", js_str(marker)))
            .await
    }

    async fn has_terms(&mut self) -> Result<bool> {
        let Some(button) = self.profile.portal.terms_button.as_deref() else {
            return Ok(false);
        };
        self.eval(&format!(
            "(() => {{ const el = document.querySelector({}); return !!el && el.offsetParent !== null; }})()",
            js_str(button)
        ))
        .await
    }

    async fn accept_terms(&mut self) -> Result<PageStatus> {
        let button = self.required("terms_button", &self.profile.portal.terms_button)?.to_string();
        self.click(&button).await
    }

    async fn submit_search(&mut self, query: &SearchQuery) -> Result<PageStatus> {
        let portal = self.profile.portal.clone();
        let (unit, from, to) = match query.window {
            Some((start, end)) => (None, Some(start.to_string()), Some(end.to_string())),
            None => (Some(query.unit_key.clone()), None, None),
        };
        let fill = format!(
            "(() => {{
                const set = (sel, v) => {{
                    if (sel === null || v === null) return true;
                    const el = document.querySelector(sel);
                    if (!el) return false;
                    el.value = v;
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return true;
                }};
                const filter = {filter};
                if (filter !== null) {{
                    const el = document.querySelector(filter);
                    if (el) {{ el.checked = {filtered}; el.dispatchEvent(new Event('change', {{ bubbles: true }})); }}
                }}
                return set({input}, {unit}) && set({from_sel}, {from}) && set({to_sel}, {to});
            }})()",
            filter = js_opt(portal.search_filter.as_deref()),
            filtered = query.filtered,
            input = js_opt(portal.search_input.as_deref()),
            unit = js_opt(unit.as_deref()),
            from_sel = js_opt(portal.date_from_input.as_deref()),
            from = js_opt(from.as_deref()),
            to_sel = js_opt(portal.date_to_input.as_deref()),
            to = js_opt(to.as_deref()),
        );
        if !self.eval::<bool>(&fill).await? {
            bail!("search form inputs not found");
        }
        debug!(source = %self.profile.id, filtered = query.filtered, "Search form filled");

        match (query.filtered, portal.show_all.as_deref()) {
            (false, Some(show_all)) => self.click(show_all).await,
            _ => {
                let submit = self.required("search_submit", &portal.search_submit)?;
                self.click(submit).await
            }
        }
    }

    async fn result_rows(&mut self) -> Result<Vec<ResultRow>> {
        let row = self.required("result_row", &self.profile.portal.result_row)?;
        let script = format!(
            "Array.from(document.querySelectorAll({row}))
                .filter(r => r.offsetParent !== null)
                .map(r => {{
                    const a = {detail} ? r.querySelector({detail}) : r.querySelector('a');
                    if (!a || !a.href) return null;
                    return {{ case_key: (a.textContent || r.textContent || '').trim(), href: a.href }};
                }})
                .filter(x => x !== null)",
            row = js_str(row),
            detail = js_opt(self.profile.portal.detail_link.as_deref()),
        );
        self.eval(&script).await
    }

    async fn open_detail(&mut self, row: &ResultRow) -> Result<PageStatus> {
        self.goto(&row.href).await
    }

    async fn tabs(&mut self) -> Result<Vec<String>> {
        let Some(tab) = self.profile.portal.tab.as_deref() else {
            return Ok(Vec::new());
        };
        self.eval(&format!(
            "Array.from(document.querySelectorAll({})).map(t => (t.textContent || '').trim()).filter(t => t)",
            js_str(tab)
        ))
        .await
    }

    async fn open_tab(&mut self, label: &str) -> Result<PageStatus> {
        let tab = self.required("tab", &self.profile.portal.tab)?;
        let script = format!(
            "(() => {{
                const t = Array.from(document.querySelectorAll({})).find(t => (t.textContent || '').trim() === {});
                if (!t) return false;
                t.click();
                return true;
            }})()",
            js_str(tab),
            js_str(label)
        );
        if !self.eval::<bool>(&script).await? {
            bail!("tab not found: {label}");
        }
        let _ = tokio::time::timeout(CLICK_SETTLE, self.page.wait_for_navigation()).await;
        self.status().await
    }

    async fn document_links(&mut self) -> Result<Vec<DocumentLink>> {
        let Some(doc) = self.profile.portal.document_link.as_deref() else {
            return Ok(Vec::new());
        };
        self.eval(&format!(
            "Array.from(document.querySelectorAll({}))
                .filter(a => a.href)
                .map(a => ({{ reference: a.href, label: (a.textContent || '').trim() }}))",
            js_str(doc)
        ))
        .await
    }

    async fn download(&mut self, link: &DocumentLink) -> Result<DownloadedDocument> {
        // Fetch inside the page so the portal's cookies and session apply.
        let script = format!(
            "(async () => {{
                const r = await fetch({}, {{ credentials: 'include' }});
                const bytes = new Uint8Array(await r.arrayBuffer());
                let bin = '';
                for (let i = 0; i < bytes.length; i += 0x8000) {{
                    bin += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
                }}
                return {{
                    status: r.status,
                    content_type: r.headers.get('content-type'),
                    disposition: r.headers.get('content-disposition'),
                    body: btoa(bin),
                }};
            }})()",
            js_str(&link.reference)
        );
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow!("failed to build evaluate params: {e}"))?;
        let blob: FetchedBlob = self
            .page
            .evaluate_expression(params)
            .await
            .context("document fetch failed")?
            .into_value()
            .map_err(|e| anyhow!("failed to convert download result: {e:?}"))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(blob.body.as_bytes())
            .context("document body was not valid base64")?;
        let filename = document_filename(blob.disposition.as_deref(), &link.reference, &link.label);
        Ok(DownloadedDocument {
            family: document_family(blob.content_type.as_deref(), &filename),
            filename,
            status: blob.status,
            bytes,
        })
    }

    async fn html(&mut self) -> Result<String> {
        self.eval("document.documentElement.outerHTML").await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let _ = self.page.close().await;
        Ok(())
    }
}
