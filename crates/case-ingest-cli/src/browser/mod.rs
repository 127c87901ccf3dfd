//! Browser-backed portal sessions.
//!
//! Portal pages are driven through CSS selectors from each source's
//! `[source.portal]` table; the browser itself is launched on first use so
//! fetch-only invocations never need Chromium.

pub mod chromium;

use std::path::PathBuf;

pub use chromium::{ChromiumPortal, ChromiumSessions};

pub const CHROMIUM_ENV: &str = "CASE_INGEST_CHROMIUM";

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var(CHROMIUM_ENV) {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Family of a downloaded document, from its content type or filename.
pub fn document_family(content_type: Option<&str>, filename: &str) -> String {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("pdf") {
        return "pdf".into();
    }
    if content_type.contains("html") {
        return "html".into();
    }
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => ext.to_ascii_lowercase(),
        _ => "bin".into(),
    }
}

/// Filename for a download: `Content-Disposition`, else the URL's last segment, else the label.
pub fn document_filename(disposition: Option<&str>, reference: &str, label: &str) -> String {
    if let Some(name) = disposition.and_then(disposition_filename) {
        return name;
    }
    let tail = reference
        .split(&['?', '#'][..])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if !tail.is_empty() {
        return tail.to_string();
    }
    let label = label.trim();
    if label.is_empty() {
        "document".into()
    } else {
        label.to_string()
    }
}

fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}
