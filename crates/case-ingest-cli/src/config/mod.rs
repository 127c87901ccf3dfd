//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "CASE_INGEST_HOME";
pub const SOURCES_ENV: &str = "CASE_INGEST_SOURCES";

const DIR_NAME: &str = ".case-ingest";
const SOURCES_FILE: &str = "sources.toml";
const CAPTCHA_DIR: &str = "captcha";

/// Resolve the data directory: flag, then `CASE_INGEST_HOME`, then `./.case-ingest/`
/// if it exists, then `~/.case-ingest/`.
pub fn resolve_home(explicit: Option<&Path>) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_home_from(
        explicit,
        std::env::var_os(HOME_ENV).map(PathBuf::from),
        &cwd,
        dirs::home_dir(),
    )
}

fn resolve_home_from(
    explicit: Option<&Path>,
    env: Option<PathBuf>,
    cwd: &Path,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = env.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }
    let local = cwd.join(DIR_NAME);
    if local.is_dir() {
        return local;
    }
    match home {
        Some(home) => home.join(DIR_NAME),
        None => local,
    }
}

/// Resolve the sources file: flag, then `CASE_INGEST_SOURCES`, then `<home>/sources.toml`.
pub fn resolve_sources(explicit: Option<&Path>, home: &Path) -> PathBuf {
    resolve_sources_from(explicit, std::env::var_os(SOURCES_ENV).map(PathBuf::from), home)
}

fn resolve_sources_from(explicit: Option<&Path>, env: Option<PathBuf>, home: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = env.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }
    home.join(SOURCES_FILE)
}

/// Directory holding captcha sentinel files.
pub fn captcha_dir(home: &Path) -> PathBuf {
    home.join(CAPTCHA_DIR)
}
