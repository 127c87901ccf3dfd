//! Static per-source configuration.
//!
//! Profiles are loaded once from a TOML file with one `[[source]]` table per
//! external source and never mutated afterwards. Mutable admission state lives
//! in the governor, keyed by the same id.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{IngestError, IngestResult};

const DEFAULT_WINDOW_SIZE: usize = 50;
const DEFAULT_MIN_RPM: u32 = 1;
const DEFAULT_COOLDOWN_SECS: u64 = 30 * 60;
const DEFAULT_THRESHOLD: f64 = 0.8;

/// How units of work for a source are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Interactive browser session driven through the case automation protocol.
    #[default]
    Portal,
    /// A single GET of `url_template` per unit.
    Fetch,
}

/// CSS selectors that teach a browser session how to walk one portal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub captcha_marker: Option<String>,
    pub terms_button: Option<String>,
    pub search_input: Option<String>,
    pub search_submit: Option<String>,
    /// Checkbox or select that narrows the search; toggled off for the "show all" pass.
    pub search_filter: Option<String>,
    pub show_all: Option<String>,
    pub date_from_input: Option<String>,
    pub date_to_input: Option<String>,
    pub result_row: Option<String>,
    pub detail_link: Option<String>,
    pub tab: Option<String>,
    pub document_link: Option<String>,
}

/// Immutable configuration for one external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub id: String,
    /// Configured requests per minute; the governor may throttle below this.
    pub rpm: u32,
    pub daily_quota: u32,
    #[serde(default = "default_cooldown_secs")]
    pub captcha_cooldown_secs: u64,
    /// Minimum rolling success rate before back-off applies.
    #[serde(default = "default_threshold")]
    pub backpressure_threshold: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_min_rpm")]
    pub min_rpm: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default)]
    pub entry_url: Option<String>,
    /// Fetch target with `{unit}`, `{start}`, `{end}` placeholders.
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub portal: PortalSelectors,
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_min_rpm() -> u32 {
    DEFAULT_MIN_RPM
}

fn default_enabled() -> bool {
    true
}

impl SourceProfile {
    /// A profile with defaults for everything except the throughput budget.
    pub fn new(id: impl Into<String>, rpm: u32, daily_quota: u32) -> Self {
        Self {
            id: id.into(),
            rpm,
            daily_quota,
            captcha_cooldown_secs: DEFAULT_COOLDOWN_SECS,
            backpressure_threshold: DEFAULT_THRESHOLD,
            window_size: DEFAULT_WINDOW_SIZE,
            min_rpm: DEFAULT_MIN_RPM,
            enabled: true,
            driver: DriverKind::Portal,
            entry_url: None,
            url_template: None,
            portal: PortalSelectors::default(),
        }
    }

    pub fn captcha_cooldown(&self) -> Duration {
        Duration::from_secs(self.captcha_cooldown_secs)
    }

    /// Upper bound of the grant jitter at a given effective rate.
    pub fn jitter_ceiling(effective_rpm: u32) -> Duration {
        Duration::from_secs(60) / effective_rpm.max(1)
    }

    fn validate(&self) -> IngestResult<()> {
        let fail = |msg: &str| Err(IngestError::Config(format!("source '{}': {msg}", self.id)));
        if self.id.trim().is_empty() {
            return Err(IngestError::Config("source id must not be empty".into()));
        }
        if self.rpm == 0 {
            return fail("rpm must be at least 1");
        }
        if self.min_rpm == 0 || self.min_rpm > self.rpm {
            return fail("min_rpm must be between 1 and rpm");
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return fail("backpressure_threshold must be within [0, 1]");
        }
        if self.window_size == 0 {
            return fail("window_size must be at least 1");
        }
        if self.driver == DriverKind::Fetch && self.url_template.is_none() {
            return fail("fetch driver requires url_template");
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct SourcesFile {
    #[serde(default, rename = "source")]
    sources: Vec<SourceProfile>,
}

/// Lookup table of every configured source.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    profiles: BTreeMap<String, SourceProfile>,
}

impl SourceRegistry {
    /// Build a registry, validating each profile and rejecting duplicate ids.
    pub fn from_profiles(profiles: impl IntoIterator<Item = SourceProfile>) -> IngestResult<Self> {
        let mut map = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            if map.contains_key(&profile.id) {
                return Err(IngestError::Config(format!(
                    "duplicate source id: {}",
                    profile.id
                )));
            }
            map.insert(profile.id.clone(), profile);
        }
        Ok(Self { profiles: map })
    }

    pub fn from_toml_str(raw: &str) -> IngestResult<Self> {
        let file: SourcesFile =
            toml::from_str(raw).map_err(|e| IngestError::Config(format!("invalid sources file: {e}")))?;
        Self::from_profiles(file.sources)
    }

    pub fn load(path: &Path) -> IngestResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read sources file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Look up a profile. An unknown id is a configuration error.
    pub fn get(&self, id: &str) -> IngestResult<&SourceProfile> {
        self.profiles
            .get(id)
            .ok_or_else(|| IngestError::UnknownSource(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
