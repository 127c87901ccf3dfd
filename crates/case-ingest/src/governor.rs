//! Admission control for scarce external sources.
//!
//! The governor keeps one [`AdmissionState`] row per source in the
//! `admission_state` table. Every mutation re-reads and rewrites that row inside
//! one immediate transaction, so separate processes share counters. Grants are
//! paced with random jitter, capped by a daily quota, suspended during captcha
//! cooldown, and halved (AIMD style) when the rolling success rate drops below
//! the source's backpressure threshold. Throttled sources recover their baseline
//! rate at the next UTC day.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::sources::{SourceProfile, SourceRegistry};
use crate::store::{decode_opt_ts, encode_ts, Database};
use crate::types::IngestResult;

/// Mutable admission bookkeeping for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionState {
    pub source: String,
    /// UTC day the counters belong to.
    pub day: NaiveDate,
    pub requests_today: u32,
    /// Current rate; may sit below the configured rpm after back-off.
    pub effective_rpm: u32,
    pub last_captcha_at: Option<DateTime<Utc>>,
    /// Most recent outcomes, oldest first. `true` is a success.
    pub outcomes: VecDeque<bool>,
}

impl AdmissionState {
    fn fresh(profile: &SourceProfile, day: NaiveDate) -> Self {
        Self {
            source: profile.id.clone(),
            day,
            requests_today: 0,
            effective_rpm: profile.rpm,
            last_captcha_at: None,
            outcomes: VecDeque::new(),
        }
    }

    /// Reset daily counters and restore the baseline rate. Returns whether anything changed.
    fn roll_to(&mut self, today: NaiveDate, profile: &SourceProfile) -> bool {
        if self.day == today {
            return false;
        }
        info!(
            source = %self.source,
            from = %self.day,
            to = %today,
            restored_rpm = profile.rpm,
            "Admission day rollover"
        );
        self.day = today;
        self.requests_today = 0;
        self.effective_rpm = profile.rpm;
        self.outcomes.clear();
        true
    }

    /// Share of successes in the outcome window, `None` while empty.
    pub fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|o| **o).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }
}

/// Why a permit was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    Disabled,
    QuotaExhausted { quota: u32 },
    CaptchaCooldown { until: DateTime<Utc> },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Disabled => write!(f, "source disabled"),
            DenyReason::QuotaExhausted { quota } => write!(f, "daily quota of {quota} exhausted"),
            DenyReason::CaptchaCooldown { until } => {
                write!(f, "captcha cooldown until {}", until.to_rfc3339())
            }
        }
    }
}

/// Outcome of an admission request. Denial is ordinary control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Serializes grants for one source within this process, so jitter spaces them out.
type Slot = Arc<tokio::sync::Mutex<()>>;

/// Issues permits per source and learns from reported outcomes.
pub struct Governor {
    sources: Arc<SourceRegistry>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot>>,
    jitter: bool,
}

impl Governor {
    pub fn new(sources: Arc<SourceRegistry>, db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sources,
            db,
            clock,
            slots: Mutex::new(HashMap::new()),
            jitter: true,
        }
    }

    /// Disable grant jitter. Grants still count against quota.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Ask for permission to perform one network operation against `source`.
    ///
    /// Fails only for an unknown source id or a storage error.
    pub async fn request_permit(&self, source: &str) -> IngestResult<bool> {
        Ok(self.admit(source).await?.is_granted())
    }

    /// Like [`Governor::request_permit`], but reports why a permit was denied.
    ///
    /// The decision and the counter update happen in one immediate transaction
    /// against the stored row, so processes sharing the database never grant
    /// past the quota between them.
    pub async fn admit(&self, source: &str) -> IngestResult<Admission> {
        let profile = self.sources.get(source)?;
        let slot = self.slot(source);
        let _spacing = slot.lock().await;
        let now = self.clock.now();

        let decision = self.db.with_tx(|tx| {
            let mut state = load(tx, profile, now)?;
            let mut dirty = state.roll_to(now.date_naive(), profile);

            let denial = if !profile.enabled {
                Some(DenyReason::Disabled)
            } else if state.requests_today >= profile.daily_quota {
                Some(DenyReason::QuotaExhausted {
                    quota: profile.daily_quota,
                })
            } else {
                match state.last_captcha_at {
                    Some(at) => {
                        let until = at + chrono::Duration::seconds(profile.captcha_cooldown_secs as i64);
                        if now < until {
                            Some(DenyReason::CaptchaCooldown { until })
                        } else {
                            info!(source, "Captcha cooldown elapsed");
                            state.last_captcha_at = None;
                            dirty = true;
                            None
                        }
                    }
                    None => None,
                }
            };

            if let Some(reason) = denial {
                if dirty {
                    persist(tx, &state, now)?;
                }
                return Ok(Err(reason));
            }

            if state.outcomes.len() >= profile.window_size {
                let rate = state.success_rate().unwrap_or(1.0);
                if rate < profile.backpressure_threshold {
                    let throttled = (state.effective_rpm / 2).max(profile.min_rpm);
                    warn!(
                        source,
                        success_rate = rate,
                        from_rpm = state.effective_rpm,
                        to_rpm = throttled,
                        "Backpressure: halving effective rate"
                    );
                    state.effective_rpm = throttled;
                    // One failure streak halves once; a fresh window has to fill before the next cut.
                    state.outcomes.clear();
                }
            }

            state.requests_today += 1;
            persist(tx, &state, now)?;
            Ok(Ok(state))
        })?;

        let state = match decision {
            Ok(state) => state,
            Err(reason) => {
                debug!(source, %reason, "Permit denied");
                return Ok(Admission::Denied(reason));
            }
        };

        if self.jitter {
            let ceiling = SourceProfile::jitter_ceiling(state.effective_rpm);
            let ceiling_ms = (ceiling.as_millis() as u64).max(1);
            let wait = Duration::from_millis(rand::thread_rng().gen_range(0..ceiling_ms));
            tokio::time::sleep(wait).await;
        }

        debug!(
            source,
            requests_today = state.requests_today,
            effective_rpm = state.effective_rpm,
            "Permit granted"
        );
        Ok(Admission::Granted)
    }

    /// Record the outcome of a permitted operation.
    ///
    /// Success means a 2xx/3xx status without a captcha interstitial. A captcha hit
    /// also starts the source's cooldown.
    pub async fn report_result(
        &self,
        source: &str,
        status_code: u16,
        captcha_hit: bool,
    ) -> IngestResult<()> {
        let profile = self.sources.get(source)?;
        let now = self.clock.now();
        let success = (200..400).contains(&status_code) && !captcha_hit;

        self.db.with_tx(|tx| {
            let mut state = load(tx, profile, now)?;
            state.roll_to(now.date_naive(), profile);
            state.outcomes.push_back(success);
            while state.outcomes.len() > profile.window_size {
                state.outcomes.pop_front();
            }
            if captcha_hit {
                warn!(source, status_code, "Captcha detected; starting cooldown");
                state.last_captcha_at = Some(now);
            }
            persist(tx, &state, now)
        })
    }

    /// Current admission state, as the next permit request would see it.
    pub async fn snapshot(&self, source: &str) -> IngestResult<AdmissionState> {
        let profile = self.sources.get(source)?;
        let now = self.clock.now();
        let row = self.db.with_conn(|conn| read_row(conn, &profile.id))?;
        let mut view = match row {
            Some(row) => row.into_state(profile)?,
            None => AdmissionState::fresh(profile, now.date_naive()),
        };
        view.roll_to(now.date_naive(), profile);
        Ok(view)
    }

    /// Lift the captcha cooldown after a human has cleared the interstitial.
    pub async fn clear_captcha(&self, source: &str) -> IngestResult<()> {
        let profile = self.sources.get(source)?;
        let now = self.clock.now();
        self.db.with_tx(|tx| {
            let mut state = load(tx, profile, now)?;
            if state.last_captcha_at.take().is_some() {
                info!(source, "Captcha cleared by human signal");
                persist(tx, &state, now)?;
            }
            Ok(())
        })
    }

    fn slot(&self, source: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(source.to_string()).or_default())
    }
}

/// An `admission_state` row as stored.
struct StoredRow {
    day: NaiveDate,
    requests_today: u32,
    effective_rpm: u32,
    last_captcha_at: Option<DateTime<Utc>>,
    outcomes: String,
}

impl StoredRow {
    fn into_state(self, profile: &SourceProfile) -> IngestResult<AdmissionState> {
        let outcomes: VecDeque<bool> = serde_json::from_str(&self.outcomes)?;
        Ok(AdmissionState {
            source: profile.id.clone(),
            day: self.day,
            requests_today: self.requests_today,
            // Config may have changed since the row was written.
            effective_rpm: self.effective_rpm.clamp(profile.min_rpm, profile.rpm),
            last_captcha_at: self.last_captcha_at,
            outcomes,
        })
    }
}

fn read_row(conn: &Connection, source: &str) -> rusqlite::Result<Option<StoredRow>> {
    conn.query_row(
        "SELECT day, requests_today, effective_rpm, last_captcha_at, outcomes
         FROM admission_state WHERE source_id = ?1",
        params![source],
        |row| {
            let day: String = row.get(0)?;
            let day = day.parse::<NaiveDate>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(StoredRow {
                day,
                requests_today: row.get(1)?,
                effective_rpm: row.get(2)?,
                last_captcha_at: decode_opt_ts(3, row.get(3)?)?,
                outcomes: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Current stored state, or a fresh one for a source never admitted before.
fn load(conn: &Connection, profile: &SourceProfile, now: DateTime<Utc>) -> IngestResult<AdmissionState> {
    match read_row(conn, &profile.id)? {
        Some(row) => row.into_state(profile),
        None => Ok(AdmissionState::fresh(profile, now.date_naive())),
    }
}

fn persist(conn: &Connection, state: &AdmissionState, now: DateTime<Utc>) -> IngestResult<()> {
    let outcomes = serde_json::to_string(&state.outcomes)?;
    conn.execute(
        "INSERT INTO admission_state
            (source_id, day, requests_today, effective_rpm, last_captcha_at, outcomes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (source_id) DO UPDATE SET
            day = excluded.day,
            requests_today = excluded.requests_today,
            effective_rpm = excluded.effective_rpm,
            last_captcha_at = excluded.last_captcha_at,
            outcomes = excluded.outcomes,
            updated_at = excluded.updated_at",
        params![
            state.source,
            state.day.to_string(),
            state.requests_today,
            state.effective_rpm,
            state.last_captcha_at.map(encode_ts),
            outcomes,
            encode_ts(now),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::IngestError;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn governor_with(
        profiles: Vec<SourceProfile>,
        db: Arc<Database>,
        clock: Arc<ManualClock>,
    ) -> Governor {
        let registry = Arc::new(SourceRegistry::from_profiles(profiles).unwrap());
        Governor::new(registry, db, clock)
    }

    fn setup(profile: SourceProfile) -> (Governor, Arc<ManualClock>, Arc<Database>) {
        let clock = Arc::new(ManualClock::new(start()));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gov = governor_with(vec![profile], Arc::clone(&db), Arc::clone(&clock));
        (gov, clock, db)
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_denies_until_rollover() {
        let (gov, clock, _db) = setup(SourceProfile::new("alpha", 2, 3));

        for _ in 0..3 {
            assert!(gov.request_permit("alpha").await.unwrap());
        }
        assert_eq!(
            gov.admit("alpha").await.unwrap(),
            Admission::Denied(DenyReason::QuotaExhausted { quota: 3 })
        );

        clock.advance(chrono::Duration::hours(15));
        assert!(gov.request_permit("alpha").await.unwrap());
        assert_eq!(gov.snapshot("alpha").await.unwrap().requests_today, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_captcha_cooldown_blocks_then_clears() {
        let mut profile = SourceProfile::new("alpha", 10, 100);
        profile.captcha_cooldown_secs = 600;
        let (gov, clock, _db) = setup(profile);

        gov.report_result("alpha", 200, true).await.unwrap();
        assert!(!gov.request_permit("alpha").await.unwrap());

        clock.advance(chrono::Duration::seconds(599));
        assert!(!gov.request_permit("alpha").await.unwrap());

        clock.advance(chrono::Duration::seconds(1));
        assert!(gov.request_permit("alpha").await.unwrap());
        assert!(gov.snapshot("alpha").await.unwrap().last_captcha_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_human_clear_lifts_cooldown() {
        let (gov, _clock, _db) = setup(SourceProfile::new("alpha", 10, 100));
        gov.report_result("alpha", 200, true).await.unwrap();
        assert!(!gov.request_permit("alpha").await.unwrap());

        gov.clear_captcha("alpha").await.unwrap();
        assert!(gov.request_permit("alpha").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_halves_once_per_window() {
        let (gov, _clock, _db) = setup(SourceProfile::new("alpha", 40, 1000));

        for _ in 0..50 {
            gov.report_result("alpha", 500, false).await.unwrap();
        }
        assert!(gov.request_permit("alpha").await.unwrap());
        let state = gov.snapshot("alpha").await.unwrap();
        assert_eq!(state.effective_rpm, 20);
        assert!(state.outcomes.is_empty());

        // A second permit without new evidence does not cut again.
        assert!(gov.request_permit("alpha").await.unwrap());
        assert_eq!(gov.snapshot("alpha").await.unwrap().effective_rpm, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_rate_restored_at_next_utc_day() {
        let (gov, clock, _db) = setup(SourceProfile::new("alpha", 40, 1000));

        for _ in 0..50 {
            gov.report_result("alpha", 500, false).await.unwrap();
        }
        assert!(gov.request_permit("alpha").await.unwrap());
        assert_eq!(gov.snapshot("alpha").await.unwrap().effective_rpm, 20);

        clock.advance(chrono::Duration::days(1));
        assert!(gov.request_permit("alpha").await.unwrap());
        let state = gov.snapshot("alpha").await.unwrap();
        assert_eq!(state.effective_rpm, 40);
        assert_eq!(state.requests_today, 1);
        assert_eq!(state.day, start().date_naive().succ_opt().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_governors_sharing_a_file_share_the_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.db");
        let clock = Arc::new(ManualClock::new(start()));
        let profile = SourceProfile::new("alpha", 600, 5);

        // Separate connections, as two processes would hold.
        let a = governor_with(
            vec![profile.clone()],
            Arc::new(Database::open(&path).unwrap()),
            Arc::clone(&clock),
        );
        let b = governor_with(
            vec![profile],
            Arc::new(Database::open(&path).unwrap()),
            Arc::clone(&clock),
        );

        let mut granted = 0;
        for (gov, times) in [(&b, 1), (&a, 5), (&b, 5)] {
            for _ in 0..times {
                if gov.request_permit("alpha").await.unwrap() {
                    granted += 1;
                }
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(a.snapshot("alpha").await.unwrap().requests_today, 5);
        assert_eq!(b.snapshot("alpha").await.unwrap().requests_today, 5);

        // A captcha seen by one is honoured by the other.
        clock.advance(chrono::Duration::days(1));
        a.report_result("alpha", 200, true).await.unwrap();
        assert!(matches!(
            b.admit("alpha").await.unwrap(),
            Admission::Denied(DenyReason::CaptchaCooldown { .. })
        ));
        b.clear_captcha("alpha").await.unwrap();
        assert!(a.request_permit("alpha").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_floors_at_min_rpm() {
        let mut profile = SourceProfile::new("alpha", 4, 1000);
        profile.window_size = 2;
        profile.min_rpm = 2;
        let (gov, _clock, _db) = setup(profile);

        for _ in 0..3 {
            gov.report_result("alpha", 503, false).await.unwrap();
            gov.report_result("alpha", 503, false).await.unwrap();
            gov.request_permit("alpha").await.unwrap();
        }
        assert_eq!(gov.snapshot("alpha").await.unwrap().effective_rpm, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_window_keeps_rate() {
        let (gov, _clock, _db) = setup(SourceProfile::new("alpha", 40, 1000));
        for i in 0..50 {
            // 3xx counts as success; one in ten fails.
            let status = if i % 10 == 0 { 404 } else { 302 };
            gov.report_result("alpha", status, false).await.unwrap();
        }
        gov.request_permit("alpha").await.unwrap();
        assert_eq!(gov.snapshot("alpha").await.unwrap().effective_rpm, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart() {
        let clock = Arc::new(ManualClock::new(start()));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let profile = SourceProfile::new("alpha", 2, 2);

        let first = governor_with(vec![profile.clone()], Arc::clone(&db), Arc::clone(&clock));
        assert!(first.request_permit("alpha").await.unwrap());
        assert!(first.request_permit("alpha").await.unwrap());
        first.report_result("alpha", 200, false).await.unwrap();
        drop(first);

        let second = governor_with(vec![profile], db, clock);
        assert!(!second.request_permit("alpha").await.unwrap());
        let state = second.snapshot("alpha").await.unwrap();
        assert_eq!(state.requests_today, 2);
        assert_eq!(state.outcomes, VecDeque::from(vec![true]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_source_fails_loudly() {
        let (gov, _clock, _db) = setup(SourceProfile::new("alpha", 2, 2));
        assert!(matches!(
            gov.request_permit("omega").await,
            Err(IngestError::UnknownSource(_))
        ));
        assert!(gov.report_result("omega", 200, false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_source_is_denied() {
        let mut profile = SourceProfile::new("alpha", 2, 2);
        profile.enabled = false;
        let (gov, _clock, _db) = setup(profile);
        assert_eq!(
            gov.admit("alpha").await.unwrap(),
            Admission::Denied(DenyReason::Disabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_waits_within_jitter_ceiling() {
        let (gov, _clock, _db) = setup(SourceProfile::new("alpha", 2, 5));
        let before = tokio::time::Instant::now();
        gov.request_permit("alpha").await.unwrap();
        assert!(before.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_success_rate() {
        let mut state = AdmissionState::fresh(&SourceProfile::new("a", 1, 1), start().date_naive());
        assert_eq!(state.success_rate(), None);
        state.outcomes.extend([true, false, true, true]);
        assert_eq!(state.success_rate(), Some(0.75));
    }
}
