//! Run lifecycle, admission, and recovery through the orchestrator.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use case_ingest::automation::ChannelSignal;
use case_ingest::*;
use common::*;

// ─────────────────────── admission ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_sixth_submission_is_denied_by_quota() {
    let h = harness(vec![fetch_source("alpha", 2, 5)]).build();

    let mut summaries = Vec::new();
    for _ in 0..6 {
        summaries.push(h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap());
    }

    assert_eq!(h.fetcher.calls(), 5);
    let ids: HashSet<_> = summaries.iter().map(|s| s.run_id.clone()).collect();
    assert_eq!(ids.len(), 6);

    for summary in &summaries[..5] {
        assert_eq!(summary.status, RunStatus::Success);
    }
    let last = &summaries[5];
    assert_eq!(last.status, RunStatus::Failed);
    assert!(!last.exit_ok());
    assert!(last.notes.as_deref().unwrap().contains("permit denied"));

    let run = h.core().ledger.get(&last.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_submissions_respect_quota() {
    let h = Arc::new(harness(vec![fetch_source("alpha", 2, 5)]).build());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.orchestrator.run_unit("alpha", "CASE-001").await })
        })
        .collect();
    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap().unwrap().status);
    }

    assert_eq!(h.fetcher.calls(), 5);
    assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Success).count(), 5);
    assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Failed).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quota_recovers_next_day() {
    let h = harness(vec![fetch_source("alpha", 2, 1)]).build();
    assert_eq!(
        h.orchestrator.run_unit("alpha", "A").await.unwrap().status,
        RunStatus::Success
    );
    assert_eq!(
        h.orchestrator.run_unit("alpha", "B").await.unwrap().status,
        RunStatus::Failed
    );

    h.clock.advance(chrono::Duration::days(1));
    assert_eq!(
        h.orchestrator.run_unit("alpha", "B").await.unwrap().status,
        RunStatus::Success
    );
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_source_fails_loudly_without_a_run() {
    let h = harness(vec![fetch_source("alpha", 2, 5)]).build();
    let err = h.orchestrator.run_unit("nope", "CASE-001").await.unwrap_err();
    assert!(matches!(err, IngestError::UnknownSource(_)));
    assert!(h.core().ledger.list(&RunFilter::default()).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_source_run_is_denied() {
    let mut profile = fetch_source("alpha", 2, 5);
    profile.enabled = false;
    let h = harness(vec![profile]).build();

    let summary = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.notes.unwrap().contains("source disabled"));
    assert_eq!(h.fetcher.calls(), 0);
}

// ─────────────────────── fetch driver ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_fetch_commits_response_as_evidence() {
    let h = harness(vec![fetch_source("alpha", 60, 100)]).build();
    let summary = h.orchestrator.run_unit("alpha", "CASE 7/2026").await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.processed, 1);

    let evidence = h.core().evidence.list_for_unit("CASE 7/2026").unwrap();
    assert_eq!(evidence.len(), 1);
    let body = h.core().evidence.read_bytes(&evidence[0]).unwrap();
    assert!(String::from_utf8(body).unwrap().contains("CASE+7%2F2026"));

    let record = h.core().commit.derived_record("alpha", "CASE 7/2026").unwrap().unwrap();
    assert_eq!(record.evidence_ids, vec![evidence[0].id]);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_status_fails_run() {
    let h = harness(vec![fetch_source("alpha", 60, 100)])
        .fetcher(CountingFetcher {
            status: 503,
            ..CountingFetcher::ok()
        })
        .build();
    let summary = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.notes.unwrap().contains("HTTP 503"));

    let state = h.core().governor.snapshot("alpha").await.unwrap();
    assert_eq!(state.outcomes.back(), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_captcha_blocks_and_starts_cooldown() {
    let h = harness(vec![fetch_source("alpha", 60, 100)])
        .fetcher(CountingFetcher {
            captcha: true,
            ..CountingFetcher::ok()
        })
        .signal(Arc::new(ChannelSignal::new()))
        .build();

    let blocked = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();
    assert_eq!(blocked.status, RunStatus::CaptchaBlocked);
    assert!(blocked.signal_location.is_some());
    let entry = h.core().commit.registry_entry("alpha", "CASE-001").unwrap().unwrap();
    assert!(entry.blocked);

    // Cooldown denies the next run without touching the network.
    let next = h.orchestrator.run_unit("alpha", "CASE-002").await.unwrap();
    assert_eq!(next.status, RunStatus::Failed);
    assert!(next.notes.unwrap().contains("captcha cooldown"));
    assert_eq!(h.fetcher.calls(), 1);
}

// ─────────────────────── recovery ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_startup_reclaims_only_stale_runs() {
    let h = harness(vec![fetch_source("alpha", 60, 100)]).build();
    let orphan = h.core().ledger.start_run("alpha", "CASE-001").unwrap();
    h.clock.advance(chrono::Duration::hours(3));

    let summary = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);

    let orphan = h.core().ledger.get(&orphan).unwrap().unwrap();
    assert_eq!(orphan.status, RunStatus::FailedStale);
    let fresh = h.core().ledger.get(&summary.run_id).unwrap().unwrap();
    assert_eq!(fresh.status, RunStatus::Success);

    // Reclamation already ran for this orchestrator.
    assert_eq!(h.orchestrator.startup().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recent_running_rows_survive_startup() {
    let h = harness(vec![fetch_source("alpha", 60, 100)]).build();
    let live = h.core().ledger.start_run("alpha", "CASE-009").unwrap();
    h.clock.advance(chrono::Duration::minutes(30));

    assert!(h.orchestrator.startup().await.unwrap().is_empty());
    let live = h.core().ledger.get(&live).unwrap().unwrap();
    assert_eq!(live.status, RunStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_rerun_enriches_existing_record() {
    let h = harness(vec![fetch_source("alpha", 60, 100)]).build();
    let first = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();
    let second = h.orchestrator.run_unit("alpha", "CASE-001").await.unwrap();

    let record = h.core().commit.derived_record("alpha", "CASE-001").unwrap().unwrap();
    assert_eq!(record.origin_run_id, second.run_id);
    // Identical response bytes are stored once.
    assert_eq!(h.core().evidence.list_for_unit("CASE-001").unwrap().len(), 1);
    assert_eq!(h.core().commit.audit_entries(&first.run_id).unwrap().len(), 1);
    assert_eq!(h.core().commit.audit_entries(&second.run_id).unwrap().len(), 1);
}
