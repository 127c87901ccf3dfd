//! File-based human signal.
//!
//! A blocked run drops `<dir>/<run_id>.pending`; an operator solves the
//! captcha in the visible browser and deletes the file. Deletion is picked up
//! through a filesystem watcher, with a slow poll as a fallback for
//! filesystems that don't deliver events.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use case_ingest::automation::{HumanSignal, SignalOutcome};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SentinelSignal {
    dir: PathBuf,
}

impl SentinelSignal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn sentinel_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.pending"))
    }

    fn watch(&self, tx: mpsc::UnboundedSender<PathBuf>) -> Option<RecommendedWatcher> {
        let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("Failed to create sentinel watcher, polling instead: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&self.dir, RecursiveMode::NonRecursive) {
            warn!("Failed to watch {}: {}", self.dir.display(), e);
            return None;
        }
        Some(watcher)
    }
}

async fn until_removed(path: &Path, mut events: mpsc::UnboundedReceiver<PathBuf>) {
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            Some(changed) = events.recv() => {
                if changed == path && !path.exists() {
                    return;
                }
            }
            _ = poll.tick() => {
                if !path.exists() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl HumanSignal for SentinelSignal {
    async fn wait(&self, run_id: &str, timeout: Duration) -> Result<SignalOutcome> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("cannot create {}", self.dir.display()))?;
        let path = self.sentinel_path(run_id);
        std::fs::write(
            &path,
            format!("Solve the captcha in the browser for run {run_id}, then delete this file.\n"),
        )
        .with_context(|| format!("cannot write {}", path.display()))?;
        info!(run_id, sentinel = %path.display(), "Waiting for a human to clear the captcha");

        let (tx, rx) = mpsc::unbounded_channel();
        // Dropping the watcher stops event delivery.
        let _watcher = self.watch(tx);

        match tokio::time::timeout(timeout, until_removed(&path, rx)).await {
            Ok(()) => Ok(SignalOutcome::Resolved),
            // The sentinel stays behind so the operator can see what was missed.
            Err(_) => Ok(SignalOutcome::Expired),
        }
    }

    fn location(&self, run_id: &str) -> String {
        self.sentinel_path(run_id).display().to_string()
    }
}
