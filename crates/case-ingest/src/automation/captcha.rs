//! Human-in-the-loop signals for captcha interstitials.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Resolved,
    Expired,
}

/// Where a human is told to act, and how the machine waits for them.
#[async_trait]
pub trait HumanSignal: Send + Sync {
    /// Block until a human resolves the interstitial for `run_id`, or `timeout` elapses.
    async fn wait(&self, run_id: &str, timeout: Duration) -> Result<SignalOutcome>;
    /// Human-readable location of the pending signal, surfaced on blocked runs.
    fn location(&self, run_id: &str) -> String;
}

/// Always resolved. For tests and unattended sources that solve their own challenges.
pub struct ResolvedSignal;

#[async_trait]
impl HumanSignal for ResolvedSignal {
    async fn wait(&self, _run_id: &str, _timeout: Duration) -> Result<SignalOutcome> {
        Ok(SignalOutcome::Resolved)
    }

    fn location(&self, run_id: &str) -> String {
        format!("resolved:{run_id}")
    }
}

/// In-process signal resolved from another task via [`ChannelSignal::resolve`].
#[derive(Default)]
pub struct ChannelSignal {
    pending: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ChannelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `run_id`'s interstitial as solved, waking its waiter.
    pub fn resolve(&self, run_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .entry(run_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    fn receiver(&self, run_id: &str) -> watch::Receiver<bool> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .entry(run_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn forget(&self, run_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(run_id);
    }
}

#[async_trait]
impl HumanSignal for ChannelSignal {
    async fn wait(&self, run_id: &str, timeout: Duration) -> Result<SignalOutcome> {
        let mut rx = self.receiver(run_id);
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|solved| *solved)).await {
            Ok(Ok(_)) => SignalOutcome::Resolved,
            Ok(Err(_)) | Err(_) => SignalOutcome::Expired,
        };
        self.forget(run_id);
        Ok(outcome)
    }

    fn location(&self, run_id: &str) -> String {
        format!("channel:{run_id}")
    }
}
