//! Bounded polling for long-running editor work.
//!
//! A graph run outlives any RPC timeout, so its completion is polled
//! instead. Running out of attempts is not a failure: the run may still
//! finish remotely, so the caller gets [`PollOutcome::Exhausted`] and
//! reports the result as unknown.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before each attempt.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    /// Every attempt came back not ready.
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Calls `probe` until it yields a value, attempts run out, or `cancel`
/// fires. Probe errors count as "not ready" and are logged.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            () = cancel.cancelled() => return PollOutcome::Cancelled,
            () = tokio::time::sleep(policy.interval) => {}
        }

        match probe(attempt).await {
            Ok(Some(value)) => return PollOutcome::Ready(value),
            Ok(None) => debug!(attempt, "poll: not ready"),
            Err(err) => warn!(attempt, error = format!("{err:#}"), "poll attempt failed"),
        }
    }
    PollOutcome::Exhausted {
        attempts: policy.max_attempts,
    }
}

/// Reads run results from `GET {base}/history/{prompt_id}`.
#[derive(Debug, Clone)]
pub struct HistoryProbe {
    client: reqwest::Client,
    base: Url,
}

impl HistoryProbe {
    pub fn new(client: reqwest::Client, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Returns the run's history entry once it exists.
    ///
    /// # Errors
    /// Returns an error on transport failures, non-success status, or a
    /// non-JSON body.
    pub async fn fetch(&self, prompt_id: &str) -> Result<Option<Value>> {
        let url = self
            .base
            .join(&format!("history/{prompt_id}"))
            .with_context(|| format!("Invalid prompt id: {prompt_id}"))?;
        let body: Value = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("Status request failed: {url}"))?
            .json()
            .await
            .context("Failed to decode status response")?;
        Ok(body.get(prompt_id).cloned())
    }
}
