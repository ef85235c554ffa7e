//! Refetches the result list while any analysis is still running.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::ClientError;
use crate::models::skin_check::AnalysisResult;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Lenient decode of a result list: entries that do not parse are skipped,
/// anything other than an array is an empty list.
pub fn parse_results(value: Value) -> Vec<AnalysisResult> {
    let Value::Array(entries) = value else {
        if !value.is_null() {
            tracing::warn!("result list is not an array, treating as empty");
        }
        return Vec::new();
    };

    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<AnalysisResult>(entry) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed analysis result");
                None
            }
        })
        .collect()
}

pub fn needs_refetch(results: &[AnalysisResult]) -> bool {
    results.iter().any(|r| !r.status.is_terminal())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Every result reached a terminal state (or there were none).
    Settled(Vec<AnalysisResult>),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ResultPoller {
    interval: Duration,
    cancel: CancellationToken,
}

impl Default for ResultPoller {
    fn default() -> Self {
        Self::new(POLL_INTERVAL)
    }
}

impl ResultPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetches, reports, and sleeps `interval` before the next fetch for as
    /// long as something is pending or processing. A fetch error ends the
    /// loop. A fetch already in flight when cancellation arrives runs to
    /// completion and its result is dropped.
    pub async fn run<F, Fut, U>(&self, mut fetch: F, mut on_update: U) -> Result<PollOutcome, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ClientError>>,
        U: FnMut(&[AnalysisResult]),
    {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }

            let value = fetch().await;
            if self.cancel.is_cancelled() {
                return Ok(PollOutcome::Cancelled);
            }

            let results = parse_results(value?);
            on_update(&results);
            if !needs_refetch(&results) {
                tracing::debug!(count = results.len(), "all results settled, polling stopped");
                return Ok(PollOutcome::Settled(results));
            }

            let pending = results.iter().filter(|r| !r.status.is_terminal()).count();
            tracing::debug!(pending, interval_ms = self.interval.as_millis() as u64, "results still running");

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Runs the loop on its own task. Dropping the handle stops it.
    pub fn spawn<F, Fut, U>(self, fetch: F, on_update: U) -> PollHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ClientError>> + Send + 'static,
        U: FnMut(&[AnalysisResult]) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move { self.run(fetch, on_update).await });
        PollHandle {
            cancel,
            task: Some(task),
        }
    }
}

pub struct PollHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<PollOutcome, ClientError>>>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the loop to end on its own.
    pub async fn join(mut self) -> Result<PollOutcome, ClientError> {
        let Some(task) = self.task.take() else {
            return Ok(PollOutcome::Cancelled);
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Ok(PollOutcome::Cancelled),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
