//! Bounded retries with exponential backoff.
//!
//! Epistemic foundation:
//! - K_i: Fatal errors (validation, open circuits, cancellation) are never retried
//! - B_i: A retryable failure may clear up on a later attempt
//! - I^B: Transient failures persist → MaxRetriesExceeded wrapping the last cause

use super::BackoffStrategy;
use crate::models::{ErrorKind, ImportError, Result, RetryConfig};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Statistics for a single `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    /// Operation invocations, including the first
    pub attempts: u32,
    /// Waits performed between attempts
    pub retries: u32,
    /// Recorded backoff delays
    pub delays_ms: Vec<u64>,
    pub last_error: Option<String>,
}

/// Wraps an async operation with bounded retries.
#[derive(Debug)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    backoff: BackoffStrategy,
    /// None = every non-fatal kind is retryable
    retryable: Option<HashSet<ErrorKind>>,
    last_stats: Mutex<RetryStats>,
    total_retries: AtomicU64,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` below 1 is treated as 1.
    pub fn new(name: impl Into<String>, max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: None,
            last_stats: Mutex::new(RetryStats::default()),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &RetryConfig) -> Self {
        let policy = Self::new(name, config.max_attempts, BackoffStrategy::from_config(config));
        match &config.retryable_kinds {
            Some(kinds) => policy.with_retryable_kinds(kinds.iter().copied()),
            None => policy,
        }
    }

    /// Restrict retries to the given error kinds.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = Some(kinds.into_iter().collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `err` may be retried under this policy.
    pub fn is_retryable(&self, err: &ImportError) -> bool {
        if err.is_fatal() {
            return false;
        }
        self.retryable
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&err.kind()))
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None).await
    }

    /// Like [`execute`](Self::execute), but stops early once `cancel` fires.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(cancel)).await
    }

    /// Stats of the most recently finished call.
    pub fn last_stats(&self) -> RetryStats {
        self.last_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retries performed across all calls.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    async fn run<T, F, Fut>(&self, mut operation: F, cancel: Option<&CancellationToken>) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stats = RetryStats::default();
        let mut attempt = 0u32;

        let outcome = loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                break Err(ImportError::Cancelled);
            }

            stats.attempts += 1;
            let err = match operation().await {
                Ok(value) => break Ok(value),
                Err(err) => err,
            };
            stats.last_error = Some(err.to_string());

            if !self.is_retryable(&err) {
                debug!(policy = %self.name, error = %err, "Non-retryable failure");
                break Err(err);
            }

            if attempt + 1 >= self.max_attempts {
                warn!(
                    policy = %self.name,
                    attempts = stats.attempts,
                    error = %err,
                    "Retries exhausted"
                );
                break Err(ImportError::MaxRetriesExceeded {
                    name: self.name.clone(),
                    attempts: stats.attempts,
                    source: Box::new(err),
                });
            }

            let delay = self.backoff.delay(attempt);
            stats.retries += 1;
            stats.delays_ms.push(delay.as_millis() as u64);
            debug!(
                policy = %self.name,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => break Err(ImportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        };

        self.total_retries
            .fetch_add(u64::from(stats.retries), Ordering::Relaxed);
        *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
        outcome
    }
}
