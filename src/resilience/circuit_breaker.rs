//! Circuit breaker for a single external dependency.
//!
//! Epistemic foundation:
//! - K_i: Closed → Open after `failure_threshold` consecutive qualifying failures
//! - K_i: Open rejects every call until `recovery_timeout` has elapsed since the last failure
//! - K_i: HalfOpen admits exactly one probe at a time
//! - B_i: A dependency that failed may have recovered → probe
//!
//! # State transitions
//! ```text
//! Closed   → Open:     failure tally reaches failure_threshold
//! Open     → HalfOpen: first acquisition after recovery_timeout
//! HalfOpen → Closed:   success_threshold consecutive probe successes
//! HalfOpen → Open:     any probe failure (timer restarts)
//! ```

use crate::models::{BreakerConfig, ImportError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast, calls are rejected
    Open,
    /// Testing recovery with a single probe
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of breaker statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Calls refused without being run
    pub rejected_requests: u64,
    pub opened_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Serializable view combining state and statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(flatten)]
    pub stats: CircuitBreakerStats,
}

/// Decides which errors count against the breaker.
pub type FailureFilter = fn(&ImportError) -> bool;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive-failure tally while Closed
    failure_count: u32,
    /// Consecutive probe successes while HalfOpen
    success_count: u32,
    probe_in_flight: bool,
    last_failure: Option<Instant>,
    stats: CircuitBreakerStats,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            probe_in_flight: false,
            last_failure: None,
            stats: CircuitBreakerStats::default(),
        }
    }
}

/// Thread-safe circuit breaker.
///
/// All mutable state lives behind one mutex. Admission and outcome recording
/// both happen under that mutex; the HalfOpen probe slot is reserved at
/// admission so concurrent callers cannot both win it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    failure_filter: Option<FailureFilter>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker; thresholds below 1 are treated as 1.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            failure_filter: None,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            config.recovery_timeout(),
            config.success_threshold,
        )
    }

    /// Only errors for which `filter` returns true count as failures.
    pub fn with_failure_filter(mut self, filter: FailureFilter) -> Self {
        self.failure_filter = Some(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call or reject it with `CircuitOpen`.
    ///
    /// The returned permit must be completed with the call's outcome; a permit
    /// dropped without completion records a failure.
    pub fn acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();
        let now = Instant::now();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.recovery_timeout, |t| now.duration_since(t));
                if elapsed < self.recovery_timeout {
                    inner.stats.rejected_requests += 1;
                    return Err(ImportError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: self.recovery_timeout - elapsed,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                info!(breaker = %self.name, "Circuit half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.stats.rejected_requests += 1;
                    return Err(ImportError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                true
            }
        };

        if probe {
            inner.probe_in_flight = true;
        }
        inner.stats.total_requests += 1;

        Ok(CallPermit {
            breaker: self,
            probe,
            completed: false,
        })
    }

    /// Run `operation` under the breaker.
    pub async fn call<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let outcome = operation.await;
        permit.complete(&outcome);
        outcome
    }

    /// Run a blocking `operation` under the breaker.
    pub fn call_blocking<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let permit = self.acquire()?;
        let outcome = operation();
        permit.complete(&outcome);
        outcome
    }

    /// Current state (read-only; never transitions).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.lock().stats.clone()
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            stats: inner.stats.clone(),
        }
    }

    /// Force Closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::new();
        info!(breaker = %self.name, "Circuit reset");
    }

    fn qualifies(&self, err: &ImportError) -> bool {
        self.failure_filter.map_or(true, |filter| filter(err))
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.lock();
        inner.stats.successful_requests += 1;

        if probe {
            inner.probe_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            inner.success_count += 1;
            if inner.success_count >= self.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(breaker = %self.name, "Circuit closed after successful probes");
            }
        } else if inner.state == CircuitState::Closed && inner.failure_count > 0 {
            inner.failure_count -= 1;
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.stats.failed_requests += 1;
        inner.stats.last_failure_at = Some(Utc::now());

        if probe {
            inner.probe_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                warn!(breaker = %self.name, "Probe failed, reopening circuit");
                self.open(&mut inner, now);
            }
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure = Some(now);
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Failure threshold reached, opening circuit"
                    );
                    self.open(&mut inner, now);
                }
            }
            // Admitted before the state changed; statistics only.
            CircuitState::Open | CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "Late failure from pre-transition call");
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.last_failure = Some(now);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.stats.opened_count += 1;
        inner.stats.opened_at = Some(Utc::now());
    }
}

/// Admission to run one call under a breaker.
#[must_use = "a permit records a failure when dropped without completion"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    completed: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the HalfOpen probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome of the call.
    pub fn complete<T>(mut self, outcome: &Result<T>) {
        self.completed = true;
        match outcome {
            Err(err) if self.breaker.qualifies(err) => self.breaker.record_failure(self.probe),
            _ => self.breaker.record_success(self.probe),
        }
    }

    pub fn success(mut self) {
        self.completed = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.completed = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        // Cancelled future or panic inside the protected call.
        if !self.completed {
            self.breaker.record_failure(self.probe);
        }
    }
}
