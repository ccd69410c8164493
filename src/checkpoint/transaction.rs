//! Batched commits over a persistence session.
//!
//! Epistemic foundation:
//! - K_i: A batch is committed as one transaction or not at all
//! - K_i: A failed commit is rolled back once and the buffer is left intact
//! - B_i: Lock conflicts (deadlocks, serialization failures) are transient
//! - I^B: Conflicts persist past the retry budget → DeadlockRetriesExhausted

use super::Session;
use crate::models::{ErrorKind, ImportError, Result};
use crate::resilience::{BackoffStrategy, RetryPolicy};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single deadlock backoff.
const MAX_DEADLOCK_DELAY: Duration = Duration::from_secs(5);

const LOCK_CONFLICT_PATTERN: &str =
    r"(?i)deadlock|lock wait timeout|could not serialize|database is (locked|busy)|try restarting transaction";

static LOCK_CONFLICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LOCK_CONFLICT_PATTERN).expect("lock conflict pattern compiles"));

/// Whether an error message describes a lock conflict.
pub fn is_lock_conflict(message: &str) -> bool {
    LOCK_CONFLICT.is_match(message)
}

/// Run `operation`, retrying failures that look like lock conflicts.
///
/// Lock conflicts are reclassified as [`ImportError::Deadlock`]; any other
/// failure propagates unchanged on the first occurrence. Returns the outcome
/// together with the number of retries spent.
///
/// Holds no borrow between attempts, so callers keeping a
/// [`TransactionManager`] behind a mutex can lock it inside `operation`.
pub async fn retry_on_deadlock<T, F, Fut>(
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> (Result<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = BackoffStrategy::new(base_delay, MAX_DEADLOCK_DELAY);
    let policy = RetryPolicy::new("deadlock", max_retries.saturating_add(1), backoff)
        .with_retryable_kinds([ErrorKind::Deadlock]);

    let outcome = policy
        .execute(|| {
            let attempt = operation();
            async move {
                attempt.await.map_err(|err| match err {
                    ImportError::Deadlock(_) => err,
                    other if is_lock_conflict(&other.to_string()) => {
                        ImportError::Deadlock(other.to_string())
                    }
                    other => other,
                })
            }
        })
        .await;

    let retries = policy.last_stats().retries;
    let outcome = outcome.map_err(|err| match err {
        ImportError::MaxRetriesExceeded { attempts, source, .. } => {
            let last_error = source.to_string();
            warn!(attempts, error = %last_error, "Deadlock retries exhausted");
            ImportError::DeadlockRetriesExhausted {
                attempts,
                last_error,
            }
        }
        other => other,
    });
    (outcome, retries)
}

/// Commit statistics; monotonic until `reset_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStats {
    pub committed_records: u64,
    pub batches_committed: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub total_retries: u64,
    pub last_error: Option<String>,
}

/// Buffers records and commits them through a [`Session`] in batches.
///
/// Not safe for concurrent mutation; share it behind a mutex or keep one per worker.
pub struct TransactionManager<S: Session> {
    session: S,
    batch_size: usize,
    buffer: Vec<Value>,
    stats: TransactionStats,
}

impl<S: Session> TransactionManager<S> {
    /// Create a manager; a `batch_size` of 0 is treated as 1.
    pub fn new(session: S, batch_size: usize) -> Self {
        Self {
            session,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            stats: TransactionStats::default(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queue a record for the next batch.
    pub fn add(&mut self, record: Value) {
        self.buffer.push(record);
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    /// Records waiting for commit.
    pub fn pending(&self) -> &[Value] {
        &self.buffer
    }

    /// Drop buffered records without committing them. Returns how many were dropped.
    pub fn discard_buffer(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    /// Commit the buffer as one transaction and return the number of records written.
    ///
    /// On failure the session is rolled back and the buffer is kept.
    pub fn commit_batch(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let staged = self
            .buffer
            .iter()
            .try_for_each(|record| self.session.add(record.clone()));
        match staged.and_then(|()| self.session.commit()) {
            Ok(()) => {
                let count = self.buffer.len();
                self.buffer.clear();
                self.stats.committed_records += count as u64;
                self.stats.batches_committed += 1;
                self.stats.transactions_committed += 1;
                debug!(records = count, "Batch committed");
                Ok(count)
            }
            Err(err) => {
                self.roll_back(&err);
                warn!(pending = self.buffer.len(), error = %err, "Batch commit failed");
                Err(err)
            }
        }
    }

    /// Commit only once the buffer has reached `batch_size`.
    pub fn commit_if_batch_full(&mut self) -> Result<Option<usize>> {
        if self.buffer.len() >= self.batch_size {
            self.commit_batch().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Commit whatever is left in the buffer.
    pub fn flush_remaining(&mut self) -> Result<usize> {
        self.commit_batch()
    }

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back exactly once when it returns
    /// `Err` or panics.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope<'_, S>) -> Result<T>,
    {
        let mut scope = TransactionScope {
            manager: self,
            staged: 0,
            savepoints: Vec::new(),
            finished: false,
        };
        match f(&mut scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                scope.abort(&err);
                Err(err)
            }
        }
    }

    /// Run `operation` under [`retry_on_deadlock`], folding the retries into the stats.
    pub async fn execute_with_retry<T, F, Fut>(
        &mut self,
        operation: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (outcome, retries) = retry_on_deadlock(operation, max_retries, base_delay).await;
        self.record_deadlock_retries(retries, &outcome);
        outcome
    }

    /// Account for a [`retry_on_deadlock`] run made outside this manager.
    pub fn record_deadlock_retries<T>(&mut self, retries: u32, outcome: &Result<T>) {
        self.stats.total_retries += u64::from(retries);
        if let Err(ImportError::DeadlockRetriesExhausted { last_error, .. }) = outcome {
            self.stats.last_error = Some(last_error.clone());
        }
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = TransactionStats::default();
    }

    fn roll_back(&mut self, cause: &ImportError) {
        if let Err(err) = self.session.rollback() {
            warn!(error = %err, "Rollback failed");
        }
        self.stats.transactions_rolled_back += 1;
        self.stats.last_error = Some(cause.to_string());
    }
}

/// An open transaction handed to the closure passed to
/// [`TransactionManager::transaction`].
pub struct TransactionScope<'a, S: Session> {
    manager: &'a mut TransactionManager<S>,
    staged: usize,
    savepoints: Vec<(String, usize)>,
    finished: bool,
}

impl<S: Session> TransactionScope<'_, S> {
    /// Stage a record in this transaction.
    pub fn add(&mut self, record: Value) -> Result<()> {
        self.manager.session.add(record)?;
        self.staged += 1;
        Ok(())
    }

    /// Records staged so far (savepoint rollbacks subtracted).
    pub fn staged(&self) -> usize {
        self.staged
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.manager.session.begin_nested(name)?;
        self.savepoints.push((name.to_string(), self.staged));
        Ok(())
    }

    /// Undo work since `name` without aborting the transaction.
    pub fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.manager.session.rollback_to(name)?;
        if let Some(idx) = self.savepoints.iter().rposition(|(n, _)| n == name) {
            self.staged = self.savepoints[idx].1;
            self.savepoints.truncate(idx + 1);
        }
        Ok(())
    }

    pub fn release(&mut self, name: &str) -> Result<()> {
        self.manager.session.release(name)?;
        if let Some(idx) = self.savepoints.iter().rposition(|(n, _)| n == name) {
            self.savepoints.truncate(idx);
        }
        Ok(())
    }

    /// Run `f` under the savepoint `name`.
    ///
    /// An error undoes only the work done by `f` and is returned to the caller,
    /// who may handle it and keep the outer transaction going.
    pub fn nested<T, F>(&mut self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.savepoint(name)?;
        match f(self) {
            Ok(value) => {
                self.release(name)?;
                Ok(value)
            }
            Err(err) => {
                debug!(savepoint = name, error = %err, "Rolling back to savepoint");
                self.rollback_to(name)?;
                self.release(name)?;
                Err(err)
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.finished = true;
        match self.manager.session.commit() {
            Ok(()) => {
                let stats = &mut self.manager.stats;
                stats.transactions_committed += 1;
                stats.committed_records += self.staged as u64;
                Ok(())
            }
            Err(err) => {
                self.manager.roll_back(&err);
                Err(err)
            }
        }
    }

    fn abort(&mut self, cause: &ImportError) {
        self.finished = true;
        self.manager.roll_back(cause);
    }
}

impl<S: Session> Drop for TransactionScope<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(staged = self.staged, "Transaction dropped before completion, rolling back");
            self.manager
                .roll_back(&ImportError::Transaction("transaction aborted".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemorySession;
    use serde_json::json;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Session whose commits fail while `failures` is positive.
    struct FailingSession {
        inner: MemorySession,
        failures: u32,
    }

    impl Session for FailingSession {
        fn add(&mut self, record: Value) -> Result<()> {
            self.inner.add(record)
        }

        fn commit(&mut self) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ImportError::Transaction("disk full".to_string()));
            }
            self.inner.commit()
        }

        fn rollback(&mut self) -> Result<()> {
            self.inner.rollback()
        }

        fn begin_nested(&mut self, name: &str) -> Result<()> {
            self.inner.begin_nested(name)
        }

        fn rollback_to(&mut self, name: &str) -> Result<()> {
            self.inner.rollback_to(name)
        }

        fn release(&mut self, name: &str) -> Result<()> {
            self.inner.release(name)
        }
    }

    #[test]
    fn test_commit_if_batch_full_threshold() {
        let session = MemorySession::new();
        let mut tx = TransactionManager::new(session.clone(), 3);

        tx.add(json!({"id": 1}));
        tx.add(json!({"id": 2}));
        assert_eq!(tx.commit_if_batch_full().unwrap(), None);
        assert_eq!(session.commit_count(), 0);

        tx.add(json!({"id": 3}));
        assert_eq!(tx.commit_if_batch_full().unwrap(), Some(3));
        assert_eq!(session.commit_count(), 1);
        assert_eq!(tx.pending_count(), 0);

        let stats = tx.stats();
        assert_eq!(stats.committed_records, 3);
        assert_eq!(stats.batches_committed, 1);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let session = MemorySession::new();
        let mut tx = TransactionManager::new(session.clone(), 10);
        assert_eq!(tx.flush_remaining().unwrap(), 0);
        assert_eq!(session.commit_count(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_buffer() {
        let inner = MemorySession::new();
        let session = FailingSession {
            inner: inner.clone(),
            failures: 1,
        };
        let mut tx = TransactionManager::new(session, 2);
        tx.add(json!({"id": 1}));
        tx.add(json!({"id": 2}));

        assert!(tx.commit_batch().is_err());
        assert_eq!(tx.pending_count(), 2);
        assert_eq!(inner.rollback_count(), 1);
        let stats = tx.stats();
        assert_eq!(stats.transactions_rolled_back, 1);
        assert!(stats.last_error.unwrap().contains("disk full"));

        // The retained buffer commits once the session recovers
        assert_eq!(tx.commit_batch().unwrap(), 2);
        assert_eq!(inner.committed().len(), 2);
    }

    #[test]
    fn test_transaction_with_savepoints() {
        let session = MemorySession::new();
        let mut tx = TransactionManager::new(session.clone(), 10);

        let staged = tx
            .transaction(|scope| {
                scope.add(json!({"id": 1}))?;
                let nested: Result<()> = scope.nested("bad_row", |scope| {
                    scope.add(json!({"id": 2}))?;
                    Err(ImportError::Processing("invalid row".to_string()))
                });
                assert!(nested.is_err());

                scope.savepoint("sp")?;
                scope.add(json!({"id": 3}))?;
                scope.release("sp")?;
                Ok(scope.staged())
            })
            .unwrap();

        assert_eq!(staged, 2);
        assert_eq!(session.committed(), vec![json!({"id": 1}), json!({"id": 3})]);
        assert_eq!(tx.stats().transactions_committed, 1);
        assert_eq!(tx.stats().committed_records, 2);
    }

    #[test]
    fn test_transaction_error_rolls_back_once() {
        let session = MemorySession::new();
        let mut tx = TransactionManager::new(session.clone(), 10);

        let result: Result<()> = tx.transaction(|scope| {
            scope.add(json!({"id": 1}))?;
            Err(ImportError::Processing("boom".to_string()))
        });

        assert!(result.is_err());
        assert!(session.committed().is_empty());
        assert_eq!(session.rollback_count(), 1);
        assert_eq!(tx.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn test_transaction_panic_rolls_back() {
        let session = MemorySession::new();
        let mut tx = TransactionManager::new(session.clone(), 10);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = tx.transaction(|scope| {
                scope.add(json!({"id": 1}))?;
                panic!("worker crashed");
            });
        }));

        assert!(outcome.is_err());
        assert!(session.committed().is_empty());
        assert_eq!(session.rollback_count(), 1);
        assert_eq!(tx.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn test_lock_conflict_pattern_compiles() {
        assert!(Regex::new(LOCK_CONFLICT_PATTERN).is_ok());
    }

    #[test]
    fn test_lock_conflict_detection() {
        assert!(is_lock_conflict("Deadlock found when trying to get lock"));
        assert!(is_lock_conflict("Lock wait timeout exceeded; try restarting transaction"));
        assert!(is_lock_conflict("could not serialize access due to concurrent update"));
        assert!(is_lock_conflict("database is locked"));
        assert!(!is_lock_conflict("unique constraint violated"));
    }

    #[tokio::test]
    async fn test_execute_with_retry_recovers_from_deadlock() {
        let mut tx = TransactionManager::new(MemorySession::new(), 10);
        let calls = AtomicU32::new(0);

        let value = tx
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ImportError::Transaction("database is locked".to_string()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                3,
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(tx.stats().total_retries, 2);
    }

    #[tokio::test]
    async fn test_execute_with_retry_propagates_other_errors() {
        let mut tx = TransactionManager::new(MemorySession::new(), 10);
        let calls = AtomicU32::new(0);

        let result: Result<()> = tx
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ImportError::Processing("constraint violated".to_string())) }
                },
                3,
                Duration::from_millis(1),
            )
            .await;

        assert!(matches!(result, Err(ImportError::Processing(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tx.stats().total_retries, 0);
    }

    #[tokio::test]
    async fn test_execute_with_retry_exhaustion() {
        let mut tx = TransactionManager::new(MemorySession::new(), 10);
        let calls = AtomicU32::new(0);

        let result: Result<()> = tx
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ImportError::Deadlock("deadlock detected".to_string())) }
                },
                2,
                Duration::from_millis(1),
            )
            .await;

        match result {
            Err(ImportError::DeadlockRetriesExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("deadlock detected"));
            }
            other => panic!("expected DeadlockRetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tx.stats().total_retries, 2);
        assert!(tx.stats().last_error.unwrap().contains("deadlock detected"));

        tx.reset_stats();
        assert_eq!(tx.stats(), TransactionStats::default());
    }
}
