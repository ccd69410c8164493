//! Resilient, resumable import of one file.
//!
//! Pipeline flow:
//! Validate → Read → Batches (dedup → database breaker(retry(process_fn)) → buffer)
//! → Commit (deadlock retry) + Checkpoint → Finalize
//!
//! Epistemic foundation:
//! - K_i: Completed only when no record failed
//! - K_i: Fingerprints become durable only after the records they cover are committed
//! - B_i: A failed run can resume from its last checkpoint under the same operation ID
//! - B_i: Row-level rejections say nothing about the database; only persistence
//!   failures count against the database breaker, once per row
//! - I^B: Commit failure → uncommitted work is dropped and redone on resume

use super::{
    BasicFileValidator, FileValidator, JsonLinesSource, RecordSource, SchemaValidator,
    StructuredLogger, StructureValidator,
};
use crate::checkpoint::{
    retry_on_deadlock, CheckpointManager, CheckpointState, IdempotencyGuard, IdempotencyStats,
    Session, TransactionManager, TransactionStats,
};
use crate::models::{
    BatchOutcome, ErrorKind, ImportConfig, ImportError, ImportResult, ImportState, Result,
};
use crate::resilience::{CircuitBreaker, CircuitBreakerSnapshot, RetryPolicy, RetryStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failures that reflect on the persistence layer rather than on one record.
fn is_persistence_failure(err: &ImportError) -> bool {
    match err {
        ImportError::MaxRetriesExceeded { source, .. } => is_persistence_failure(source),
        other => matches!(
            other.kind(),
            ErrorKind::Transaction | ErrorKind::Deadlock | ErrorKind::Io
        ),
    }
}

/// Mutable bookkeeping for the current cycle.
#[derive(Debug)]
struct RunProgress {
    state: ImportState,
    can_resume: bool,
    imported: usize,
    skipped: usize,
    errors: usize,
    batches: usize,
    started: Option<Instant>,
    error_message: Option<String>,
    file: Option<PathBuf>,
    table_type: Option<String>,
    last_checkpoint: Option<DateTime<Utc>>,
}

impl RunProgress {
    fn new() -> Self {
        Self {
            state: ImportState::Pending,
            can_resume: false,
            imported: 0,
            skipped: 0,
            errors: 0,
            batches: 0,
            started: None,
            error_message: None,
            file: None,
            table_type: None,
            last_checkpoint: None,
        }
    }

    /// Start a new Running cycle with fresh counters.
    fn begin(&mut self, file: &Path, table_type: &str) {
        let last_checkpoint = self.last_checkpoint;
        *self = Self::new();
        self.state = ImportState::Running;
        self.started = Some(Instant::now());
        self.file = Some(file.to_path_buf());
        self.table_type = Some(table_type.to_string());
        self.last_checkpoint = last_checkpoint;
    }
}

/// Retry policy health.
#[derive(Debug, Clone, Serialize)]
pub struct RetryHealth {
    pub name: String,
    pub total_retries: u64,
    pub last_call: RetryStats,
}

/// Snapshot of an orchestrator and its components.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub operation_id: String,
    pub state: ImportState,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub batches_processed: usize,
    pub pending_records: usize,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub retry: RetryHealth,
    pub transactions: TransactionStats,
    pub idempotency: IdempotencyStats,
}

/// Runs resilient imports for one operation ID.
///
/// `Send + Sync`; share it through `Arc` to process batches from several tasks.
pub struct ImportOrchestrator<S: Session> {
    operation_id: String,
    config: ImportConfig,
    database_breaker: CircuitBreaker,
    filesystem_breaker: CircuitBreaker,
    parsing_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    transactions: Mutex<TransactionManager<S>>,
    checkpoints: CheckpointManager,
    guard: IdempotencyGuard,
    logger: StructuredLogger,
    file_validator: Box<dyn FileValidator>,
    structure_validator: Box<dyn StructureValidator>,
    source: Box<dyn RecordSource>,
    cancel: CancellationToken,
    run: Mutex<RunProgress>,
}

impl<S: Session> ImportOrchestrator<S> {
    /// Create an orchestrator persisting through `session`.
    ///
    /// Storage directories from the config are created if missing.
    pub fn new(operation_id: &str, config: ImportConfig, session: S) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;

        let checkpoints = CheckpointManager::new(&storage.checkpoint_dir, operation_id)?;
        let guard = IdempotencyGuard::new(&storage.idempotency_dir, operation_id)?;
        let logger = StructuredLogger::new(&storage.log_dir, operation_id)?;

        info!(
            operation_id,
            batch_size = config.transaction.batch_size,
            max_attempts = config.retry.max_attempts,
            "Import orchestrator created"
        );

        Ok(Self {
            operation_id: operation_id.to_string(),
            database_breaker: CircuitBreaker::from_config("database", &config.breakers.database)
                .with_failure_filter(is_persistence_failure),
            filesystem_breaker: CircuitBreaker::from_config(
                "filesystem",
                &config.breakers.filesystem,
            ),
            parsing_breaker: CircuitBreaker::from_config("parsing", &config.breakers.parsing),
            retry_policy: RetryPolicy::from_config(operation_id, &config.retry),
            transactions: Mutex::new(TransactionManager::new(
                session,
                config.transaction.batch_size,
            )),
            checkpoints,
            guard,
            logger,
            file_validator: Box::new(BasicFileValidator::from_config(&config)),
            structure_validator: Box::new(SchemaValidator::from_config(&config)),
            source: Box::new(JsonLinesSource),
            cancel: CancellationToken::new(),
            run: Mutex::new(RunProgress::new()),
            config,
        })
    }

    pub fn with_file_validator(mut self, validator: impl FileValidator + 'static) -> Self {
        self.file_validator = Box::new(validator);
        self
    }

    pub fn with_structure_validator(mut self, validator: impl StructureValidator + 'static) -> Self {
        self.structure_validator = Box::new(validator);
        self
    }

    pub fn with_record_source(mut self, source: impl RecordSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Stop the run (between batches and during retry waits) once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn state(&self) -> ImportState {
        self.progress().state
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn idempotency_guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    fn progress(&self) -> MutexGuard<'_, RunProgress> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transactions(&self) -> MutexGuard<'_, TransactionManager<S>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the file and structure validators.
    ///
    /// A file-level error is returned alone; schema checks need a readable file.
    pub fn validate_prerequisites(&self, path: &Path, table_type: &str) -> Vec<String> {
        if let Err(e) = self.file_validator.validate(path) {
            return vec![e];
        }
        match self.structure_validator.validate(path, table_type) {
            Ok(()) => Vec::new(),
            Err(e) => vec![e],
        }
    }

    /// Import every record of `path`, transforming each with `process_fn`.
    pub async fn import_file<F, Fut>(
        &self,
        path: &Path,
        table_type: &str,
        process_fn: F,
    ) -> ImportResult
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        {
            let mut run = self.progress();
            let refusal = match run.state {
                ImportState::Completed => Some("already completed"),
                ImportState::Failed if !run.can_resume => Some("failed and cannot be resumed"),
                ImportState::Running => Some("already running"),
                _ => None,
            };
            if let Some(reason) = refusal {
                warn!(operation_id = %self.operation_id, state = %run.state, "Import refused");
                let mut result = self.result(&run);
                result.success = false;
                result.error_message = Some(format!("Operation {} is {reason}", self.operation_id));
                return result;
            }
            run.begin(path, table_type);
        }

        self.logger.set_context("table_type", table_type);
        self.logger.set_context("file", path.display().to_string());
        self.logger.info("Import started", Value::Null);

        self.prepare_resume();

        let validation_errors = self.validate_prerequisites(path, table_type);
        if !validation_errors.is_empty() {
            self.logger
                .error("Validation failed", json!({ "errors": validation_errors }));
            let mut result = self.fail("Validation failed".to_string(), false);
            result.validation_errors = validation_errors;
            return result;
        }

        let records = match self.parsing_breaker.call_blocking(|| self.source.read(path)) {
            Ok(records) => records,
            Err(err) => {
                self.logger
                    .error("Reading records failed", json!({ "error": err.to_string() }));
                return self.fail(format!("Failed to read records: {err}"), err.is_circuit_open());
            }
        };

        let batch_size = self.config.transaction.batch_size;
        let interval = self.config.checkpoint.interval_batches;
        let total_batches = records.len().div_ceil(batch_size);
        info!(
            operation_id = %self.operation_id,
            records = records.len(),
            batches = total_batches,
            "Processing records"
        );

        for (n, chunk) in records.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                self.logger.warn("Import cancelled", json!({ "batch": n + 1 }));
                if let Err(e) = self.commit_and_checkpoint().await {
                    warn!(error = %e, "Commit on cancellation failed");
                }
                return self.fail("Import cancelled".to_string(), true);
            }

            let batch_name = format!("batch-{}/{}", n + 1, total_batches);
            self.process_batch(chunk.to_vec(), &process_fn, &batch_name)
                .await;

            let committed = if (n + 1) % interval == 0 {
                self.commit_and_checkpoint().await.map(|_| ())
            } else {
                self.commit_if_batch_full().await.map(|_| ())
            };
            if let Err(err) = committed {
                return self.fail(format!("Commit failed: {err}"), true);
            }
        }

        self.finalize().await
    }

    /// Load the latest checkpoint for logging and drop expired ones.
    fn prepare_resume(&self) {
        let keep_days = self.config.checkpoint.keep_days;
        match self
            .filesystem_breaker
            .call_blocking(|| self.checkpoints.cleanup_old_checkpoints(keep_days))
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Expired checkpoints removed"),
            Err(e) => warn!(error = %e, "Checkpoint cleanup failed"),
        }

        match self.checkpoints.load_checkpoint() {
            Ok(Some(checkpoint)) => {
                self.logger.info(
                    "Resuming from checkpoint",
                    json!({
                        "checkpoint_created_at": checkpoint.created_at,
                        "progress": checkpoint.progress,
                    }),
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not load checkpoint"),
        }
    }

    /// Process one batch of records.
    ///
    /// Duplicates are skipped. A failing record is logged and counted; it never
    /// aborts the batch. Each record takes one database breaker admission for
    /// all of its retry attempts.
    pub async fn process_batch<F, Fut>(
        &self,
        items: Vec<Value>,
        process_fn: &F,
        batch_name: &str,
    ) -> BatchOutcome
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        {
            let mut run = self.progress();
            run.started.get_or_insert_with(Instant::now);
        }

        let mut outcome = BatchOutcome::default();

        for (index, item) in items.into_iter().enumerate() {
            let fingerprint = match self.guard.try_reserve(&item) {
                Ok(Some(fingerprint)) => fingerprint,
                Ok(None) => {
                    outcome.skipped += 1;
                    continue;
                }
                Err(err) => {
                    outcome.failed += 1;
                    self.log_item_failure(batch_name, index, &item, &err);
                    continue;
                }
            };

            let processed = match self.database_breaker.acquire() {
                Ok(permit) => {
                    let attempted = self
                        .retry_policy
                        .execute_cancellable(|| process_fn(item.clone()), &self.cancel)
                        .await;
                    permit.complete(&attempted);
                    attempted
                }
                Err(err) => Err(err),
            };

            match processed {
                Ok(record) => {
                    self.transactions().add(record);
                    outcome.processed += 1;
                }
                Err(err) => {
                    self.guard.release(&fingerprint);
                    outcome.failed += 1;
                    self.log_item_failure(batch_name, index, &item, &err);
                }
            }
        }

        {
            let mut run = self.progress();
            run.imported += outcome.processed;
            run.skipped += outcome.skipped;
            run.errors += outcome.failed;
            run.batches += 1;
        }

        debug!(
            batch = batch_name,
            processed = outcome.processed,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Batch processed"
        );
        outcome
    }

    fn log_item_failure(&self, batch_name: &str, index: usize, item: &Value, err: &ImportError) {
        self.logger.error(
            "Record processing failed",
            json!({
                "batch": batch_name,
                "index": index,
                "id": item.get("id").cloned().unwrap_or(Value::Null),
                "error": err.to_string(),
                "error_kind": err.kind(),
            }),
        );
    }

    /// Commit the buffer and record cumulative progress in a checkpoint.
    pub async fn commit_and_checkpoint(&self) -> Result<usize> {
        let committed = self.commit_with_retry(|tx| tx.commit_batch()).await;
        let committed = self.settle_commit(committed)?;
        self.write_checkpoint()?;
        Ok(committed)
    }

    /// Commit only when the buffer has reached the batch size.
    async fn commit_if_batch_full(&self) -> Result<Option<usize>> {
        let full = {
            let tx = self.transactions();
            tx.pending_count() >= tx.batch_size()
        };
        if !full {
            return Ok(None);
        }
        let committed = self
            .commit_with_retry(|tx| tx.commit_if_batch_full().map(Option::unwrap_or_default))
            .await;
        self.settle_commit(committed).map(Some)
    }

    /// Run `commit` under the database breaker, retrying lock conflicts.
    ///
    /// The manager is locked per attempt only, never across a backoff wait.
    async fn commit_with_retry<F>(&self, commit: F) -> Result<usize>
    where
        F: Fn(&mut TransactionManager<S>) -> Result<usize>,
    {
        let settings = &self.config.transaction;
        let (outcome, retries) = retry_on_deadlock(
            || {
                std::future::ready(
                    self.database_breaker
                        .call_blocking(|| commit(&mut *self.transactions())),
                )
            },
            settings.deadlock_max_retries,
            Duration::from_millis(settings.deadlock_base_delay_ms),
        )
        .await;
        if retries > 0 {
            debug!(retries, "Commit retried after lock conflicts");
        }
        self.transactions().record_deadlock_retries(retries, &outcome);
        outcome
    }

    /// Make fingerprints durable after a commit, or drop uncommitted work after a failure.
    fn settle_commit(&self, outcome: Result<usize>) -> Result<usize> {
        match outcome {
            Ok(committed) => {
                self.filesystem_breaker
                    .call_blocking(|| self.guard.flush())?;
                Ok(committed)
            }
            Err(err) => {
                let dropped = self.transactions().discard_buffer();
                {
                    let mut run = self.progress();
                    run.imported = run.imported.saturating_sub(dropped);
                }
                let discarded = self.guard.discard_pending();
                self.logger.error(
                    "Commit failed",
                    json!({
                        "error": err.to_string(),
                        "dropped_records": dropped,
                        "discarded_fingerprints": discarded,
                    }),
                );
                Err(err)
            }
        }
    }

    fn write_checkpoint(&self) -> Result<CheckpointState> {
        let committed_records = self.transactions().stats().committed_records;
        let (progress, metadata) = {
            let run = self.progress();
            let progress = json!({
                "imported_count": run.imported,
                "skipped_count": run.skipped,
                "error_count": run.errors,
                "batches_processed": run.batches,
                "committed_records": committed_records,
            });
            let metadata = json!({
                "file": run.file.as_ref().map(|p| p.display().to_string()),
                "table_type": run.table_type,
                "state": run.state,
            });
            (into_map(progress), into_map(metadata))
        };

        let state = self
            .filesystem_breaker
            .call_blocking(|| self.checkpoints.update_checkpoint(progress, Some(metadata)))?;
        self.progress().last_checkpoint = Some(state.updated_at.unwrap_or(state.created_at));
        Ok(state)
    }

    /// Commit what is left and settle the run state.
    pub async fn finalize(&self) -> ImportResult {
        let flushed = self.commit_with_retry(|tx| tx.flush_remaining()).await;
        let flushed = self.settle_commit(flushed);
        if let Err(err) = flushed {
            return self.fail(format!("Final commit failed: {err}"), true);
        }

        let errors = self.progress().errors;
        if errors == 0 {
            match self.filesystem_breaker.call_blocking(|| self.checkpoints.delete_all()) {
                Ok(removed) => debug!(removed, "Checkpoints purged"),
                Err(e) => warn!(error = %e, "Could not purge checkpoints"),
            }
            let mut run = self.progress();
            run.state = ImportState::Completed;
            run.can_resume = false;
            run.error_message = None;
            let result = self.result(&run);
            drop(run);

            self.logger.info(
                "Import completed",
                json!({
                    "imported_count": result.imported_count,
                    "skipped_count": result.skipped_count,
                    "duration_secs": result.duration_secs,
                }),
            );
            result
        } else {
            {
                let mut run = self.progress();
                run.state = ImportState::Failed;
            }
            if let Err(e) = self.write_checkpoint() {
                warn!(error = %e, "Final checkpoint failed");
            }
            self.fail(format!("{errors} record(s) failed to import"), true)
        }
    }

    fn fail(&self, message: String, can_resume: bool) -> ImportResult {
        let mut run = self.progress();
        run.state = ImportState::Failed;
        run.can_resume = can_resume;
        run.error_message = Some(message.clone());
        let result = self.result(&run);
        drop(run);

        self.logger.error(
            "Import failed",
            json!({
                "error": message,
                "can_resume": can_resume,
                "imported_count": result.imported_count,
                "error_count": result.error_count,
            }),
        );
        result
    }

    fn result(&self, run: &RunProgress) -> ImportResult {
        ImportResult {
            success: run.state != ImportState::Failed && run.errors == 0,
            operation_id: self.operation_id.clone(),
            state: run.state,
            imported_count: run.imported,
            skipped_count: run.skipped,
            error_count: run.errors,
            duration_secs: run.started.map_or(0.0, |t| t.elapsed().as_secs_f64()),
            error_message: run.error_message.clone(),
            can_resume: run.can_resume,
            validation_errors: Vec::new(),
        }
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let (transactions, pending_records) = {
            let tx = self.transactions();
            (tx.stats(), tx.pending_count())
        };
        let run = self.progress();
        OrchestratorStats {
            operation_id: self.operation_id.clone(),
            state: run.state,
            imported_count: run.imported,
            skipped_count: run.skipped,
            error_count: run.errors,
            batches_processed: run.batches,
            pending_records,
            last_checkpoint: run.last_checkpoint,
            circuit_breakers: vec![
                self.database_breaker.snapshot(),
                self.filesystem_breaker.snapshot(),
                self.parsing_breaker.snapshot(),
            ],
            retry: RetryHealth {
                name: self.retry_policy.name().to_string(),
                total_retries: self.retry_policy.total_retries(),
                last_call: self.retry_policy.last_stats(),
            },
            transactions,
            idempotency: self.guard.stats(),
        }
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemorySession;
    use crate::models::StorageConfig;
    use crate::resilience::CircuitState;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config(root: &Path, batch_size: usize) -> ImportConfig {
        let mut config = ImportConfig {
            storage: StorageConfig::under(root),
            ..Default::default()
        };
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.retry.jitter = false;
        config.transaction.batch_size = batch_size;
        config.transaction.deadlock_base_delay_ms = 1;
        config
    }

    fn write_records(dir: &Path, ids: impl IntoIterator<Item = u32>) -> PathBuf {
        let path = dir.join("employees.jsonl");
        let content: String = ids
            .into_iter()
            .map(|id| format!("{{\"id\": {id}, \"name\": \"employee-{id}\"}}\n"))
            .collect();
        fs::write(&path, content).unwrap();
        path
    }

    async fn identity(record: Value) -> Result<Value> {
        Ok(record)
    }

    /// Session whose commits fail while the shared flag is set, after first
    /// reporting `lock_conflicts` lock conflicts.
    #[derive(Clone)]
    struct FlakySession {
        inner: MemorySession,
        failing: Arc<AtomicBool>,
        lock_conflicts: Arc<AtomicU32>,
    }

    impl FlakySession {
        fn new(inner: &MemorySession, failing: bool, lock_conflicts: u32) -> Self {
            Self {
                inner: inner.clone(),
                failing: Arc::new(AtomicBool::new(failing)),
                lock_conflicts: Arc::new(AtomicU32::new(lock_conflicts)),
            }
        }
    }

    impl Session for FlakySession {
        fn add(&mut self, record: Value) -> Result<()> {
            self.inner.add(record)
        }

        fn commit(&mut self) -> Result<()> {
            let conflicted = self
                .lock_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if conflicted {
                return Err(ImportError::Transaction("database is locked".to_string()));
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ImportError::Transaction("connection reset".to_string()));
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

    #[tokio::test]
    async fn test_missing_file_fails_validation() {
        let dir = TempDir::new().unwrap();
        let orchestrator =
            ImportOrchestrator::new("missing", test_config(dir.path(), 10), MemorySession::new())
                .unwrap();

        let result = orchestrator
            .import_file(&dir.path().join("missing.xlsx"), "employees", identity)
            .await;

        assert!(!result.success);
        assert!(!result.can_resume);
        assert_eq!(result.state, ImportState::Failed);
        assert!(result.validation_errors[0].contains("File not found"));

        // A non-resumable failure refuses another cycle
        let again = orchestrator
            .import_file(&dir.path().join("missing.xlsx"), "employees", identity)
            .await;
        assert!(!again.success);
        assert!(again.error_message.unwrap().contains("cannot be resumed"));
        assert_eq!(orchestrator.state(), ImportState::Failed);
    }

    #[tokio::test]
    async fn test_failing_item_does_not_abort_batch() {
        let dir = TempDir::new().unwrap();
        let session = MemorySession::new();
        let orchestrator =
            ImportOrchestrator::new("batch", test_config(dir.path(), 10), session.clone()).unwrap();

        let items: Vec<Value> = (1..=5).map(|id| json!({ "id": id })).collect();
        let process = |record: Value| async move {
            if record["id"] == 3 {
                Err(ImportError::Processing("bad row".to_string()))
            } else {
                Ok(record)
            }
        };

        let outcome = orchestrator.process_batch(items, &process, "batch-1").await;
        assert_eq!(outcome.processed, 4);
        assert_eq!(outcome.failed, 1);

        let result = orchestrator.finalize().await;
        assert!(!result.success);
        assert!(result.can_resume);
        assert_eq!(result.imported_count, 4);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.state, ImportState::Failed);
        assert_eq!(session.committed().len(), 4);

        // Checkpoints are kept for resumption
        let checkpoints = orchestrator.checkpoint_manager().list_checkpoints().unwrap();
        assert!(!checkpoints.is_empty());

        let log = fs::read_to_string(orchestrator.logger().path()).unwrap();
        assert!(log.contains("\"index\":2"));
        assert!(log.contains("\"id\":3"));
    }

    #[tokio::test]
    async fn test_full_success_purges_checkpoints() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=5);
        let session = MemorySession::new();
        let orchestrator =
            ImportOrchestrator::new("full", test_config(dir.path(), 2), session.clone()).unwrap();

        let result = orchestrator.import_file(&path, "employees", identity).await;

        assert!(result.success);
        assert_eq!(result.state, ImportState::Completed);
        assert_eq!(result.imported_count, 5);
        assert!(!result.can_resume);
        assert_eq!(session.committed().len(), 5);
        assert!(orchestrator
            .checkpoint_manager()
            .list_checkpoints()
            .unwrap()
            .is_empty());

        let stats = orchestrator.get_stats();
        assert_eq!(stats.transactions.committed_records, 5);
        assert_eq!(stats.batches_processed, 3);
        assert_eq!(stats.circuit_breakers.len(), 3);
        assert!(serde_json::to_value(&stats).is_ok());

        // Completed runs are not re-run
        let again = orchestrator.import_file(&path, "employees", identity).await;
        assert!(!again.success);
        assert_eq!(orchestrator.state(), ImportState::Completed);
    }

    #[tokio::test]
    async fn test_resume_skips_imported_records() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=4);
        let session = MemorySession::new();
        let orchestrator =
            ImportOrchestrator::new("resume", test_config(dir.path(), 10), session.clone())
                .unwrap();

        let healthy = Arc::new(AtomicBool::new(false));
        let process = {
            let healthy = Arc::clone(&healthy);
            move |record: Value| {
                let ok = healthy.load(Ordering::SeqCst) || record["id"] != 2;
                async move {
                    if ok {
                        Ok(record)
                    } else {
                        Err(ImportError::Processing("upstream unavailable".to_string()))
                    }
                }
            }
        };

        let first = orchestrator.import_file(&path, "employees", &process).await;
        assert_eq!(first.imported_count, 3);
        assert_eq!(first.error_count, 1);
        assert!(first.can_resume);

        healthy.store(true, Ordering::SeqCst);
        let second = orchestrator.import_file(&path, "employees", &process).await;
        assert!(second.success);
        assert_eq!(second.imported_count, 1);
        assert_eq!(second.skipped_count, 3);
        assert_eq!(session.committed().len(), 4);

        // A fresh instance sees the persisted fingerprints
        let restarted =
            ImportOrchestrator::new("resume", test_config(dir.path(), 10), MemorySession::new())
                .unwrap();
        let third = restarted.import_file(&path, "employees", identity).await;
        assert_eq!(third.imported_count, 0);
        assert_eq!(third.skipped_count, 4);
    }

    #[tokio::test]
    async fn test_commit_failure_is_resumable() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=3);
        let inner = MemorySession::new();
        let session = FlakySession::new(&inner, true, 0);
        let failing = Arc::clone(&session.failing);
        let orchestrator =
            ImportOrchestrator::new("flaky", test_config(dir.path(), 10), session).unwrap();

        let first = orchestrator.import_file(&path, "employees", identity).await;
        assert!(!first.success);
        assert!(first.can_resume);
        assert!(first.error_message.unwrap().contains("Commit failed"));
        // Dropped records are not reported as imported
        assert_eq!(first.imported_count, 0);
        assert_eq!(orchestrator.idempotency_guard().stats().cache_size, 0);
        assert_eq!(orchestrator.get_stats().pending_records, 0);

        failing.store(false, Ordering::SeqCst);
        let second = orchestrator.import_file(&path, "employees", identity).await;
        assert!(second.success);
        assert_eq!(second.imported_count, 3);
        assert_eq!(inner.committed().len(), 3);
    }

    #[tokio::test]
    async fn test_adjacent_failing_rows_do_not_trip_database_breaker() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=10);
        let session = MemorySession::new();
        let orchestrator =
            ImportOrchestrator::new("adjacent", test_config(dir.path(), 10), session.clone())
                .unwrap();

        let process = |record: Value| async move {
            if record["id"] == 3 || record["id"] == 4 {
                Err(ImportError::Processing("rejected row".to_string()))
            } else {
                Ok(record)
            }
        };

        let result = orchestrator.import_file(&path, "employees", process).await;
        assert_eq!(result.imported_count, 8);
        assert_eq!(result.error_count, 2);
        assert!(result.can_resume);
        assert_eq!(session.committed().len(), 8);

        let database = &orchestrator.get_stats().circuit_breakers[0];
        assert_eq!(database.name, "database");
        assert_eq!(database.state, CircuitState::Closed);
        assert_eq!(database.stats.rejected_requests, 0);
    }

    #[tokio::test]
    async fn test_persistence_failures_open_database_breaker_once_per_row() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=7);
        let orchestrator =
            ImportOrchestrator::new("outage", test_config(dir.path(), 10), MemorySession::new())
                .unwrap();

        let process = |_record: Value| async {
            Err::<Value, _>(ImportError::Transaction("connection refused".to_string()))
        };

        let result = orchestrator.import_file(&path, "employees", process).await;
        assert!(!result.success);
        assert_eq!(result.error_count, 7);

        // Five rows reach the threshold even though each was attempted three times
        let database = &orchestrator.get_stats().circuit_breakers[0];
        assert_eq!(database.state, CircuitState::Open);
        assert_eq!(database.stats.failed_requests, 5);
        assert!(database.stats.rejected_requests >= 2);
    }

    #[tokio::test]
    async fn test_locked_commit_is_retried() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=3);
        let inner = MemorySession::new();
        let orchestrator = ImportOrchestrator::new(
            "locked",
            test_config(dir.path(), 10),
            FlakySession::new(&inner, false, 1),
        )
        .unwrap();

        let result = orchestrator.import_file(&path, "employees", identity).await;
        assert!(result.success);
        assert_eq!(result.state, ImportState::Completed);
        assert_eq!(result.imported_count, 3);
        assert_eq!(inner.committed().len(), 3);

        let stats = orchestrator.get_stats().transactions;
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.transactions_rolled_back, 1);
        assert_eq!(stats.committed_records, 3);
    }

    #[tokio::test]
    async fn test_persistent_lock_conflict_exhausts_commit_retries() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=3);
        let inner = MemorySession::new();
        let mut config = test_config(dir.path(), 10);
        config.transaction.deadlock_max_retries = 2;
        let orchestrator =
            ImportOrchestrator::new("deadlocked", config, FlakySession::new(&inner, false, 10))
                .unwrap();

        let result = orchestrator.import_file(&path, "employees", identity).await;
        assert!(!result.success);
        assert!(result.can_resume);
        assert!(result.error_message.unwrap().contains("Deadlock persisted after 3 attempts"));
        assert_eq!(result.imported_count, 0);
        assert!(inner.committed().is_empty());
        assert_eq!(orchestrator.get_stats().transactions.total_retries, 2);
    }

    #[tokio::test]
    async fn test_schema_violation_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("employees.jsonl");
        fs::write(&path, "{\"id\": 1}\n").unwrap();

        let orchestrator =
            ImportOrchestrator::new("schema", test_config(dir.path(), 10), MemorySession::new())
                .unwrap()
                .with_structure_validator(
                    SchemaValidator::new().with_schema("employees", ["id", "name"]),
                );

        let result = orchestrator.import_file(&path, "employees", identity).await;
        assert!(!result.can_resume);
        assert!(result.validation_errors[0].contains("name"));
    }

    #[tokio::test]
    async fn test_unparseable_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jsonl");
        fs::write(&path, "{\"id\": 1}\n{broken\n").unwrap();

        let orchestrator =
            ImportOrchestrator::new("broken", test_config(dir.path(), 10), MemorySession::new())
                .unwrap();

        let result = orchestrator.import_file(&path, "employees", identity).await;
        assert_eq!(result.state, ImportState::Failed);
        assert!(!result.can_resume);
        assert!(result.error_message.unwrap().contains("Line 2"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_resumable() {
        let dir = TempDir::new().unwrap();
        let path = write_records(dir.path(), 1..=3);
        let token = CancellationToken::new();
        token.cancel();

        let orchestrator =
            ImportOrchestrator::new("cancel", test_config(dir.path(), 10), MemorySession::new())
                .unwrap()
                .with_cancellation(token);

        let result = orchestrator.import_file(&path, "employees", identity).await;
        assert!(!result.success);
        assert!(result.can_resume);
        assert_eq!(result.imported_count, 0);
    }
}
