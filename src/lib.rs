//! bulkimport - Resilient, resumable batch imports.
//!
//! ## Architecture
//!
//! An `ImportOrchestrator` composes, per operation ID:
//! - **Circuit breakers** for the database, filesystem and parsing dependencies
//! - **Retry policy** with exponential backoff for per-record processing
//! - **Transaction manager** committing records in bounded batches
//! - **Checkpoint manager** and **idempotency guard** for resumption
//! - **Structured logger** writing one JSON line per event
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Dependency failures (breakers, retry, backoff, checkpoints)

pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod resilience;

// Re-exports for convenience
pub use checkpoint::{
    CheckpointManager, CheckpointState, IdempotencyGuard, JsonlSession, MemorySession, Session,
    TransactionManager,
};
pub use models::{ImportConfig, ImportError, ImportResult, ImportState, Result};
pub use pipeline::{ImportOrchestrator, OrchestratorStats, StructuredLogger};
pub use resilience::{BackoffStrategy, CircuitBreaker, CircuitState, RetryPolicy};
