//! Durable state for resumable imports.
//!
//! Provides:
//! - `CheckpointManager`: Timestamped progress snapshots per operation
//! - `IdempotencyGuard`: Persisted content-fingerprint dedup set
//! - `Session`: Persistence unit-of-work, with memory and JSON-lines backends
//! - `TransactionManager`: Batched commits with savepoints and deadlock retry

mod idempotency;
mod session;
mod state;
mod transaction;

pub use idempotency::*;
pub use session::*;
pub use state::*;
pub use transaction::*;
