//! Error types for bulkimport.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (validation, bad input, open circuits)
//! - I^B materialized: Infrastructure failures (I/O, lock conflicts, exhausted retries)
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for bulkimport.
#[derive(Debug, Error)]
pub enum ImportError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Circuit breaker '{name}' is open; retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("'{name}' failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        name: String,
        attempts: u32,
        #[source]
        source: Box<ImportError>,
    },

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Deadlock persisted after {attempts} attempts: {last_error}")]
    DeadlockRetriesExhausted { attempts: u32, last_error: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    CircuitOpen,
    Processing,
    Parse,
    MaxRetries,
    Deadlock,
    Transaction,
    Io,
    Serialization,
    Cancelled,
    Internal,
}

impl ImportError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Processing(_) => ErrorKind::Processing,
            Self::Parse(_) => ErrorKind::Parse,
            Self::MaxRetriesExceeded { .. } => ErrorKind::MaxRetries,
            Self::Deadlock(_) | Self::DeadlockRetriesExhausted { .. } => ErrorKind::Deadlock,
            Self::Transaction(_) => ErrorKind::Transaction,
            Self::Io { .. } => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Fatal errors abort the unit of work immediately and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::CircuitOpen { .. } | Self::Cancelled
        )
    }

    /// Whether a circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Result type alias for bulkimport.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ImportError::Validation("x".into()).is_fatal());
        assert!(ImportError::Cancelled.is_fatal());
        assert!(ImportError::CircuitOpen {
            name: "database".into(),
            retry_after: Duration::from_secs(1),
        }
        .is_fatal());
        assert!(!ImportError::Processing("x".into()).is_fatal());
        assert!(!ImportError::Deadlock("x".into()).is_fatal());
    }

    #[test]
    fn test_max_retries_keeps_cause() {
        let err = ImportError::MaxRetriesExceeded {
            name: "db".into(),
            attempts: 3,
            source: Box::new(ImportError::Processing("boom".into())),
        };
        assert_eq!(err.kind(), ErrorKind::MaxRetries);
        assert!(err.to_string().contains("boom"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Processing failed: boom"));
    }
}
