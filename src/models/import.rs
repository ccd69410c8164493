//! Run state and result types for an import.
//!
//! K_i: These types represent what a caller observes about a run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an import operation.
///
/// Forward-monotonic: Pending → Running → {Completed, Failed}. A resumable
/// failure may start a new Running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportState {
    Pending,
    Running,
    Failed,
    Completed,
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Final outcome of one `import_file` cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    /// True iff no record failed and no fatal error occurred
    pub success: bool,

    pub operation_id: String,

    pub state: ImportState,

    /// Records processed and buffered for commit
    pub imported_count: usize,

    /// Records skipped as duplicates
    pub skipped_count: usize,

    /// Records whose processing failed
    pub error_count: usize,

    /// Wall-clock duration of the cycle in seconds
    pub duration_secs: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Whether re-invoking with the same operation ID continues from the last checkpoint
    pub can_resume: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

/// Per-batch tallies returned by `process_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serialization_omits_empty_fields() {
        let result = ImportResult {
            success: true,
            operation_id: "op-1".into(),
            state: ImportState::Completed,
            imported_count: 3,
            skipped_count: 0,
            error_count: 0,
            duration_secs: 0.5,
            error_message: None,
            can_resume: false,
            validation_errors: Vec::new(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "completed");
        assert!(json.get("error_message").is_none());
        assert!(json.get("validation_errors").is_none());
    }
}
