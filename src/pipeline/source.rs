//! Record sources feeding the orchestrator.

use crate::models::{ImportError, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Reads the raw records of an import file.
pub trait RecordSource: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<Value>>;
}

/// One JSON value per non-blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSource;

impl RecordSource for JsonLinesSource {
    fn read(&self, path: &Path) -> Result<Vec<Value>> {
        let file = File::open(path).map_err(|e| ImportError::io("opening import file", e))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ImportError::io("reading import file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line)
                .map_err(|e| ImportError::Parse(format!("Line {}: {}", line_num + 1, e)))?;
            records.push(record);
        }

        info!(count = records.len(), path = %path.display(), "Loaded records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reads_records_skipping_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        fs::write(&path, "{\"id\": 1}\n\n  \n{\"id\": 2}\n").unwrap();

        let records = JsonLinesSource.read(&path).unwrap();
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[test]
    fn test_parse_error_names_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        fs::write(&path, "{\"id\": 1}\nnot json\n").unwrap();

        match JsonLinesSource.read(&path) {
            Err(ImportError::Parse(msg)) => assert!(msg.starts_with("Line 2")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
