//! Pre-flight validation of import files.
//!
//! Validators report a human-readable message; the orchestrator collects them
//! into `ImportResult::validation_errors`.

use crate::models::ImportConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

/// File-level checks (existence, readability, size, type).
pub trait FileValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), String>;
}

/// Record-shape checks for a table type.
pub trait StructureValidator: Send + Sync {
    fn validate(&self, path: &Path, table_type: &str) -> Result<(), String>;
}

/// Checks that the path is a readable, non-empty file with an accepted extension.
#[derive(Debug, Clone, Default)]
pub struct BasicFileValidator {
    allowed_extensions: Vec<String>,
}

impl BasicFileValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ImportConfig) -> Self {
        Self::new().with_allowed_extensions(config.validation.allowed_extensions.iter().cloned())
    }

    /// Restrict accepted extensions (case-insensitive, without the dot).
    pub fn with_allowed_extensions(mut self, extensions: impl IntoIterator<Item = String>) -> Self {
        self.allowed_extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }
}

impl FileValidator for BasicFileValidator {
    fn validate(&self, path: &Path) -> Result<(), String> {
        if !path.exists() {
            return Err(format!("File not found: {}", path.display()));
        }
        let metadata = fs::metadata(path)
            .map_err(|e| format!("Cannot stat file {}: {e}", path.display()))?;
        if !metadata.is_file() {
            return Err(format!("Not a regular file: {}", path.display()));
        }
        if metadata.len() == 0 {
            return Err(format!("File is empty: {}", path.display()));
        }
        File::open(path).map_err(|e| format!("File not readable: {} ({e})", path.display()))?;

        if !self.allowed_extensions.is_empty() {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if !self.allowed_extensions.contains(&extension) {
                return Err(format!(
                    "Unsupported file type '{extension}' for {} (allowed: {})",
                    path.display(),
                    self.allowed_extensions.join(", ")
                ));
            }
        }
        Ok(())
    }
}

/// Checks every JSON-lines record against the required fields of its table type.
///
/// Table types without a configured schema are accepted as-is.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    schemas: HashMap<String, Vec<String>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ImportConfig) -> Self {
        let schemas = config
            .schemas
            .iter()
            .map(|(table, schema)| (table.clone(), schema.required_fields.clone()))
            .collect();
        Self { schemas }
    }

    pub fn with_schema(
        mut self,
        table_type: &str,
        required_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.schemas.insert(
            table_type.to_string(),
            required_fields.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl StructureValidator for SchemaValidator {
    fn validate(&self, path: &Path, table_type: &str) -> Result<(), String> {
        let Some(required) = self.schemas.get(table_type).filter(|r| !r.is_empty()) else {
            return Ok(());
        };

        let file = File::open(path).map_err(|e| format!("Cannot open {}: {e}", path.display()))?;
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| format!("Cannot read {}: {e}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line)
                .map_err(|e| format!("Line {}: invalid JSON: {e}", line_num + 1))?;
            let Some(fields) = record.as_object() else {
                return Err(format!("Line {}: expected a JSON object", line_num + 1));
            };

            let missing: Vec<&str> = required
                .iter()
                .filter(|f| !fields.contains_key(f.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(format!(
                    "Line {}: missing required field(s) for '{table_type}': {}",
                    line_num + 1,
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file() {
        let err = BasicFileValidator::new()
            .validate(Path::new("/nonexistent/missing.xlsx"))
            .unwrap_err();
        assert!(err.contains("File not found"));
    }

    #[test]
    fn test_empty_file_and_directory_rejected() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.jsonl");
        fs::write(&empty, "").unwrap();

        let validator = BasicFileValidator::new();
        assert!(validator.validate(&empty).unwrap_err().contains("empty"));
        assert!(validator.validate(dir.path()).unwrap_err().contains("Not a regular file"));
    }

    #[test]
    fn test_extension_allow_list() {
        let dir = TempDir::new().unwrap();
        let csv = dir.path().join("data.CSV");
        let txt = dir.path().join("data.txt");
        fs::write(&csv, "a,b\n").unwrap();
        fs::write(&txt, "a,b\n").unwrap();

        let validator =
            BasicFileValidator::new().with_allowed_extensions([".csv".to_string(), "jsonl".to_string()]);
        assert!(validator.validate(&csv).is_ok());
        assert!(validator.validate(&txt).unwrap_err().contains("Unsupported file type"));
    }

    #[test]
    fn test_schema_required_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("employees.jsonl");
        fs::write(
            &path,
            "{\"id\": 1, \"name\": \"Aiko\"}\n\n{\"id\": 2}\n",
        )
        .unwrap();

        let validator = SchemaValidator::new().with_schema("employees", ["id", "name"]);
        let err = validator.validate(&path, "employees").unwrap_err();
        assert!(err.starts_with("Line 3"));
        assert!(err.contains("name"));

        // No schema configured for this table type
        assert!(validator.validate(&path, "departments").is_ok());
    }
}
