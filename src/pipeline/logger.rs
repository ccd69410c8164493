//! Per-operation JSON-lines log.
//!
//! Every entry is appended to `<log_dir>/<operation_id>.log.jsonl` and mirrored
//! to `tracing`. Write failures are reported through `tracing` and never
//! propagate to the import.

use crate::models::{ImportError, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Appends structured entries for one operation.
#[derive(Debug)]
pub struct StructuredLogger {
    operation_id: String,
    path: PathBuf,
    file: Mutex<File>,
    context: Mutex<Map<String, Value>>,
}

impl StructuredLogger {
    pub fn new(log_dir: &Path, operation_id: &str) -> Result<Self> {
        fs::create_dir_all(log_dir).map_err(|e| ImportError::io("creating log dir", e))?;
        let path = log_dir.join(format!("{operation_id}.log.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ImportError::io("opening structured log", e))?;

        Ok(Self {
            operation_id: operation_id.to_string(),
            path,
            file: Mutex::new(file),
            context: Mutex::new(Map::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attach a key to every subsequent entry.
    pub fn set_context(&self, key: &str, value: impl Into<Value>) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.into());
    }

    pub fn clear_context(&self) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn debug(&self, message: &str, extra: Value) {
        self.log(LogLevel::Debug, message, extra);
    }

    pub fn info(&self, message: &str, extra: Value) {
        self.log(LogLevel::Info, message, extra);
    }

    pub fn warn(&self, message: &str, extra: Value) {
        self.log(LogLevel::Warn, message, extra);
    }

    pub fn error(&self, message: &str, extra: Value) {
        self.log(LogLevel::Error, message, extra);
    }

    /// Write one entry. `extra` object fields are merged at the top level.
    pub fn log(&self, level: LogLevel, message: &str, extra: Value) {
        let context = Value::Object(
            self.context
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );

        let mut entry = Map::new();
        entry.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        entry.insert("level".into(), serde_json::to_value(level).unwrap_or(Value::Null));
        entry.insert("message".into(), Value::String(message.to_string()));
        entry.insert("operation_id".into(), Value::String(self.operation_id.clone()));
        entry.insert("context".into(), context);
        match extra {
            Value::Object(fields) => {
                for (key, value) in fields {
                    entry.entry(key).or_insert(value);
                }
            }
            Value::Null => {}
            other => {
                entry.insert("extra".into(), other);
            }
        }
        let entry = Value::Object(entry);

        match level {
            LogLevel::Debug => debug!(operation_id = %self.operation_id, entry = %entry, "{message}"),
            LogLevel::Info => info!(operation_id = %self.operation_id, entry = %entry, "{message}"),
            LogLevel::Warn => warn!(operation_id = %self.operation_id, entry = %entry, "{message}"),
            LogLevel::Error => error!(operation_id = %self.operation_id, entry = %entry, "{message}"),
        }

        self.append(&entry);
    }

    fn append(&self, entry: &Value) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{entry}") {
            warn!(path = %self.path.display(), error = %e, "Structured log write failed");
        }
    }
}
