//! Persistence sessions consumed by the transaction manager.
//!
//! The real persistence layer is an external collaborator; these
//! implementations cover dry runs (`MemorySession`) and JSON-lines output
//! (`JsonlSession`).

use crate::models::{ImportError, Result};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Unit-of-work interface of a persistence backend.
pub trait Session: Send {
    /// Stage a record in the current transaction.
    fn add(&mut self, record: Value) -> Result<()>;

    /// Make every staged record durable.
    fn commit(&mut self) -> Result<()>;

    /// Discard every staged record.
    fn rollback(&mut self) -> Result<()>;

    /// Open a named savepoint.
    fn begin_nested(&mut self, name: &str) -> Result<()>;

    /// Discard records staged after `name`; the savepoint stays open.
    fn rollback_to(&mut self, name: &str) -> Result<()>;

    /// Close `name` (and any savepoint opened after it), keeping its records.
    fn release(&mut self, name: &str) -> Result<()>;
}

impl<S: Session + ?Sized> Session for Box<S> {
    fn add(&mut self, record: Value) -> Result<()> {
        (**self).add(record)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn begin_nested(&mut self, name: &str) -> Result<()> {
        (**self).begin_nested(name)
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        (**self).rollback_to(name)
    }

    fn release(&mut self, name: &str) -> Result<()> {
        (**self).release(name)
    }
}

/// Records staged in an open transaction plus its savepoint stack.
#[derive(Debug, Default)]
struct Staging {
    records: Vec<Value>,
    /// (name, staged length when opened)
    savepoints: Vec<(String, usize)>,
}

impl Staging {
    fn position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| ImportError::Transaction(format!("Unknown savepoint: {name}")))
    }

    fn begin_nested(&mut self, name: &str) {
        self.savepoints.push((name.to_string(), self.records.len()));
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        let mark = self.savepoints[idx].1;
        self.records.truncate(mark);
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    fn release(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    fn take(&mut self) -> Vec<Value> {
        self.savepoints.clear();
        std::mem::take(&mut self.records)
    }

    fn clear(&mut self) {
        self.records.clear();
        self.savepoints.clear();
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    committed: Vec<Value>,
    staging: Staging,
    commits: usize,
    rollbacks: usize,
}

/// In-memory session. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records made durable so far.
    pub fn committed(&self) -> Vec<Value> {
        self.lock().committed.clone()
    }

    pub fn staged_count(&self) -> usize {
        self.lock().staging.records.len()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.lock().rollbacks
    }
}

impl Session for MemorySession {
    fn add(&mut self, record: Value) -> Result<()> {
        self.lock().staging.records.push(record);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut store = self.lock();
        let records = store.staging.take();
        store.committed.extend(records);
        store.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let mut store = self.lock();
        store.staging.clear();
        store.rollbacks += 1;
        Ok(())
    }

    fn begin_nested(&mut self, name: &str) -> Result<()> {
        self.lock().staging.begin_nested(name);
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.lock().staging.rollback_to(name)
    }

    fn release(&mut self, name: &str) -> Result<()> {
        self.lock().staging.release(name)
    }
}

/// Session that appends committed records to a JSON-lines file.
///
/// Commits stage the batch in a temp file first, then append it to the output
/// and sync.
#[derive(Debug)]
pub struct JsonlSession {
    output_path: PathBuf,
    staging: Staging,
}

impl JsonlSession {
    pub fn new(output_path: &Path) -> Result<Self> {
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ImportError::io("creating output dir", e))?;
        }
        Ok(Self {
            output_path: output_path.to_path_buf(),
            staging: Staging::default(),
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl Session for JsonlSession {
    fn add(&mut self, record: Value) -> Result<()> {
        self.staging.records.push(record);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.staging.records.is_empty() {
            self.staging.clear();
            return Ok(());
        }

        let temp_output = self.output_path.with_extension("jsonl.tmp");
        {
            let file = File::create(&temp_output)
                .map_err(|e| ImportError::io("creating temp output", e))?;
            let mut writer = BufWriter::new(file);
            for record in &self.staging.records {
                serde_json::to_writer(&mut writer, record)?;
                writeln!(writer).map_err(|e| ImportError::io("writing temp output", e))?;
            }
            writer
                .flush()
                .map_err(|e| ImportError::io("flushing temp output", e))?;
        }

        let staged = fs::read(&temp_output).map_err(|e| ImportError::io("reading temp output", e))?;
        let mut output_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .map_err(|e| ImportError::io("opening output file", e))?;
        output_file
            .write_all(&staged)
            .map_err(|e| ImportError::io("appending to output", e))?;
        output_file
            .sync_all()
            .map_err(|e| ImportError::io("syncing output", e))?;
        fs::remove_file(&temp_output).map_err(|e| ImportError::io("removing temp output", e))?;

        let written = self.staging.take().len();
        debug!(records = written, path = %self.output_path.display(), "Records appended");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.staging.clear();
        Ok(())
    }

    fn begin_nested(&mut self, name: &str) -> Result<()> {
        self.staging.begin_nested(name);
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.staging.rollback_to(name)
    }

    fn release(&mut self, name: &str) -> Result<()> {
        self.staging.release(name)
    }
}
