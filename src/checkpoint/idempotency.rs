//! Content-fingerprint deduplication for imported records.
//!
//! Epistemic foundation:
//! - K_i: Fingerprint = SHA-256 of the canonical (recursively key-sorted) JSON form
//! - K_i: A fingerprint in the cache has been accepted once per guard lifetime
//! - B_i: Store file may be missing or corrupt → start empty, never fail construction
//! - I^B: Crash between reserve and flush → unflushed fingerprints are reprocessed on resume

use crate::models::{ImportError, Result};
use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Guard counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdempotencyStats {
    /// Fingerprints accepted during this guard's lifetime
    pub processed_count: u64,
    /// Repeats rejected during this guard's lifetime
    pub duplicate_count: u64,
    /// Fingerprints currently known (including loaded ones)
    pub cache_size: usize,
    /// Accepted but not yet flushed
    pub pending_count: usize,
}

#[derive(Debug, Default)]
struct GuardInner {
    cache: BTreeMap<String, String>,
    pending: HashSet<String>,
    processed_count: u64,
    duplicate_count: u64,
}

/// Durable set of accepted record fingerprints for one operation.
#[derive(Debug)]
pub struct IdempotencyGuard {
    path: PathBuf,
    inner: Mutex<GuardInner>,
}

impl IdempotencyGuard {
    /// Open the guard stored at `<storage_dir>/<operation_id>.json`.
    pub fn new(storage_dir: &Path, operation_id: &str) -> Result<Self> {
        fs::create_dir_all(storage_dir)
            .map_err(|e| ImportError::io("creating idempotency dir", e))?;

        let path = storage_dir.join(format!("{operation_id}.json"));
        let cache = Self::load(&path);
        info!(path = %path.display(), fingerprints = cache.len(), "Idempotency guard loaded");

        Ok(Self {
            path,
            inner: Mutex::new(GuardInner {
                cache,
                ..Default::default()
            }),
        })
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        if !path.exists() {
            return BTreeMap::new();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable idempotency store, starting empty");
                return BTreeMap::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Corrupt idempotency store, starting empty");
            BTreeMap::new()
        })
    }

    fn lock(&self) -> MutexGuard<'_, GuardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deterministic fingerprint of `item`, independent of map ordering.
    pub fn fingerprint<T: Serialize + ?Sized>(item: &T) -> Result<String> {
        let value = serde_json::to_value(item)?;
        let canonical = serde_json::to_string(&Canonical(&value))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// True iff `item` has not been accepted yet. Does not mutate the guard.
    pub fn should_process<T: Serialize + ?Sized>(&self, item: &T) -> Result<bool> {
        let fingerprint = Self::fingerprint(item)?;
        Ok(!self.lock().cache.contains_key(&fingerprint))
    }

    /// Record `item` as accepted, optionally flushing immediately.
    ///
    /// Returns false (and counts a duplicate) when it was already accepted.
    pub fn mark_processed<T: Serialize + ?Sized>(&self, item: &T, persist: bool) -> Result<bool> {
        let fingerprint = Self::fingerprint(item)?;
        let inserted = self.insert(fingerprint);
        if persist {
            self.flush()?;
        }
        Ok(inserted)
    }

    /// Atomically check and record `item`.
    ///
    /// Returns the fingerprint when this caller won the reservation, `None`
    /// for a duplicate.
    pub fn try_reserve<T: Serialize + ?Sized>(&self, item: &T) -> Result<Option<String>> {
        let fingerprint = Self::fingerprint(item)?;
        Ok(self.insert(fingerprint.clone()).then_some(fingerprint))
    }

    fn insert(&self, fingerprint: String) -> bool {
        let mut inner = self.lock();
        if inner.cache.contains_key(&fingerprint) {
            inner.duplicate_count += 1;
            debug!(fingerprint = %fingerprint, "Duplicate record");
            return false;
        }
        inner.cache.insert(fingerprint.clone(), fingerprint.clone());
        inner.pending.insert(fingerprint);
        inner.processed_count += 1;
        true
    }

    /// Undo an unflushed reservation whose processing failed.
    pub fn release(&self, fingerprint: &str) -> bool {
        let mut inner = self.lock();
        if !inner.pending.remove(fingerprint) {
            return false;
        }
        inner.cache.remove(fingerprint);
        inner.processed_count = inner.processed_count.saturating_sub(1);
        true
    }

    /// Forget every fingerprint accepted since the last flush.
    pub fn discard_pending(&self) -> usize {
        let mut inner = self.lock();
        let pending: Vec<String> = inner.pending.drain().collect();
        for fingerprint in &pending {
            inner.cache.remove(fingerprint);
        }
        inner.processed_count = inner.processed_count.saturating_sub(pending.len() as u64);
        if !pending.is_empty() {
            warn!(discarded = pending.len(), "Discarded unflushed fingerprints");
        }
        pending.len()
    }

    /// Persist the cache (atomic write-then-rename).
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        let content = serde_json::to_string_pretty(&inner.cache)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .map_err(|e| ImportError::io("writing idempotency store", e))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| ImportError::io("renaming idempotency store", e))?;

        inner.pending.clear();
        debug!(fingerprints = inner.cache.len(), "Idempotency store flushed");
        Ok(())
    }

    /// Clear memory and delete the backing store.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock();
        *inner = GuardInner::default();
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| ImportError::io("removing idempotency store", e))?;
        }
        info!(path = %self.path.display(), "Idempotency guard reset");
        Ok(())
    }

    pub fn stats(&self) -> IdempotencyStats {
        let inner = self.lock();
        IdempotencyStats {
            processed_count: inner.processed_count,
            duplicate_count: inner.duplicate_count,
            cache_size: inner.cache.len(),
            pending_count: inner.pending.len(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Serializes a JSON value with object keys sorted at every level.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::{SerializeMap, SerializeSeq};

        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            }
            Value::Array(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&Canonical(item))?;
                }
                out.end()
            }
            other => other.serialize(serializer),
        }
    }
}
