use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{MatchError, Result};

/// Opaque record returned for a confirmed identity.
pub type Record = Map<String, Value>;

/// Field holding the store's own identifier, never returned to callers.
pub const DEFAULT_INTERNAL_ID_FIELD: &str = "_id";

/// Lookup threads allowed in flight at once, including ones abandoned after
/// a timeout. Beyond this the store is reported unavailable without spawning.
pub const MAX_PENDING_LOOKUPS: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Unavailable(String),
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} lookups still pending")]
    Saturated(usize),
}

/// Exact-key record lookup by identity id.
///
/// `Ok(None)` means the store answered and has no such key.
pub trait RecordStore: Send + Sync {
    fn find(&self, identity_id: &str) -> Result<Option<Record>, StoreError>;
}

/// In-memory store, keyed by one field of each record.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: HashMap<String, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `records` by the string value of `key_field`; records without it are dropped.
    pub fn from_records(records: impl IntoIterator<Item = Record>, key_field: &str) -> Self {
        let records = records
            .into_iter()
            .filter_map(|r| {
                let key = r.get(key_field)?.as_str()?.to_string();
                Some((key, r))
            })
            .collect();
        Self { records }
    }

    pub fn insert(&mut self, identity_id: impl Into<String>, record: Record) {
        self.records.insert(identity_id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemoryStore {
    fn find(&self, identity_id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.get(identity_id).cloned())
    }
}

/// One JSON object per identity at `<dir>/<identity_id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, identity_id: &str) -> Option<PathBuf> {
        let valid = !identity_id.is_empty()
            && !identity_id.starts_with('.')
            && !identity_id.contains(['/', '\\', '\0']);
        valid.then(|| self.dir.join(format!("{identity_id}.json")))
    }
}

impl RecordStore for DirectoryStore {
    fn find(&self, identity_id: &str) -> Result<Option<Record>, StoreError> {
        if !self.dir.is_dir() {
            return Err(StoreError::Unavailable(
                "record directory missing".to_string(),
            ));
        }
        let Some(path) = self.record_path(identity_id) else {
            return Ok(None);
        };

        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                log::debug!("reading {}: {e}", path.display());
                return Err(StoreError::Unavailable(format!("read failed: {}", e.kind())));
            }
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            log::debug!("parsing {}: {e}", path.display());
            StoreError::Unavailable("corrupt record".to_string())
        })
    }
}

/// Fetches records for confirmed identities only.
#[derive(Clone)]
pub struct RecordResolver {
    store: Arc<dyn RecordStore>,
    timeout: Option<Duration>,
    internal_id_field: String,
    pending: Arc<AtomicUsize>,
}

impl RecordResolver {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            timeout: None,
            pending: Arc::new(AtomicUsize::new(0)),
            internal_id_field: DEFAULT_INTERNAL_ID_FIELD.to_string(),
        }
    }

    /// Stop waiting for the store after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_internal_id_field(mut self, field: impl Into<String>) -> Self {
        self.internal_id_field = field.into();
        self
    }

    /// `Ok(None)` when not confirmed (no lookup happens) or when the store
    /// has no record for `identity_id`. Store failures are
    /// [`MatchError::RecordStoreUnavailable`].
    pub fn resolve(&self, identity_id: &str, confirmed: bool) -> Result<Option<Record>> {
        if !confirmed {
            return Ok(None);
        }

        let found = self.lookup(identity_id).map_err(|e| {
            log::warn!("record lookup for {identity_id} failed: {e}");
            MatchError::RecordStoreUnavailable(e.to_string())
        })?;

        Ok(found.map(|mut record| {
            record.remove(&self.internal_id_field);
            record
        }))
    }

    fn lookup(&self, identity_id: &str) -> Result<Option<Record>, StoreError> {
        let Some(timeout) = self.timeout else {
            return self.store.find(identity_id);
        };

        let slot = PendingSlot::acquire(&self.pending)?;
        let (tx, rx) = mpsc::channel();
        let store = Arc::clone(&self.store);
        let key = identity_id.to_string();
        // On timeout the worker is left to finish on its own; its send fails silently.
        std::thread::Builder::new()
            .name("record-lookup".to_string())
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(store.find(&key));
            })
            .map_err(|e| StoreError::Unavailable(format!("spawning lookup: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Unavailable(
                "lookup worker exited".to_string(),
            )),
        }
    }
}

/// One in-flight lookup; released when the worker thread ends.
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn acquire(pending: &Arc<AtomicUsize>) -> Result<Self, StoreError> {
        pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING_LOOKUPS).then_some(n + 1)
            })
            .map_err(StoreError::Saturated)?;
        Ok(Self(Arc::clone(pending)))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
