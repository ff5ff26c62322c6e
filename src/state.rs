//! Persisted cluster membership.
//!
//! The durable record for a cluster is a single string: the ids of its
//! active databases, comma-joined in activation order. An empty string is a
//! valid record meaning "nothing was active"; a missing record means no
//! state was ever persisted.

use crate::error::{Result, TandemError};
use crate::types::DatabaseId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const DELIMITER: char = ',';

/// Encode active database ids in activation order.
pub fn encode<'a>(ids: impl IntoIterator<Item = &'a DatabaseId>) -> String {
    ids.into_iter()
        .map(DatabaseId::as_str)
        .collect::<Vec<_>>()
        .join(&DELIMITER.to_string())
}

/// Decode a persisted record. The empty string decodes to no ids.
pub fn decode(record: &str) -> Vec<DatabaseId> {
    if record.is_empty() {
        return Vec::new();
    }
    record.split(DELIMITER).map(DatabaseId::new).collect()
}

/// Durable storage for membership records, keyed by cluster id.
pub trait StateStore: Send + Sync {
    fn load(&self, cluster_id: &str) -> Result<Option<String>>;

    fn store(&self, cluster_id: &str, record: &str) -> Result<()>;

    fn remove(&self, cluster_id: &str) -> Result<()>;
}

/// In-process state store.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a write.
    pub fn with_record(self, cluster_id: impl Into<String>, record: impl Into<String>) -> Self {
        self.records.lock().insert(cluster_id.into(), record.into());
        self
    }

    /// Number of successful `store` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, cluster_id: &str) -> Result<Option<String>> {
        Ok(self.records.lock().get(cluster_id).cloned())
    }

    fn store(&self, cluster_id: &str, record: &str) -> Result<()> {
        self.records
            .lock()
            .insert(cluster_id.to_string(), record.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, cluster_id: &str) -> Result<()> {
        self.records.lock().remove(cluster_id);
        Ok(())
    }
}

/// State store backed by one JSON file holding `{cluster_id: record}`.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// original, so readers never observe a partially written file.
pub struct FileStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in the file.
    pub fn records(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.lock();
        self.read()
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                TandemError::StateStore(format!(
                    "Failed to parse {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, records: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self, cluster_id: &str) -> Result<Option<String>> {
        Ok(self.records()?.remove(cluster_id))
    }

    fn store(&self, cluster_id: &str, record: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut records = self.read()?;
        records.insert(cluster_id.to_string(), record.to_string());
        self.write(&records)
    }

    fn remove(&self, cluster_id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut records = self.read()?;
        if records.remove(cluster_id).is_some() {
            self.write(&records)?;
        }
        Ok(())
    }
}
