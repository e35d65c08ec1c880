//! Persisted live state
//!
//! The state store remembers, per resource id, what the engine last applied:
//! the provider-assigned id, the property templates, the recorded
//! dependencies and any provider outputs. Secret values never reach it
//! because templates keep `${secret.*}` placeholders unexpanded.
//!
//! Only the executor writes to a store. Writes to the same id are serialized
//! by a per-id lock; every write is flushed before it returns.

use crate::error::StateStoreError;
use crate::types::Properties;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

/// What the engine knows about one live resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStateRecord {
    pub resource_id: String,
    /// Kept as text so records written by other versions still load
    pub resource_type: String,
    pub provider_assigned_id: String,
    /// Property templates as last applied
    pub last_applied_properties: Properties,
    #[serde(default)]
    pub parent: Option<String>,
    /// All dependencies at the time of the last apply
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Attributes returned by the provider
    #[serde(default)]
    pub outputs: Properties,
    pub last_applied_at: DateTime<Utc>,
}

/// Point-in-time copy of all records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub resources: BTreeMap<String, LiveStateRecord>,
}

impl StateSnapshot {
    pub fn get(&self, id: &str) -> Option<&LiveStateRecord> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Storage for live state records
pub trait StateStore: Send + Sync {
    /// Copy of every record
    fn snapshot(&self) -> Result<StateSnapshot, StateStoreError>;

    fn get(&self, id: &str) -> Result<Option<LiveStateRecord>, StateStoreError>;

    /// Insert or replace a record and flush it
    fn put(&self, record: LiveStateRecord) -> Result<(), StateStoreError>;

    /// Remove a record and flush; removing a missing id is not an error
    fn remove(&self, id: &str) -> Result<(), StateStoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-resource-id locks
#[derive(Debug, Default)]
struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    fn handle(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(lock(&self.locks).entry(id.to_string()).or_default())
    }

    /// Forget the lock of a removed id unless a caller still holds it
    fn prune(&self, id: &str) {
        let mut locks = lock(&self.locks);
        if locks
            .get(id)
            .is_some_and(|handle| Arc::strong_count(handle) == 1)
        {
            locks.remove(id);
        }
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// Serialized form of the state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// Incremented on every write
    pub serial: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub resources: BTreeMap<String, LiveStateRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    /// Read a state file without taking the lock
    pub fn read(path: &Path) -> Result<Self, StateStoreError> {
        if !path.exists() {
            log::debug!("State file does not exist, using empty state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: Self =
            serde_json::from_str(&content).map_err(|e| StateStoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if document.version > STATE_VERSION {
            return Err(StateStoreError::Corrupt {
                path: path.to_path_buf(),
                message: format!(
                    "state version {} is newer than supported version {STATE_VERSION}",
                    document.version
                ),
            });
        }
        Ok(document)
    }
}

impl From<StateDocument> for StateSnapshot {
    fn from(document: StateDocument) -> Self {
        Self {
            resources: document.resources,
        }
    }
}

/// State persisted to a JSON file, guarded by a sibling `.lock` file.
///
/// Lifecycle: [`FileStateStore::open`] at process start, a flush after every
/// record write, [`FileStateStore::close`] (or drop) at exit.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    document: Mutex<StateDocument>,
    locks: ResourceLocks,
}

impl FileStateStore {
    /// Open the store, creating parent directories and taking the lock
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StateStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = lock_path_for(&path);
        acquire_lock(&lock_path)?;

        let document = match StateDocument::read(&path) {
            Ok(document) => document,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e);
            }
        };

        log::debug!(
            "Opened state {} (serial {}, {} records)",
            path.display(),
            document.serial,
            document.resources.len()
        );

        Ok(Self {
            path,
            lock_path,
            document: Mutex::new(document),
            locks: ResourceLocks::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn serial(&self) -> u64 {
        lock(&self.document).serial
    }

    /// Flush and release the lock
    pub fn close(self) -> Result<(), StateStoreError> {
        let result = {
            let document = lock(&self.document);
            self.persist(&document)
        };
        // Drop removes the lock file
        drop(self);
        result
    }

    /// Write the document atomically: temp file, then rename
    fn persist(&self, document: &StateDocument) -> Result<(), StateStoreError> {
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateStoreError::Serialize(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateStoreError::Io { path, source }
        };

        fs::write(&tmp, content).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }

    /// Apply a mutation and flush; the mutation is rolled back if the flush fails
    fn mutate<F>(&self, id: &str, change: F) -> Result<(), StateStoreError>
    where
        F: FnOnce(&mut BTreeMap<String, LiveStateRecord>) -> Option<LiveStateRecord>,
    {
        let handle = self.locks.handle(id);
        let _id_guard = lock(&handle);

        let mut document = lock(&self.document);
        let previous = change(&mut document.resources);
        let previous_updated = document.last_updated;
        document.serial += 1;
        document.last_updated = Utc::now();

        if let Err(e) = self.persist(&document) {
            document.serial -= 1;
            document.last_updated = previous_updated;
            match previous {
                Some(record) => {
                    document.resources.insert(id.to_string(), record);
                }
                None => {
                    document.resources.remove(id);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn snapshot(&self) -> Result<StateSnapshot, StateStoreError> {
        Ok(StateSnapshot {
            resources: lock(&self.document).resources.clone(),
        })
    }

    fn get(&self, id: &str) -> Result<Option<LiveStateRecord>, StateStoreError> {
        Ok(lock(&self.document).resources.get(id).cloned())
    }

    fn put(&self, record: LiveStateRecord) -> Result<(), StateStoreError> {
        let id = record.resource_id.clone();
        self.mutate(&id, |resources| resources.insert(id.clone(), record))?;
        log::debug!("Recorded state for {id}");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StateStoreError> {
        if !lock(&self.document).resources.contains_key(id) {
            return Ok(());
        }
        // Re-inserting the removed record is the rollback
        self.mutate(id, |resources| resources.remove(id))?;
        self.locks.prune(id);
        log::debug!("Removed state for {id}");
        Ok(())
    }
}

impl Drop for FileStateStore {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path)
            && e.kind() != ErrorKind::NotFound
        {
            log::warn!("Failed to release state lock {}: {e}", self.lock_path.display());
        }
    }
}

/// Path of the lock file guarding a state file
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn acquire_lock(lock_path: &Path) -> Result<(), StateStoreError> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(StateStoreError::Locked(lock_path.to_path_buf()))
        }
        Err(source) => Err(StateStoreError::Io {
            path: lock_path.to_path_buf(),
            source,
        }),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// State held in memory only, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    resources: Mutex<BTreeMap<String, LiveStateRecord>>,
    locks: ResourceLocks,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a snapshot
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            resources: Mutex::new(snapshot.resources),
            locks: ResourceLocks::default(),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn snapshot(&self) -> Result<StateSnapshot, StateStoreError> {
        Ok(StateSnapshot {
            resources: lock(&self.resources).clone(),
        })
    }

    fn get(&self, id: &str) -> Result<Option<LiveStateRecord>, StateStoreError> {
        Ok(lock(&self.resources).get(id).cloned())
    }

    fn put(&self, record: LiveStateRecord) -> Result<(), StateStoreError> {
        let handle = self.locks.handle(&record.resource_id);
        let _id_guard = lock(&handle);
        lock(&self.resources).insert(record.resource_id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StateStoreError> {
        {
            let handle = self.locks.handle(id);
            let _id_guard = lock(&handle);
            lock(&self.resources).remove(id);
        }
        self.locks.prune(id);
        Ok(())
    }
}
