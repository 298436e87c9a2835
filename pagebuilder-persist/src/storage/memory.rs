//! Process-local engine.
//!
//! Same contract as the RocksDB engine, held entirely in memory. Every
//! database opened through one `MemoryEngine` outlives its connections,
//! so dropping a [`crate::Database`] and opening a new one against the
//! same engine behaves like a page reload.
//!
//! [`Faults`] injects failures at each completion point (open, request,
//! commit) and can slow opens and commits down to widen race windows.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::engine::{
    index_entries, Connection, Engine, EngineError, IndexSpec, Key, Request, Response,
    Transaction, TxMode, UpgradeContext, UpgradeFn, Value,
};

/// Failure injection switches. All off by default.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub fail_open: bool,
    pub fail_request: bool,
    pub fail_commit: bool,
    pub abort_commit: bool,
    pub open_delay: Option<Duration>,
    pub commit_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
struct MemPartition {
    indexes: Vec<IndexSpec>,
    records: BTreeMap<Key, Value>,
}

#[derive(Debug, Clone, Default)]
struct DbState {
    version: u32,
    partitions: BTreeMap<String, MemPartition>,
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    state: RwLock<DbState>,
}

impl MemoryDatabase {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, DbState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DbState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared {
    faults: Mutex<Faults>,
    open_attempts: AtomicUsize,
    committed_writes: AtomicUsize,
}

impl Shared {
    fn faults(&self) -> Faults {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct MemoryEngine {
    supported: bool,
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            supported: true,
            databases: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared {
                faults: Mutex::new(Faults::default()),
                open_attempts: AtomicUsize::new(0),
                committed_writes: AtomicUsize::new(0),
            }),
        }
    }

    /// An engine that fails feature detection.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        *self
            .shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = faults;
    }

    /// Number of times `open` reached the engine.
    pub fn open_attempts(&self) -> usize {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    /// Number of write transactions that committed.
    pub fn committed_writes(&self) -> usize {
        self.shared.committed_writes.load(Ordering::SeqCst)
    }

    /// Stored version of a database, if it exists.
    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.database(name).map(|db| db.read().version)
    }

    /// Declared indexes on a partition.
    pub fn indexes(&self, name: &str, partition: &str) -> Vec<IndexSpec> {
        self.database(name)
            .and_then(|db| db.read().partitions.get(partition).map(|p| p.indexes.clone()))
            .unwrap_or_default()
    }

    fn database(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl Engine for MemoryEngine {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: &mut UpgradeFn<'_>,
    ) -> Result<Arc<dyn Connection>, EngineError> {
        if !self.supported {
            return Err(EngineError::Unavailable("memory engine disabled".into()));
        }
        self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);

        let faults = self.shared.faults();
        if let Some(delay) = faults.open_delay {
            std::thread::sleep(delay);
        }
        if faults.fail_open {
            return Err(EngineError::Io("injected open failure".into()));
        }

        let db = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone();

        let version = {
            let mut state = db.write();
            let stored = state.version;
            let target = version.unwrap_or(stored.max(1));
            if target < stored {
                return Err(EngineError::VersionMismatch {
                    requested: target,
                    stored,
                });
            }
            if target > stored {
                // Upgrade against a copy so a failed callback leaves the
                // stored schema untouched.
                let mut ctx = MemUpgrade {
                    old_version: stored,
                    new_version: target,
                    state: state.clone(),
                };
                upgrade(&mut ctx)?;
                ctx.state.version = target;
                *state = ctx.state;
                log::debug!("Memory database '{name}' upgraded {stored} → {target}");
            }
            target
        };

        Ok(Arc::new(MemoryConnection {
            name: name.to_string(),
            version,
            db,
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemUpgrade {
    old_version: u32,
    new_version: u32,
    state: DbState,
}

impl UpgradeContext for MemUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn has_partition(&self, name: &str) -> bool {
        self.state.partitions.contains_key(name)
    }

    fn create_partition(&mut self, name: &str) -> Result<(), EngineError> {
        self.state.partitions.entry(name.to_string()).or_default();
        Ok(())
    }

    fn index_names(&self, partition: &str) -> Result<Vec<String>, EngineError> {
        self.state
            .partitions
            .get(partition)
            .map(|p| p.indexes.iter().map(|i| i.name.clone()).collect())
            .ok_or_else(|| EngineError::UnknownPartition(partition.to_string()))
    }

    fn create_index(&mut self, partition: &str, index: &IndexSpec) -> Result<(), EngineError> {
        let part = self
            .state
            .partitions
            .get_mut(partition)
            .ok_or_else(|| EngineError::UnknownPartition(partition.to_string()))?;
        if part.indexes.iter().any(|i| i.name == index.name) {
            return Ok(());
        }
        if index.unique {
            let mut seen = Vec::new();
            for value in part.records.values() {
                if let Some(key) = index.key_path.evaluate(value) {
                    if seen.contains(&key) {
                        return Err(EngineError::Constraint {
                            index: index.name.clone(),
                            key,
                        });
                    }
                    seen.push(key);
                }
            }
        }
        part.indexes.push(index.clone());
        Ok(())
    }
}

pub struct MemoryConnection {
    name: String,
    version: u32,
    db: Arc<MemoryDatabase>,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn partitions(&self) -> Vec<String> {
        self.db.read().partitions.keys().cloned().collect()
    }

    fn begin(&self, partition: &str, mode: TxMode) -> Result<Box<dyn Transaction>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        if !self.db.read().partitions.contains_key(partition) {
            return Err(EngineError::UnknownPartition(partition.to_string()));
        }
        Ok(Box::new(MemoryTransaction {
            db: Arc::clone(&self.db),
            shared: Arc::clone(&self.shared),
            partition: partition.to_string(),
            mode,
            staged: Vec::new(),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    db: Arc<MemoryDatabase>,
    shared: Arc<Shared>,
    partition: String,
    mode: TxMode,
    staged: Vec<Request>,
}

impl MemoryTransaction {
    fn partition<'a>(&self, state: &'a DbState) -> Result<&'a MemPartition, EngineError> {
        state
            .partitions
            .get(&self.partition)
            .ok_or_else(|| EngineError::UnknownPartition(self.partition.clone()))
    }
}

/// Apply one write to a partition, enforcing unique indexes.
fn apply(part: &mut MemPartition, request: &Request) -> Result<Response, EngineError> {
    match request {
        Request::Put { key, value } => {
            for (spec, index_key) in index_entries(&part.indexes, value) {
                if !spec.unique {
                    continue;
                }
                let taken = part.records.iter().any(|(k, v)| {
                    k != key && spec.key_path.evaluate(v).as_ref() == Some(&index_key)
                });
                if taken {
                    return Err(EngineError::Constraint {
                        index: spec.name.clone(),
                        key: index_key,
                    });
                }
            }
            part.records.insert(key.clone(), value.clone());
            Ok(Response::Key(key.clone()))
        }
        Request::Delete(key) => {
            part.records.remove(key);
            Ok(Response::Done)
        }
        Request::Clear => {
            part.records.clear();
            Ok(Response::Done)
        }
        other => Err(EngineError::Io(format!("'{}' is not a write", other.name()))),
    }
}

impl Transaction for MemoryTransaction {
    fn execute(&mut self, request: Request) -> Result<Response, EngineError> {
        if self.shared.faults().fail_request {
            return Err(EngineError::Io("injected request failure".into()));
        }

        let state = self.db.read();
        let part = self.partition(&state)?;

        match request {
            Request::Get(key) => Ok(Response::Value(part.records.get(&key).cloned())),
            Request::GetAll => Ok(Response::Values(part.records.values().cloned().collect())),
            Request::GetAllKeys => Ok(Response::Keys(part.records.keys().cloned().collect())),
            Request::IndexGetAll { index, key } => {
                let spec = part.indexes.iter().find(|i| i.name == index).ok_or_else(|| {
                    EngineError::UnknownIndex {
                        partition: self.partition.clone(),
                        index: index.clone(),
                    }
                })?;
                let values = part
                    .records
                    .values()
                    .filter(|v| spec.key_path.evaluate(v).as_ref() == Some(&key))
                    .cloned()
                    .collect();
                Ok(Response::Values(values))
            }
            write => {
                if self.mode == TxMode::ReadOnly {
                    return Err(EngineError::ReadOnly);
                }
                // Validate against committed state plus earlier staged writes.
                let mut working = part.clone();
                drop(state);
                for staged in &self.staged {
                    apply(&mut working, staged)?;
                }
                let response = apply(&mut working, &write)?;
                self.staged.push(write);
                Ok(response)
            }
        }
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let faults = self.shared.faults();
        if let Some(delay) = faults.commit_delay {
            std::thread::sleep(delay);
        }
        if faults.abort_commit {
            return Err(EngineError::Aborted("injected abort".into()));
        }
        if faults.fail_commit {
            return Err(EngineError::Io("injected commit failure".into()));
        }
        if self.staged.is_empty() {
            return Ok(());
        }

        let mut state = self.db.write();
        let mut working = self.partition(&state)?.clone();
        for request in &self.staged {
            apply(&mut working, request)?;
        }
        state.partitions.insert(self.partition.clone(), working);
        self.shared.committed_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        log::debug!(
            "Discarding {} staged writes on '{}'",
            self.staged.len(),
            self.partition
        );
    }
}
