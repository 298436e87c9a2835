//! RocksDB-backed engine.
//!
//! One RocksDB instance per database, stored at `<root>/<name>`.
//!
//! Column families:
//! - `<partition>`: one per declared partition; key = encoded [`Key`],
//!   value = JSON (LZ4 compressed)
//! - `__meta`: the schema catalog (bincode: version + partitions + indexes)
//! - `__index`: secondary index entries,
//!   key = `partition ∥ index ∥ index key ∥ primary key`, empty value
//!
//! A read-write transaction is a single `WriteBatch`, so every commit is
//! atomic: a record and its index entries land together or not at all.

use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::engine::{
    index_entries, Connection, Engine, EngineError, IndexSpec, Key, Request, Response,
    Transaction, TxMode, UpgradeContext, UpgradeFn, Value,
};

type Db = DBWithThreadMode<MultiThreaded>;

/// Reserved column family names.
const CF_DEFAULT: &str = "default";
const CF_META: &str = "__meta";
const CF_INDEX: &str = "__index";

const CATALOG_KEY: &[u8] = b"catalog";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Root directory; each database is a subdirectory
    pub path: PathBuf,
    /// Block cache size in bytes per column family (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: true, so a resolved `set` is durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("page_builder_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

// ─── Catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionEntry {
    name: String,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    version: u32,
    partitions: Vec<PartitionEntry>,
}

impl Catalog {
    fn load(db: &Db) -> Result<Self, EngineError> {
        let cf = cf_handle(db, CF_META)?;
        match db.get_cf(&cf, CATALOG_KEY)? {
            Some(bytes) => {
                let (catalog, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| EngineError::Corrupted(e.to_string()))?;
                Ok(catalog)
            }
            None => Ok(Self::default()),
        }
    }

    fn save(&self, db: &Db, sync: bool) -> Result<(), EngineError> {
        let cf = cf_handle(db, CF_META)?;
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::Corrupted(e.to_string()))?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        db.put_cf_opt(&cf, CATALOG_KEY, bytes, &write_opts)?;
        Ok(())
    }

    fn partition(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

// ─── Encoding helpers ─────────────────────────────────────────────────

fn encode_value(value: &Value) -> Result<Vec<u8>, EngineError> {
    let json = serde_json::to_vec(value).map_err(|e| EngineError::Corrupted(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_value(bytes: &[u8]) -> Result<Value, EngineError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| EngineError::Corrupted(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| EngineError::Corrupted(e.to_string()))
}

fn decode_key(bytes: &[u8]) -> Result<Key, EngineError> {
    Key::decode(bytes).ok_or_else(|| EngineError::Corrupted("undecodable key".into()))
}

/// `partition ∥ index ∥ index key`: every entry for that index key.
fn index_prefix(partition: &str, index: &str, index_key: &Key) -> Vec<u8> {
    let mut out = Key::from(partition).encode();
    Key::from(index).encode_into(&mut out);
    index_key.encode_into(&mut out);
    out
}

fn index_entry(partition: &str, index: &str, index_key: &Key, primary: &Key) -> Vec<u8> {
    let mut out = index_prefix(partition, index, index_key);
    primary.encode_into(&mut out);
    out
}

fn cf_handle<'a>(db: &'a Db, name: &str) -> Result<Arc<BoundColumnFamily<'a>>, EngineError> {
    db.cf_handle(name)
        .ok_or_else(|| EngineError::UnknownPartition(name.to_string()))
}

/// Keys in `cf` starting with `prefix`.
fn scan_prefix(
    db: &Db,
    cf: &Arc<BoundColumnFamily<'_>>,
    prefix: &[u8],
) -> Result<Vec<Box<[u8]>>, EngineError> {
    let mut keys = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
        let (key, _) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key);
    }
    Ok(keys)
}

// ─── Engine ───────────────────────────────────────────────────────────

pub struct RocksEngine {
    config: RocksConfig,
}

impl RocksEngine {
    pub fn new(config: RocksConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.config.path.join(name)
    }

    fn db_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.config.max_open_files);
        opts.set_keep_log_file_num(5);
        opts
    }

    /// Build column-family-specific options.
    fn cf_options(config: &RocksConfig, name: &str) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_META => {
                // One small record, read once per open
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_INDEX => {
                // Empty values, prefix-scanned keys
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {
                // Values arrive LZ4-compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }
}

impl Engine for RocksEngine {
    fn is_supported(&self) -> bool {
        std::fs::create_dir_all(&self.config.path).is_ok()
    }

    fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: &mut UpgradeFn<'_>,
    ) -> Result<Arc<dyn Connection>, EngineError> {
        let path = self.database_path(name);
        let db_opts = self.db_options();

        // Column families already on disk; a missing database lists nothing.
        let mut families = Db::list_cf(&db_opts, &path).unwrap_or_default();
        for reserved in [CF_DEFAULT, CF_META, CF_INDEX] {
            if !families.iter().any(|f| f == reserved) {
                families.push(reserved.to_string());
            }
        }
        let descriptors: Vec<ColumnFamilyDescriptor> = families
            .iter()
            .map(|f| ColumnFamilyDescriptor::new(f, Self::cf_options(&self.config, f)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &path, descriptors)?;
        let mut catalog = Catalog::load(&db)?;

        let stored = catalog.version;
        let target = version.unwrap_or(stored.max(1));
        if target < stored {
            return Err(EngineError::VersionMismatch {
                requested: target,
                stored,
            });
        }
        if target > stored {
            let mut ctx = RocksUpgrade {
                db: &db,
                config: &self.config,
                catalog: catalog.clone(),
                old_version: stored,
                new_version: target,
            };
            upgrade(&mut ctx)?;
            let mut upgraded = ctx.catalog;
            upgraded.version = target;
            upgraded.save(&db, true)?;
            catalog = upgraded;
            log::info!("Database '{name}' upgraded {stored} → {target}");
        }

        log::debug!(
            "Opened database '{name}' v{} with {} partitions at {}",
            catalog.version,
            catalog.partitions.len(),
            path.display()
        );

        Ok(Arc::new(RocksConnection {
            inner: Arc::new(RocksInner {
                name: name.to_string(),
                db: RwLock::new(Some(Arc::new(db))),
                catalog,
                sync_writes: self.config.sync_writes,
                writer: Mutex::new(()),
            }),
        }))
    }
}

// ─── Upgrade ──────────────────────────────────────────────────────────

struct RocksUpgrade<'a> {
    db: &'a Db,
    config: &'a RocksConfig,
    catalog: Catalog,
    old_version: u32,
    new_version: u32,
}

impl UpgradeContext for RocksUpgrade<'_> {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn has_partition(&self, name: &str) -> bool {
        self.catalog.partition(name).is_some() && self.db.cf_handle(name).is_some()
    }

    fn create_partition(&mut self, name: &str) -> Result<(), EngineError> {
        if name == CF_DEFAULT || name.starts_with("__") {
            return Err(EngineError::Io(format!("Partition name '{name}' is reserved")));
        }
        // A column family left behind by an earlier failed upgrade is reused.
        if self.db.cf_handle(name).is_none() {
            self.db
                .create_cf(name, &RocksEngine::cf_options(self.config, name))?;
        }
        if self.catalog.partition(name).is_none() {
            self.catalog.partitions.push(PartitionEntry {
                name: name.to_string(),
                indexes: Vec::new(),
            });
        }
        Ok(())
    }

    fn index_names(&self, partition: &str) -> Result<Vec<String>, EngineError> {
        self.catalog
            .partition(partition)
            .map(|p| p.indexes.iter().map(|i| i.name.clone()).collect())
            .ok_or_else(|| EngineError::UnknownPartition(partition.to_string()))
    }

    fn create_index(&mut self, partition: &str, index: &IndexSpec) -> Result<(), EngineError> {
        let exists = self
            .catalog
            .partition(partition)
            .ok_or_else(|| EngineError::UnknownPartition(partition.to_string()))?
            .indexes
            .iter()
            .any(|i| i.name == index.name);
        if exists {
            return Ok(());
        }

        // Build the index over records already in the partition, replacing
        // entries an earlier failed upgrade may have left behind.
        let cf = cf_handle(self.db, partition)?;
        let cf_index = cf_handle(self.db, CF_INDEX)?;
        let mut batch = WriteBatch::default();
        let mut stale = Key::from(partition).encode();
        Key::from(index.name.as_str()).encode_into(&mut stale);
        for entry in scan_prefix(self.db, &cf_index, &stale)? {
            batch.delete_cf(&cf_index, entry);
        }
        let mut seen = HashSet::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (raw_key, raw_value) = item?;
            let primary = decode_key(&raw_key)?;
            let value = decode_value(&raw_value)?;
            let Some(index_key) = index.key_path.evaluate(&value) else {
                continue;
            };
            if index.unique && !seen.insert(index_key.encode()) {
                return Err(EngineError::Constraint {
                    index: index.name.clone(),
                    key: index_key,
                });
            }
            batch.put_cf(
                &cf_index,
                index_entry(partition, &index.name, &index_key, &primary),
                b"",
            );
        }
        self.db.write(batch)?;

        if let Some(entry) = self
            .catalog
            .partitions
            .iter_mut()
            .find(|p| p.name == partition)
        {
            entry.indexes.push(index.clone());
        }
        Ok(())
    }
}

// ─── Connection ───────────────────────────────────────────────────────

struct RocksInner {
    name: String,
    /// `None` once closed. Transactions hold their own clone, so the
    /// directory lock is released when the last one finishes.
    db: RwLock<Option<Arc<Db>>>,
    catalog: Catalog,
    sync_writes: bool,
    /// Serializes read-write commits on this connection.
    writer: Mutex<()>,
}

impl RocksInner {
    fn handle(&self) -> Result<Arc<Db>, EngineError> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EngineError::Closed)
    }
}

pub struct RocksConnection {
    inner: Arc<RocksInner>,
}

impl Connection for RocksConnection {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn version(&self) -> u32 {
        self.inner.catalog.version
    }

    fn partitions(&self) -> Vec<String> {
        self.inner
            .catalog
            .partitions
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    fn begin(&self, partition: &str, mode: TxMode) -> Result<Box<dyn Transaction>, EngineError> {
        let db = self.inner.handle()?;
        let entry = self
            .inner
            .catalog
            .partition(partition)
            .ok_or_else(|| EngineError::UnknownPartition(partition.to_string()))?;
        Ok(Box::new(RocksTransaction {
            indexes: entry.indexes.clone(),
            inner: Arc::clone(&self.inner),
            db,
            partition: partition.to_string(),
            mode,
            staged: Vec::new(),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        let taken = self
            .inner
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(db) = taken {
            db.flush_wal(true)?;
            log::debug!("Closed database '{}'", self.inner.name);
        }
        Ok(())
    }
}

// ─── Transaction ──────────────────────────────────────────────────────

struct RocksTransaction {
    inner: Arc<RocksInner>,
    db: Arc<Db>,
    partition: String,
    indexes: Vec<IndexSpec>,
    mode: TxMode,
    /// Write requests, replayed into one `WriteBatch` at commit.
    staged: Vec<Request>,
}

impl RocksTransaction {
    fn load(&self, key: &Key) -> Result<Option<Value>, EngineError> {
        let cf = cf_handle(&self.db, &self.partition)?;
        self.db
            .get_cf(&cf, key.encode())?
            .map(|bytes| decode_value(&bytes))
            .transpose()
    }

    /// Another record already holding `index_key` in a unique index.
    fn index_owner(&self, spec: &IndexSpec, index_key: &Key, primary: &Key) -> Result<Option<Key>, EngineError> {
        let cf_index = cf_handle(&self.db, CF_INDEX)?;
        let prefix = index_prefix(&self.partition, &spec.name, index_key);
        for entry in scan_prefix(&self.db, &cf_index, &prefix)? {
            let owner = decode_key(&entry[prefix.len()..])?;
            if &owner != primary {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    fn stage_index_removal(&self, batch: &mut WriteBatch, primary: &Key, old: &Value) -> Result<(), EngineError> {
        let cf_index = cf_handle(&self.db, CF_INDEX)?;
        for (spec, index_key) in index_entries(&self.indexes, old) {
            batch.delete_cf(
                &cf_index,
                index_entry(&self.partition, &spec.name, &index_key, primary),
            );
        }
        Ok(())
    }

    fn read(&self, request: Request) -> Result<Response, EngineError> {
        let db = &self.db;
        let cf = cf_handle(db, &self.partition)?;
        match request {
            Request::Get(key) => Ok(Response::Value(self.load(&key)?)),
            Request::GetAll => {
                let mut values = Vec::new();
                for item in db.iterator_cf(&cf, IteratorMode::Start) {
                    let (_, raw) = item?;
                    values.push(decode_value(&raw)?);
                }
                Ok(Response::Values(values))
            }
            Request::GetAllKeys => {
                let mut keys = Vec::new();
                for item in db.iterator_cf(&cf, IteratorMode::Start) {
                    let (raw, _) = item?;
                    keys.push(decode_key(&raw)?);
                }
                Ok(Response::Keys(keys))
            }
            Request::IndexGetAll { index, key } => {
                if !self.indexes.iter().any(|i| i.name == index) {
                    return Err(EngineError::UnknownIndex {
                        partition: self.partition.clone(),
                        index,
                    });
                }
                let cf_index = cf_handle(db, CF_INDEX)?;
                let prefix = index_prefix(&self.partition, &index, &key);
                let mut values = Vec::new();
                for entry in scan_prefix(db, &cf_index, &prefix)? {
                    if let Some(raw) = db.get_cf(&cf, &entry[prefix.len()..])? {
                        values.push(decode_value(&raw)?);
                    }
                }
                Ok(Response::Values(values))
            }
            other => Err(EngineError::Io(format!("'{}' is not a read", other.name()))),
        }
    }

    /// Stage `request` into `batch` against committed state, checking
    /// unique indexes.
    fn stage(&self, batch: &mut WriteBatch, request: &Request) -> Result<Response, EngineError> {
        let db = &self.db;
        let cf = cf_handle(db, &self.partition)?;

        match request {
            Request::Put { key, value } => {
                if !self.indexes.is_empty() {
                    if let Some(old) = self.load(key)? {
                        self.stage_index_removal(batch, key, &old)?;
                    }
                    let cf_index = cf_handle(db, CF_INDEX)?;
                    for (spec, index_key) in index_entries(&self.indexes, value) {
                        if spec.unique && self.index_owner(spec, &index_key, key)?.is_some() {
                            return Err(EngineError::Constraint {
                                index: spec.name.clone(),
                                key: index_key,
                            });
                        }
                        batch.put_cf(
                            &cf_index,
                            index_entry(&self.partition, &spec.name, &index_key, key),
                            b"",
                        );
                    }
                }
                batch.put_cf(&cf, key.encode(), encode_value(value)?);
                Ok(Response::Key(key.clone()))
            }
            Request::Delete(key) => {
                if !self.indexes.is_empty() {
                    if let Some(old) = self.load(key)? {
                        self.stage_index_removal(batch, key, &old)?;
                    }
                }
                batch.delete_cf(&cf, key.encode());
                Ok(Response::Done)
            }
            Request::Clear => {
                for item in db.iterator_cf(&cf, IteratorMode::Start) {
                    let (raw, _) = item?;
                    batch.delete_cf(&cf, raw);
                }
                let cf_index = cf_handle(db, CF_INDEX)?;
                for entry in scan_prefix(db, &cf_index, &Key::from(self.partition.as_str()).encode())? {
                    batch.delete_cf(&cf_index, entry);
                }
                Ok(Response::Done)
            }
            other => Err(EngineError::Io(format!("'{}' is not a write", other.name()))),
        }
    }
}

impl Transaction for RocksTransaction {
    fn execute(&mut self, request: Request) -> Result<Response, EngineError> {
        if !request.is_write() {
            return self.read(request);
        }
        if self.mode == TxMode::ReadOnly {
            return Err(EngineError::ReadOnly);
        }
        // Early check so constraint failures surface on the request;
        // commit stages again under the writer lock.
        let response = self.stage(&mut WriteBatch::default(), &request)?;
        self.staged.push(request);
        Ok(response)
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let _writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut batch = WriteBatch::default();
        for request in &self.staged {
            self.stage(&mut batch, request)?;
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
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
