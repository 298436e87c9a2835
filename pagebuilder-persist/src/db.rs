//! Key/value adapter over a versioned, transactional [`Engine`].
//!
//! ```text
//!   get/set/del/...                       one open per Database
//!  ─────────────────┐                   ┌──────────────────────────┐
//!                   ▼                   │ Shared<open future>      │
//!            ┌─────────────┐  open()    │  idle → opening → ready  │
//!            │  Database   │ ─────────► │                 ↘ error  │
//!            └──────┬──────┘            └──────────────────────────┘
//!                   │ spawn_blocking
//!                   ▼
//!     begin(store) → execute(request) → commit()
//! ```
//!
//! Every operation resolves only after both its request and its
//! transaction completed. The first `open()` starts the connection; every
//! concurrent or later caller awaits the same memoized outcome until
//! [`Database::close`] drops it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::serialize::{from_plain, to_plain, SerializeError};
use crate::storage::{
    Connection, Engine, EngineError, IndexSpec, Key, Request, Response, TxMode, UpgradeContext,
};

/// Partition used when neither an explicit nor a declared store exists.
pub const DEFAULT_STORE: &str = "kv";

// ─── Configuration ────────────────────────────────────────────────────

/// A partition and the secondary indexes it should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDefinition {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
}

impl StoreDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Database identity and schema.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub name: String,
    /// `None` opens whatever version is stored (1 for a new database).
    pub version: Option<u32>,
    /// Default partition for calls that do not name one.
    pub store: Option<String>,
    pub stores: Vec<StoreDefinition>,
}

impl DbOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            store: None,
            stores: Vec::new(),
        }
    }

    /// Single `kv` partition under a throwaway name.
    pub fn for_testing() -> Self {
        Self::new("test-db")
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn store(mut self, name: impl Into<String>) -> Self {
        self.store = Some(name.into());
        self
    }

    pub fn with_store(mut self, store: StoreDefinition) -> Self {
        self.stores.push(store);
        self
    }

    /// Partitions the schema will hold.
    ///
    /// Declared stores win; a named default missing from them is appended.
    /// With nothing declared, the default store (or `kv`) is the only one.
    pub fn resolved_stores(&self) -> Vec<StoreDefinition> {
        if self.stores.is_empty() {
            let name = self.store.clone().unwrap_or_else(|| DEFAULT_STORE.to_string());
            return vec![StoreDefinition::new(name)];
        }
        let mut stores = self.stores.clone();
        if let Some(name) = &self.store {
            if !stores.iter().any(|s| &s.name == name) {
                stores.push(StoreDefinition::new(name.clone()));
            }
        }
        stores
    }
}

// ─── Status & errors ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    Idle,
    Opening,
    Ready,
    Error,
}

impl fmt::Display for DbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbStatus::Idle => "idle",
            DbStatus::Opening => "opening",
            DbStatus::Ready => "ready",
            DbStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Adapter errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// No storage engine in this environment. Permanent.
    UnsupportedEnvironment,
    /// The engine refused to open the database. Not retried until `close`.
    ConnectionError(String),
    /// The individual request failed.
    RequestFailed(String),
    /// The transaction could not start or failed to commit.
    TransactionFailed(String),
    /// The transaction was aborted before committing.
    TransactionAborted(String),
    /// A value could not be converted to or from its stored form.
    Serialization(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::UnsupportedEnvironment => {
                write!(f, "Durable storage is not available in this environment")
            }
            DbError::ConnectionError(e) => write!(f, "Failed to open database: {e}"),
            DbError::RequestFailed(e) => write!(f, "Request failed: {e}"),
            DbError::TransactionFailed(e) => write!(f, "Transaction failed: {e}"),
            DbError::TransactionAborted(e) => write!(f, "Transaction aborted: {e}"),
            DbError::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<SerializeError> for DbError {
    fn from(e: SerializeError) -> Self {
        DbError::Serialization(e.message().to_string())
    }
}

impl DbError {
    fn from_open(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable(_) => DbError::UnsupportedEnvironment,
            other => DbError::ConnectionError(other.to_string()),
        }
    }
}

// ─── Schema reconciliation ────────────────────────────────────────────

/// Create every declared partition and index that does not exist yet.
///
/// Runs inside the engine's upgrade step. Existing partitions are reused
/// and existing indexes are left alone, so a half-migrated schema converges
/// to the declared one.
pub fn reconcile(
    ctx: &mut dyn UpgradeContext,
    stores: &[StoreDefinition],
) -> Result<(), EngineError> {
    for store in stores {
        if ctx.has_partition(&store.name) {
            log::debug!("Reusing partition '{}'", store.name);
        } else {
            ctx.create_partition(&store.name)?;
            log::info!(
                "Created partition '{}' (v{} → v{})",
                store.name,
                ctx.old_version(),
                ctx.new_version()
            );
        }

        let existing = ctx.index_names(&store.name)?;
        for index in &store.indexes {
            if existing.contains(&index.name) {
                continue;
            }
            ctx.create_index(&store.name, index)?;
            log::info!("Created index '{}' on '{}'", index.name, store.name);
        }
    }
    Ok(())
}

// ─── Database ─────────────────────────────────────────────────────────

type OpenFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>, DbError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot {
    pending: Option<OpenFuture>,
    /// Bumped by `close`; an open that finishes under an older epoch
    /// leaves status alone.
    epoch: u64,
}

struct DatabaseInner {
    engine: Arc<dyn Engine>,
    name: String,
    version: Option<u32>,
    stores: Arc<Vec<StoreDefinition>>,
    default_store: String,
    supported: bool,
    slot: Mutex<Slot>,
    status: watch::Sender<DbStatus>,
    last_error: Mutex<Option<DbError>>,
}

impl DatabaseInner {
    fn start_open(self: &Arc<Self>, epoch: u64) -> OpenFuture {
        let weak: Weak<Self> = Arc::downgrade(self);
        let engine = Arc::clone(&self.engine);
        let name = self.name.clone();
        let version = self.version;
        let stores = Arc::clone(&self.stores);

        async move {
            let opened = tokio::task::spawn_blocking(move || {
                engine.open(&name, version, &mut |ctx: &mut dyn UpgradeContext| {
                    reconcile(ctx, &stores)
                })
            })
            .await;
            let result = match opened {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(DbError::from_open(e)),
                Err(e) => Err(DbError::ConnectionError(format!("open task failed: {e}"))),
            };
            if let Some(inner) = weak.upgrade() {
                inner.settle(epoch, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn settle(&self, epoch: u64, result: &Result<Arc<dyn Connection>, DbError>) {
        let slot = lock(&self.slot);
        if slot.epoch != epoch {
            return;
        }
        match result {
            Ok(conn) => {
                log::info!("Database '{}' ready (version {})", self.name, conn.version());
                self.status.send_replace(DbStatus::Ready);
            }
            Err(e) => {
                log::error!("Failed to open database '{}': {e}", self.name);
                *lock(&self.last_error) = Some(e.clone());
                self.status.send_replace(DbStatus::Error);
            }
        }
    }
}

/// Handle to one named database. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("default_store", &self.inner.default_store)
            .field("status", &self.status())
            .finish()
    }
}

impl Database {
    /// Resolve the schema and default store. Nothing is opened yet.
    pub fn new(engine: Arc<dyn Engine>, options: DbOptions) -> Self {
        let stores = options.resolved_stores();
        let default_store = options
            .store
            .clone()
            .or_else(|| stores.first().map(|s| s.name.clone()))
            .unwrap_or_else(|| DEFAULT_STORE.to_string());
        let supported = engine.is_supported();
        let (status, _) = watch::channel(DbStatus::Idle);

        Self {
            inner: Arc::new(DatabaseInner {
                engine,
                name: options.name,
                version: options.version,
                stores: Arc::new(stores),
                default_store,
                supported,
                slot: Mutex::new(Slot {
                    pending: None,
                    epoch: 0,
                }),
                status,
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_supported(&self) -> bool {
        self.inner.supported
    }

    pub fn default_store(&self) -> &str {
        &self.inner.default_store
    }

    pub fn stores(&self) -> &[StoreDefinition] {
        &self.inner.stores
    }

    pub fn status(&self) -> DbStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DbStatus> {
        self.inner.status.subscribe()
    }

    /// Last connection-level failure, kept until replaced.
    pub fn last_error(&self) -> Option<DbError> {
        lock(&self.inner.last_error).clone()
    }

    fn ensure_supported(&self) -> Result<(), DbError> {
        if self.inner.supported {
            return Ok(());
        }
        let err = DbError::UnsupportedEnvironment;
        *lock(&self.inner.last_error) = Some(err.clone());
        self.inner.status.send_replace(DbStatus::Error);
        Err(err)
    }

    /// Open the connection, or join the attempt already under way.
    pub async fn open(&self) -> Result<Arc<dyn Connection>, DbError> {
        self.ensure_supported()?;
        let pending = {
            let mut slot = lock(&self.inner.slot);
            match &slot.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.inner.start_open(slot.epoch);
                    slot.pending = Some(pending.clone());
                    self.inner.status.send_replace(DbStatus::Opening);
                    log::debug!("Opening database '{}'", self.inner.name);
                    pending
                }
            }
        };
        pending.await
    }

    /// Release the connection and return to `Idle`. The next operation
    /// reopens. Close-time errors are logged and dropped.
    pub fn close(&self) {
        let pending = {
            let mut slot = lock(&self.inner.slot);
            let Some(pending) = slot.pending.take() else {
                return;
            };
            slot.epoch += 1;
            self.inner.status.send_replace(DbStatus::Idle);
            pending
        };

        let name = self.inner.name.clone();
        let settled = pending.peek().cloned();
        match settled {
            Some(Ok(conn)) => close_quietly(&name, &conn),
            Some(Err(_)) => {}
            None => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Ok(conn) = pending.await {
                            close_quietly(&name, &conn);
                        }
                    });
                }
                Err(_) => log::debug!("Dropping unfinished open of '{name}'"),
            },
        }
    }

    fn store_name<'a>(&'a self, store: Option<&'a str>) -> &'a str {
        store.unwrap_or(&self.inner.default_store)
    }

    /// One request inside one transaction; resolves after the commit.
    async fn with_store(
        &self,
        mode: TxMode,
        store: &str,
        request: Request,
    ) -> Result<Response, DbError> {
        let conn = self.open().await?;
        let store = store.to_string();
        let op = request.name();

        tokio::task::spawn_blocking(move || {
            let mut tx = conn
                .begin(&store, mode)
                .map_err(|e| DbError::TransactionFailed(format!("{op} on '{store}': {e}")))?;
            let response = match tx.execute(request) {
                Ok(response) => response,
                Err(e) => {
                    tx.abort();
                    return Err(DbError::RequestFailed(format!("{op} on '{store}': {e}")));
                }
            };
            tx.commit().map_err(|e| match e {
                EngineError::Aborted(reason) => {
                    DbError::TransactionAborted(format!("{op} on '{store}': {reason}"))
                }
                other => DbError::TransactionFailed(format!("{op} on '{store}': {other}")),
            })?;
            Ok(response)
        })
        .await
        .map_err(|e| DbError::TransactionAborted(format!("{op} task failed: {e}")))?
    }

    /// Read one value. A missing key is `Ok(None)`.
    pub async fn get<V: DeserializeOwned>(
        &self,
        key: impl Into<Key>,
        store: Option<&str>,
    ) -> Result<Option<V>, DbError> {
        let store = self.store_name(store);
        match self
            .with_store(TxMode::ReadOnly, store, Request::Get(key.into()))
            .await?
        {
            Response::Value(Some(value)) => Ok(Some(from_plain(value)?)),
            Response::Value(None) => Ok(None),
            other => Err(unexpected("get", &other)),
        }
    }

    pub async fn get_all<V: DeserializeOwned>(&self, store: Option<&str>) -> Result<Vec<V>, DbError> {
        let store = self.store_name(store);
        match self.with_store(TxMode::ReadOnly, store, Request::GetAll).await? {
            Response::Values(values) => decode_all(values),
            other => Err(unexpected("getAll", &other)),
        }
    }

    pub async fn get_all_keys(&self, store: Option<&str>) -> Result<Vec<Key>, DbError> {
        let store = self.store_name(store);
        match self
            .with_store(TxMode::ReadOnly, store, Request::GetAllKeys)
            .await?
        {
            Response::Keys(keys) => Ok(keys),
            other => Err(unexpected("getAllKeys", &other)),
        }
    }

    /// Values whose `index` evaluates to `key`, in primary-key order.
    pub async fn get_all_by_index<V: DeserializeOwned>(
        &self,
        index: &str,
        key: impl Into<Key>,
        store: Option<&str>,
    ) -> Result<Vec<V>, DbError> {
        let store = self.store_name(store);
        let request = Request::IndexGetAll {
            index: index.to_string(),
            key: key.into(),
        };
        match self.with_store(TxMode::ReadOnly, store, request).await? {
            Response::Values(values) => decode_all(values),
            other => Err(unexpected("index.getAll", &other)),
        }
    }

    /// Upsert. Resolves once the write is committed.
    pub async fn set<V: Serialize + ?Sized>(
        &self,
        key: impl Into<Key>,
        value: &V,
        store: Option<&str>,
    ) -> Result<(), DbError> {
        let key = key.into();
        let store = self.store_name(store);
        let value = to_plain(value)?;
        log::debug!("Saving key \"{key}\" to store \"{store}\"");
        self.with_store(TxMode::ReadWrite, store, Request::Put { key, value })
            .await?;
        Ok(())
    }

    pub async fn del(&self, key: impl Into<Key>, store: Option<&str>) -> Result<(), DbError> {
        let store = self.store_name(store);
        self.with_store(TxMode::ReadWrite, store, Request::Delete(key.into()))
            .await?;
        Ok(())
    }

    pub async fn clear(&self, store: Option<&str>) -> Result<(), DbError> {
        let store = self.store_name(store);
        self.with_store(TxMode::ReadWrite, store, Request::Clear)
            .await?;
        Ok(())
    }
}

fn close_quietly(name: &str, conn: &Arc<dyn Connection>) {
    match conn.close() {
        Ok(()) => log::debug!("Closed database '{name}'"),
        Err(e) => log::debug!("Ignoring close error on '{name}': {e}"),
    }
}

fn decode_all<V: DeserializeOwned>(values: Vec<crate::storage::Value>) -> Result<Vec<V>, DbError> {
    values
        .into_iter()
        .map(|v| from_plain(v).map_err(DbError::from))
        .collect()
}

fn unexpected(op: &str, response: &Response) -> DbError {
    DbError::RequestFailed(format!("{op}: unexpected engine response {response:?}"))
}
