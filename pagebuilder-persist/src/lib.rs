//! # pagebuilder-persist: Durable state for the page builder
//!
//! Mirrors the in-memory domain stores into a versioned key/value database
//! and restores them on the next start.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  get_state   ┌──────────────┐  set(app-state)  ┌────────────┐
//! │ TabsStore   │ ───────────► │   DataSync   │ ───────────────► │  Database  │
//! │ Sections    │ ◄─────────── │ (timer +     │ ◄─────────────── │  (adapter) │
//! └─────────────┘   hydrate    │  lifecycle)  │   get(app-state) └─────┬──────┘
//!                              └──────────────┘                        │
//!                                                              ┌───────┴───────┐
//!                                                              │ Engine        │
//!                                                              │ RocksDB / mem │
//!                                                              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: engine traits, the RocksDB engine and the in-memory engine
//! - [`db`]: memoized connection, schema reconciliation, key/value operations
//! - [`serialize`]: live state to plain values
//! - [`sync`]: hydration and guarded snapshot writes
//!
//! The database assumes a single writer. A second process opening the same
//! RocksDB directory fails with a connection error.

pub mod db;
pub mod serialize;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use db::{reconcile, Database, DbError, DbOptions, DbStatus, StoreDefinition, DEFAULT_STORE};
pub use serialize::{from_plain, to_plain, SerializeError};
pub use storage::{
    Engine, EngineError, Faults, IndexSpec, Key, KeyPath, MemoryEngine, RocksConfig, RocksEngine,
    Value,
};
pub use sync::{
    DataSync, HydrateOutcome, Lifecycle, LifecycleEvent, PersistedState, SkipReason, SyncConfig,
    SyncOutcome, SyncPhase, Visibility,
};
