//! Durable record engines.
//!
//! ```text
//! ┌──────────────┐   open(name, version, upgrade)   ┌──────────────┐
//! │   Database   │ ───────────────────────────────► │    Engine    │
//! │  (adapter)   │                                  │ Rocks/Memory │
//! └──────┬───────┘                                  └──────┬───────┘
//!        │ begin(partition, mode)                          │
//!        ▼                                                 ▼
//! ┌──────────────┐   execute(request) → commit()    ┌──────────────┐
//! │ Transaction  │ ◄──────────────────────────────  │  Connection  │
//! └──────────────┘                                  └──────────────┘
//! ```
//!
//! A request completing and its transaction completing are two separate
//! signals. Callers treat an operation as done only after `commit`.

pub mod engine;
pub mod memory;
pub mod rocks;

pub use engine::{
    Connection, Engine, EngineError, IndexSpec, Key, KeyPath, Request, Response, Transaction,
    TxMode, UpgradeContext, UpgradeFn, Value,
};
pub use memory::{Faults, MemoryEngine};
pub use rocks::{RocksConfig, RocksEngine};
