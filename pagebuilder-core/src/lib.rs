//! # pagebuilder-core: Domain state for the page builder
//!
//! Holds the two in-memory stores the UI mutates and the persistence
//! layer snapshots:
//!
//! ```text
//! ┌─────────────┐  remove(tab)   ┌───────────────┐
//! │ TabsStore   │ ─────────────► │ SectionsStore │
//! │ Live<Vec>   │                │ Live<buckets> │
//! └──────┬──────┘                └───────┬───────┘
//!        │ get_state / hydrate           │ get_state / hydrate
//!        └───────────────┬───────────────┘
//!                        ▼
//!                 DomainStore contract
//! ```
//!
//! ## Modules
//!
//! - [`live`]: `Live<T>`, the shared reactive cell stores are built on
//! - [`tabs`]: tab list and active tab
//! - [`sections`]: text/table sections bucketed per tab
//! - [`util`]: id and slug helpers

pub mod live;
pub mod sections;
pub mod tabs;
pub mod util;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use live::Live;
pub use sections::{
    NewSection, Section, SectionContent, SectionType, SectionsState, SectionsStore,
    TableSectionData, TextSectionData,
};
pub use tabs::{Tab, TabsState, TabsStore, HOME_TAB_ID};
pub use util::{generate_id, generate_slug};

/// Contract between a domain store and the persistence layer.
///
/// `get_state` yields an owned copy; the store keeps exclusive ownership
/// of its live state. `hydrate` replaces that state from a snapshot and
/// must fall back to defaults when the snapshot is missing.
pub trait DomainStore: Send + Sync {
    type State: Serialize + DeserializeOwned + Send;

    fn get_state(&self) -> Self::State;

    fn hydrate(&self, state: Option<Self::State>);
}
