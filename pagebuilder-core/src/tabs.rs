//! Tab list and active-tab selection.

use serde::{Deserialize, Serialize};

use crate::live::Live;
use crate::sections::SectionsStore;
use crate::util::{generate_id, generate_slug};
use crate::DomainStore;

/// Id of the tab every fresh session starts with.
pub const HOME_TAB_ID: &str = "home";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: String,
    pub name: String,
    pub slug: String,
}

impl Tab {
    pub fn home() -> Self {
        Self {
            id: HOME_TAB_ID.to_string(),
            name: "Home".to_string(),
            slug: "/".to_string(),
        }
    }
}

/// Persisted shape of [`TabsStore`].
///
/// `tabs` is optional on the way in: a snapshot without a tab list keeps
/// whatever tabs the store already has.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabsState {
    #[serde(default)]
    pub active_tab_id: Option<String>,
    #[serde(default)]
    pub tabs: Option<Vec<Tab>>,
}

#[derive(Debug, Clone)]
pub struct TabsStore {
    active_tab_id: Live<Option<String>>,
    tabs: Live<Vec<Tab>>,
}

impl Default for TabsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TabsStore {
    /// A store holding only the home tab, with nothing selected.
    pub fn new() -> Self {
        Self {
            active_tab_id: Live::new(None),
            tabs: Live::new(vec![Tab::home()]),
        }
    }

    pub fn set_active_tab(&self, tab_id: impl Into<String>) {
        self.active_tab_id.set(Some(tab_id.into()));
    }

    pub fn active_tab_id(&self) -> Option<String> {
        self.active_tab_id.get()
    }

    /// The selected tab, if the selection points at an existing tab.
    pub fn active_tab(&self) -> Option<Tab> {
        let active = self.active_tab_id.read();
        let id = active.as_deref()?;
        self.tabs.with(|tabs| tabs.iter().find(|t| t.id == id).cloned())
    }

    pub fn tabs_list(&self) -> Vec<Tab> {
        self.tabs.get()
    }

    pub fn len(&self) -> usize {
        self.tabs.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a tab named `name` (trimmed) and return it.
    pub fn add(&self, name: &str) -> Tab {
        let name = name.trim();
        let tab = Tab {
            id: generate_id(),
            name: name.to_string(),
            slug: generate_slug(name),
        };
        self.tabs.update(|tabs| tabs.push(tab.clone()));
        tab
    }

    /// Remove a tab and every section filed under it.
    ///
    /// Returns the index the tab occupied, or `None` if it was unknown.
    /// Sections are dropped either way.
    pub fn remove(&self, tab_id: &str, sections: &SectionsStore) -> Option<usize> {
        let index = self.tabs.update(|tabs| {
            let index = tabs.iter().position(|t| t.id == tab_id);
            tabs.retain(|t| t.id != tab_id);
            index
        });
        if sections.remove_by_tab(tab_id) {
            log::debug!("Dropped sections of removed tab {tab_id}");
        }
        index
    }

    /// Replace the tab with the same id. Unknown ids are ignored.
    pub fn update(&self, tab: Tab) {
        self.tabs.update(|tabs| {
            if let Some(slot) = tabs.iter_mut().find(|t| t.id == tab.id) {
                *slot = tab;
            }
        });
    }
}

impl DomainStore for TabsStore {
    type State = TabsState;

    fn get_state(&self) -> TabsState {
        TabsState {
            active_tab_id: self.active_tab_id.get(),
            tabs: Some(self.tabs.get()),
        }
    }

    fn hydrate(&self, state: Option<TabsState>) {
        let Some(state) = state else {
            return;
        };
        self.active_tab_id.set(state.active_tab_id);
        if let Some(tabs) = state.tabs {
            log::debug!("Hydrating {} tabs", tabs.len());
            self.tabs.set(tabs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{NewSection, SectionType};

    #[test]
    fn test_defaults_to_home_tab() {
        let store = TabsStore::new();
        assert_eq!(store.tabs_list(), vec![Tab::home()]);
        assert_eq!(store.active_tab_id(), None);
        assert!(store.active_tab().is_none());
    }

    #[test]
    fn test_add_trims_and_slugs() {
        let store = TabsStore::new();
        let tab = store.add("  Quarterly Report ");
        assert_eq!(tab.name, "Quarterly Report");
        assert_eq!(tab.slug, "quarterly-report");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_active_tab_resolves() {
        let store = TabsStore::new();
        let tab = store.add("Docs");
        store.set_active_tab(tab.id.clone());
        assert_eq!(store.active_tab(), Some(tab));

        store.set_active_tab("missing");
        assert!(store.active_tab().is_none());
    }

    #[test]
    fn test_remove_returns_index_and_drops_sections() {
        let tabs = TabsStore::new();
        let sections = SectionsStore::new();
        let tab = tabs.add("Docs");
        sections.add(NewSection::new(&tab.id, "Intro", SectionType::Text));

        assert_eq!(tabs.remove(&tab.id, &sections), Some(1));
        assert_eq!(tabs.len(), 1);
        assert!(sections.tab_sections(&tab.id).is_empty());
        assert_eq!(tabs.remove("nope", &sections), None);
    }

    #[test]
    fn test_update_replaces_matching_tab() {
        let store = TabsStore::new();
        let mut tab = store.add("Docs");
        tab.name = "Documentation".into();
        store.update(tab.clone());
        assert_eq!(store.tabs_list()[1], tab);
    }

    #[test]
    fn test_hydrate_none_keeps_defaults() {
        let store = TabsStore::new();
        store.hydrate(None);
        assert_eq!(store.tabs_list(), vec![Tab::home()]);
    }

    #[test]
    fn test_hydrate_without_tab_list_keeps_tabs() {
        let store = TabsStore::new();
        store.hydrate(Some(TabsState {
            active_tab_id: Some(HOME_TAB_ID.into()),
            tabs: None,
        }));
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_tab(), Some(Tab::home()));
    }

    #[test]
    fn test_state_roundtrip() {
        let store = TabsStore::new();
        let tab = store.add("Docs");
        store.set_active_tab(tab.id.clone());
        let state = store.get_state();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["activeTabId"], tab.id.as_str());

        let restored = TabsStore::new();
        restored.hydrate(Some(serde_json::from_value(json).unwrap()));
        assert_eq!(restored.tabs_list(), store.tabs_list());
        assert_eq!(restored.active_tab(), Some(tab));
    }
}
