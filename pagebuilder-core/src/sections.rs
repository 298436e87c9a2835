//! Text and table sections, bucketed per tab.
//!
//! Buckets keep the order tabs first received a section; sections keep
//! their order within a bucket. Flattening the buckets in that order
//! gives [`SectionsStore::sections`], which is also the persisted order.

use serde::{Deserialize, Serialize};

use crate::live::Live;
use crate::util::generate_id;
use crate::DomainStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Text,
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextSectionData {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSectionData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Section payload. Table is tried first so `{columns, rows}` never
/// collapses into a text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionContent {
    Table(TableSectionData),
    Text(TextSectionData),
}

impl SectionContent {
    /// Content a freshly added section of `kind` starts with.
    pub fn default_for(kind: SectionType) -> Self {
        match kind {
            SectionType::Text => SectionContent::Text(TextSectionData::default()),
            SectionType::Table => SectionContent::Table(TableSectionData {
                columns: vec!["Column 1".to_string()],
                rows: vec![vec![String::new()]],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub tab_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SectionType,
    pub data: SectionContent,
}

/// Input to [`SectionsStore::add`]; the id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewSection {
    pub tab_id: String,
    pub name: String,
    pub kind: SectionType,
    pub data: Option<SectionContent>,
}

impl NewSection {
    pub fn new(tab_id: impl Into<String>, name: impl Into<String>, kind: SectionType) -> Self {
        Self {
            tab_id: tab_id.into(),
            name: name.into(),
            kind,
            data: None,
        }
    }

    pub fn with_data(mut self, data: SectionContent) -> Self {
        self.data = Some(data);
        self
    }
}

/// Persisted shape of [`SectionsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SectionsState {
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default)]
struct TabBucket {
    tab_id: String,
    sections: Vec<Section>,
}

fn bucket_mut<'a>(buckets: &'a mut Vec<TabBucket>, tab_id: &str) -> &'a mut Vec<Section> {
    let index = match buckets.iter().position(|b| b.tab_id == tab_id) {
        Some(index) => index,
        None => {
            buckets.push(TabBucket {
                tab_id: tab_id.to_string(),
                sections: Vec::new(),
            });
            buckets.len() - 1
        }
    };
    &mut buckets[index].sections
}

/// (bucket index, position within bucket)
fn locate(buckets: &[TabBucket], section_id: &str) -> Option<(usize, usize)> {
    buckets.iter().enumerate().find_map(|(b, bucket)| {
        bucket
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .map(|i| (b, i))
    })
}

#[derive(Debug, Clone, Default)]
pub struct SectionsStore {
    buckets: Live<Vec<TabBucket>>,
}

impl SectionsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section, filling in default content for its type.
    pub fn add(&self, section: NewSection) -> Section {
        let data = section
            .data
            .unwrap_or_else(|| SectionContent::default_for(section.kind));
        let section = Section {
            id: generate_id(),
            tab_id: section.tab_id,
            name: section.name,
            kind: section.kind,
            data,
        };
        self.buckets
            .update(|buckets| bucket_mut(buckets, &section.tab_id).push(section.clone()));
        section
    }

    /// Replace a section by id, moving it to the end of its new tab's
    /// bucket when `tab_id` changed. Returns `false` for unknown ids.
    pub fn update(&self, section: Section) -> bool {
        self.buckets.update(|buckets| {
            let Some((b, i)) = locate(buckets, &section.id) else {
                return false;
            };
            if buckets[b].tab_id != section.tab_id {
                buckets[b].sections.remove(i);
                bucket_mut(buckets, &section.tab_id).push(section);
            } else {
                buckets[b].sections[i] = section;
            }
            true
        })
    }

    /// Replace only the content of a section.
    pub fn update_data(&self, section_id: &str, data: SectionContent) -> bool {
        self.buckets.update(|buckets| match locate(buckets, section_id) {
            Some((b, i)) => {
                buckets[b].sections[i].data = data;
                true
            }
            None => false,
        })
    }

    /// Reorder within a tab. Out-of-range or identical indices are no-ops.
    pub fn move_section(&self, tab_id: &str, from: usize, to: usize) -> bool {
        self.buckets.update(|buckets| {
            let Some(bucket) = buckets.iter_mut().find(|b| b.tab_id == tab_id) else {
                return false;
            };
            let len = bucket.sections.len();
            if from >= len || to >= len || from == to {
                return false;
            }
            let moved = bucket.sections.remove(from);
            bucket.sections.insert(to, moved);
            true
        })
    }

    pub fn get_section(&self, section_id: &str) -> Option<Section> {
        self.buckets.with(|buckets| {
            locate(buckets, section_id).map(|(b, i)| buckets[b].sections[i].clone())
        })
    }

    /// All sections, flattened bucket by bucket.
    pub fn sections(&self) -> Vec<Section> {
        self.buckets.with(|buckets| {
            buckets
                .iter()
                .flat_map(|b| b.sections.iter().cloned())
                .collect()
        })
    }

    pub fn tab_sections(&self, tab_id: &str) -> Vec<Section> {
        self.buckets.with(|buckets| {
            buckets
                .iter()
                .find(|b| b.tab_id == tab_id)
                .map(|b| b.sections.clone())
                .unwrap_or_default()
        })
    }

    pub fn len(&self) -> usize {
        self.buckets
            .with(|buckets| buckets.iter().map(|b| b.sections.len()).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a tab's bucket. Returns `false` if the tab had none.
    pub fn remove_by_tab(&self, tab_id: &str) -> bool {
        self.buckets.update(|buckets| {
            let before = buckets.len();
            buckets.retain(|b| b.tab_id != tab_id);
            buckets.len() != before
        })
    }
}

impl DomainStore for SectionsStore {
    type State = SectionsState;

    fn get_state(&self) -> SectionsState {
        SectionsState {
            sections: self.sections(),
        }
    }

    fn hydrate(&self, state: Option<SectionsState>) {
        let mut buckets = Vec::new();
        if let Some(state) = state {
            for section in state.sections {
                bucket_mut(&mut buckets, &section.tab_id).push(section);
            }
        }
        log::debug!("Hydrated sections into {} tab buckets", buckets.len());
        self.buckets.set(buckets);
    }
}
