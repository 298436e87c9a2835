//! Orchestrator tests on a real data directory.
//!
//! Each test plays a "session": build stores, start syncing, edit, flush,
//! tear everything down, then start a new session on the same directory.

use pagebuilder_core::{
    NewSection, SectionContent, SectionType, SectionsStore, Tab, TabsStore, TextSectionData,
};
use pagebuilder_persist::{
    DataSync, HydrateOutcome, Lifecycle, LifecycleEvent, PersistedState, RocksConfig, RocksEngine,
    SyncConfig, SyncOutcome, Visibility,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn session(path: &Path) -> DataSync {
    DataSync::new(
        Arc::new(RocksEngine::new(RocksConfig::for_testing(path))),
        SyncConfig::for_testing(),
        TabsStore::new(),
        SectionsStore::new(),
    )
}

async fn end(sync: DataSync) {
    sync.shutdown().await;
    sync.database().close();
}

#[tokio::test]
async fn test_session_restores_previous_edits() {
    let dir = tempdir().unwrap();
    let lifecycle = Lifecycle::new();

    let first = session(dir.path());
    first.start(&lifecycle);
    assert_eq!(first.hydrated().await, Ok(HydrateOutcome::Empty));

    let tab = first.tabs().add("Landing Page");
    first.tabs().set_active_tab(tab.id.clone());
    let hero = first.sections().add(
        NewSection::new(&tab.id, "Hero", SectionType::Text).with_data(SectionContent::Text(
            TextSectionData {
                text: "Welcome".into(),
            },
        )),
    );
    let grid = first
        .sections()
        .add(NewSection::new(&tab.id, "Grid", SectionType::Table));
    assert_eq!(first.sync().await, Ok(SyncOutcome::Written));
    end(first).await;

    let second = session(dir.path());
    second.start(&lifecycle);
    assert_eq!(second.hydrated().await, Ok(HydrateOutcome::Restored));
    assert_eq!(second.tabs().tabs_list(), vec![Tab::home(), tab.clone()]);
    assert_eq!(second.tabs().active_tab(), Some(tab.clone()));
    assert_eq!(second.sections().tab_sections(&tab.id), vec![hero, grid]);
    end(second).await;
}

#[tokio::test]
async fn test_unload_event_flushes_before_teardown() {
    let dir = tempdir().unwrap();
    let lifecycle = Lifecycle::new();

    let first = session(dir.path());
    first.start(&lifecycle);
    first.hydrated().await.unwrap();
    let tab = first.tabs().add("Blog");

    lifecycle.emit(LifecycleEvent::VisibilityChange(Visibility::Hidden));
    // The flush runs on a spawned task; wait until it has been stored.
    let mut saved = false;
    for _ in 0..200 {
        let state: Option<PersistedState> = first
            .database()
            .get(first.config().state_key.as_str(), None)
            .await
            .unwrap();
        if state.is_some() && !first.is_syncing() {
            saved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saved, "visibility change never flushed");
    end(first).await;

    let second = session(dir.path());
    assert_eq!(second.hydrate().await, Ok(HydrateOutcome::Restored));
    assert_eq!(second.tabs().tabs_list(), vec![Tab::home(), tab]);
    end(second).await;
}

#[tokio::test]
async fn test_removed_tab_and_sections_stay_removed() {
    let dir = tempdir().unwrap();

    let first = session(dir.path());
    let keep = first.tabs().add("Keep");
    let gone = first.tabs().add("Drop");
    let kept = first
        .sections()
        .add(NewSection::new(&keep.id, "Stays", SectionType::Text));
    first
        .sections()
        .add(NewSection::new(&gone.id, "Goes", SectionType::Table));
    first.sync().await.unwrap();

    assert_eq!(first.tabs().remove(&gone.id, first.sections()), Some(2));
    first.sync().await.unwrap();
    end(first).await;

    let second = session(dir.path());
    second.hydrate().await.unwrap();
    assert_eq!(second.tabs().tabs_list(), vec![Tab::home(), keep]);
    assert_eq!(second.sections().sections(), vec![kept]);
    assert!(second.sections().tab_sections(&gone.id).is_empty());
    end(second).await;
}
