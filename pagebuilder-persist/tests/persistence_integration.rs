//! Persistence integration tests against the RocksDB engine.
//!
//! Verifies:
//! - Values survive closing and reopening the database
//! - Closing releases the directory even while a connection is held
//! - Concurrent opens share one RocksDB instance
//! - Version upgrades add partitions and backfill new indexes
//! - A second writer on the same directory is refused
//! - Unique indexes reject conflicting writes atomically

use pagebuilder_persist::{
    Database, DbError, DbOptions, DbStatus, IndexSpec, Key, RocksConfig, RocksEngine,
    StoreDefinition, Value,
};
use pagebuilder_persist::storage::TxMode;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Page {
    slug: String,
    tab: String,
    order: u32,
}

fn page(slug: &str, tab: &str, order: u32) -> Page {
    Page {
        slug: slug.into(),
        tab: tab.into(),
        order,
    }
}

fn rocks(path: &std::path::Path) -> Arc<RocksEngine> {
    Arc::new(RocksEngine::new(RocksConfig::for_testing(path)))
}

fn pages_v1() -> DbOptions {
    DbOptions::new("site")
        .version(1)
        .with_store(StoreDefinition::new("pages"))
}

// ─── Round trips ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_values_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let db = Database::new(rocks(dir.path()), pages_v1());
        db.set("home", &page("home", "main", 0), None).await.unwrap();
        db.set("about", &page("about", "main", 1), None).await.unwrap();
        db.set(42, &json!({"nested": {"list": [1, 2, 3]}}), None)
            .await
            .unwrap();
        db.close();
    }

    let db = Database::new(rocks(dir.path()), pages_v1());
    assert_eq!(
        db.get::<Page>("home", None).await.unwrap(),
        Some(page("home", "main", 0))
    );
    assert_eq!(
        db.get::<Value>(42, None).await.unwrap(),
        Some(json!({"nested": {"list": [1, 2, 3]}}))
    );
    assert_eq!(
        db.get_all_keys(None).await.unwrap(),
        vec![Key::Int(42), Key::from("about"), Key::from("home")]
    );
    assert_eq!(db.get::<Page>("missing", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_and_clear_persist() {
    let dir = tempdir().unwrap();

    {
        let db = Database::new(rocks(dir.path()), pages_v1());
        for i in 0..10 {
            db.set(i, &page(&format!("p{i}"), "main", i as u32), None)
                .await
                .unwrap();
        }
        db.del(3, None).await.unwrap();
        db.close();
    }

    let db = Database::new(rocks(dir.path()), pages_v1());
    assert_eq!(db.get_all_keys(None).await.unwrap().len(), 9);
    assert_eq!(db.get::<Page>(3, None).await.unwrap(), None);

    db.clear(None).await.unwrap();
    assert!(db.get_all::<Page>(None).await.unwrap().is_empty());
}

// ─── Connection lifecycle ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_share_instance() {
    let dir = tempdir().unwrap();
    let db = Database::new(rocks(dir.path()), pages_v1());

    // A second RocksDB instance on the same directory would fail on LOCK.
    let opens = (0..8).map(|_| {
        let db = db.clone();
        tokio::spawn(async move { db.open().await.map(|conn| conn.version()) })
    });
    for result in futures_util::future::join_all(opens).await {
        assert_eq!(result.unwrap(), Ok(1));
    }
    assert_eq!(db.status(), DbStatus::Ready);
}

#[tokio::test]
async fn test_second_writer_is_refused() {
    let dir = tempdir().unwrap();
    let first = Database::new(rocks(dir.path()), pages_v1());
    first.open().await.unwrap();

    let second = Database::new(rocks(dir.path()), pages_v1());
    assert!(matches!(
        second.open().await,
        Err(DbError::ConnectionError(_))
    ));
    assert_eq!(second.status(), DbStatus::Error);

    // The first connection is unaffected.
    first.set("k", &1, None).await.unwrap();
}

#[tokio::test]
async fn test_close_then_reuse() {
    let dir = tempdir().unwrap();
    let db = Database::new(rocks(dir.path()), pages_v1());
    db.set("k", "v", None).await.unwrap();

    db.close();
    assert_eq!(db.status(), DbStatus::Idle);

    assert_eq!(
        db.get::<String>("k", None).await.unwrap(),
        Some("v".to_string())
    );
    assert_eq!(db.status(), DbStatus::Ready);
}

#[tokio::test]
async fn test_close_then_reuse_with_connection_held() {
    let dir = tempdir().unwrap();
    let db = Database::new(rocks(dir.path()), pages_v1());
    db.set("k", "v", None).await.unwrap();

    let held = db.open().await.unwrap();
    db.close();

    assert_eq!(
        db.get::<String>("k", None).await.unwrap(),
        Some("v".to_string())
    );
    assert_eq!(db.status(), DbStatus::Ready);
    assert!(db.last_error().is_none());
    assert!(held.begin("pages", TxMode::ReadOnly).is_err());
}

// ─── Schema evolution ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upgrade_backfills_new_index() {
    let dir = tempdir().unwrap();

    {
        let db = Database::new(rocks(dir.path()), pages_v1());
        db.set(1, &page("home", "main", 0), None).await.unwrap();
        db.set(2, &page("faq", "help", 0), None).await.unwrap();
        db.set(3, &page("contact", "help", 1), None).await.unwrap();
        db.close();
    }

    let v2 = DbOptions::new("site")
        .version(2)
        .with_store(
            StoreDefinition::new("pages")
                .with_index(IndexSpec::new("by_tab", "tab"))
                .with_index(IndexSpec::new("by_slug", "slug").unique()),
        )
        .with_store(StoreDefinition::new("assets"));
    let db = Database::new(rocks(dir.path()), v2);

    let conn = db.open().await.unwrap();
    assert_eq!(conn.version(), 2);
    assert!(conn.partitions().contains(&"assets".to_string()));

    let help: Vec<Page> = db.get_all_by_index("by_tab", "help", None).await.unwrap();
    assert_eq!(help, vec![page("faq", "help", 0), page("contact", "help", 1)]);

    // Existing rows keep their index entries current on overwrite.
    db.set(2, &page("faq", "main", 5), None).await.unwrap();
    let help: Vec<Page> = db.get_all_by_index("by_tab", "help", None).await.unwrap();
    assert_eq!(help, vec![page("contact", "help", 1)]);

    db.set("x", &json!({"kind": "logo"}), Some("assets"))
        .await
        .unwrap();
    assert_eq!(db.get_all_keys(Some("assets")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unique_violation_leaves_store_untouched() {
    let dir = tempdir().unwrap();
    let options = DbOptions::new("site").with_store(
        StoreDefinition::new("pages").with_index(IndexSpec::new("by_slug", "slug").unique()),
    );
    let db = Database::new(rocks(dir.path()), options);
    db.set(1, &page("home", "main", 0), None).await.unwrap();

    let clash = db.set(2, &page("home", "other", 1), None).await;
    assert!(matches!(clash, Err(DbError::RequestFailed(_))));
    assert_eq!(db.get::<Page>(2, None).await.unwrap(), None);

    let homes: Vec<Page> = db.get_all_by_index("by_slug", "home", None).await.unwrap();
    assert_eq!(homes, vec![page("home", "main", 0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sets_keep_slug_unique() {
    let dir = tempdir().unwrap();
    let options = DbOptions::new("site").with_store(
        StoreDefinition::new("pages").with_index(IndexSpec::new("by_slug", "slug").unique()),
    );
    let db = Database::new(rocks(dir.path()), options);
    db.open().await.unwrap();

    let sets = (0..8).map(|i| {
        let db = db.clone();
        tokio::spawn(async move { db.set(i, &page("pricing", "main", i as u32), None).await })
    });
    let mut written = 0;
    for result in futures_util::future::join_all(sets).await {
        match result.unwrap() {
            Ok(()) => written += 1,
            Err(e) => assert!(matches!(
                e,
                DbError::RequestFailed(_) | DbError::TransactionFailed(_)
            )),
        }
    }

    assert_eq!(written, 1);
    assert_eq!(db.get_all_keys(None).await.unwrap().len(), 1);
    let pricing: Vec<Page> = db.get_all_by_index("by_slug", "pricing", None).await.unwrap();
    assert_eq!(pricing.len(), 1);
}

#[tokio::test]
async fn test_older_version_is_refused() {
    let dir = tempdir().unwrap();
    {
        let db = Database::new(rocks(dir.path()), pages_v1().version(3));
        db.open().await.unwrap();
        db.close();
    }

    let db = Database::new(rocks(dir.path()), pages_v1().version(2));
    let err = db.open().await.unwrap_err();
    assert!(matches!(err, DbError::ConnectionError(_)));
    assert_eq!(db.last_error(), Some(err));
}

#[tokio::test]
async fn test_unversioned_open_keeps_stored_version() {
    let dir = tempdir().unwrap();
    {
        let db = Database::new(rocks(dir.path()), pages_v1().version(4));
        db.set("k", &true, None).await.unwrap();
        db.close();
    }

    let mut options = pages_v1();
    options.version = None;
    let db = Database::new(rocks(dir.path()), options);
    assert_eq!(db.open().await.unwrap().version(), 4);
    assert_eq!(db.get::<bool>("k", None).await.unwrap(), Some(true));
}
