//! Page Builder: headless host for the persistence layer.
//!
//! Opens the RocksDB engine under `PAGE_BUILDER_DATA`, restores the last
//! session, and reads editing commands from stdin. Ctrl-C and `quit` are
//! treated as an unload: one final snapshot is written before exit.

mod commands;

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::Command;
use pagebuilder_core::{SectionsStore, TabsStore};
use pagebuilder_persist::{
    DataSync, Lifecycle, RocksConfig, RocksEngine, SkipReason, SyncConfig, SyncOutcome,
};

/// Host settings read from the environment.
#[derive(Debug, Clone)]
struct AppConfig {
    data_dir: PathBuf,
    sync_interval: Duration,
}

impl AppConfig {
    fn from_env() -> Self {
        let data_dir = std::env::var_os("PAGE_BUILDER_DATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| RocksConfig::default().path);
        let default_interval = SyncConfig::default().interval;
        let sync_interval = match std::env::var("PAGE_BUILDER_SYNC_SECS") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!("Ignoring PAGE_BUILDER_SYNC_SECS={raw:?}");
                    default_interval
                }
            },
            Err(_) => default_interval,
        };
        Self {
            data_dir,
            sync_interval,
        }
    }
}

/// Write the last snapshot. A flush already in flight holds older state,
/// so wait for it and write again.
async fn final_flush(sync: &DataSync) {
    loop {
        match sync.sync().await {
            Ok(SyncOutcome::Written) => {
                info!("Final snapshot written");
                return;
            }
            Ok(SyncOutcome::Skipped(SkipReason::InProgress)) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(SyncOutcome::Skipped(SkipReason::Unsupported)) => {
                warn!("No durable storage; this session is not saved");
                return;
            }
            Err(e) => {
                error!("Final snapshot failed: {e}");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting Page Builder...");
    let config = AppConfig::from_env();
    let engine = RocksEngine::new(RocksConfig {
        path: config.data_dir.clone(),
        ..RocksConfig::default()
    });
    let sync_config = SyncConfig {
        interval: config.sync_interval,
        ..SyncConfig::default()
    };

    let tabs = TabsStore::new();
    let sections = SectionsStore::new();
    let sync = DataSync::new(Arc::new(engine), sync_config, tabs.clone(), sections.clone());
    let lifecycle = Lifecycle::new();
    sync.start(&lifecycle);

    match sync.hydrated().await {
        Ok(outcome) => info!(
            "Session ready ({outcome:?}): {} tabs, {} sections, data at {}",
            tabs.len(),
            sections.len(),
            config.data_dir.display()
        ),
        Err(e) => warn!("Starting from defaults: {e}"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match &command {
            Command::Quit => break,
            Command::Signal(event) => {
                lifecycle.emit(*event);
            }
            Command::Sync => match sync.sync().await {
                Ok(outcome) => println!("{outcome:?}"),
                Err(e) => println!("sync failed: {e}"),
            },
            other => {
                for out in commands::apply(other, &tabs, &sections) {
                    println!("{out}");
                }
            }
        }
    }

    // Detach triggers first so nothing new starts behind the last flush.
    sync.shutdown().await;
    final_flush(&sync).await;
    sync.database().close();
    info!("Bye");
}
