//! Snapshot orchestration between the domain stores and the database.
//!
//! ```text
//!   start(lifecycle)
//!        │
//!        ├──► hydrate task ─── get(state_key) ──► TabsStore::hydrate
//!        │                                     └► SectionsStore::hydrate
//!        │
//!        └──► trigger loop ─┬─ interval tick ───────────┐
//!                           └─ PageHide / BeforeUnload  ├──► spawn sync()
//!                              / VisibilityChange(Hidden)┘
//!
//!   sync(): guard ─► get_state() ×2 ─► to_plain ─► set(state_key) ─► release
//! ```
//!
//! Phases: `Uninitialized → Hydrating → Idle ⇄ Syncing → Stopped`.
//! Hydration and the trigger loop run side by side, so a lifecycle event
//! arriving during hydration flushes immediately. At most one sync holds
//! the guard; any trigger that finds it held is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use pagebuilder_core::{DomainStore, SectionsStore, TabsStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::db::{Database, DbError, DbOptions};
use crate::serialize::{from_plain, to_plain};
use crate::storage::{Engine, Value};

// ─── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_name: String,
    pub store: String,
    /// Key the snapshot is stored under.
    pub state_key: String,
    /// Period of the background flush.
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_name: "page-builder".to_string(),
            store: "snapshots".to_string(),
            state_key: "app-state".to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    /// Defaults with a timer slow enough never to fire during a test.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            ..Self::default()
        }
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions::new(self.db_name.clone()).store(self.store.clone())
    }
}

/// The stored record. Slices stay untyped until each store parses its own.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub tabs: Value,
    #[serde(default)]
    pub sections: Value,
    /// RFC 3339, millisecond precision, UTC.
    #[serde(default)]
    pub saved_at: String,
}

// ─── Lifecycle events ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Host signals that the process may go away soon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PageHide,
    BeforeUnload,
    VisibilityChange(Visibility),
}

impl LifecycleEvent {
    /// Whether this event is a flush point.
    pub fn should_flush(&self) -> bool {
        !matches!(self, LifecycleEvent::VisibilityChange(Visibility::Visible))
    }

    fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::PageHide => "pagehide",
            LifecycleEvent::BeforeUnload => "beforeunload",
            LifecycleEvent::VisibilityChange(_) => "visibilitychange",
        }
    }
}

/// Event target the host emits lifecycle events on.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Deliver `event` to every attached listener. Returns how many there were.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Hydrating,
    Idle,
    Syncing,
    Stopped,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Uninitialized => "uninitialized",
            SyncPhase::Hydrating => "hydrating",
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No durable storage in this environment.
    Unsupported,
    /// Another sync holds the guard.
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Written,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrateOutcome {
    /// A snapshot was found and handed to the stores.
    Restored,
    /// Nothing usable was stored; stores keep their defaults.
    Empty,
    /// No durable storage; hydration skipped.
    Unsupported,
}

// ─── Orchestrator ─────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SyncInner {
    config: SyncConfig,
    db: Database,
    tabs: TabsStore,
    sections: SectionsStore,
    started: AtomicBool,
    stopped: AtomicBool,
    hydrating: AtomicBool,
    syncing: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    hydration: watch::Sender<Option<Result<HydrateOutcome, DbError>>>,
}

/// Holds one of the phase flags raised; lowers it on every exit path.
struct FlagGuard<'a> {
    inner: &'a SyncInner,
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    /// Raise `flag` only if it is down.
    fn try_acquire(inner: &'a SyncInner, flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        inner.publish_phase();
        Some(Self { inner, flag })
    }

    fn raise(inner: &'a SyncInner, flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        inner.publish_phase();
        Self { inner, flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.inner.publish_phase();
    }
}

impl SyncInner {
    fn publish_phase(&self) {
        self.phase.send_if_modified(|phase| {
            let next = if self.stopped.load(Ordering::Acquire) {
                SyncPhase::Stopped
            } else if self.syncing.load(Ordering::Acquire) {
                SyncPhase::Syncing
            } else if self.hydrating.load(Ordering::Acquire) {
                SyncPhase::Hydrating
            } else if self.started.load(Ordering::Acquire) {
                SyncPhase::Idle
            } else {
                SyncPhase::Uninitialized
            };
            let changed = *phase != next;
            *phase = next;
            changed
        });
    }

    async fn hydrate(&self) -> Result<HydrateOutcome, DbError> {
        let result = self.load().await;
        self.hydration.send_replace(Some(result.clone()));
        result
    }

    async fn load(&self) -> Result<HydrateOutcome, DbError> {
        if !self.db.is_supported() {
            log::info!("Durable storage unavailable; starting from defaults");
            return Ok(HydrateOutcome::Unsupported);
        }
        let _hydrating = FlagGuard::raise(self, &self.hydrating);

        self.db.open().await?;
        let stored: Option<Value> = self.db.get(self.config.state_key.as_str(), None).await?;
        let Some(stored) = stored else {
            log::info!("No saved state under '{}'", self.config.state_key);
            return Ok(HydrateOutcome::Empty);
        };

        match from_plain::<PersistedState>(stored) {
            Ok(state) => {
                hydrate_slice(&self.tabs, state.tabs, "tabs");
                hydrate_slice(&self.sections, state.sections, "sections");
                log::info!("Restored state saved at {}", state.saved_at);
                Ok(HydrateOutcome::Restored)
            }
            Err(e) => {
                log::warn!("Ignoring malformed snapshot: {e}");
                self.tabs.hydrate(None);
                self.sections.hydrate(None);
                Ok(HydrateOutcome::Empty)
            }
        }
    }

    async fn sync(&self) -> Result<SyncOutcome, DbError> {
        if !self.db.is_supported() {
            return Ok(SyncOutcome::Skipped(SkipReason::Unsupported));
        }
        let Some(_syncing) = FlagGuard::try_acquire(self, &self.syncing) else {
            log::debug!("Sync already in flight; skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::InProgress));
        };

        let payload = PersistedState {
            tabs: to_plain(&self.tabs.get_state())?,
            sections: to_plain(&self.sections.get_state())?,
            saved_at: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
        };
        self.db
            .set(self.config.state_key.as_str(), &payload, None)
            .await?;
        log::debug!("Snapshot written at {}", payload.saved_at);
        Ok(SyncOutcome::Written)
    }

    fn spawn_sync(self: &Arc<Self>, trigger: &'static str) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.sync().await {
                Ok(SyncOutcome::Written) => log::debug!("Synced on {trigger}"),
                Ok(SyncOutcome::Skipped(_)) => {}
                Err(e) => log::warn!("Sync on {trigger} failed, retrying on next trigger: {e}"),
            }
        });
    }
}

/// Parse one slice for its store. Null, missing or malformed slices
/// hydrate with `None`.
fn hydrate_slice<S: DomainStore>(store: &S, slice: Value, label: &str) {
    let state = if slice.is_null() {
        None
    } else {
        match from_plain::<S::State>(slice) {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("Ignoring malformed {label} slice: {e}");
                None
            }
        }
    };
    store.hydrate(state);
}

async fn run_triggers(inner: Arc<SyncInner>, mut events: broadcast::Receiver<LifecycleEvent>) {
    let period = inner.config.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut listening = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.spawn_sync("interval"),
            event = events.recv(), if listening => match event {
                Ok(event) if event.should_flush() => inner.spawn_sync(event.name()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {missed} lifecycle events; flushing");
                    inner.spawn_sync("lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    log::debug!("Lifecycle channel closed; timer only");
                    listening = false;
                }
            },
        }
    }
}

/// Keeps [`TabsStore`] and [`SectionsStore`] mirrored in durable storage.
pub struct DataSync {
    inner: Arc<SyncInner>,
    triggers: Mutex<Option<JoinHandle<()>>>,
}

impl DataSync {
    pub fn new(
        engine: Arc<dyn Engine>,
        config: SyncConfig,
        tabs: TabsStore,
        sections: SectionsStore,
    ) -> Self {
        let db = Database::new(engine, config.db_options());
        let (phase, _) = watch::channel(SyncPhase::Uninitialized);
        let (hydration, _) = watch::channel(None);
        Self {
            inner: Arc::new(SyncInner {
                config,
                db,
                tabs,
                sections,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                hydrating: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                phase,
                hydration,
            }),
            triggers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn tabs(&self) -> &TabsStore {
        &self.inner.tabs
    }

    pub fn sections(&self) -> &SectionsStore {
        &self.inner.sections
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Spawn hydration and attach the timer and lifecycle listeners.
    ///
    /// Must be called inside a tokio runtime. Calls after the first, or
    /// after [`DataSync::stop`], do nothing.
    ///
    /// Triggers never wait for hydration. A flush that commits before
    /// hydration reads the snapshot stores the stores' current (default)
    /// state, and hydration then restores that instead of the previous
    /// session.
    pub fn start(&self, lifecycle: &Lifecycle) {
        if self.inner.stopped.load(Ordering::Acquire) {
            log::warn!("Ignoring start on a stopped orchestrator");
            return;
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.publish_phase();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.hydrate().await {
                log::error!("Failed to hydrate state: {e}");
            }
        });

        let events = lifecycle.subscribe();
        let handle = tokio::spawn(run_triggers(Arc::clone(&self.inner), events));
        *lock(&self.triggers) = Some(handle);
        log::info!(
            "Sync started (every {}s)",
            self.inner.config.interval.as_secs_f32()
        );
    }

    /// Restore both stores from the stored snapshot.
    pub async fn hydrate(&self) -> Result<HydrateOutcome, DbError> {
        self.inner.hydrate().await
    }

    /// Wait for the first hydration started by [`DataSync::start`] (or a
    /// direct [`DataSync::hydrate`]) to finish.
    pub async fn hydrated(&self) -> Result<HydrateOutcome, DbError> {
        let mut rx = self.inner.hydration.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DbError::TransactionAborted("orchestrator dropped".into()))?;
        match &*settled {
            Some(result) => result.clone(),
            None => Ok(HydrateOutcome::Empty),
        }
    }

    /// Write one snapshot of both stores.
    pub async fn sync(&self) -> Result<SyncOutcome, DbError> {
        self.inner.sync().await
    }

    fn detach(&self) -> Option<JoinHandle<()>> {
        let handle = lock(&self.triggers).take();
        if let Some(handle) = &handle {
            handle.abort();
            log::info!("Sync stopped");
        }
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.publish_phase();
        handle
    }

    /// Cancel the timer and detach lifecycle listeners. In-flight syncs
    /// finish on their own. Idempotent.
    pub fn stop(&self) {
        self.detach();
    }

    /// [`DataSync::stop`], then wait until the listeners are gone.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.detach() {
            let _ = handle.await;
        }
    }
}

impl Drop for DataSync {
    fn drop(&mut self) {
        self.stop();
    }
}
