//! Application state persistence
//!
//! [`PersistManager`] writes selected slices of application state to a
//! storage backend on a throttled schedule and rebuilds state from the
//! backend at startup, upgrading it through migrations as needed.
//!
//! Each persist cycle moves `Idle -> Pending -> Writing -> Idle`. Calls to
//! [`PersistManager::persist`] inside one throttle window coalesce: only the
//! latest snapshot is written. A failed write is reported and dropped; the
//! next state change starts a new cycle.

use crate::backend::{BackendError, Backends, StorageBackend};
use crate::config::{ConfigError, PersistConfig};
use crate::migrate::MigrationError;
use crate::record::{self, RecordError};
use crate::transform::{ResolvedTransforms, TransformError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Capacity of the manager's event channel
const EVENT_BUFFER: usize = 32;

/// Own backend changes remembered until their notifications arrive
const OWN_CHANGE_LIMIT: usize = 128;

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistError {
    /// State could not be converted to the storage format
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Application state is not a map of slices
    #[error("State must serialize to an object of slices")]
    NotSliced,

    /// Backend rejected a write
    #[error("Write to {key} failed: {source}")]
    BackendWrite {
        /// Backend record key
        key: String,
        /// Underlying backend error
        source: BackendError,
    },

    /// Backend read failed
    #[error("Read of {key} failed: {source}")]
    BackendRead {
        /// Backend record key
        key: String,
        /// Underlying backend error
        source: BackendError,
    },

    /// Backend removal failed
    #[error("Removal of {key} failed: {source}")]
    BackendRemove {
        /// Backend record key
        key: String,
        /// Underlying backend error
        source: BackendError,
    },

    /// Stored record could not be decoded
    #[error("Corrupt record {key}: {source}")]
    CorruptRecord {
        /// Backend record key
        key: String,
        /// Decoding error
        source: RecordError,
    },

    /// A migration step failed
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A transform failed
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for persistence operations
pub type Result<T> = std::result::Result<T, PersistError>;

/// Rehydrated state: slices tagged with the schema version they follow
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version
    pub version: u32,
    /// Slice name to value
    pub slices: BTreeMap<String, Value>,
}

impl PersistedState {
    /// Empty state at `version`
    pub fn empty(version: u32) -> Self {
        Self { version, slices: BTreeMap::new() }
    }

    /// Add a slice
    pub fn with_slice(mut self, name: impl Into<String>, value: Value) -> Self {
        self.slices.insert(name.into(), value);
        self
    }

    /// Get a slice
    pub fn slice(&self, name: &str) -> Option<&Value> {
        self.slices.get(name)
    }

    /// Whether no slices were restored
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Deserialize one slice into a typed value
    pub fn slice_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.slices
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Where the current persist cycle is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStatus {
    /// Nothing waiting to be written
    Idle,
    /// A snapshot is waiting for the throttle window to close
    Pending,
    /// A snapshot is being written
    Writing,
}

/// Notifications emitted by a manager
#[derive(Debug, Clone, PartialEq)]
pub enum PersistEvent {
    /// A snapshot reached the backend
    Written {
        /// Store key
        key: String,
        /// Schema version written
        version: u32,
    },

    /// A write failed and was dropped
    WriteFailed {
        /// Store key
        key: String,
        /// Failure description
        error: String,
    },

    /// Another writer changed the record; the application should apply it
    ExternallyChanged {
        /// Store key
        key: String,
        /// Rehydrated state from the new record
        state: PersistedState,
    },
}

struct PendingWrite {
    generation: u64,
    slices: Map<String, Value>,
}

#[derive(Default)]
struct Cycle {
    pending: Option<PendingWrite>,
    generation: u64,
    in_flight: usize,
    writer_active: bool,
    /// Values this manager wrote (`None` for removals), oldest first
    own_changes: VecDeque<Option<String>>,
}

impl Cycle {
    fn take_pending(&mut self) -> Option<PendingWrite> {
        let pending = self.pending.take()?;
        self.in_flight += 1;
        Some(pending)
    }

    fn expect_change(&mut self, value: Option<String>) {
        if self.own_changes.len() == OWN_CHANGE_LIMIT {
            self.own_changes.pop_front();
        }
        self.own_changes.push_back(value);
    }

    fn forget_change(&mut self, value: &Option<String>) {
        if let Some(pos) = self.own_changes.iter().rposition(|c| c == value) {
            self.own_changes.remove(pos);
        }
    }

    /// Match a backend notification against our own changes.
    ///
    /// Notifications arrive in write order, so older entries that never
    /// produced one are dropped along with the match.
    fn take_own_change(&mut self, value: &Option<String>) -> bool {
        match self.own_changes.iter().position(|c| c == value) {
            Some(pos) => {
                self.own_changes.drain(..=pos);
                true
            }
            None => false,
        }
    }
}

struct Inner {
    config: PersistConfig,
    transforms: ResolvedTransforms,
    backend: Arc<dyn StorageBackend>,
    storage_key: String,
    cycle: Mutex<Cycle>,
    /// Generation of the newest snapshot on the backend; held for every write
    written: Mutex<u64>,
    events_tx: broadcast::Sender<PersistEvent>,
}

/// Persists and rehydrates one store
#[derive(Clone)]
pub struct PersistManager {
    inner: Arc<Inner>,
}

impl PersistManager {
    /// Create a manager writing to the backend named by `config.storage`
    pub fn new(config: PersistConfig, backends: &Backends) -> std::result::Result<Self, ConfigError> {
        let backend = backends.for_kind(config.storage);
        Self::with_backend(config, backend)
    }

    /// Create a manager over an explicit backend
    pub fn with_backend(
        config: PersistConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        if backend.kind() != config.storage {
            tracing::warn!(
                "Store {} is configured for {} storage but was given a {} backend",
                config.key,
                config.storage,
                backend.kind()
            );
        }

        if !config.transforms.is_empty() {
            tracing::debug!("Store {} uses {} transforms", config.key, config.transforms.len());
        }

        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            inner: Arc::new(Inner {
                transforms: config.resolve_transforms(),
                storage_key: config.storage_key(),
                config,
                backend,
                cycle: Mutex::new(Cycle::default()),
                written: Mutex::new(0),
                events_tx,
            }),
        })
    }

    /// The store's configuration
    pub fn config(&self) -> &PersistConfig {
        &self.inner.config
    }

    /// Backend record key
    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    /// The backend this store writes to
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.inner.backend.clone()
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<PersistEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Current persist cycle state
    pub async fn status(&self) -> PersistStatus {
        let cycle = self.inner.cycle.lock().await;
        if cycle.in_flight > 0 {
            PersistStatus::Writing
        } else if cycle.pending.is_some() {
            PersistStatus::Pending
        } else {
            PersistStatus::Idle
        }
    }

    /// Schedule `state` to be written.
    ///
    /// The state must serialize to an object whose fields are slices. The
    /// write happens once the throttle window closes; later calls in the same
    /// window replace the snapshot. Failures go to the configured handler.
    pub async fn persist<S: Serialize>(&self, state: &S) {
        let snapshot = match serde_json::to_value(state) {
            Ok(Value::Object(slices)) => slices,
            Ok(_) => return self.inner.report(&PersistError::NotSliced),
            Err(e) => return self.inner.report(&PersistError::Serialization(e)),
        };

        let mut cycle = self.inner.cycle.lock().await;
        cycle.generation += 1;
        cycle.pending = Some(PendingWrite { generation: cycle.generation, slices: snapshot });

        if !cycle.writer_active {
            cycle.writer_active = true;
            tokio::spawn(run_writer(self.inner.clone()));
        }
    }

    /// Write the pending snapshot now, ignoring the throttle
    pub async fn flush(&self) -> Result<()> {
        let pending = self.inner.cycle.lock().await.take_pending();
        match pending {
            Some(pending) => self.inner.write(pending).await,
            None => Ok(()),
        }
    }

    /// Rebuild state from the backend.
    ///
    /// A missing record yields an empty state at the configured version.
    /// Unreadable records and damaged slices fall back to defaults; only a
    /// failing migration is returned as an error.
    pub async fn rehydrate(&self) -> Result<PersistedState> {
        let key = &self.inner.storage_key;

        let raw = match self.inner.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::debug!("No persisted record for {}", key);
                return Ok(PersistedState::empty(self.inner.config.version));
            }
            Err(source) => {
                let err = PersistError::BackendRead { key: key.clone(), source };
                tracing::warn!("{}; using defaults", err);
                return Ok(self.inner.defaults());
            }
        };

        let state = self.restore(&raw)?;
        tracing::info!(
            "Rehydrated {} slices from {} at version {}",
            state.slices.len(),
            key,
            state.version
        );
        Ok(state)
    }

    /// Remove the records of the named stores from this manager's backend.
    ///
    /// Every removal is attempted; returns false if any failed.
    pub async fn clear(&self, keys: &[&str]) -> bool {
        let mut ok = true;

        for key in keys {
            let storage_key = record::storage_key(key);
            let own = storage_key == self.inner.storage_key;
            if own {
                self.inner.cycle.lock().await.expect_change(None);
            }

            if let Err(source) = self.inner.backend.remove(&storage_key).await {
                if own {
                    self.inner.cycle.lock().await.forget_change(&None);
                }
                let err = PersistError::BackendRemove { key: storage_key, source };
                tracing::warn!("{}", err);
                ok = false;
            }
        }

        ok
    }

    /// Drop any pending snapshot and remove this store's record
    pub async fn purge(&self) -> bool {
        self.inner.cycle.lock().await.pending = None;
        let key = self.inner.config.key.clone();
        self.clear(&[key.as_str()]).await
    }

    /// Decode, migrate and transform a raw record
    pub(crate) fn restore(&self, raw: &str) -> Result<PersistedState> {
        let inner = &self.inner;

        let decoded = match record::decode(raw) {
            Ok(decoded) => decoded,
            Err(source) => {
                let err = PersistError::CorruptRecord { key: inner.storage_key.clone(), source };
                tracing::warn!("{}; using defaults", err);
                return Ok(inner.defaults());
            }
        };

        let stored: Map<String, Value> = decoded.slices.into_iter().collect();
        let migrated = inner
            .config
            .migrations
            .run(Value::Object(stored), decoded.version, inner.config.version)?;

        let Value::Object(migrated) = migrated else {
            return Err(MigrationError::StepFailed {
                version: inner.config.version,
                reason: "migrated state is not an object of slices".to_string(),
            }
            .into());
        };

        let mut state = PersistedState::empty(decoded.version.max(inner.config.version));
        let mut failed = decoded.corrupt;

        for (name, value) in migrated {
            if !inner.config.includes(&name) {
                continue;
            }
            match inner.transforms.inbound(&name, value) {
                Ok(value) => {
                    state.slices.insert(name, value);
                }
                Err(e) => {
                    tracing::warn!("{}; slice {} will use its default", e, name);
                    failed.push(name);
                }
            }
        }

        for name in failed {
            if let Some(default) = inner.config.defaults.get(&name) {
                state.slices.insert(name, default.clone());
            }
        }

        Ok(state)
    }

    /// Whether a backend notification for this store came from this manager
    pub(crate) async fn take_own_change(&self, value: &Option<String>) -> bool {
        self.inner.cycle.lock().await.take_own_change(value)
    }

    pub(crate) fn emit(&self, event: PersistEvent) {
        let _ = self.inner.events_tx.send(event);
    }
}

impl Inner {
    /// Select slices, drop blacklisted paths and apply outbound transforms
    fn select(&self, snapshot: &Map<String, Value>) -> Result<BTreeMap<String, Value>> {
        let mut selected = BTreeMap::new();

        'slices: for (name, value) in snapshot {
            if !self.config.includes(name) {
                continue;
            }

            let mut value = value.clone();
            for path in self.config.blacklist.iter().filter(|p| p.slice() == name) {
                if path.is_slice() {
                    continue 'slices;
                }
                path.remove_from(&mut value);
            }

            let value = self.transforms.outbound(name, value)?;
            selected.insert(name.clone(), value);
        }

        Ok(selected)
    }

    async fn write(&self, pending: PendingWrite) -> Result<()> {
        let result = {
            let mut written = self.written.lock().await;
            if pending.generation <= *written {
                tracing::debug!("Skipping superseded snapshot for {}", self.storage_key);
                None
            } else {
                let result = self.write_record(&pending.slices).await;
                if result.is_ok() {
                    *written = pending.generation;
                }
                Some(result)
            }
        };
        self.cycle.lock().await.in_flight -= 1;

        match result {
            None => Ok(()),
            Some(Ok(())) => {
                tracing::debug!("Persisted {} at version {}", self.storage_key, self.config.version);
                let _ = self.events_tx.send(PersistEvent::Written {
                    key: self.config.key.clone(),
                    version: self.config.version,
                });
                Ok(())
            }
            Some(Err(e)) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    async fn write_record(&self, snapshot: &Map<String, Value>) -> Result<()> {
        let slices = self.select(snapshot)?;
        let raw = record::encode(&slices, self.config.version)?;

        // Recorded first so our own change notification is not taken as external
        self.cycle.lock().await.expect_change(Some(raw.clone()));

        if let Err(source) = self.backend.set(&self.storage_key, raw.clone()).await {
            self.cycle.lock().await.forget_change(&Some(raw));
            return Err(PersistError::BackendWrite { key: self.storage_key.clone(), source });
        }
        Ok(())
    }

    fn report(&self, err: &PersistError) {
        tracing::warn!("Persist of {} failed: {}", self.storage_key, err);

        if let Some(handler) = &self.config.on_write_error {
            handler(err);
        }

        let _ = self.events_tx.send(PersistEvent::WriteFailed {
            key: self.config.key.clone(),
            error: err.to_string(),
        });
    }

    fn defaults(&self) -> PersistedState {
        let mut state = PersistedState::empty(self.config.version);
        state.slices = self.config.defaults.clone();
        state
    }
}

async fn run_writer(inner: Arc<Inner>) {
    loop {
        if inner.config.throttle.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(inner.config.throttle).await;
        }

        let pending = {
            let mut cycle = inner.cycle.lock().await;
            match cycle.take_pending() {
                Some(pending) => pending,
                None => {
                    cycle.writer_active = false;
                    return;
                }
            }
        };

        // Failures are reported inside write; the cycle goes back to idle
        let _ = inner.write(pending).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockStorageBackend, SessionBackend, StorageKind};
    use crate::transform::{FnTransform, Obfuscate};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn session_manager(config: PersistConfig) -> (PersistManager, Arc<SessionBackend>) {
        let backend = Arc::new(SessionBackend::new());
        let manager = PersistManager::with_backend(config.storage(StorageKind::Session), backend.clone())
            .unwrap();
        (manager, backend)
    }

    #[tokio::test]
    async fn test_missing_record_rehydrates_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = PersistConfig::new("root").version(3).migrate(1, move |s| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(s)
        });
        let (manager, _) = session_manager(config);

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state, PersistedState::empty(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_then_rehydrate() {
        let (manager, backend) = session_manager(PersistConfig::new("root").version(1));

        manager.persist(&json!({ "ui": { "theme": "dark" } })).await;
        assert_eq!(manager.status().await, PersistStatus::Pending);
        manager.flush().await.unwrap();
        assert_eq!(manager.status().await, PersistStatus::Idle);

        assert!(backend.get("persist:root").await.unwrap().is_some());

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.slice("ui"), Some(&json!({ "theme": "dark" })));
    }

    #[tokio::test]
    async fn test_blacklisted_subpath_dropped() {
        let config = PersistConfig::new("root")
            .whitelist(["interview"])
            .blacklist(["interview.currentSession.stream"])
            .unwrap();
        let (manager, _) = session_manager(config);

        manager
            .persist(&json!({
                "interview": { "currentSession": { "id": "s1", "stream": { "live": true } } },
                "ui": { "theme": "dark" }
            }))
            .await;
        manager.flush().await.unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slice("interview"), Some(&json!({ "currentSession": { "id": "s1" } })));
        assert_eq!(state.slice("ui"), None);
    }

    #[tokio::test]
    async fn test_blacklisted_slice_dropped() {
        let config = PersistConfig::new("root").blacklist(["ui"]).unwrap();
        let (manager, _) = session_manager(config);

        manager.persist(&json!({ "ui": {}, "candidate": { "list": [] } })).await;
        manager.flush().await.unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slices.keys().collect::<Vec<_>>(), vec!["candidate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_coalesces_to_latest() {
        let (manager, backend) =
            session_manager(PersistConfig::new("root").throttle(Duration::from_millis(500)));
        let mut events = manager.subscribe();

        for n in 0..5 {
            manager.persist(&json!({ "timer": { "remaining": n } })).await;
        }
        assert!(backend.get("persist:root").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(510)).await;

        assert_eq!(
            events.try_recv().unwrap(),
            PersistEvent::Written { key: "root".to_string(), version: 0 }
        );
        assert!(events.try_recv().is_err());

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slice("timer"), Some(&json!({ "remaining": 4 })));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.status().await, PersistStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_spaced_by_throttle() {
        let (manager, _) =
            session_manager(PersistConfig::new("root").throttle(Duration::from_millis(100)));
        let mut events = manager.subscribe();

        manager.persist(&json!({ "a": 1 })).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.persist(&json!({ "a": 2 })).await;

        // Second window closes 100ms after the first write
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_ok());
        assert_eq!(manager.rehydrate().await.unwrap().slice("a"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_write_failure_reported_without_retry() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let config = PersistConfig::new("root")
            .storage(StorageKind::Session)
            .on_write_error(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let backend = Arc::new(SessionBackend::new().with_quota(16));
        let manager = PersistManager::with_backend(config, backend.clone()).unwrap();

        manager.persist(&json!({ "candidate": { "list": ["a long resume body"] } })).await;
        let err = manager.flush().await.unwrap_err();

        assert!(matches!(
            err,
            PersistError::BackendWrite { source: BackendError::QuotaExceeded { .. }, .. }
        ));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().await, PersistStatus::Idle);
        assert!(backend.keys().await.unwrap().is_empty());

        // Nothing left to retry
        manager.flush().await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_object_state_rejected() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let (manager, _) = session_manager(PersistConfig::new("root").on_write_error(move |e| {
            assert!(matches!(e, PersistError::NotSliced));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        manager.persist(&json!([1, 2, 3])).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().await, PersistStatus::Idle);
    }

    #[tokio::test]
    async fn test_migrations_then_inbound_transforms() {
        let (manager, backend) = session_manager(
            PersistConfig::new("root")
                .version(2)
                .migrate(1, |mut s| {
                    s["ui"]["theme"] = json!("light");
                    Ok(s)
                })
                .migrate(2, |mut s| {
                    s["ui"]["density"] = json!("compact");
                    Ok(s)
                })
                .transform(FnTransform::new(
                    "mark",
                    |v, _| Ok(v),
                    |mut v, _| {
                        v["restored"] = json!(true);
                        Ok(v)
                    },
                )),
        );

        backend
            .set("persist:root", r#"{"ui":"{\"font\":12}"}"#.to_string())
            .await
            .unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(
            state.slice("ui"),
            Some(&json!({ "font": 12, "theme": "light", "density": "compact", "restored": true }))
        );
    }

    #[tokio::test]
    async fn test_migration_failure_propagates() {
        let (manager, backend) = session_manager(
            PersistConfig::new("root").version(1).migrate(1, |_| {
                Err(MigrationError::StepFailed { version: 1, reason: "bad shape".to_string() })
            }),
        );
        backend.set("persist:root", r#"{"ui":"{}"}"#.to_string()).await.unwrap();

        let err = manager.rehydrate().await.unwrap_err();
        assert!(matches!(err, PersistError::Migration(_)));
    }

    #[tokio::test]
    async fn test_corrupt_slice_uses_default() {
        let (manager, backend) = session_manager(
            PersistConfig::new("root")
                .version(1)
                .default_slice("ui", json!({ "theme": "system" })),
        );
        backend
            .set(
                "persist:root",
                r#"{"ui":"{broken","candidate":"{\"list\":[1]}","_persist":"{\"version\":1}"}"#
                    .to_string(),
            )
            .await
            .unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slice("ui"), Some(&json!({ "theme": "system" })));
        assert_eq!(state.slice("candidate"), Some(&json!({ "list": [1] })));
    }

    #[tokio::test]
    async fn test_inbound_failure_isolated_to_slice() {
        let (manager, backend) = session_manager(
            PersistConfig::new("root").transforms(
                crate::transform::TransformRegistry::new().add_for(&["secret"], Obfuscate),
            ),
        );
        backend
            .set("persist:root", r#"{"secret":"\"%%%\"","ui":"{}"}"#.to_string())
            .await
            .unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slice("secret"), None);
        assert_eq!(state.slice("ui"), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_unreadable_record_yields_defaults() {
        let (manager, backend) =
            session_manager(PersistConfig::new("root").version(4).default_slice("ui", json!({})));
        backend.set("persist:root", "<<<".to_string()).await.unwrap();

        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.slice("ui"), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_backend_read_failure_yields_defaults() {
        let mut backend = MockStorageBackend::new();
        backend.expect_kind().return_const(StorageKind::Local);
        backend
            .expect_get()
            .returning(|_| Err(BackendError::Unavailable("disk detached".to_string())));

        let manager = PersistManager::with_backend(PersistConfig::new("root").version(2), Arc::new(backend))
            .unwrap();

        assert_eq!(manager.rehydrate().await.unwrap(), PersistedState::empty(2));
    }

    #[tokio::test]
    async fn test_clear_reports_partial_failure() {
        let mut backend = MockStorageBackend::new();
        backend.expect_kind().return_const(StorageKind::Local);
        backend.expect_remove().returning(|key| {
            if key == "persist:session" {
                Err(BackendError::Unavailable("locked".to_string()))
            } else {
                Ok(())
            }
        });

        let manager = PersistManager::with_backend(PersistConfig::new("root"), Arc::new(backend)).unwrap();

        assert!(manager.clear(&["root"]).await);
        assert!(!manager.clear(&["root", "session"]).await);
    }

    #[tokio::test]
    async fn test_purge_removes_record() {
        let (manager, backend) = session_manager(PersistConfig::new("root"));
        manager.persist(&json!({ "ui": {} })).await;
        manager.flush().await.unwrap();

        assert!(manager.purge().await);
        assert!(backend.get("persist:root").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rehydrate_then_persist_is_stable() {
        let (manager, backend) = session_manager(
            PersistConfig::new("root").version(1).transform(Obfuscate),
        );
        manager
            .persist(&json!({ "candidate": { "list": [{ "name": "Ada", "score": 91 }] } }))
            .await;
        manager.flush().await.unwrap();
        let first = backend.get("persist:root").await.unwrap().unwrap();

        let state = manager.rehydrate().await.unwrap();
        manager.persist(&state.slices).await;
        manager.flush().await.unwrap();
        let second = backend.get("persist:root").await.unwrap().unwrap();

        assert_eq!(record::decode(&first).unwrap(), record::decode(&second).unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let backends = Backends::new(
            Arc::new(SessionBackend::new()),
            Arc::new(SessionBackend::new()),
        );
        let result = PersistManager::new(PersistConfig::new(""), &backends);
        assert!(matches!(result, Err(ConfigError::EmptyKey)));
    }

    struct GatedBackend {
        records: SessionBackend,
        gate: tokio::sync::Notify,
        hold_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl StorageBackend for GatedBackend {
        fn kind(&self) -> StorageKind {
            StorageKind::Session
        }

        async fn get(&self, key: &str) -> crate::backend::Result<Option<String>> {
            self.records.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> crate::backend::Result<()> {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.records.set(key, value).await
        }

        async fn remove(&self, key: &str) -> crate::backend::Result<()> {
            self.records.remove(key).await
        }

        async fn keys(&self) -> crate::backend::Result<Vec<String>> {
            self.records.keys().await
        }

        fn subscribe(&self) -> broadcast::Receiver<crate::backend::StorageEvent> {
            self.records.subscribe()
        }
    }

    fn slices(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_flush_during_slow_write_keeps_latest() {
        let backend = Arc::new(GatedBackend {
            records: SessionBackend::new(),
            gate: tokio::sync::Notify::new(),
            hold_next: std::sync::atomic::AtomicBool::new(true),
        });
        let manager = PersistManager::with_backend(
            PersistConfig::new("root").storage(StorageKind::Session),
            backend.clone(),
        )
        .unwrap();

        manager.persist(&json!({ "ui": { "n": 1 } })).await;
        for _ in 0..10 {
            if manager.status().await == PersistStatus::Writing {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.status().await, PersistStatus::Writing);

        manager.persist(&json!({ "ui": { "n": 2 } })).await;
        let flusher = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.flush().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.status().await, PersistStatus::Writing);

        backend.gate.notify_one();
        flusher.await.unwrap().unwrap();

        assert_eq!(manager.status().await, PersistStatus::Idle);
        let state = manager.rehydrate().await.unwrap();
        assert_eq!(state.slice("ui"), Some(&json!({ "n": 2 })));
    }

    #[tokio::test]
    async fn test_superseded_snapshot_not_written() {
        let (manager, backend) = session_manager(PersistConfig::new("root"));
        let mut events = manager.subscribe();
        manager.inner.cycle.lock().await.in_flight = 2;

        let newer = PendingWrite { generation: 2, slices: slices(json!({ "ui": { "n": 2 } })) };
        let older = PendingWrite { generation: 1, slices: slices(json!({ "ui": { "n": 1 } })) };
        manager.inner.write(newer).await.unwrap();
        manager.inner.write(older).await.unwrap();

        let raw = backend.get("persist:root").await.unwrap().unwrap();
        assert_eq!(record::decode(&raw).unwrap().slices["ui"], json!({ "n": 2 }));
        assert!(matches!(events.try_recv(), Ok(PersistEvent::Written { .. })));
        assert!(events.try_recv().is_err());
        assert_eq!(manager.status().await, PersistStatus::Idle);
    }
}
