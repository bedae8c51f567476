//! Coordination of several persisted stores
//!
//! An application usually keeps more than one store: durable preferences
//! and candidate data, plus session-scoped interview progress. [`Persistor`]
//! owns one [`PersistManager`] per store and handles the operations that span
//! all of them: startup rehydration, fan-out writes, clearing, and
//! snapshot export and import.

use crate::backend::{Backends, StorageKind};
use crate::config::{ConfigError, PersistConfig};
use crate::persistence::{PersistManager, PersistedState, Result};
use crate::record::KEY_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw records from every backend, keyed by backend kind then record key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Backend kind to record key to raw record
    pub backends: BTreeMap<StorageKind, BTreeMap<String, String>>,
}

impl Snapshot {
    /// Total number of records
    pub fn len(&self) -> usize {
        self.backends.values().map(BTreeMap::len).sum()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw record for `key` in `kind`
    pub fn record(&self, kind: StorageKind, key: &str) -> Option<&str> {
        self.backends.get(&kind)?.get(key).map(String::as_str)
    }
}

/// Owns the managers of every configured store
pub struct Persistor {
    backends: Backends,
    managers: Vec<PersistManager>,
}

impl Persistor {
    /// Create a persistor over a backend set with no stores
    pub fn new(backends: Backends) -> Self {
        Self { backends, managers: Vec::new() }
    }

    /// Add a store
    pub fn add_store(&mut self, config: PersistConfig) -> std::result::Result<PersistManager, ConfigError> {
        let manager = PersistManager::new(config, &self.backends)?;
        self.managers.push(manager.clone());
        Ok(manager)
    }

    /// Manager for the store `key`
    pub fn store(&self, key: &str) -> Option<&PersistManager> {
        self.managers.iter().find(|m| m.config().key == key)
    }

    /// All managers, in the order they were added
    pub fn stores(&self) -> &[PersistManager] {
        &self.managers
    }

    /// The backend set
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Rehydrate every store independently.
    ///
    /// A store whose rehydration fails comes back empty at its configured
    /// version; the others are unaffected.
    pub async fn rehydrate_all(&self) -> BTreeMap<String, PersistedState> {
        let mut states = BTreeMap::new();

        for manager in &self.managers {
            let config = manager.config();
            let state = match manager.rehydrate().await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!("Rehydration of {} failed, starting empty: {}", config.key, e);
                    PersistedState::empty(config.version)
                }
            };
            states.insert(config.key.clone(), state);
        }

        states
    }

    /// Offer the same application state to every store
    pub async fn persist_all<S: Serialize>(&self, state: &S) {
        for manager in &self.managers {
            manager.persist(state).await;
        }
    }

    /// Flush every store; returns the first failure after trying all
    pub async fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for manager in &self.managers {
            if let Err(e) = manager.flush().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove the named store records from every backend.
    ///
    /// Returns false if any removal failed; the rest are still attempted.
    pub async fn clear(&self, keys: &[&str]) -> bool {
        let mut ok = true;

        for (kind, backend) in self.backends.all() {
            for key in keys {
                let storage_key = crate::record::storage_key(key);
                if let Err(e) = backend.remove(&storage_key).await {
                    tracing::warn!("Failed to clear {} from {} storage: {}", storage_key, kind, e);
                    ok = false;
                }
            }
        }

        ok
    }

    /// Copy every persisted record from every backend
    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();

        for (kind, backend) in self.backends.all() {
            let mut records = BTreeMap::new();
            let keys = backend.keys().await.map_err(|source| {
                crate::persistence::PersistError::BackendRead { key: format!("{}*", KEY_PREFIX), source }
            })?;

            for key in keys.into_iter().filter(|k| k.starts_with(KEY_PREFIX)) {
                match backend.get(&key).await {
                    Ok(Some(raw)) => {
                        records.insert(key, raw);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Skipping {} in export: {}", key, e),
                }
            }

            if !records.is_empty() {
                snapshot.backends.insert(kind, records);
            }
        }

        tracing::info!("Exported {} persisted records", snapshot.len());
        Ok(snapshot)
    }

    /// Write snapshot records back verbatim.
    ///
    /// No migration runs here; stores upgrade the imported records at their
    /// next rehydration. Returns false if any record failed to import.
    pub async fn import_snapshot(&self, snapshot: &Snapshot) -> bool {
        let mut ok = true;

        for (kind, records) in &snapshot.backends {
            let backend = self.backends.for_kind(*kind);
            for (key, raw) in records {
                if let Err(e) = backend.set(key, raw.clone()).await {
                    tracing::warn!("Failed to import {} into {} storage: {}", key, kind, e);
                    ok = false;
                }
            }
        }

        ok
    }
}
