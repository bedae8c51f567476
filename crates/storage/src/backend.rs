//! Storage backends for persisted records
//!
//! A backend is a keyed store of raw record strings with a change
//! notification stream. Three kinds exist:
//!
//! - [`LocalBackend`]: durable, survives process restart (sled)
//! - [`SessionBackend`]: in-memory, cleared when the session ends
//! - [`NoopBackend`]: persistence disabled
//!
//! [`Backends`] resolves a [`StorageKind`] named in a persist configuration to
//! the backend instance that serves it.

use crate::kv::{KvConfig, KvError, KvStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Capacity of each backend's change notification channel
const EVENT_BUFFER: usize = 64;

/// Backend error types
#[derive(Debug, Error)]
pub enum BackendError {
    /// Write would exceed the backend's byte quota
    #[error("Quota exceeded writing {key}: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded {
        /// Record key being written
        key: String,
        /// Bytes the store would hold after the write
        needed: usize,
        /// Configured quota in bytes
        quota: usize,
    },

    /// Backend cannot serve requests
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Durable store error
    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Which kind of backend a store persists to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Durable store
    #[default]
    Local,
    /// Session-scoped store
    Session,
    /// Persistence disabled
    None,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
            StorageKind::Session => write!(f, "session"),
            StorageKind::None => write!(f, "none"),
        }
    }
}

/// Change notification emitted by a backend after a write or removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Record key that changed
    pub key: String,
    /// New raw value, `None` when the record was removed
    pub new_value: Option<String>,
}

/// Keyed record store contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Kind of storage this backend provides
    fn kind(&self) -> StorageKind;

    /// Read the raw record for `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write the raw record for `key`
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove the record for `key`; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every record key held by the backend
    async fn keys(&self) -> Result<Vec<String>>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Durable backend over [`KvStore`]
pub struct LocalBackend {
    kv: KvStore,
    events_tx: broadcast::Sender<StorageEvent>,
}

impl LocalBackend {
    /// Open a durable backend at the configured path
    pub fn open(config: KvConfig) -> Result<Self> {
        Ok(Self::with_store(KvStore::new(config)?))
    }

    /// Create a temporary durable backend (for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_store(KvStore::in_memory()?))
    }

    /// Wrap an existing store
    pub fn with_store(kv: KvStore) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { kv, events_tx }
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.kv.flush()?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.kv.get(key)?)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.kv.set(key, &value)?;
        let _ = self.events_tx.send(StorageEvent {
            key: key.to_string(),
            new_value: Some(value),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.kv.remove(key)? {
            let _ = self.events_tx.send(StorageEvent { key: key.to_string(), new_value: None });
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.kv.keys_with_prefix("")?)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events_tx.subscribe()
    }
}

/// Session-scoped in-memory backend with an optional byte quota
pub struct SessionBackend {
    records: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
    events_tx: broadcast::Sender<StorageEvent>,
}

impl Default for SessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend {
    /// Create an unbounded session backend
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { records: RwLock::new(HashMap::new()), quota: None, events_tx }
    }

    /// Limit the total bytes (keys plus values) the session may hold
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// End the session, dropping every record
    pub async fn end_session(&self) {
        let mut records = self.records.write().await;
        for key in records.keys() {
            let _ = self.events_tx.send(StorageEvent { key: key.clone(), new_value: None });
        }
        records.clear();
        tracing::debug!("Session storage cleared");
    }

    /// Bytes currently held
    pub async fn used_bytes(&self) -> usize {
        let records = self.records.read().await;
        records.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[async_trait]
impl StorageBackend for SessionBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Session
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut records = self.records.write().await;

        if let Some(quota) = self.quota {
            let others: usize = records
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                return Err(BackendError::QuotaExceeded { key: key.to_string(), needed, quota });
            }
        }

        records.insert(key.to_string(), value.clone());
        drop(records);

        let _ = self.events_tx.send(StorageEvent { key: key.to_string(), new_value: Some(value) });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let removed = self.records.write().await.remove(key).is_some();
        if removed {
            let _ = self.events_tx.send(StorageEvent { key: key.to_string(), new_value: None });
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events_tx.subscribe()
    }
}

/// Backend for stores with persistence disabled
pub struct NoopBackend {
    events_tx: broadcast::Sender<StorageEvent>,
}

impl Default for NoopBackend {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(1);
        Self { events_tx }
    }
}

#[async_trait]
impl StorageBackend for NoopBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::None
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events_tx.subscribe()
    }
}

/// One backend per storage kind
#[derive(Clone)]
pub struct Backends {
    local: Arc<dyn StorageBackend>,
    session: Arc<dyn StorageBackend>,
    none: Arc<dyn StorageBackend>,
}

impl Backends {
    /// Assemble a backend set
    pub fn new(local: Arc<dyn StorageBackend>, session: Arc<dyn StorageBackend>) -> Self {
        Self { local, session, none: Arc::new(NoopBackend::default()) }
    }

    /// Durable store at `config.path` plus a fresh session store
    pub fn open(config: KvConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(LocalBackend::open(config)?), Arc::new(SessionBackend::new())))
    }

    /// Temporary durable store plus a fresh session store (for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(LocalBackend::in_memory()?), Arc::new(SessionBackend::new())))
    }

    /// Backend serving `kind`
    pub fn for_kind(&self, kind: StorageKind) -> Arc<dyn StorageBackend> {
        match kind {
            StorageKind::Local => self.local.clone(),
            StorageKind::Session => self.session.clone(),
            StorageKind::None => self.none.clone(),
        }
    }

    /// All backends that actually store records
    pub fn all(&self) -> [(StorageKind, Arc<dyn StorageBackend>); 2] {
        [
            (StorageKind::Local, self.local.clone()),
            (StorageKind::Session, self.session.clone()),
        ]
    }
}
