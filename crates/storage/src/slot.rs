//! Typed single-key values
//!
//! [`StoredValue`] keeps one JSON value under one backend key, outside any
//! persisted store. Reads fall back to the initial value when the key is
//! missing or holds something that no longer deserializes.

use crate::backend::{self, StorageBackend, StorageEvent};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Stored value errors
#[derive(Debug, Error)]
pub enum SlotError {
    /// Value could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend rejected the operation
    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),
}

/// Result type for stored values
pub type Result<T> = std::result::Result<T, SlotError>;

/// A typed value under a single backend key
pub struct StoredValue<T> {
    backend: Arc<dyn StorageBackend>,
    key: String,
    initial: T,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> StoredValue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Bind `key` on `backend`, using `initial` when nothing usable is stored
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>, initial: T) -> Self {
        Self { backend, key: key.into(), initial, _phantom: PhantomData }
    }

    /// Backend key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value, or the initial value
    pub async fn get(&self) -> T {
        match self.backend.get(&self.key).await {
            Ok(Some(raw)) => self.parse(&raw),
            Ok(None) => self.initial.clone(),
            Err(e) => {
                tracing::warn!("Reading {} failed, using initial value: {}", self.key, e);
                self.initial.clone()
            }
        }
    }

    /// Store a new value
    pub async fn set(&self, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(&self.key, raw).await?;
        Ok(())
    }

    /// Read, modify and store; returns the stored value
    pub async fn update<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut value = self.get().await;
        f(&mut value);
        self.set(&value).await?;
        Ok(value)
    }

    /// Remove the stored value so reads return the initial value again
    pub async fn remove(&self) -> Result<()> {
        self.backend.remove(&self.key).await?;
        Ok(())
    }

    /// Values written to this key by anyone, as they happen
    pub fn changes(&self) -> StoredValueChanges<T> {
        StoredValueChanges {
            events: self.backend.subscribe(),
            key: self.key.clone(),
            initial: self.initial.clone(),
        }
    }

    fn parse(&self, raw: &str) -> T {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!("Stored value {} is unreadable, using initial value: {}", self.key, e);
            self.initial.clone()
        })
    }
}

/// Stream of new values for one key
pub struct StoredValueChanges<T> {
    events: broadcast::Receiver<StorageEvent>,
    key: String,
    initial: T,
}

impl<T> StoredValueChanges<T>
where
    T: DeserializeOwned + Clone,
{
    /// Wait for the next change; `None` once the backend is gone
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.key == self.key => {
                    return Some(
                        event
                            .new_value
                            .and_then(|raw| serde_json::from_str(&raw).ok())
                            .unwrap_or_else(|| self.initial.clone()),
                    );
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
