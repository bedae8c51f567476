//! Cross-instance synchronization
//!
//! When another writer (another tab, another process sharing the backend)
//! replaces a store's record, the manager re-reads it and emits
//! [`PersistEvent::ExternallyChanged`]. The owning application decides how to
//! apply the new state. Nothing is merged: the last write to the backend wins.

use crate::backend::StorageEvent;
use crate::persistence::{PersistEvent, PersistManager, PersistedState};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Running external-change watcher; stops when dropped
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop watching
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the watcher has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl PersistManager {
    /// Watch the backend for changes to this store made by other writers
    pub fn watch_external(&self) -> SyncHandle {
        let manager = self.clone();
        let mut changes = self.backend().subscribe();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => manager.apply_storage_event(event).await,
                    // The newest notifications are kept, so the latest record still arrives
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Missed {} storage events for {}", missed, manager.storage_key());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        SyncHandle { task }
    }

    /// Handle one backend notification
    pub(crate) async fn apply_storage_event(&self, event: StorageEvent) {
        if event.key != self.storage_key() {
            return;
        }

        if self.take_own_change(&event.new_value).await {
            return;
        }

        let state = match event.new_value {
            Some(raw) => match self.restore(&raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Ignoring external change to {}: {}", event.key, e);
                    return;
                }
            },
            None => PersistedState::empty(self.config().version),
        };

        tracing::info!("Store {} changed externally", self.config().key);
        self.emit(PersistEvent::ExternallyChanged { key: self.config().key.clone(), state });
    }
}
