//! State persistence for Crisp Interview Assistant
//!
//! This crate saves selected slices of application state to a storage
//! backend and restores them at startup. Writes are throttled and
//! coalesced, slices pass through configurable transforms, and stored
//! records are upgraded by versioned migrations before they are returned.
//!
//! The main entry points are [`PersistManager`] for a single store and
//! [`Persistor`] for an application with several stores.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app_state;
pub mod backend;
pub mod config;
pub mod kv;
pub mod migrate;
pub mod path;
pub mod persistence;
pub mod persistor;
pub mod record;
pub mod slot;
pub mod sync;
pub mod transform;

pub use backend::{
    BackendError, Backends, LocalBackend, NoopBackend, SessionBackend, StorageBackend, StorageEvent,
    StorageKind,
};
pub use config::{ConfigError, PersistConfig, PersistSettings};
pub use kv::{KvConfig, KvStore};
pub use migrate::{MigrationError, MigrationTable};
pub use path::StatePath;
pub use persistence::{PersistError, PersistEvent, PersistManager, PersistStatus, PersistedState};
pub use persistor::{Persistor, Snapshot};
pub use slot::StoredValue;
pub use sync::SyncHandle;
pub use transform::{DerivedFields, FnTransform, Obfuscate, StripFields, Transform, TransformRegistry};
