//! Persist configuration
//!
//! [`PersistConfig`] is built once, validated, and then shared read-only by
//! a [`crate::persistence::PersistManager`]. Plain-data configuration coming
//! from the embedding application can be loaded as [`PersistSettings`].

use crate::backend::StorageKind;
use crate::migrate::{self, MigrationTable};
use crate::path::{PathError, StatePath};
use crate::persistence::PersistError;
use crate::transform::{ResolvedTransforms, Transform, TransformRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Record key is empty
    #[error("Persist key must not be empty")]
    EmptyKey,

    /// Blacklist path failed to parse
    #[error("Invalid state path: {0}")]
    InvalidPath(#[from] PathError),

    /// Whitelist entry is not a plain slice name
    #[error("Invalid slice name: {0:?}")]
    InvalidSlice(String),

    /// A migration targets a version the configuration never reaches
    #[error("Migration to version {migration} exceeds configured version {version}")]
    MigrationBeyondVersion {
        /// Migration target version
        migration: u32,
        /// Configured schema version
        version: u32,
    },

    /// Settings could not be parsed
    #[error("Invalid persist settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Result type for configuration
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Callback receiving write failures
pub type WriteErrorHandler = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Persist configuration for one store
#[derive(Clone)]
pub struct PersistConfig {
    /// Store key; the backend record is `persist:<key>`
    pub key: String,
    /// Backend kind the store writes to
    pub storage: StorageKind,
    /// Current schema version
    pub version: u32,
    /// Slices to persist; `None` persists every slice
    pub whitelist: Option<Vec<String>>,
    /// Paths excluded from persistence, applied after the whitelist
    pub blacklist: Vec<StatePath>,
    /// Value transforms in declared order
    pub transforms: TransformRegistry,
    /// Migration steps keyed by target version
    pub migrations: MigrationTable,
    /// Minimum interval between backend writes
    pub throttle: Duration,
    /// Values used for slices that fail to rehydrate
    pub defaults: BTreeMap<String, Value>,
    /// Called when a backend write fails
    pub on_write_error: Option<WriteErrorHandler>,
}

impl PersistConfig {
    /// Create a configuration for the store `key` with default settings
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            storage: StorageKind::default(),
            version: 0,
            whitelist: None,
            blacklist: Vec::new(),
            transforms: TransformRegistry::new(),
            migrations: MigrationTable::new(),
            throttle: Duration::ZERO,
            defaults: BTreeMap::new(),
            on_write_error: None,
        }
    }

    /// Set the backend kind
    pub fn storage(mut self, kind: StorageKind) -> Self {
        self.storage = kind;
        self
    }

    /// Set the schema version
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Persist only the named slices
    pub fn whitelist<I, S>(mut self, slices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(slices.into_iter().map(Into::into).collect());
        self
    }

    /// Exclude dotted paths, e.g. `interview.currentSession.stream`
    pub fn blacklist<I, S>(mut self, paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.blacklist.push(StatePath::parse(path.as_ref())?);
        }
        Ok(self)
    }

    /// Exclude an already parsed path
    pub fn blacklist_path(mut self, path: StatePath) -> Self {
        self.blacklist.push(path);
        self
    }

    /// Replace the transform registry
    pub fn transforms(mut self, registry: TransformRegistry) -> Self {
        self.transforms = registry;
        self
    }

    /// Append a transform applying to every slice
    pub fn transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms = self.transforms.add(transform);
        self
    }

    /// Replace the migration table
    pub fn migrations(mut self, table: MigrationTable) -> Self {
        self.migrations = table;
        self
    }

    /// Register the migration producing `version`
    pub fn migrate<F>(mut self, version: u32, step: F) -> Self
    where
        F: Fn(Value) -> migrate::Result<Value> + Send + Sync + 'static,
    {
        self.migrations = self.migrations.add(version, step);
        self
    }

    /// Set the write throttle interval
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = interval;
        self
    }

    /// Fallback value for a slice that fails to rehydrate
    pub fn default_slice(mut self, slice: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(slice.into(), value);
        self
    }

    /// Set the write failure handler
    pub fn on_write_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PersistError) + Send + Sync + 'static,
    {
        self.on_write_error = Some(Arc::new(handler));
        self
    }

    /// Backend record key
    pub fn storage_key(&self) -> String {
        crate::record::storage_key(&self.key)
    }

    /// Whether `slice` is selected by the whitelist
    pub fn includes(&self, slice: &str) -> bool {
        self.whitelist
            .as_ref()
            .map_or(true, |list| list.iter().any(|s| s == slice))
    }

    /// Check the configuration for mistakes that would only show up at runtime
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }

        if let Some(list) = &self.whitelist {
            if let Some(bad) = list.iter().find(|s| s.is_empty() || s.contains('.')) {
                return Err(ConfigError::InvalidSlice(bad.clone()));
            }
        }

        if let Some(latest) = self.migrations.latest() {
            if latest > self.version {
                return Err(ConfigError::MigrationBeyondVersion {
                    migration: latest,
                    version: self.version,
                });
            }
        }

        for path in &self.blacklist {
            if !self.includes(path.slice()) {
                tracing::debug!(
                    "Blacklist path {} names slice outside the whitelist of {}",
                    path,
                    self.key
                );
            }
        }

        Ok(())
    }

    /// Resolve transforms into per-slice chains
    pub(crate) fn resolve_transforms(&self) -> ResolvedTransforms {
        self.transforms.resolve()
    }
}

impl fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConfig")
            .field("key", &self.key)
            .field("storage", &self.storage)
            .field("version", &self.version)
            .field("whitelist", &self.whitelist)
            .field("blacklist", &self.blacklist)
            .field("transforms", &self.transforms)
            .field("migrations", &self.migrations)
            .field("throttle", &self.throttle)
            .field("defaults", &self.defaults)
            .field("on_write_error", &self.on_write_error.is_some())
            .finish()
    }
}

/// Plain-data persist settings supplied by the embedding application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistSettings {
    /// Store key
    pub key: String,
    /// Backend kind
    #[serde(default)]
    pub storage: StorageKind,
    /// Schema version
    #[serde(default)]
    pub version: u32,
    /// Slices to persist
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    /// Dotted exclusion paths
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Write throttle in milliseconds
    #[serde(default)]
    pub throttle_ms: u64,
}

impl PersistSettings {
    /// Parse settings from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a validated configuration.
    ///
    /// Transforms, migrations and handlers are code, so they are attached
    /// to the returned configuration by the caller.
    pub fn into_config(self) -> Result<PersistConfig> {
        let mut config = PersistConfig::new(self.key)
            .storage(self.storage)
            .version(self.version)
            .throttle(Duration::from_millis(self.throttle_ms))
            .blacklist(&self.blacklist)?;
        config.whitelist = self.whitelist;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_builder() {
        let config = PersistConfig::new("root")
            .storage(StorageKind::Session)
            .version(2)
            .whitelist(["interview", "ui"])
            .blacklist(["interview.currentSession.stream"])
            .unwrap()
            .throttle(Duration::from_millis(250))
            .default_slice("ui", json!({}));

        assert_eq!(config.storage_key(), "persist:root");
        assert_eq!(config.storage, StorageKind::Session);
        assert_eq!(config.version, 2);
        assert!(config.includes("ui"));
        assert!(!config.includes("candidate"));
        assert_eq!(config.blacklist[0].to_string(), "interview.currentSession.stream");
        assert_eq!(config.throttle, Duration::from_millis(250));
        config.validate().unwrap();
    }

    #[test]
    fn test_no_whitelist_includes_everything() {
        let config = PersistConfig::new("root");
        assert!(config.includes("anything"));
        assert_eq!(config.throttle, Duration::ZERO);
        assert_eq!(config.storage, StorageKind::Local);
    }

    #[test]
    fn test_bad_blacklist_rejected_at_build() {
        let err = PersistConfig::new("root").blacklist(["ui..theme"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPath(_)));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(PersistConfig::new("").validate(), Err(ConfigError::EmptyKey)));

        let dotted = PersistConfig::new("root").whitelist(["ui.theme"]);
        assert!(matches!(dotted.validate(), Err(ConfigError::InvalidSlice(_))));

        let ahead = PersistConfig::new("root").version(1).migrate(3, Ok);
        assert!(matches!(
            ahead.validate(),
            Err(ConfigError::MigrationBeyondVersion { migration: 3, version: 1 })
        ));
    }

    #[test]
    fn test_settings_into_config() {
        let settings = PersistSettings::from_json(
            r#"{
                "key": "root",
                "storage": "local",
                "version": 2,
                "whitelist": ["interview", "candidate"],
                "blacklist": ["interview.currentSession.stream"],
                "throttleMs": 1000
            }"#,
        )
        .unwrap();

        let config = settings.into_config().unwrap();
        assert_eq!(config.key, "root");
        assert_eq!(config.version, 2);
        assert_eq!(config.whitelist, Some(vec!["interview".to_string(), "candidate".to_string()]));
        assert_eq!(config.blacklist.len(), 1);
        assert_eq!(config.throttle, Duration::from_secs(1));
    }

    #[test]
    fn test_settings_defaults_and_errors() {
        let settings = PersistSettings::from_json(r#"{"key":"session"}"#).unwrap();
        assert_eq!(settings.storage, StorageKind::Local);
        assert_eq!(settings.throttle_ms, 0);
        assert!(settings.whitelist.is_none());

        assert!(matches!(PersistSettings::from_json("{"), Err(ConfigError::Settings(_))));

        let bad = PersistSettings { blacklist: vec![String::new()], ..settings };
        assert!(matches!(bad.into_config(), Err(ConfigError::InvalidPath(_))));
    }
}
