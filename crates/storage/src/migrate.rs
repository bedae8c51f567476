//! Versioned state migrations
//!
//! A migration upgrades persisted state from version `N - 1` to `N`. The
//! table is keyed by target version; running it from a stored version to a
//! target version applies every registered step in between, in order.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Migration errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration step rejected its input
    #[error("Migration to version {version} failed: {reason}")]
    StepFailed {
        /// Target version of the failing step
        version: u32,
        /// Failure description
        reason: String,
    },
}

/// Result type for migrations
pub type Result<T> = std::result::Result<T, MigrationError>;

type MigrationFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Migration steps keyed by the version they produce
#[derive(Clone, Default)]
pub struct MigrationTable {
    steps: BTreeMap<u32, MigrationFn>,
}

impl MigrationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step producing `version`, replacing any earlier one
    pub fn add<F>(mut self, version: u32, step: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(step));
        self
    }

    /// Versions with a registered step, ascending
    pub fn versions(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    /// Highest version with a registered step
    pub fn latest(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }

    /// Number of steps that would run from `stored` to `target`
    pub fn pending(&self, stored: u32, target: u32) -> usize {
        if stored >= target {
            return 0;
        }
        self.steps.range(stored + 1..=target).count()
    }

    /// Upgrade `state` from `stored` to `target`.
    ///
    /// Steps with `stored < version <= target` run in ascending order, each
    /// consuming the previous output. Versions without a step are skipped.
    /// A stored version newer than the target is left untouched.
    pub fn run(&self, state: Value, stored: u32, target: u32) -> Result<Value> {
        if stored > target {
            tracing::warn!(
                "Persisted state is at version {} but configuration declares {}; downgrade skipped",
                stored,
                target
            );
            return Ok(state);
        }
        if stored == target {
            tracing::debug!("Persisted state already at version {}", target);
            return Ok(state);
        }

        tracing::info!(
            "Migrating persisted state from version {} to {} ({} steps)",
            stored,
            target,
            self.pending(stored, target)
        );

        let mut current = state;
        for (version, step) in self.steps.range(stored + 1..=target) {
            tracing::debug!("Applying state migration {} -> {}", version - 1, version);
            current = step(current)?;
        }

        Ok(current)
    }
}

impl fmt::Debug for MigrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationTable")
            .field("versions", &self.versions())
            .finish()
    }
}
