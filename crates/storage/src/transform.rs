//! Value transforms applied at write and read time
//!
//! A transform is a pair of pure mappings over one slice: `outbound` runs
//! before a slice is serialized, `inbound` after it has been read and
//! migrated. Outbound transforms run in declared order and inbound
//! transforms run the same chain in reverse, so stacked transforms
//! unwind cleanly.
//!
//! Transforms are registered in a [`TransformRegistry`] and resolved once
//! into [`ResolvedTransforms`], a per-slice lookup table.

use crate::path::{PathError, StatePath};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transform errors
#[derive(Debug, Error)]
pub enum TransformError {
    /// Mapping before write failed
    #[error("Outbound transform {transform} failed on slice {slice}: {reason}")]
    Outbound {
        /// Transform name
        transform: String,
        /// Slice being written
        slice: String,
        /// Failure description
        reason: String,
    },

    /// Mapping after read failed
    #[error("Inbound transform {transform} failed on slice {slice}: {reason}")]
    Inbound {
        /// Transform name
        transform: String,
        /// Slice being read
        slice: String,
        /// Failure description
        reason: String,
    },
}

/// Result type for transforms
pub type Result<T> = std::result::Result<T, TransformError>;

/// A pair of mappings over one slice value
pub trait Transform: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Map a slice value before it is written
    fn outbound(&self, value: Value, slice: &str) -> Result<Value>;

    /// Map a slice value after it is read
    fn inbound(&self, value: Value, slice: &str) -> Result<Value>;
}

type MapFn = Arc<dyn Fn(Value, &str) -> Result<Value> + Send + Sync>;

/// Transform built from two closures
pub struct FnTransform {
    name: String,
    outbound: MapFn,
    inbound: MapFn,
}

impl FnTransform {
    /// Create a transform from outbound and inbound closures
    pub fn new<O, I>(name: impl Into<String>, outbound: O, inbound: I) -> Self
    where
        O: Fn(Value, &str) -> Result<Value> + Send + Sync + 'static,
        I: Fn(Value, &str) -> Result<Value> + Send + Sync + 'static,
    {
        Self { name: name.into(), outbound: Arc::new(outbound), inbound: Arc::new(inbound) }
    }
}

impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound(&self, value: Value, slice: &str) -> Result<Value> {
        (self.outbound)(value, slice)
    }

    fn inbound(&self, value: Value, slice: &str) -> Result<Value> {
        (self.inbound)(value, slice)
    }
}

/// Drops transient fields (live handles, timers) before write
pub struct StripFields {
    fields: Vec<StatePath>,
}

impl StripFields {
    /// Fields are dotted paths relative to the slice root, e.g. `timer.handle`
    pub fn new<I, S>(fields: I) -> std::result::Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = fields
            .into_iter()
            .map(|f| StatePath::parse(f.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { fields })
    }
}

impl Transform for StripFields {
    fn name(&self) -> &str {
        "strip-fields"
    }

    fn outbound(&self, mut value: Value, _slice: &str) -> Result<Value> {
        for field in &self.fields {
            field.remove_within(&mut value);
        }
        Ok(value)
    }

    fn inbound(&self, value: Value, _slice: &str) -> Result<Value> {
        Ok(value)
    }
}

type EnvProvider = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Derived top-level fields: dropped on write, recomputed on read
///
/// The provider is called at every inbound pass, so values like the current
/// viewport size reflect the environment at rehydration time.
pub struct DerivedFields {
    name: String,
    fields: Vec<String>,
    provider: EnvProvider,
}

impl DerivedFields {
    /// Create a derived-field transform
    pub fn new<F>(name: impl Into<String>, fields: &[&str], provider: F) -> Self
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            provider: Arc::new(provider),
        }
    }
}

impl Transform for DerivedFields {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound(&self, mut value: Value, _slice: &str) -> Result<Value> {
        if let Some(map) = value.as_object_mut() {
            for field in &self.fields {
                map.remove(field);
            }
        }
        Ok(value)
    }

    fn inbound(&self, mut value: Value, _slice: &str) -> Result<Value> {
        if let Some(map) = value.as_object_mut() {
            for (key, derived) in (self.provider)() {
                if self.fields.contains(&key) {
                    map.insert(key, derived);
                }
            }
        }
        Ok(value)
    }
}

/// Reversible base64 encoding of a whole slice
///
/// This hides a slice from casual inspection of the storage backend. It is
/// not encryption: anyone with the record can decode it.
#[derive(Debug, Default)]
pub struct Obfuscate;

impl Transform for Obfuscate {
    fn name(&self) -> &str {
        "obfuscate"
    }

    fn outbound(&self, value: Value, slice: &str) -> Result<Value> {
        let json = serde_json::to_string(&value).map_err(|e| TransformError::Outbound {
            transform: self.name().to_string(),
            slice: slice.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Value::String(STANDARD.encode(json)))
    }

    fn inbound(&self, value: Value, slice: &str) -> Result<Value> {
        let fail = |reason: String| TransformError::Inbound {
            transform: "obfuscate".to_string(),
            slice: slice.to_string(),
            reason,
        };

        let encoded = value
            .as_str()
            .ok_or_else(|| fail("expected an encoded string".to_string()))?;
        let bytes = STANDARD.decode(encoded).map_err(|e| fail(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| fail(e.to_string()))
    }
}

/// Transforms in declaration order, each scoped to all slices or a set of them
#[derive(Clone, Default)]
pub struct TransformRegistry {
    entries: Vec<(Option<HashSet<String>>, Arc<dyn Transform>)>,
}

impl TransformRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for every slice
    pub fn add(mut self, transform: impl Transform + 'static) -> Self {
        self.entries.push((None, Arc::new(transform)));
        self
    }

    /// Register a transform for the named slices only
    pub fn add_for(mut self, slices: &[&str], transform: impl Transform + 'static) -> Self {
        let scope = slices.iter().map(|s| s.to_string()).collect();
        self.entries.push((Some(scope), Arc::new(transform)));
        self
    }

    /// Number of registered transforms
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transforms are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the per-slice lookup table
    pub fn resolve(&self) -> ResolvedTransforms {
        let global: Vec<Arc<dyn Transform>> = self
            .entries
            .iter()
            .filter(|(scope, _)| scope.is_none())
            .map(|(_, t)| t.clone())
            .collect();

        let named: HashSet<&String> = self
            .entries
            .iter()
            .filter_map(|(scope, _)| scope.as_ref())
            .flatten()
            .collect();

        let by_slice = named
            .into_iter()
            .map(|slice| {
                let chain = self
                    .entries
                    .iter()
                    .filter(|(scope, _)| scope.as_ref().map_or(true, |s| s.contains(slice)))
                    .map(|(_, t)| t.clone())
                    .collect();
                (slice.clone(), chain)
            })
            .collect();

        ResolvedTransforms { global, by_slice }
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(_, t)| t.name()))
            .finish()
    }
}

/// Per-slice transform chains
#[derive(Clone, Default)]
pub struct ResolvedTransforms {
    global: Vec<Arc<dyn Transform>>,
    by_slice: HashMap<String, Vec<Arc<dyn Transform>>>,
}

impl ResolvedTransforms {
    /// Chain applying to `slice`, in declared order
    pub fn chain(&self, slice: &str) -> &[Arc<dyn Transform>] {
        self.by_slice.get(slice).unwrap_or(&self.global)
    }

    /// Apply the chain before write
    pub fn outbound(&self, slice: &str, value: Value) -> Result<Value> {
        self.chain(slice)
            .iter()
            .try_fold(value, |value, t| t.outbound(value, slice))
    }

    /// Apply the chain in reverse after read
    pub fn inbound(&self, slice: &str, value: Value) -> Result<Value> {
        self.chain(slice)
            .iter()
            .rev()
            .try_fold(value, |value, t| t.inbound(value, slice))
    }
}

impl fmt::Debug for ResolvedTransforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTransforms")
            .field("global", &self.global.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("slices", &self.by_slice.keys().collect::<Vec<_>>())
            .finish()
    }
}
