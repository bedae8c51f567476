//! Persisted record wire format
//!
//! A record is a JSON object. Each slice is stored under its own name as a
//! JSON-encoded string, so a damaged slice can be dropped on its own. The
//! reserved `_persist` field holds the encoded [`PersistMeta`]. Records that
//! predate versioning have no `_persist` field and read as version 0.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reserved metadata field
pub const META_FIELD: &str = "_persist";

/// Prefix of every record key in a backend
pub const KEY_PREFIX: &str = "persist:";

/// Record decoding errors
#[derive(Debug, Error)]
pub enum RecordError {
    /// Record is not JSON
    #[error("Record is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Record is JSON but not an object
    #[error("Record is not a JSON object")]
    NotAnObject,
}

/// Record metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistMeta {
    /// Schema version the slices are expressed in
    pub version: u32,
    /// Whether the writer had completed rehydration
    #[serde(default)]
    pub rehydrated: bool,
}

/// A decoded record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRecord {
    /// Stored schema version (0 when untagged)
    pub version: u32,
    /// Slices that decoded cleanly
    pub slices: BTreeMap<String, Value>,
    /// Slices whose payload could not be decoded
    pub corrupt: Vec<String>,
}

/// Backend key for a store key, e.g. `root` -> `persist:root`
pub fn storage_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// Encode slices tagged with `version`
pub fn encode(slices: &BTreeMap<String, Value>, version: u32) -> serde_json::Result<String> {
    let mut record = Map::new();

    for (name, value) in slices {
        record.insert(name.clone(), Value::String(serde_json::to_string(value)?));
    }

    let meta = PersistMeta { version, rehydrated: true };
    record.insert(META_FIELD.to_string(), Value::String(serde_json::to_string(&meta)?));

    serde_json::to_string(&Value::Object(record))
}

/// Decode a raw record, isolating damaged slices
pub fn decode(raw: &str) -> Result<DecodedRecord, RecordError> {
    let record = match serde_json::from_str::<Value>(raw)? {
        Value::Object(record) => record,
        _ => return Err(RecordError::NotAnObject),
    };

    let mut decoded = DecodedRecord::default();

    for (name, payload) in record {
        if name == META_FIELD {
            decoded.version = read_meta(&payload).map(|m| m.version).unwrap_or_else(|| {
                tracing::warn!("Unreadable persist metadata, treating record as version 0");
                0
            });
            continue;
        }

        match payload {
            Value::String(encoded) => match serde_json::from_str(&encoded) {
                Ok(value) => {
                    decoded.slices.insert(name, value);
                }
                Err(e) => {
                    tracing::warn!("Slice {} is corrupt and will use its default: {}", name, e);
                    decoded.corrupt.push(name);
                }
            },
            // Written by a tool that stored slices inline
            other => {
                decoded.slices.insert(name, other);
            }
        }
    }

    Ok(decoded)
}

fn read_meta(payload: &Value) -> Option<PersistMeta> {
    match payload {
        Value::String(encoded) => serde_json::from_str(encoded).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_shape() {
        let mut slices = BTreeMap::new();
        slices.insert("ui".to_string(), json!({ "theme": "dark" }));

        let raw = encode(&slices, 2).unwrap();
        let outer: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(outer["ui"], json!(r#"{"theme":"dark"}"#));
        let meta: PersistMeta = serde_json::from_str(outer[META_FIELD].as_str().unwrap()).unwrap();
        assert_eq!(meta, PersistMeta { version: 2, rehydrated: true });
    }

    #[test]
    fn test_decode_round_trip() {
        let mut slices = BTreeMap::new();
        slices.insert("candidate".to_string(), json!({ "list": [1, 2] }));
        slices.insert("ui".to_string(), json!(null));

        let decoded = decode(&encode(&slices, 7).unwrap()).unwrap();
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.slices, slices);
        assert!(decoded.corrupt.is_empty());
    }

    #[test]
    fn test_untagged_record_is_version_zero() {
        let decoded = decode(r#"{"candidate":"{\"candidates\":[]}"}"#).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.slices["candidate"], json!({ "candidates": [] }));
    }

    #[test]
    fn test_corrupt_slice_isolated() {
        let raw = r#"{"ui":"{\"theme\":","candidate":"{\"list\":[]}","_persist":"{\"version\":1}"}"#;
        let decoded = decode(raw).unwrap();

        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.corrupt, vec!["ui".to_string()]);
        assert_eq!(decoded.slices.len(), 1);
        assert_eq!(decoded.slices["candidate"], json!({ "list": [] }));
    }

    #[test]
    fn test_inline_meta_and_slices() {
        let decoded = decode(r#"{"ui":{"theme":"light"},"_persist":{"version":3}}"#).unwrap();
        assert_eq!(decoded.version, 3);
        assert_eq!(decoded.slices["ui"], json!({ "theme": "light" }));
    }

    #[test]
    fn test_garbage_meta_reads_as_zero() {
        let decoded = decode(r#"{"_persist":"nope"}"#).unwrap();
        assert_eq!(decoded.version, 0);
    }

    #[test]
    fn test_malformed_records() {
        assert!(matches!(decode("{not json"), Err(RecordError::Malformed(_))));
        assert!(matches!(decode("[1,2]"), Err(RecordError::NotAnObject)));
        assert_eq!(storage_key("root"), "persist:root");
    }
}
