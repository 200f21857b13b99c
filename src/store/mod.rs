//! Record store for ingest items.
//!
//! The [`RecordStore`] trait is the only path through which pipeline code
//! reads or writes item state. Two backends are provided:
//!
//! - [`sqlite::SqliteStore`]: production backend over the `ingest_items`
//!   and `item_meta` tables.
//! - [`memory::InMemoryStore`]: lock-protected maps for tests and embedding.
//!
//! # Failure contract
//!
//! No operation returns an error or panics. Read failures degrade to a safe
//! default (empty mapping, `None`, the caller's default) and write failures
//! degrade to a no-op (or `false`); both are logged through `tracing`. The
//! store sits beneath batch loops that must survive any single corrupt item.
//!
//! # Value storage
//!
//! | Written value | Stored as | Read back by [`RecordStore::read_meta`] |
//! |---------------|-----------|------------------------------------------|
//! | JSON array | native array | `{ "value": [...] }` |
//! | JSON object | JSON text | the parsed object |
//! | scalar | scalar | parsed object if the scalar is JSON text, else `{ "value": scalar }` |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::{IngestItem, ItemFilter, ItemId, ItemKind, Mapping, Stage, TargetType};

/// Physical representation of a metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Scalar(Value),
    Array(Vec<Value>),
    Json(String),
}

impl StoredValue {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => StoredValue::Array(items.clone()),
            Value::Object(_) => StoredValue::Json(value.to_string()),
            scalar => StoredValue::Scalar(scalar.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Scalar(_) => "scalar",
            StoredValue::Array(_) => "array",
            StoredValue::Json(_) => "json",
        }
    }
}

/// Coerce a stored value to a mapping.
///
/// Returns `None` when the value is null or undecodable JSON text.
pub fn coerce_mapping(stored: &StoredValue) -> Option<Mapping> {
    match stored {
        StoredValue::Json(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Some(map),
            Ok(Value::Null) => None,
            Ok(other) => Some(wrap_scalar(other)),
            Err(_) => None,
        },
        StoredValue::Array(items) => Some(wrap_scalar(Value::Array(items.clone()))),
        StoredValue::Scalar(Value::Null) => None,
        StoredValue::Scalar(Value::Object(map)) => Some(map.clone()),
        StoredValue::Scalar(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Some(map),
            _ => Some(wrap_scalar(Value::String(text.clone()))),
        },
        StoredValue::Scalar(other) => Some(wrap_scalar(other.clone())),
    }
}

fn wrap_scalar(value: Value) -> Mapping {
    let mut map = Mapping::new();
    map.insert("value".to_string(), value);
    map
}

/// Decode one raw-payload slot. Only non-empty mappings satisfy the read.
fn payload_from_slot(stored: Option<&StoredValue>) -> Option<Mapping> {
    match stored? {
        StoredValue::Json(text) | StoredValue::Scalar(Value::String(text)) => {
            payload_from_text(text)
        }
        StoredValue::Scalar(Value::Object(map)) if !map.is_empty() => Some(map.clone()),
        _ => None,
    }
}

fn payload_from_text(text: &str) -> Option<Mapping> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

/// Resolve an item's raw payload from its storage slots, in order:
/// canonical meta slot, legacy meta slot, item body. Empty when all fail.
pub fn resolve_raw_payload(
    canonical: Option<&StoredValue>,
    legacy: Option<&StoredValue>,
    body: Option<&str>,
) -> Mapping {
    payload_from_slot(canonical)
        .or_else(|| payload_from_slot(legacy))
        .or_else(|| body.and_then(payload_from_text))
        .unwrap_or_default()
}

/// Coerce a stored value to an integer.
pub fn coerce_int(stored: &StoredValue) -> Option<i64> {
    match stored {
        StoredValue::Scalar(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        StoredValue::Scalar(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        StoredValue::Scalar(Value::Bool(b)) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Coerce a stored value to text. Objects come back as their JSON text.
pub fn coerce_text(stored: &StoredValue) -> Option<String> {
    match stored {
        StoredValue::Scalar(Value::Null) => None,
        StoredValue::Scalar(Value::String(s)) => Some(s.clone()),
        StoredValue::Scalar(other) => Some(other.to_string()),
        StoredValue::Json(text) => Some(text.clone()),
        StoredValue::Array(items) => Some(Value::Array(items.clone()).to_string()),
    }
}

/// SHA-256 of a payload's canonical JSON text, used to skip duplicate enqueues.
pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Reject empty or whitespace keys before touching storage.
pub(crate) fn valid_key(id: ItemId, key: &str) -> bool {
    if id <= 0 || key.trim().is_empty() {
        tracing::warn!(item_id = id, key, "ignoring metadata write with invalid id or key");
        return false;
    }
    true
}

/// Storage backend for ingest items.
///
/// See the [module docs](self) for the failure contract every
/// implementation must honor.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new item at stage `new` with `payload` in the canonical
    /// raw-payload slot. Returns `None` if persistence fails.
    async fn create(&self, payload: &Value, kind: ItemKind, target: TargetType) -> Option<ItemId>;

    /// The item's raw payload, trying the canonical slot, the legacy slot
    /// and finally the body text. Empty when none decodes.
    async fn read_raw_payload(&self, id: ItemId) -> Mapping;

    /// Store a scalar, array or object under `key`.
    async fn write_field(&self, id: ItemId, key: &str, value: &Value);

    /// Remove `key` from the item's metadata. Missing keys are a no-op.
    async fn delete_field(&self, id: ItemId, key: &str);

    /// Move the item to `stage`.
    async fn set_stage(&self, id: ItemId, stage: Stage);

    /// Write `fields` and move the item to `stage` as one update.
    /// Returns `false` (and writes nothing) if the update fails.
    async fn advance(&self, id: ItemId, stage: Stage, fields: &[(&str, Value)]) -> bool;

    /// Read `key` coerced to a mapping, or `default` (empty when `None`)
    /// when absent or undecodable.
    async fn read_meta(&self, id: ItemId, key: &str, default: Option<Mapping>) -> Mapping;

    /// Read `key` coerced to an integer, or `default`.
    async fn read_int(&self, id: ItemId, key: &str, default: i64) -> i64;

    /// Read `key` coerced to text.
    async fn read_text(&self, id: ItemId, key: &str) -> Option<String>;

    /// Row snapshot, `None` when missing or when the stored stage is unknown.
    async fn get(&self, id: ItemId) -> Option<IngestItem>;

    /// Current stage of the item.
    async fn stage(&self, id: ItemId) -> Option<Stage> {
        self.get(id).await.map(|item| item.stage)
    }

    /// Correct the item's target content type.
    async fn set_target(&self, id: ItemId, target: TargetType);

    /// Ids of items matching `filter`, oldest first.
    async fn select(&self, filter: &ItemFilter) -> Vec<ItemId>;

    /// Item count per stage, every stage present (zero when empty).
    async fn count_by_stage(&self, target: Option<TargetType>) -> BTreeMap<Stage, i64>;

    /// Delete the item and its metadata. Returns `true` if a row was removed.
    async fn delete(&self, id: ItemId) -> bool;

    /// Id of an item created from a payload with this hash.
    async fn find_by_payload_hash(&self, hash: &str) -> Option<ItemId>;

    /// Id of a re-import of `source_post_id` that is still moving through
    /// the pipeline.
    async fn find_active_reimport(&self, source_post_id: &str) -> Option<ItemId>;
}

/// Zero-filled per-stage counts.
pub(crate) fn empty_counts() -> BTreeMap<Stage, i64> {
    Stage::ALL.iter().map(|s| (*s, 0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_become_json_text_arrays_stay_native() {
        assert!(matches!(
            StoredValue::from_value(&json!({"a": 1})),
            StoredValue::Json(_)
        ));
        assert!(matches!(
            StoredValue::from_value(&json!([1, 2])),
            StoredValue::Array(_)
        ));
        assert!(matches!(
            StoredValue::from_value(&json!(7)),
            StoredValue::Scalar(_)
        ));
    }

    #[test]
    fn coerce_mapping_wraps_scalars_and_parses_json() {
        let parsed = coerce_mapping(&StoredValue::Json("{\"category\":\"cafe\"}".into())).unwrap();
        assert_eq!(parsed["category"], "cafe");

        let wrapped = coerce_mapping(&StoredValue::Scalar(json!(42))).unwrap();
        assert_eq!(wrapped["value"], 42);

        let from_text = coerce_mapping(&StoredValue::Scalar(json!("{\"x\":true}"))).unwrap();
        assert_eq!(from_text["x"], true);

        assert!(coerce_mapping(&StoredValue::Json("{broken".into())).is_none());
        assert!(coerce_mapping(&StoredValue::Scalar(Value::Null)).is_none());
    }

    #[test]
    fn raw_payload_fallback_order() {
        let canonical = StoredValue::Json("{\"name\":\"canonical\"}".into());
        let legacy = StoredValue::Scalar(json!("{\"name\":\"legacy\"}"));
        let body = "{\"name\":\"body\"}";

        let p = resolve_raw_payload(Some(&canonical), Some(&legacy), Some(body));
        assert_eq!(p["name"], "canonical");

        let p = resolve_raw_payload(None, Some(&legacy), Some(body));
        assert_eq!(p["name"], "legacy");

        let broken = StoredValue::Json("not json".into());
        let p = resolve_raw_payload(Some(&broken), None, Some(body));
        assert_eq!(p["name"], "body");

        let p = resolve_raw_payload(None, None, Some("plain text body"));
        assert!(p.is_empty());
    }

    #[test]
    fn coerce_int_accepts_numeric_text() {
        assert_eq!(coerce_int(&StoredValue::Scalar(json!("85"))), Some(85));
        assert_eq!(coerce_int(&StoredValue::Scalar(json!(79.6))), Some(80));
        assert_eq!(coerce_int(&StoredValue::Scalar(json!("n/a"))), None);
        assert_eq!(coerce_int(&StoredValue::Json("{}".into())), None);
    }

    #[test]
    fn payload_hash_is_stable() {
        let a = payload_hash(&json!({"name": "Cafe", "id": 1}));
        let b = payload_hash(&json!({"name": "Cafe", "id": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
