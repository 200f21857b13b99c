//! In-memory [`RecordStore`] implementation for tests and embedding.
//!
//! Uses a single `Mutex` over all items so every operation, including
//! [`advance`](RecordStore::advance), observes and updates one consistent
//! snapshot. A poisoned lock is recovered rather than propagated.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    coerce_int, coerce_mapping, coerce_text, empty_counts, payload_hash, resolve_raw_payload,
    valid_key, RecordStore, StoredValue,
};
use crate::models::{keys, IngestItem, ItemFilter, ItemId, ItemKind, Mapping, Stage, TargetType};

struct StoredItem {
    item: IngestItem,
    body: Option<String>,
    meta: HashMap<String, StoredValue>,
}

#[derive(Default)]
struct Inner {
    next_id: ItemId,
    items: BTreeMap<ItemId, StoredItem>,
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an item whose payload only exists in its body text, the way
    /// the oldest records were stored.
    pub fn insert_with_body(&self, body: &str, kind: ItemKind, target: TargetType) -> ItemId {
        let mut inner = self.lock();
        let id = next_id(&mut inner);
        inner.items.insert(
            id,
            StoredItem {
                item: new_item(id, kind, target, None),
                body: Some(body.to_string()),
                meta: HashMap::new(),
            },
        );
        id
    }

    /// Write a raw metadata slot without going through value conversion.
    pub fn put_raw_meta(&self, id: ItemId, key: &str, stored: StoredValue) {
        if let Some(stored_item) = self.lock().items.get_mut(&id) {
            stored_item.meta.insert(key.to_string(), stored);
        }
    }

    fn meta(&self, id: ItemId, key: &str) -> Option<StoredValue> {
        self.lock()
            .items
            .get(&id)
            .and_then(|s| s.meta.get(key).cloned())
    }
}

fn next_id(inner: &mut Inner) -> ItemId {
    inner.next_id += 1;
    inner.next_id
}

fn new_item(id: ItemId, kind: ItemKind, target: TargetType, hash: Option<String>) -> IngestItem {
    let now = chrono::Utc::now().timestamp();
    IngestItem {
        id,
        kind,
        target,
        stage: Stage::New,
        payload_hash: hash,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create(&self, payload: &Value, kind: ItemKind, target: TargetType) -> Option<ItemId> {
        let mut inner = self.lock();
        let id = next_id(&mut inner);
        let mut meta = HashMap::new();
        meta.insert(
            keys::RAW_PAYLOAD.to_string(),
            StoredValue::from_value(payload),
        );
        inner.items.insert(
            id,
            StoredItem {
                item: new_item(id, kind, target, Some(payload_hash(payload))),
                body: None,
                meta,
            },
        );
        Some(id)
    }

    async fn read_raw_payload(&self, id: ItemId) -> Mapping {
        let inner = self.lock();
        match inner.items.get(&id) {
            Some(s) => resolve_raw_payload(
                s.meta.get(keys::RAW_PAYLOAD),
                s.meta.get(keys::RAW_PAYLOAD_LEGACY),
                s.body.as_deref(),
            ),
            None => Mapping::new(),
        }
    }

    async fn write_field(&self, id: ItemId, key: &str, value: &Value) {
        if !valid_key(id, key) {
            return;
        }
        let mut inner = self.lock();
        match inner.items.get_mut(&id) {
            Some(s) => {
                s.meta.insert(key.to_string(), StoredValue::from_value(value));
                s.item.updated_at = chrono::Utc::now().timestamp();
            }
            None => tracing::warn!(item_id = id, key, "write to missing item ignored"),
        }
    }

    async fn delete_field(&self, id: ItemId, key: &str) {
        if let Some(s) = self.lock().items.get_mut(&id) {
            s.meta.remove(key);
        }
    }

    async fn set_stage(&self, id: ItemId, stage: Stage) {
        if !self.advance(id, stage, &[]).await {
            tracing::warn!(item_id = id, stage = %stage, "stage not updated");
        }
    }

    async fn advance(&self, id: ItemId, stage: Stage, fields: &[(&str, Value)]) -> bool {
        if fields.iter().any(|(key, _)| !valid_key(id, key)) {
            return false;
        }
        let mut inner = self.lock();
        let Some(s) = inner.items.get_mut(&id) else {
            return false;
        };
        for (key, value) in fields {
            s.meta.insert(key.to_string(), StoredValue::from_value(value));
        }
        s.item.stage = stage;
        s.item.updated_at = chrono::Utc::now().timestamp();
        true
    }

    async fn read_meta(&self, id: ItemId, key: &str, default: Option<Mapping>) -> Mapping {
        self.meta(id, key)
            .and_then(|stored| coerce_mapping(&stored))
            .or(default)
            .unwrap_or_default()
    }

    async fn read_int(&self, id: ItemId, key: &str, default: i64) -> i64 {
        self.meta(id, key)
            .and_then(|stored| coerce_int(&stored))
            .unwrap_or(default)
    }

    async fn read_text(&self, id: ItemId, key: &str) -> Option<String> {
        self.meta(id, key).and_then(|stored| coerce_text(&stored))
    }

    async fn get(&self, id: ItemId) -> Option<IngestItem> {
        self.lock().items.get(&id).map(|s| s.item.clone())
    }

    async fn set_target(&self, id: ItemId, target: TargetType) {
        if let Some(s) = self.lock().items.get_mut(&id) {
            s.item.target = target;
        }
    }

    async fn select(&self, filter: &ItemFilter) -> Vec<ItemId> {
        // BTreeMap order is creation order.
        self.lock()
            .items
            .values()
            .filter(|s| filter.matches(&s.item))
            .map(|s| s.item.id)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    async fn count_by_stage(&self, target: Option<TargetType>) -> BTreeMap<Stage, i64> {
        let mut counts = empty_counts();
        for s in self.lock().items.values() {
            if target.map_or(true, |t| t == s.item.target) {
                *counts.entry(s.item.stage).or_insert(0) += 1;
            }
        }
        counts
    }

    async fn delete(&self, id: ItemId) -> bool {
        self.lock().items.remove(&id).is_some()
    }

    async fn find_by_payload_hash(&self, hash: &str) -> Option<ItemId> {
        self.lock()
            .items
            .values()
            .find(|s| s.item.payload_hash.as_deref() == Some(hash))
            .map(|s| s.item.id)
    }

    async fn find_active_reimport(&self, source_post_id: &str) -> Option<ItemId> {
        self.lock()
            .items
            .values()
            .filter(|s| !s.item.stage.is_terminal())
            .find(|s| {
                s.meta
                    .get(keys::SOURCE_POST_ID)
                    .and_then(coerce_text)
                    .as_deref()
                    == Some(source_post_id)
            })
            .map(|s| s.item.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn raw_payload_reads_are_idempotent_for_every_slot() {
        let store = InMemoryStore::new();
        let canonical = store
            .create(&json!({"name": "Canonical"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        let body_only =
            store.insert_with_body("{\"name\":\"Body\"}", ItemKind::Event, TargetType::LocalEvent);
        let legacy = store.insert_with_body("not json", ItemKind::Place, TargetType::LocalPlace);
        store.put_raw_meta(
            legacy,
            keys::RAW_PAYLOAD_LEGACY,
            StoredValue::Scalar(json!("{\"name\":\"Legacy\"}")),
        );

        for (id, name) in [(canonical, "Canonical"), (body_only, "Body"), (legacy, "Legacy")] {
            let first = store.read_raw_payload(id).await;
            let second = store.read_raw_payload(id).await;
            assert_eq!(first["name"], name);
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn undecodable_meta_returns_default() {
        let store = InMemoryStore::new();
        let id = store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        store.put_raw_meta(id, "enrichment", StoredValue::Json("{oops".into()));
        assert!(store.read_meta(id, "enrichment", None).await.is_empty());
        assert_eq!(store.read_int(id, "enrichment", -1).await, -1);
    }

    #[tokio::test]
    async fn advance_on_missing_item_is_rejected() {
        let store = InMemoryStore::new();
        assert!(!store.advance(12, Stage::Scored, &[("score", json!(50))]).await);
        assert!(store.get(12).await.is_none());
    }
}
