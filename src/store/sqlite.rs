//! SQLite-backed [`RecordStore`] implementation.
//!
//! Items live in `ingest_items`; metadata lives in `item_meta` as
//! `(value_kind, value)` pairs where scalars and arrays are JSON-encoded
//! and objects keep their JSON text verbatim.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use super::{
    coerce_int, coerce_mapping, coerce_text, empty_counts, payload_hash, resolve_raw_payload,
    valid_key, RecordStore, StoredValue,
};
use crate::models::{keys, IngestItem, ItemFilter, ItemId, ItemKind, Mapping, Stage, TargetType};

/// SQLite implementation of the [`RecordStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn try_create(
        &self,
        payload: &Value,
        kind: ItemKind,
        target: TargetType,
    ) -> Result<ItemId> {
        let now = chrono::Utc::now().timestamp();
        let hash = payload_hash(payload);
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ingest_items (kind, target_type, stage, body, payload_hash, created_at, updated_at)
            VALUES (?, ?, 'new', NULL, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(target.as_str())
        .bind(&hash)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let stored = StoredValue::from_value(payload);
        upsert_meta(&mut tx, id, keys::RAW_PAYLOAD, &stored).await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn try_load_meta(&self, id: ItemId, key: &str) -> Result<Option<StoredValue>> {
        let row = sqlx::query("SELECT value_kind, value FROM item_meta WHERE item_id = ? AND meta_key = ?")
            .bind(id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| {
            let kind: String = row.get("value_kind");
            let text: Option<String> = row.get("value");
            from_column(&kind, text)
        }))
    }

    /// Metadata value, with failures logged and mapped to `None`.
    async fn load_meta(&self, id: ItemId, key: &str) -> Option<StoredValue> {
        match self.try_load_meta(id, key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(item_id = id, key, error = %e, "failed to read item metadata");
                None
            }
        }
    }

    async fn try_read_raw_payload(&self, id: ItemId) -> Result<Mapping> {
        let canonical = self.try_load_meta(id, keys::RAW_PAYLOAD).await?;
        let legacy = self.try_load_meta(id, keys::RAW_PAYLOAD_LEGACY).await?;
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM ingest_items WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        Ok(resolve_raw_payload(
            canonical.as_ref(),
            legacy.as_ref(),
            body.as_deref(),
        ))
    }

    async fn try_write_field(&self, id: ItemId, key: &str, value: &Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_meta(&mut tx, id, key, &StoredValue::from_value(value)).await?;
        touch(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_advance(&self, id: ItemId, stage: Stage, fields: &[(&str, Value)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in fields {
            upsert_meta(&mut tx, id, key, &StoredValue::from_value(value)).await?;
        }
        let now = chrono::Utc::now().timestamp();
        let updated = sqlx::query("UPDATE ingest_items SET stage = ?, updated_at = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            anyhow::bail!("item {} does not exist", id);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn try_get(&self, id: ItemId) -> Result<Option<IngestItem>> {
        let row = sqlx::query(
            "SELECT id, kind, target_type, stage, payload_hash, created_at, updated_at FROM ingest_items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_item(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn try_select(&self, filter: &ItemFilter) -> Result<Vec<ItemId>> {
        let mut sql = String::from("SELECT id FROM ingest_items WHERE 1 = 1");
        if !filter.stages.is_empty() {
            let placeholders = vec!["?"; filter.stages.len()].join(", ");
            sql.push_str(&format!(" AND stage IN ({})", placeholders));
        }
        if filter.target.is_some() {
            sql.push_str(" AND target_type = ?");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ?");

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for stage in &filter.stages {
            query = query.bind(stage.as_str());
        }
        if let Some(target) = filter.target {
            query = query.bind(target.as_str());
        }
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        query = query.bind(limit);

        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn try_count_by_stage(&self, target: Option<TargetType>) -> Result<BTreeMap<Stage, i64>> {
        let rows = match target {
            Some(t) => {
                sqlx::query(
                    "SELECT stage, COUNT(*) AS n FROM ingest_items WHERE target_type = ? GROUP BY stage",
                )
                .bind(t.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT stage, COUNT(*) AS n FROM ingest_items GROUP BY stage")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = empty_counts();
        for row in &rows {
            let stage: String = row.get("stage");
            match stage.parse::<Stage>() {
                Ok(stage) => {
                    counts.insert(stage, row.get("n"));
                }
                Err(e) => tracing::warn!(error = %e, "skipping rows with unknown stage"),
            }
        }
        Ok(counts)
    }

    async fn try_delete(&self, id: ItemId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM item_meta WHERE item_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM ingest_items WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn try_find_active_reimport(&self, source_post_id: &str) -> Result<Option<ItemId>> {
        let placeholders = vec!["?"; Stage::ACTIVE.len()].join(", ");
        let sql = format!(
            r#"
            SELECT i.id FROM ingest_items i
            JOIN item_meta m ON m.item_id = i.id AND m.meta_key = ?
            WHERE m.value = ? AND i.stage IN ({})
            ORDER BY i.id ASC
            LIMIT 1
            "#,
            placeholders
        );
        let encoded = to_column(&StoredValue::Scalar(Value::String(source_post_id.to_string())));

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(keys::SOURCE_POST_ID)
            .bind(encoded);
        for stage in Stage::ACTIVE {
            query = query.bind(stage.as_str());
        }
        Ok(query.fetch_optional(&self.pool).await?)
    }
}

/// Encode a stored value for the `value` column.
fn to_column(stored: &StoredValue) -> String {
    match stored {
        StoredValue::Scalar(v) => v.to_string(),
        StoredValue::Array(items) => Value::Array(items.clone()).to_string(),
        StoredValue::Json(text) => text.clone(),
    }
}

/// Decode a `(value_kind, value)` pair. Scalars that are not JSON are
/// legacy plain text and come back as strings.
fn from_column(kind: &str, text: Option<String>) -> Option<StoredValue> {
    let text = text?;
    match kind {
        "scalar" => Some(StoredValue::Scalar(
            serde_json::from_str(&text).unwrap_or(Value::String(text)),
        )),
        "array" => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Some(StoredValue::Array(items)),
            _ => {
                tracing::warn!("discarding undecodable array metadata");
                None
            }
        },
        "json" => Some(StoredValue::Json(text)),
        other => {
            tracing::warn!(kind = other, "discarding metadata with unknown value kind");
            None
        }
    }
}

async fn upsert_meta(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: ItemId,
    key: &str,
    stored: &StoredValue,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO item_meta (item_id, meta_key, value_kind, value)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(item_id, meta_key) DO UPDATE SET
            value_kind = excluded.value_kind,
            value = excluded.value
        "#,
    )
    .bind(id)
    .bind(key)
    .bind(stored.kind())
    .bind(to_column(stored))
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to write metadata '{}' for item {}", key, id))?;
    Ok(())
}

async fn touch(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, id: ItemId) -> Result<()> {
    sqlx::query("UPDATE ingest_items SET updated_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<IngestItem> {
    let kind: String = row.get("kind");
    let target: String = row.get("target_type");
    let stage: String = row.get("stage");
    Ok(IngestItem {
        id: row.get("id"),
        kind: kind.parse()?,
        target: target.parse()?,
        stage: stage.parse()?,
        payload_hash: row.get("payload_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create(&self, payload: &Value, kind: ItemKind, target: TargetType) -> Option<ItemId> {
        match self.try_create(payload, kind, target).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(kind = %kind, error = %e, "failed to create ingest item");
                None
            }
        }
    }

    async fn read_raw_payload(&self, id: ItemId) -> Mapping {
        match self.try_read_raw_payload(id).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "failed to read raw payload");
                Mapping::new()
            }
        }
    }

    async fn write_field(&self, id: ItemId, key: &str, value: &Value) {
        if !valid_key(id, key) {
            return;
        }
        if let Err(e) = self.try_write_field(id, key, value).await {
            tracing::warn!(item_id = id, key, error = %e, "failed to write item metadata");
        }
    }

    async fn delete_field(&self, id: ItemId, key: &str) {
        if !valid_key(id, key) {
            return;
        }
        let result = sqlx::query("DELETE FROM item_meta WHERE item_id = ? AND meta_key = ?")
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(item_id = id, key, error = %e, "failed to delete item metadata");
        }
    }

    async fn set_stage(&self, id: ItemId, stage: Stage) {
        if !self.advance(id, stage, &[]).await {
            tracing::warn!(item_id = id, stage = %stage, "stage not updated");
        }
    }

    async fn advance(&self, id: ItemId, stage: Stage, fields: &[(&str, Value)]) -> bool {
        if id <= 0 || fields.iter().any(|(key, _)| !valid_key(id, key)) {
            return false;
        }
        match self.try_advance(id, stage, fields).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(item_id = id, stage = %stage, error = %e, "failed to advance item");
                false
            }
        }
    }

    async fn read_meta(&self, id: ItemId, key: &str, default: Option<Mapping>) -> Mapping {
        self.load_meta(id, key)
            .await
            .and_then(|stored| coerce_mapping(&stored))
            .or(default)
            .unwrap_or_default()
    }

    async fn read_int(&self, id: ItemId, key: &str, default: i64) -> i64 {
        self.load_meta(id, key)
            .await
            .and_then(|stored| coerce_int(&stored))
            .unwrap_or(default)
    }

    async fn read_text(&self, id: ItemId, key: &str) -> Option<String> {
        self.load_meta(id, key)
            .await
            .and_then(|stored| coerce_text(&stored))
    }

    async fn get(&self, id: ItemId) -> Option<IngestItem> {
        match self.try_get(id).await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "failed to load ingest item");
                None
            }
        }
    }

    async fn set_target(&self, id: ItemId, target: TargetType) {
        let result = sqlx::query("UPDATE ingest_items SET target_type = ?, updated_at = ? WHERE id = ?")
            .bind(target.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(item_id = id, target = %target, error = %e, "failed to set target type");
        }
    }

    async fn select(&self, filter: &ItemFilter) -> Vec<ItemId> {
        match self.try_select(filter).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to select items");
                Vec::new()
            }
        }
    }

    async fn count_by_stage(&self, target: Option<TargetType>) -> BTreeMap<Stage, i64> {
        match self.try_count_by_stage(target).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "failed to count items by stage");
                empty_counts()
            }
        }
    }

    async fn delete(&self, id: ItemId) -> bool {
        match self.try_delete(id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "failed to delete item");
                false
            }
        }
    }

    async fn find_by_payload_hash(&self, hash: &str) -> Option<ItemId> {
        let result = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM ingest_items WHERE payload_hash = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await;
        match result {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to look up payload hash");
                None
            }
        }
    }

    async fn find_active_reimport(&self, source_post_id: &str) -> Option<ItemId> {
        match self.try_find_active_reimport(source_post_id).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(source_post_id, error = %e, "failed to look up in-flight re-import");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn create_starts_at_new_with_payload() {
        let store = store().await;
        let payload = json!({"name": "Blue Door Cafe", "types": ["cafe"]});
        let id = store
            .create(&payload, ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();

        let item = store.get(id).await.unwrap();
        assert_eq!(item.stage, Stage::New);
        assert_eq!(item.target, TargetType::LocalPlace);
        assert_eq!(store.read_raw_payload(id).await["name"], "Blue Door Cafe");
        assert_eq!(
            store.find_by_payload_hash(&payload_hash(&payload)).await,
            Some(id)
        );
    }

    #[tokio::test]
    async fn legacy_and_body_payloads_stay_readable() {
        let store = store().await;
        let legacy_id: i64 = sqlx::query_scalar(
            "INSERT INTO ingest_items (kind, target_type, stage, body, created_at, updated_at) VALUES ('place', 'local_place', 'new', NULL, 1, 1) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO item_meta (item_id, meta_key, value_kind, value) VALUES (?, '_raw_data', 'scalar', ?)")
            .bind(legacy_id)
            .bind("{\"name\":\"Old Mill\"}")
            .execute(store.pool())
            .await
            .unwrap();

        let body_id: i64 = sqlx::query_scalar(
            "INSERT INTO ingest_items (kind, target_type, stage, body, created_at, updated_at) VALUES ('event', 'local_event', 'new', '{\"name\":\"Jazz Night\"}', 2, 2) RETURNING id",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();

        let first = store.read_raw_payload(legacy_id).await;
        assert_eq!(first["name"], "Old Mill");
        assert_eq!(store.read_raw_payload(legacy_id).await, first);
        assert_eq!(store.read_raw_payload(body_id).await["name"], "Jazz Night");
        assert!(store.read_raw_payload(9999).await.is_empty());
    }

    #[tokio::test]
    async fn metadata_kinds_roundtrip_through_coercion() {
        let store = store().await;
        let id = store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();

        store
            .write_field(id, "classification", &json!({"category": "cafe", "confidence": 0.9}))
            .await;
        store.write_field(id, "tags", &json!(["a", "b"])).await;
        store.write_field(id, "score", &json!(81)).await;
        store.write_field(id, "", &json!(1)).await;

        assert_eq!(store.read_meta(id, "classification", None).await["category"], "cafe");
        assert_eq!(store.read_meta(id, "tags", None).await["value"], json!(["a", "b"]));
        assert_eq!(store.read_int(id, "score", 0).await, 81);
        assert_eq!(store.read_int(id, "missing", 7).await, 7);

        let mut fallback = Mapping::new();
        fallback.insert("fallback".into(), json!(true));
        assert_eq!(
            store.read_meta(id, "missing", Some(fallback.clone())).await,
            fallback
        );
    }

    #[tokio::test]
    async fn advance_writes_fields_and_stage_together() {
        let store = store().await;
        let id = store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        assert!(store.advance(id, Stage::Published, &[("published_post_id", json!("abc"))]).await);
        assert_eq!(store.stage(id).await, Some(Stage::Published));
        assert_eq!(store.read_text(id, "published_post_id").await.as_deref(), Some("abc"));

        assert!(!store.advance(4242, Stage::Published, &[("published_post_id", json!("zzz"))]).await);
        assert!(store.read_text(4242, "published_post_id").await.is_none());
    }

    #[tokio::test]
    async fn select_is_oldest_first_and_filtered() {
        let store = store().await;
        let a = store.create(&json!({"n": 1}), ItemKind::Place, TargetType::LocalPlace).await.unwrap();
        let b = store.create(&json!({"n": 2}), ItemKind::Event, TargetType::LocalEvent).await.unwrap();
        let c = store.create(&json!({"n": 3}), ItemKind::Place, TargetType::LocalPlace).await.unwrap();
        store.set_stage(b, Stage::Classified).await;

        let all_new = store.select(&ItemFilter::stages(&[Stage::New])).await;
        assert_eq!(all_new, vec![a, c]);

        let limited = store.select(&ItemFilter::stages(&Stage::ACTIVE).with_limit(2)).await;
        assert_eq!(limited, vec![a, b]);

        let events = store
            .select(&ItemFilter::default().with_target(Some(TargetType::LocalEvent)))
            .await;
        assert_eq!(events, vec![b]);

        let counts = store.count_by_stage(None).await;
        assert_eq!(counts[&Stage::New], 2);
        assert_eq!(counts[&Stage::Classified], 1);
        assert_eq!(counts[&Stage::Published], 0);
    }

    #[tokio::test]
    async fn active_reimport_lookup_ignores_finished_items() {
        let store = store().await;
        let id = store.create(&json!({"n": 1}), ItemKind::Place, TargetType::LocalPlace).await.unwrap();
        store.write_field(id, keys::SOURCE_POST_ID, &json!("post-1")).await;
        assert_eq!(store.find_active_reimport("post-1").await, Some(id));

        store.set_stage(id, Stage::Published).await;
        assert_eq!(store.find_active_reimport("post-1").await, None);

        assert!(store.delete(id).await);
        assert!(store.get(id).await.is_none());
    }
}
