//! Publication target for scored items.
//!
//! A listing is the public record an item becomes once it clears the
//! publish threshold. Listings are keyed by a uuid. An upsert merges into an
//! existing listing, matched in this order:
//!
//! 1. `merge_into`, the listing a re-import came from;
//! 2. the upstream `source_key` (a place or event id) within the target type;
//! 3. the item that published it before.
//!
//! Slugs are unique per target type but never used to match, except as the
//! last resort for a re-import whose listing has gone missing. A new
//! listing whose slug is taken gets a numeric suffix.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::models::{ItemId, Mapping, TargetType};

/// A listing to create or merge.
#[derive(Debug, Clone)]
pub struct ListingDraft {
    /// Existing listing to merge into (re-imports).
    pub merge_into: Option<String>,
    pub target: TargetType,
    /// Upstream identifier of the record, e.g. a place id.
    pub source_key: Option<String>,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub score: i64,
    pub source_item_id: Option<ItemId>,
    pub payload: Mapping,
}

/// A stored listing.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub id: String,
    pub target: TargetType,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub score: i64,
    pub source_item_id: Option<ItemId>,
    pub source_key: Option<String>,
    pub payload: Mapping,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Filter for [`ListingSink::list`]. Results are most recently updated first.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub target: Option<TargetType>,
    pub ids: Vec<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ListingSink: Send + Sync {
    /// Create or merge a listing. Returns the listing id.
    async fn upsert(&self, draft: &ListingDraft) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<Listing>>;

    async fn list(&self, query: &ListingQuery) -> Result<Vec<Listing>>;
}

/// Lowercase ASCII words joined by `-`.
pub fn slugify(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// `slug`, or the first of `slug-2`, `slug-3`, ... that is not taken.
fn free_slug(slug: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(slug) {
        return slug.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", slug, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| slug.to_string())
}

// ============ SQLite ============

pub struct SqliteListings {
    pool: SqlitePool,
}

impl SqliteListings {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn existing_id(&self, draft: &ListingDraft) -> Result<Option<String>> {
        if let Some(id) = &draft.merge_into {
            let found: Option<String> = sqlx::query_scalar("SELECT id FROM listings WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(key) = &draft.source_key {
            let found: Option<String> = sqlx::query_scalar(
                "SELECT id FROM listings WHERE target_type = ? AND source_key = ? LIMIT 1",
            )
            .bind(draft.target.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(item_id) = draft.source_item_id {
            let found: Option<String> = sqlx::query_scalar(
                "SELECT id FROM listings WHERE target_type = ? AND source_item_id = ? LIMIT 1",
            )
            .bind(draft.target.as_str())
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(id) = &draft.merge_into {
            tracing::warn!(listing_id = %id, "merge target missing, matching by slug");
            return Ok(sqlx::query_scalar(
                "SELECT id FROM listings WHERE target_type = ? AND slug = ?",
            )
            .bind(draft.target.as_str())
            .bind(&draft.slug)
            .fetch_optional(&self.pool)
            .await?);
        }

        Ok(None)
    }

    async fn unused_slug(&self, draft: &ListingDraft) -> Result<String> {
        let taken: Vec<String> = sqlx::query_scalar(
            "SELECT slug FROM listings WHERE target_type = ? AND (slug = ? OR slug LIKE ?)",
        )
        .bind(draft.target.as_str())
        .bind(&draft.slug)
        .bind(format!("{}-%", draft.slug))
        .fetch_all(&self.pool)
        .await?;
        Ok(free_slug(&draft.slug, |s| taken.iter().any(|t| t == s)))
    }
}

fn row_to_listing(row: &sqlx::sqlite::SqliteRow) -> Result<Listing> {
    let target: String = row.get("target_type");
    let payload_json: String = row.get("payload_json");
    Ok(Listing {
        id: row.get("id"),
        target: target.parse()?,
        slug: row.get("slug"),
        title: row.get("title"),
        content: row.get("content"),
        score: row.get("score"),
        source_item_id: row.get("source_item_id"),
        source_key: row.get("source_key"),
        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ListingSink for SqliteListings {
    async fn upsert(&self, draft: &ListingDraft) -> Result<String> {
        if draft.slug.is_empty() {
            bail!("listing slug is empty");
        }
        let now = chrono::Utc::now().timestamp();
        let payload_json = serde_json::to_string(&draft.payload)?;

        if let Some(id) = self.existing_id(draft).await? {
            sqlx::query(
                r#"
                UPDATE listings
                SET title = ?, content = ?, score = ?, source_item_id = ?,
                    source_key = COALESCE(?, source_key), payload_json = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&draft.title)
            .bind(&draft.content)
            .bind(draft.score)
            .bind(draft.source_item_id)
            .bind(&draft.source_key)
            .bind(&payload_json)
            .bind(now)
            .bind(&id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update listing {}", id))?;
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let slug = self.unused_slug(draft).await?;
        sqlx::query(
            r#"
            INSERT INTO listings (id, target_type, slug, title, content, score, source_item_id, source_key, payload_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(draft.target.as_str())
        .bind(&slug)
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(draft.score)
        .bind(draft.source_item_id)
        .bind(&draft.source_key)
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert listing '{}'", slug))?;

        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_listing).transpose()
    }

    async fn list(&self, query: &ListingQuery) -> Result<Vec<Listing>> {
        let rows = sqlx::query("SELECT * FROM listings ORDER BY updated_at DESC, id")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::new();
        for row in &rows {
            let listing = row_to_listing(row)?;
            if query.target.map_or(true, |t| t == listing.target)
                && (query.ids.is_empty() || query.ids.contains(&listing.id))
            {
                out.push(listing);
            }
            if query.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }
}

// ============ In-memory ============

/// In-memory sink for tests. Can be switched into a failing mode.
#[derive(Default)]
pub struct MemoryListings {
    rows: Mutex<BTreeMap<String, Listing>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryListings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upsert fail with `message`.
    pub fn fail_upserts(&self, message: &str) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ListingSink for MemoryListings {
    async fn upsert(&self, draft: &ListingDraft) -> Result<String> {
        if let Some(msg) = self
            .fail_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            bail!(msg);
        }
        if draft.slug.is_empty() {
            bail!("listing slug is empty");
        }

        let now = chrono::Utc::now().timestamp();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let same_target = |l: &&Listing| l.target == draft.target;
        let existing = draft
            .merge_into
            .as_ref()
            .filter(|id| rows.contains_key(*id))
            .cloned()
            .or_else(|| {
                let key = draft.source_key.as_ref()?;
                rows.values()
                    .filter(same_target)
                    .find(|l| l.source_key.as_ref() == Some(key))
                    .map(|l| l.id.clone())
            })
            .or_else(|| {
                let item = draft.source_item_id?;
                rows.values()
                    .filter(same_target)
                    .find(|l| l.source_item_id == Some(item))
                    .map(|l| l.id.clone())
            })
            .or_else(|| {
                draft.merge_into.as_ref()?;
                rows.values()
                    .filter(same_target)
                    .find(|l| l.slug == draft.slug)
                    .map(|l| l.id.clone())
            });

        let (id, created_at, slug, source_key) = match existing.and_then(|id| rows.get(&id)) {
            Some(l) => (
                l.id.clone(),
                l.created_at,
                l.slug.clone(),
                draft.source_key.clone().or_else(|| l.source_key.clone()),
            ),
            None => {
                let slug = free_slug(&draft.slug, |s| {
                    rows.values().filter(same_target).any(|l| l.slug == s)
                });
                (
                    uuid::Uuid::new_v4().to_string(),
                    now,
                    slug,
                    draft.source_key.clone(),
                )
            }
        };

        rows.insert(
            id.clone(),
            Listing {
                id: id.clone(),
                target: draft.target,
                slug,
                title: draft.title.clone(),
                content: draft.content.clone(),
                score: draft.score,
                source_item_id: draft.source_item_id,
                source_key,
                payload: draft.payload.clone(),
                created_at,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Listing>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn list(&self, query: &ListingQuery) -> Result<Vec<Listing>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Listing> = rows
            .values()
            .filter(|l| query.target.map_or(true, |t| t == l.target))
            .filter(|l| query.ids.is_empty() || query.ids.contains(&l.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        out.truncate(query.limit.unwrap_or(usize::MAX));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn sqlite_sink() -> SqliteListings {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        SqliteListings::new(pool)
    }

    fn draft(slug: &str, title: &str) -> ListingDraft {
        ListingDraft {
            merge_into: None,
            target: TargetType::LocalPlace,
            source_key: None,
            slug: slug.to_string(),
            title: title.to_string(),
            content: "Body".to_string(),
            score: 90,
            source_item_id: Some(1),
            payload: Mapping::new(),
        }
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Joe's Café & Bar!"), "joe-s-caf-bar");
        assert_eq!(slugify("  "), "");
    }

    #[tokio::test]
    async fn sqlite_republishing_an_item_merges() {
        let sink = sqlite_sink().await;
        let a = sink.upsert(&draft("blue-door", "Blue Door")).await.unwrap();
        let b = sink.upsert(&draft("blue-door", "The Blue Door")).await.unwrap();
        assert_eq!(a, b);

        let listing = sink.get(&a).await.unwrap().unwrap();
        assert_eq!(listing.title, "The Blue Door");
        assert_eq!(sink.list(&ListingQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_slug_from_different_items_stays_separate() {
        for sink in [
            Box::new(sqlite_sink().await) as Box<dyn ListingSink>,
            Box::new(MemoryListings::new()) as Box<dyn ListingSink>,
        ] {
            let mut portland = draft("starbucks", "Starbucks");
            portland.source_item_id = Some(1);
            let mut seattle = draft("starbucks", "Starbucks");
            seattle.source_item_id = Some(2);
            seattle.content = "Starbucks in Seattle".to_string();

            let a = sink.upsert(&portland).await.unwrap();
            let b = sink.upsert(&seattle).await.unwrap();
            assert_ne!(a, b);

            let first = sink.get(&a).await.unwrap().unwrap();
            assert_eq!(first.content, "Body");
            assert_eq!(first.slug, "starbucks");
            assert_eq!(sink.get(&b).await.unwrap().unwrap().slug, "starbucks-2");
            assert_eq!(sink.list(&ListingQuery::default()).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn source_key_matches_across_items() {
        for sink in [
            Box::new(sqlite_sink().await) as Box<dyn ListingSink>,
            Box::new(MemoryListings::new()) as Box<dyn ListingSink>,
        ] {
            let mut first = draft("gull-cafe", "Gull Cafe");
            first.source_key = Some("ChIJ-gull".to_string());
            let mut renamed = draft("gull-cafe-bar", "Gull Cafe & Bar");
            renamed.source_item_id = Some(7);
            renamed.source_key = Some("ChIJ-gull".to_string());

            let a = sink.upsert(&first).await.unwrap();
            assert_eq!(sink.upsert(&renamed).await.unwrap(), a);

            let mut event = renamed.clone();
            event.target = TargetType::LocalEvent;
            assert_ne!(sink.upsert(&event).await.unwrap(), a);
        }
    }

    #[test]
    fn free_slug_appends_counter() {
        let taken = ["cafe", "cafe-2"];
        assert_eq!(free_slug("cafe", |s| taken.contains(&s)), "cafe-3");
        assert_eq!(free_slug("bar", |s| taken.contains(&s)), "bar");
    }

    #[tokio::test]
    async fn sqlite_merge_into_keeps_id_and_slug() {
        let sink = sqlite_sink().await;
        let id = sink.upsert(&draft("old-name", "Old")).await.unwrap();
        let mut renamed = draft("new-name", "New");
        renamed.merge_into = Some(id.clone());
        assert_eq!(sink.upsert(&renamed).await.unwrap(), id);

        let listing = sink.get(&id).await.unwrap().unwrap();
        assert_eq!(listing.slug, "old-name");
        assert_eq!(listing.title, "New");
    }

    #[tokio::test]
    async fn list_filters_by_target_and_ids() {
        let sink = MemoryListings::new();
        let place = sink.upsert(&draft("a", "A")).await.unwrap();
        let mut event = draft("b", "B");
        event.target = TargetType::LocalEvent;
        sink.upsert(&event).await.unwrap();

        let places = sink
            .list(&ListingQuery {
                target: Some(TargetType::LocalPlace),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].id, place);

        let by_id = sink
            .list(&ListingQuery {
                ids: vec![place.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[tokio::test]
    async fn failing_memory_sink() {
        let sink = MemoryListings::new();
        sink.fail_upserts("disk full");
        let err = sink.upsert(&draft("x", "X")).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(sink.is_empty());
    }
}
