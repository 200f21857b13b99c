use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{commit, StageContext, StageHandler};
use crate::listings::{slugify, ListingDraft};
use crate::models::{keys, ItemId, Mapping, Stage};
use crate::places::{display_name, first_text, source_key};

/// `scored` → `published` | `ready_for_review` | `error_publish`.
///
/// A listing write failure diverts the item to `error_publish` and is not
/// reported as a handler failure.
pub struct Publish;

fn title(enrichment: &Mapping, payload: &Mapping, id: ItemId) -> String {
    enrichment
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.trim().is_empty())
        .map(|n| n.trim().to_string())
        .or_else(|| display_name(payload).map(String::from))
        .unwrap_or_else(|| format!("Listing {}", id))
}

/// Slug from the title, qualified by the city unless the title already
/// names it.
fn listing_slug(title: &str, city: Option<&str>, id: ItemId) -> String {
    let base = slugify(title);
    if base.is_empty() {
        return format!("listing-{}", id);
    }
    match city.map(slugify).filter(|c| !c.is_empty()) {
        Some(city) if !format!("-{}-", base).contains(&format!("-{}-", city)) => {
            format!("{}-{}", base, city)
        }
        _ => base,
    }
}

async fn draft(ctx: &StageContext, id: ItemId, score: i64) -> Result<ListingDraft> {
    let item = ctx
        .store
        .get(id)
        .await
        .ok_or_else(|| anyhow!("item {} not found", id))?;
    let payload = ctx.store.read_raw_payload(id).await;
    let enrichment = ctx.store.read_meta(id, keys::ENRICHMENT, None).await;
    let classification = ctx.store.read_meta(id, keys::CLASSIFICATION, None).await;
    let content = ctx
        .store
        .read_text(id, keys::REWRITTEN_CONTENT)
        .await
        .unwrap_or_default();

    let title = title(&enrichment, &payload, id);
    let city = first_text(&enrichment, &["city"])
        .or_else(|| first_text(&payload, &["city", "locality", "town"]));
    let slug = listing_slug(&title, city, id);
    let source_key = source_key(&payload);

    let mut listing_payload = Mapping::new();
    listing_payload.insert("raw".into(), Value::Object(payload));
    listing_payload.insert("enrichment".into(), Value::Object(enrichment));
    listing_payload.insert("classification".into(), Value::Object(classification));

    Ok(ListingDraft {
        merge_into: ctx.store.read_text(id, keys::SOURCE_POST_ID).await,
        target: item.target,
        source_key,
        slug,
        title,
        content,
        score,
        source_item_id: Some(id),
        payload: listing_payload,
    })
}

#[async_trait]
impl StageHandler for Publish {
    fn stage(&self) -> Stage {
        Stage::Scored
    }

    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage> {
        let score = ctx.store.read_int(id, keys::SCORE, -1).await;
        if score < 0 {
            bail!("item has no score");
        }

        let threshold = ctx.publish_threshold();
        if score < threshold {
            tracing::info!(item_id = id, score, threshold, "held for review");
            return commit(ctx, id, Stage::ReadyForReview, &[]).await;
        }

        let draft = draft(ctx, id, score).await?;
        match ctx.listings.upsert(&draft).await {
            Ok(listing_id) => {
                commit(
                    ctx,
                    id,
                    Stage::Published,
                    &[(keys::PUBLISHED_POST_ID, json!(listing_id))],
                )
                .await
            }
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "publication failed");
                commit(
                    ctx,
                    id,
                    Stage::ErrorPublish,
                    &[(keys::LAST_ERROR, json!(format!("publish failed: {:#}", e)))],
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listings::ListingSink;
    use crate::models::{ItemKind, TargetType};
    use crate::stages::testing::Fixture;
    use crate::store::RecordStore;

    async fn scored_item(fx: &Fixture, score: i64) -> ItemId {
        let id = fx
            .store
            .create(&json!({"name": "Tide Pool Diner"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store
            .advance(
                id,
                Stage::Scored,
                &[
                    (keys::SCORE, json!(score)),
                    (keys::REWRITTEN_CONTENT, json!("# Tide Pool Diner")),
                ],
            )
            .await;
        id
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let fx = Fixture::new();
        let at = scored_item(&fx, 80).await;
        let below = scored_item(&fx, 79).await;
        let ctx = fx.context(80);

        assert_eq!(Publish.handle(&ctx, at).await.unwrap(), Stage::Published);
        assert!(fx.store.read_text(at, keys::PUBLISHED_POST_ID).await.is_some());

        assert_eq!(Publish.handle(&ctx, below).await.unwrap(), Stage::ReadyForReview);
        assert!(fx.store.read_text(below, keys::PUBLISHED_POST_ID).await.is_none());
    }

    #[tokio::test]
    async fn sink_failure_diverts_to_error_publish() {
        let fx = Fixture::new();
        fx.listings.fail_upserts("database is locked");
        let id = scored_item(&fx, 95).await;

        assert_eq!(Publish.handle(&fx.context(80), id).await.unwrap(), Stage::ErrorPublish);
        assert_eq!(
            fx.store.read_text(id, keys::LAST_ERROR).await.as_deref(),
            Some("publish failed: database is locked")
        );
        assert!(fx.store.read_text(id, keys::PUBLISHED_POST_ID).await.is_none());
    }

    #[tokio::test]
    async fn reimport_merges_into_source_listing() {
        let fx = Fixture::new();
        let first = scored_item(&fx, 90).await;
        Publish.handle(&fx.context(80), first).await.unwrap();
        let listing_id = fx.store.read_text(first, keys::PUBLISHED_POST_ID).await.unwrap();

        let again = scored_item(&fx, 92).await;
        fx.store
            .write_field(again, keys::SOURCE_POST_ID, &json!(listing_id.clone()))
            .await;
        Publish.handle(&fx.context(80), again).await.unwrap();

        assert_eq!(
            fx.store.read_text(again, keys::PUBLISHED_POST_ID).await,
            Some(listing_id.clone())
        );
        assert_eq!(fx.listings.len(), 1);
        assert_eq!(fx.listings.get(&listing_id).await.unwrap().unwrap().score, 92);
    }

    #[test]
    fn slug_is_qualified_by_city() {
        assert_eq!(listing_slug("Starbucks", Some("Seattle"), 1), "starbucks-seattle");
        assert_eq!(listing_slug("Portland Roasters", Some("Portland"), 1), "portland-roasters");
        assert_eq!(listing_slug("Starbucks", None, 1), "starbucks");
        assert_eq!(listing_slug("!!!", Some("Rome"), 9), "listing-9");
    }

    async fn scored_place(fx: &Fixture, payload: Value) -> ItemId {
        let id = fx
            .store
            .create(&payload, ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store
            .advance(
                id,
                Stage::Scored,
                &[
                    (keys::SCORE, json!(90)),
                    (keys::REWRITTEN_CONTENT, json!(format!("{} listing", payload["city"]))),
                ],
            )
            .await;
        id
    }

    #[tokio::test]
    async fn same_name_places_publish_separately() {
        let fx = Fixture::new();
        let ctx = fx.context(80);
        let portland = scored_place(&fx, json!({"name": "Starbucks", "city": "Portland"})).await;
        let seattle = scored_place(&fx, json!({"name": "Starbucks", "city": "Seattle"})).await;
        // Same name and city, different upstream place.
        let other = scored_place(
            &fx,
            json!({"name": "Starbucks", "city": "Seattle", "place_id": "ChIJ-2"}),
        )
        .await;

        for id in [portland, seattle, other] {
            assert_eq!(Publish.handle(&ctx, id).await.unwrap(), Stage::Published);
        }
        let ids: Vec<String> = published_ids(&fx, &[portland, seattle, other]).await;
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_eq!(fx.listings.len(), 3);

        let first = fx.listings.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(first.slug, "starbucks-portland");
        assert!(first.content.contains("Portland"));
        assert_eq!(
            fx.listings.get(&ids[2]).await.unwrap().unwrap().slug,
            "starbucks-seattle-2"
        );
    }

    #[tokio::test]
    async fn same_place_id_merges() {
        let fx = Fixture::new();
        let ctx = fx.context(80);
        let a = scored_place(&fx, json!({"name": "Gull Cafe", "city": "Rockland", "place_id": "ChIJ-9"})).await;
        let b = scored_place(&fx, json!({"name": "Gull Café & Bar", "city": "Rockland", "place_id": "ChIJ-9"})).await;
        Publish.handle(&ctx, a).await.unwrap();
        Publish.handle(&ctx, b).await.unwrap();

        let ids = published_ids(&fx, &[a, b]).await;
        assert_eq!(ids[0], ids[1]);
        assert_eq!(fx.listings.len(), 1);
    }

    async fn published_ids(fx: &Fixture, items: &[ItemId]) -> Vec<String> {
        let mut out = Vec::new();
        for id in items {
            out.push(fx.store.read_text(*id, keys::PUBLISHED_POST_ID).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn unscored_item_fails() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store.set_stage(id, Stage::Scored).await;
        assert!(Publish.handle(&fx.context(80), id).await.is_err());
    }
}
