use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{commit, StageContext, StageHandler};
use crate::context_sources::ContextQuery;
use crate::models::{keys, ItemId, Mapping, Stage};
use crate::places::{display_name, first_text};

/// `classified` → `enriched`: normalized fields plus external context.
pub struct Enrich;

fn number(payload: &Mapping, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| match payload.get(*f) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Coordinates from flat fields or a `geometry.location` object.
fn coordinates(payload: &Mapping) -> Option<(f64, f64)> {
    if let (Some(lat), Some(lng)) = (
        number(payload, &["lat", "latitude"]),
        number(payload, &["lng", "lon", "longitude"]),
    ) {
        return Some((lat, lng));
    }
    let location = payload
        .get("geometry")
        .and_then(|g| g.get("location"))
        .and_then(|l| l.as_object())?;
    Some((number(location, &["lat"])?, number(location, &["lng"])?))
}

/// Normalized view of the raw payload.
pub(crate) fn normalize(payload: &Mapping, classification: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(v) = value {
            out.insert(key.to_string(), json!(v));
        }
    };

    put("name", display_name(payload));
    put(
        "address",
        first_text(payload, &["formatted_address", "address", "vicinity"]),
    );
    put("city", first_text(payload, &["city", "locality", "town"]));
    put("region", first_text(payload, &["region", "state", "province"]));
    put("country", first_text(payload, &["country", "country_code"]));
    put(
        "phone",
        first_text(
            payload,
            &["phone", "formatted_phone_number", "international_phone_number"],
        ),
    );
    put("website", first_text(payload, &["website", "url"]));
    put("venue", first_text(payload, &["venue", "venue_name"]));
    put(
        "start_date",
        first_text(payload, &["start_date", "start", "date"]),
    );
    put("end_date", first_text(payload, &["end_date", "end"]));
    put("description", first_text(payload, &["description", "summary"]));
    put(
        "category",
        classification.get("category").and_then(|c| c.as_str()),
    );

    if let Some((lat, lng)) = coordinates(payload) {
        out.insert("coordinates".into(), json!({ "lat": lat, "lng": lng }));
    }
    if let Some(rating) = number(payload, &["rating"]) {
        out.insert("rating".into(), json!(rating));
    }
    out
}

#[async_trait]
impl StageHandler for Enrich {
    fn stage(&self) -> Stage {
        Stage::Classified
    }

    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage> {
        let payload = ctx.store.read_raw_payload(id).await;
        if payload.is_empty() {
            bail!("raw payload is empty or unreadable");
        }
        let classification = ctx.store.read_meta(id, keys::CLASSIFICATION, None).await;

        let mut enrichment = normalize(&payload, &classification);

        let mut context = Mapping::new();
        let mut warnings = Vec::new();
        if let Some(name) = enrichment.get("name").and_then(|n| n.as_str()) {
            let query = ContextQuery {
                name: name.to_string(),
                city: enrichment
                    .get("city")
                    .and_then(|c| c.as_str())
                    .map(String::from),
                category: enrichment
                    .get("category")
                    .and_then(|c| c.as_str())
                    .map(String::from),
            };
            for source in &ctx.sources {
                match source.lookup(&query).await {
                    Ok(Some(found)) => {
                        context.insert(source.name().to_string(), Value::Object(found));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(item_id = id, source = source.name(), error = %e, "context lookup failed");
                        warnings.push(json!(format!("{}: {}", source.name(), e)));
                    }
                }
            }
        }

        if !context.is_empty() {
            enrichment.insert("context".into(), Value::Object(context));
        }
        if !warnings.is_empty() {
            enrichment.insert("warnings".into(), Value::Array(warnings));
        }
        enrichment.insert("enriched_at".into(), json!(chrono::Utc::now().to_rfc3339()));

        commit(
            ctx,
            id,
            Stage::Enriched,
            &[(keys::ENRICHMENT, Value::Object(enrichment))],
        )
        .await
    }
}
