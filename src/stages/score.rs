use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{commit, StageContext, StageHandler};
use crate::models::{keys, ItemId, Mapping, Stage};

/// `rewritten` → `scored`: deterministic 0–100 quality score.
pub struct Score;

const CONTENT_POINTS: i64 = 35;
const COMPLETENESS_POINTS: i64 = 35;
const CONFIDENCE_POINTS: f64 = 15.0;
const CONTEXT_POINTS: i64 = 10;
const MODEL_POINTS: i64 = 5;

/// Word count at which content earns full marks.
const FULL_CONTENT_WORDS: i64 = 250;

const COMPLETENESS_FIELDS: &[&str] = &["name", "address", "city", "coordinates", "phone", "website"];

/// Score breakdown for an item's accumulated data.
pub(crate) fn breakdown(
    content: &str,
    enrichment: &Mapping,
    classification: &Mapping,
    rewrite_source: Option<&str>,
) -> Mapping {
    let words = content.split_whitespace().count() as i64;
    let content_score = (words * CONTENT_POINTS / FULL_CONTENT_WORDS).min(CONTENT_POINTS);

    let present = COMPLETENESS_FIELDS
        .iter()
        .filter(|f| enrichment.get(**f).is_some_and(|v| !v.is_null()))
        .count() as i64;
    let completeness = present * COMPLETENESS_POINTS / COMPLETENESS_FIELDS.len() as i64;

    let confidence = classification
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let confidence_score = (confidence * CONFIDENCE_POINTS).round() as i64;

    let context_score = if enrichment
        .get("context")
        .and_then(|c| c.as_object())
        .is_some_and(|c| !c.is_empty())
    {
        CONTEXT_POINTS
    } else {
        0
    };
    let model_score = if rewrite_source == Some("model") {
        MODEL_POINTS
    } else {
        0
    };

    let total =
        (content_score + completeness + confidence_score + context_score + model_score).clamp(0, 100);

    let mut out = Mapping::new();
    out.insert("content".into(), json!(content_score));
    out.insert("words".into(), json!(words));
    out.insert("completeness".into(), json!(completeness));
    out.insert("confidence".into(), json!(confidence_score));
    out.insert("context".into(), json!(context_score));
    out.insert("model".into(), json!(model_score));
    out.insert("total".into(), json!(total));
    out
}

#[async_trait]
impl StageHandler for Score {
    fn stage(&self) -> Stage {
        Stage::Rewritten
    }

    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage> {
        let content = ctx
            .store
            .read_text(id, keys::REWRITTEN_CONTENT)
            .await
            .filter(|c| !c.trim().is_empty());
        let Some(content) = content else {
            bail!("no rewritten content to score");
        };
        let enrichment = ctx.store.read_meta(id, keys::ENRICHMENT, None).await;
        let classification = ctx.store.read_meta(id, keys::CLASSIFICATION, None).await;
        let source = ctx.store.read_text(id, keys::REWRITE_SOURCE).await;

        let breakdown = breakdown(&content, &enrichment, &classification, source.as_deref());
        let total = breakdown.get("total").cloned().unwrap_or(json!(0));

        commit(
            ctx,
            id,
            Stage::Scored,
            &[
                (keys::SCORE, total),
                (keys::SCORE_BREAKDOWN, Value::Object(breakdown)),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemKind, TargetType};
    use crate::stages::testing::Fixture;
    use crate::store::RecordStore;

    fn mapping(v: Value) -> Mapping {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn full_marks_are_capped_at_100() {
        let content = "word ".repeat(400);
        let enrichment = mapping(json!({
            "name": "n", "address": "a", "city": "c",
            "coordinates": {"lat": 0, "lng": 0}, "phone": "p", "website": "w",
            "context": {"wikipedia": {"summary": "s"}}
        }));
        let b = breakdown(&content, &enrichment, &mapping(json!({"confidence": 1.0})), Some("model"));
        assert_eq!(b["total"], 100);
    }

    #[test]
    fn sparse_items_score_low() {
        let b = breakdown("short text", &mapping(json!({"name": "n"})), &Mapping::new(), Some("template"));
        assert_eq!(b["content"], 0);
        assert_eq!(b["completeness"], 5);
        assert_eq!(b["total"], 5);
    }

    #[tokio::test]
    async fn score_is_deterministic_and_stored() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store
            .advance(
                id,
                Stage::Rewritten,
                &[
                    (keys::REWRITTEN_CONTENT, json!("# X\n\nA place.")),
                    (keys::ENRICHMENT, json!({"name": "X", "city": "Y"})),
                ],
            )
            .await;

        assert_eq!(Score.handle(&fx.context(80), id).await.unwrap(), Stage::Scored);
        let first = fx.store.read_int(id, keys::SCORE, -1).await;
        let stored = fx.store.read_meta(id, keys::SCORE_BREAKDOWN, None).await;
        assert_eq!(stored["total"], first);
        assert_eq!(
            breakdown("# X\n\nA place.", &mapping(json!({"name": "X", "city": "Y"})), &Mapping::new(), None)["total"],
            first
        );
    }

    #[tokio::test]
    async fn missing_content_fails() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "x"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store.set_stage(id, Stage::Rewritten).await;
        assert!(Score.handle(&fx.context(80), id).await.is_err());
    }
}
