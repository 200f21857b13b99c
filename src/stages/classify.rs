use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{commit, StageContext, StageHandler};
use crate::gateway::{is_stub, json_error, ChatMessage};
use crate::models::{keys, ItemId, Mapping, Stage, TargetType};
use crate::places::{infer_category, normalize_category};

const SYSTEM_PROMPT: &str = "You classify scraped local listings. Given a raw place or event \
record, pick a short lowercase category (e.g. restaurant, cafe, museum, concert), a confidence \
between 0 and 1, and the content type it should become: local_place, local_event, or city \
when the record describes a whole town or region.";

/// `new` → `classified`: category and confidence for the item.
pub struct Classify;

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "category": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "target_type": { "type": "string", "enum": ["local_place", "local_event", "city"] }
        },
        "required": ["category", "confidence"]
    })
}

fn heuristic(payload: &Mapping) -> Mapping {
    let (category, confidence) = infer_category(payload);
    let mut out = Mapping::new();
    out.insert("category".into(), json!(category));
    out.insert("confidence".into(), json!(confidence));
    out.insert("source".into(), json!("heuristic"));
    out
}

/// Normalize a model reply, filling gaps from the heuristic.
fn from_model(reply: &Value, payload: &Mapping) -> Mapping {
    let fallback = infer_category(payload);
    let category = reply
        .get("category")
        .and_then(|c| c.as_str())
        .map(normalize_category)
        .filter(|c| !c.is_empty())
        .unwrap_or(fallback.0);
    let confidence = reply
        .get("confidence")
        .and_then(|c| c.as_f64())
        .filter(|c| c.is_finite())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    let mut out = Mapping::new();
    out.insert("category".into(), json!(category));
    out.insert("confidence".into(), json!(confidence));
    out.insert("source".into(), json!("model"));
    if let Some(target) = reply
        .get("target_type")
        .and_then(|t| t.as_str())
        .and_then(|t| t.parse::<TargetType>().ok())
    {
        out.insert("target_type".into(), json!(target.as_str()));
    }
    out
}

#[async_trait]
impl StageHandler for Classify {
    fn stage(&self) -> Stage {
        Stage::New
    }

    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage> {
        let payload = ctx.store.read_raw_payload(id).await;
        if payload.is_empty() {
            bail!("raw payload is empty or unreadable");
        }
        let kind = ctx
            .store
            .get(id)
            .await
            .map(|item| item.kind.as_str())
            .unwrap_or("place");

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Record type: {}\n\n{}",
                kind,
                Value::Object(payload.clone())
            )),
        ];
        let reply = ctx.gateway.json_call(&messages, &schema()).await;
        if let Some(err) = json_error(&reply) {
            bail!("classification failed: {}", err);
        }

        let classification = if is_stub(&reply) {
            heuristic(&payload)
        } else {
            from_model(&reply, &payload)
        };

        if let Some(target) = classification
            .get("target_type")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse::<TargetType>().ok())
        {
            ctx.store.set_target(id, target).await;
        }

        commit(
            ctx,
            id,
            Stage::Classified,
            &[(keys::CLASSIFICATION, Value::Object(classification))],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, ModelProvider};
    use crate::models::ItemKind;
    use crate::stages::testing::Fixture;
    use crate::store::RecordStore;
    use std::sync::Arc;

    struct Canned(Value);

    #[async_trait]
    impl ModelProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        fn model(&self) -> &str {
            "canned"
        }
        async fn json_call(&self, _m: &[ChatMessage], _s: &Value) -> Result<Value> {
            Ok(self.0.clone())
        }
        async fn text_call(&self, _m: &[ChatMessage]) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn stub_reply_falls_back_to_heuristic() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "Crust", "types": ["bakery"]}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        assert_eq!(Classify.handle(&fx.context(80), id).await.unwrap(), Stage::Classified);

        let c = fx.store.read_meta(id, keys::CLASSIFICATION, None).await;
        assert_eq!(c["category"], "bakery");
        assert_eq!(c["source"], "heuristic");
    }

    #[tokio::test]
    async fn model_reply_is_normalized_and_may_retarget() {
        let mut fx = Fixture::new();
        fx.gateway = Arc::new(Gateway::new(Arc::new(Canned(
            json!({"category": "Town Center", "confidence": 1.7, "target_type": "city"}),
        ))));
        let id = fx
            .store
            .create(&json!({"name": "Springfield"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        Classify.handle(&fx.context(80), id).await.unwrap();

        let c = fx.store.read_meta(id, keys::CLASSIFICATION, None).await;
        assert_eq!(c["category"], "town_center");
        assert_eq!(c["confidence"], 1.0);
        assert_eq!(fx.store.get(id).await.unwrap().target, TargetType::City);
    }

    #[tokio::test]
    async fn gateway_error_fails_without_advancing() {
        let mut fx = Fixture::new();
        fx.gateway = Arc::new(Gateway::new(Arc::new(Canned(json!({"error": "rate limited"})))));
        let id = fx
            .store
            .create(&json!({"name": "X"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        let err = Classify.handle(&fx.context(80), id).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(fx.store.stage(id).await, Some(Stage::New));
    }

    #[tokio::test]
    async fn empty_payload_is_an_error() {
        let fx = Fixture::new();
        let id = fx.store.insert_with_body("not json", ItemKind::Place, TargetType::LocalPlace);
        assert!(Classify.handle(&fx.context(80), id).await.is_err());
    }
}
