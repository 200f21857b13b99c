//! Pipeline stage handlers.
//!
//! Each handler performs one stage's work for one item, writes its output
//! and moves the item on:
//!
//! ```text
//! new ──Classify──▶ classified ──Enrich──▶ enriched ──Rewrite──▶ rewritten
//!     ──Score──▶ scored ──Publish──▶ published | ready_for_review | error_publish
//! ```
//!
//! Handlers write their result and the new stage through
//! [`RecordStore::advance`], so an item never shows a stage whose output is
//! missing. A handler that returns `Err` leaves the item at its current
//! stage; [`Pipeline::process`] records the message under `last_error`.

mod classify;
mod enrich;
mod publish;
mod rewrite;
mod score;

pub use classify::Classify;
pub use enrich::Enrich;
pub use publish::Publish;
pub use rewrite::Rewrite;
pub use score::Score;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::context_sources::ContextSource;
use crate::gateway::Gateway;
use crate::listings::ListingSink;
use crate::models::{keys, ItemId, Stage};
use crate::store::RecordStore;

/// Everything a handler may touch.
pub struct StageContext {
    pub store: Arc<dyn RecordStore>,
    pub gateway: Arc<Gateway>,
    pub listings: Arc<dyn ListingSink>,
    pub sources: Vec<Box<dyn ContextSource>>,
    /// Inclusive lower bound for publication. Updated on settings reload.
    pub publish_threshold: AtomicI64,
}

impl StageContext {
    pub fn publish_threshold(&self) -> i64 {
        self.publish_threshold.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage this handler runs for.
    fn stage(&self) -> Stage;

    /// Process one item. Returns the stage the item was moved to.
    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage>;
}

/// Handlers keyed by the stage they run for.
pub struct HandlerSet {
    handlers: BTreeMap<Stage, Box<dyn StageHandler>>,
}

impl HandlerSet {
    /// The five pipeline handlers.
    pub fn standard() -> Self {
        let mut set = Self {
            handlers: BTreeMap::new(),
        };
        set.insert(Box::new(Classify));
        set.insert(Box::new(Enrich));
        set.insert(Box::new(Rewrite));
        set.insert(Box::new(Score));
        set.insert(Box::new(Publish));
        set
    }

    /// Register `handler`, replacing any handler for the same stage.
    pub fn insert(&mut self, handler: Box<dyn StageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn get(&self, stage: Stage) -> Option<&dyn StageHandler> {
        self.handlers.get(&stage).map(|h| h.as_ref())
    }
}

/// Result of processing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub from: Stage,
    pub to: Stage,
}

/// Dispatches items to the handler for their current stage.
pub struct Pipeline {
    ctx: StageContext,
    handlers: HandlerSet,
}

impl Pipeline {
    pub fn new(ctx: StageContext, handlers: HandlerSet) -> Self {
        Self { ctx, handlers }
    }

    pub fn standard(ctx: StageContext) -> Self {
        Self::new(ctx, HandlerSet::standard())
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.ctx.store
    }

    /// Run the handler for the item's current stage.
    ///
    /// Clears any previous `last_error` first. On failure the new error is
    /// written to `last_error` and returned.
    pub async fn process(&self, id: ItemId) -> Result<StageOutcome> {
        let store = &self.ctx.store;
        store.delete_field(id, keys::LAST_ERROR).await;

        let result = self.dispatch(id).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(item_id = id, from = %outcome.from, to = %outcome.to, "item advanced");
                if !outcome.from.next_stages().contains(&outcome.to) {
                    tracing::warn!(item_id = id, from = %outcome.from, to = %outcome.to, "unexpected stage transition");
                }
            }
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "item failed");
                store
                    .write_field(id, keys::LAST_ERROR, &Value::String(format!("{:#}", e)))
                    .await;
            }
        }
        result
    }

    async fn dispatch(&self, id: ItemId) -> Result<StageOutcome> {
        let from = self
            .ctx
            .store
            .stage(id)
            .await
            .ok_or_else(|| anyhow!("item {} not found", id))?;
        if from.is_terminal() {
            bail!("item {} is at rest stage '{}'", id, from);
        }
        let handler = self
            .handlers
            .get(from)
            .ok_or_else(|| anyhow!("no handler registered for stage '{}'", from))?;
        let to = handler.handle(&self.ctx, id).await?;
        Ok(StageOutcome { from, to })
    }
}

/// Write `fields` and move to `stage`, failing if the store rejects it.
pub(crate) async fn commit(
    ctx: &StageContext,
    id: ItemId,
    stage: Stage,
    fields: &[(&str, Value)],
) -> Result<Stage> {
    if !ctx.store.advance(id, stage, fields).await {
        bail!("failed to store results for stage '{}'", stage);
    }
    Ok(stage)
}

/// Compact JSON view of the item's accumulated data for prompts.
pub(crate) fn prompt_context(sections: &[(&str, &crate::models::Mapping)]) -> String {
    let mut obj = serde_json::Map::new();
    for (name, section) in sections {
        if !section.is_empty() {
            obj.insert(name.to_string(), Value::Object((*section).clone()));
        }
    }
    serde_json::to_string_pretty(&Value::Object(obj)).unwrap_or_else(|_| json!({}).to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::listings::MemoryListings;
    use crate::store::memory::InMemoryStore;

    pub struct Fixture {
        pub store: Arc<InMemoryStore>,
        pub listings: Arc<MemoryListings>,
        pub gateway: Arc<Gateway>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStore::new()),
                listings: Arc::new(MemoryListings::new()),
                gateway: Arc::new(Gateway::null()),
            }
        }

        pub fn context(&self, publish_threshold: i64) -> StageContext {
            StageContext {
                store: self.store.clone(),
                gateway: self.gateway.clone(),
                listings: self.listings.clone(),
                sources: Vec::new(),
                publish_threshold: AtomicI64::new(publish_threshold),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::models::{ItemKind, TargetType};

    struct Exploding;

    #[async_trait]
    impl StageHandler for Exploding {
        fn stage(&self) -> Stage {
            Stage::New
        }
        async fn handle(&self, _ctx: &StageContext, _id: ItemId) -> Result<Stage> {
            bail!("boom")
        }
    }

    #[tokio::test]
    async fn failure_records_last_error_and_keeps_stage() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "X"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        let mut handlers = HandlerSet::standard();
        handlers.insert(Box::new(Exploding));
        let pipeline = Pipeline::new(fx.context(80), handlers);

        assert!(pipeline.process(id).await.is_err());
        assert_eq!(fx.store.stage(id).await, Some(Stage::New));
        assert_eq!(
            fx.store.read_text(id, keys::LAST_ERROR).await.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn success_clears_stale_error() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "Blue Door Cafe", "types": ["cafe"]}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store.write_field(id, keys::LAST_ERROR, &json!("old failure")).await;

        let pipeline = Pipeline::standard(fx.context(80));
        let outcome = pipeline.process(id).await.unwrap();
        assert_eq!(outcome, StageOutcome { from: Stage::New, to: Stage::Classified });
        assert!(fx.store.read_text(id, keys::LAST_ERROR).await.is_none());
    }

    #[tokio::test]
    async fn rest_stages_are_not_dispatched() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(&json!({"name": "X"}), ItemKind::Place, TargetType::LocalPlace)
            .await
            .unwrap();
        fx.store.set_stage(id, Stage::Published).await;
        let pipeline = Pipeline::standard(fx.context(80));
        assert!(pipeline.process(id).await.is_err());
        assert_eq!(fx.store.stage(id).await, Some(Stage::Published));
    }

    #[tokio::test]
    async fn null_gateway_drives_item_to_publication() {
        let fx = Fixture::new();
        let id = fx
            .store
            .create(
                &json!({
                    "name": "Lighthouse Coffee Roasters",
                    "types": ["cafe", "point_of_interest"],
                    "formatted_address": "12 Harbor St, Portland, ME",
                    "city": "Portland",
                    "phone": "+1 207 555 0100",
                    "website": "https://lighthouse.example",
                    "lat": 43.65,
                    "lng": -70.25
                }),
                ItemKind::Place,
                TargetType::LocalPlace,
            )
            .await
            .unwrap();

        let pipeline = Pipeline::standard(fx.context(0));
        for expected in [
            Stage::Classified,
            Stage::Enriched,
            Stage::Rewritten,
            Stage::Scored,
            Stage::Published,
        ] {
            assert_eq!(pipeline.process(id).await.unwrap().to, expected);
        }
        let listing_id = fx.store.read_text(id, keys::PUBLISHED_POST_ID).await.unwrap();
        let listing = fx.listings.get(&listing_id).await.unwrap().unwrap();
        assert_eq!(listing.slug, "lighthouse-coffee-roasters-portland");
    }
}
