use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{commit, prompt_context, StageContext, StageHandler};
use crate::gateway::{is_sentinel, text_error, ChatMessage};
use crate::models::{keys, ItemId, Mapping, Stage};

const SYSTEM_PROMPT: &str = "You write listing pages for a local guide. Using only the facts \
provided, write an engaging markdown description of 150-300 words with a level-one heading \
containing the name. Do not invent opening hours, prices, or contact details.";

/// `enriched` → `rewritten`: long-form listing content.
pub struct Rewrite;

fn text<'a>(m: &'a Mapping, key: &str) -> Option<&'a str> {
    m.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Deterministic content built from enrichment alone.
pub(crate) fn template(enrichment: &Mapping, classification: &Mapping) -> String {
    let name = text(enrichment, "name").unwrap_or("Untitled listing");
    let category = text(classification, "category")
        .or_else(|| text(enrichment, "category"))
        .map(|c| c.replace('_', " "));

    let mut out = format!("# {}\n\n", name);

    let mut intro = match (&category, text(enrichment, "city")) {
        (Some(cat), Some(city)) => format!("{} is a {} in {}.", name, cat, city),
        (Some(cat), None) => format!("{} is a {}.", name, cat),
        (None, Some(city)) => format!("{} is located in {}.", name, city),
        (None, None) => format!("{}.", name),
    };
    if let Some(desc) = text(enrichment, "description") {
        intro.push(' ');
        intro.push_str(desc);
    }
    out.push_str(&intro);
    out.push_str("\n\n");

    if let Some(summary) = enrichment
        .get("context")
        .and_then(|c| c.as_object())
        .and_then(|c| c.values().find_map(|v| v.get("summary").and_then(|s| s.as_str())))
    {
        out.push_str(summary.trim());
        out.push_str("\n\n");
    }

    let details: Vec<String> = [
        ("Venue", "venue"),
        ("Starts", "start_date"),
        ("Ends", "end_date"),
        ("Address", "address"),
        ("Phone", "phone"),
        ("Website", "website"),
    ]
    .iter()
    .filter_map(|(label, key)| text(enrichment, key).map(|v| format!("- **{}:** {}", label, v)))
    .collect();
    if !details.is_empty() {
        out.push_str("## Details\n\n");
        out.push_str(&details.join("\n"));
        out.push('\n');
    }

    out.trim_end().to_string()
}

#[async_trait]
impl StageHandler for Rewrite {
    fn stage(&self) -> Stage {
        Stage::Enriched
    }

    async fn handle(&self, ctx: &StageContext, id: ItemId) -> Result<Stage> {
        let payload = ctx.store.read_raw_payload(id).await;
        let enrichment = ctx.store.read_meta(id, keys::ENRICHMENT, None).await;
        let classification = ctx.store.read_meta(id, keys::CLASSIFICATION, None).await;
        if payload.is_empty() && enrichment.is_empty() {
            bail!("nothing to rewrite: payload and enrichment are empty");
        }

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt_context(&[
                ("classification", &classification),
                ("enrichment", &enrichment),
                ("raw", &payload),
            ])),
        ];
        let reply = ctx.gateway.text_call(&messages).await;

        let (content, source) = if is_sentinel(&reply) {
            (template(&enrichment, &classification), "template")
        } else if let Some(err) = text_error(&reply) {
            bail!("rewrite failed: {}", err);
        } else {
            (reply.trim().to_string(), "model")
        };
        if content.is_empty() {
            bail!("rewrite produced empty content");
        }

        commit(
            ctx,
            id,
            Stage::Rewritten,
            &[
                (keys::REWRITTEN_CONTENT, Value::String(content)),
                (keys::REWRITE_SOURCE, json!(source)),
            ],
        )
        .await
    }
}
