//! `ingest` commands: operator tools over the item store.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;

use crate::bootstrap::App;
use crate::config::Config;
use crate::ingestors::{enqueue_envelope, Enqueued, Envelope};
use crate::listings::{ListingQuery, ListingSink};
use crate::models::{keys, ItemFilter, ItemId, ItemKind, Stage, TargetType};
use crate::places::is_city_like;
use crate::settings::{constant_value, process_env, SECRET_KEYS};
use crate::store::RecordStore;

/// Fields cleared by a soft reset.
const SOFT_RESET_KEYS: &[&str] = &[
    keys::LAST_ERROR,
    keys::SCORE,
    keys::SCORE_BREAKDOWN,
    keys::PUBLISHED_POST_ID,
];

/// Metadata keys printed by `ingest show`, in pipeline order.
const SHOW_KEYS: &[&str] = &[
    keys::CLASSIFICATION,
    keys::ENRICHMENT,
    keys::REWRITE_SOURCE,
    keys::REWRITTEN_CONTENT,
    keys::SCORE,
    keys::SCORE_BREAKDOWN,
    keys::PUBLISHED_POST_ID,
    keys::SOURCE_POST_ID,
    keys::IS_REIMPORT,
    keys::LAST_ERROR,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubAction {
    Retag,
    Delete,
}

impl std::str::FromStr for ScrubAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retag" => Ok(ScrubAction::Retag),
            "delete" => Ok(ScrubAction::Delete),
            other => bail!("Unknown scrub action '{}'. Use retag or delete.", other),
        }
    }
}

/// `ingest add`
pub async fn run_add(
    config: Config,
    path: &Path,
    kind: Option<&str>,
    target: Option<&str>,
) -> Result<()> {
    let kind = kind.map(str::parse::<ItemKind>).transpose()?;
    let target = target.map(str::parse::<TargetType>).transpose()?;

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let envelope = Envelope::parse(value)?.with_overrides(kind, target);

    let app = App::bootstrap(config).await?;
    match enqueue_envelope(app.store.as_ref(), &envelope).await? {
        Enqueued::Created(id) => println!(
            "Created item {} ({} -> {}) at stage new",
            id, envelope.kind, envelope.target
        ),
        Enqueued::Duplicate(id) => println!("Duplicate payload; already stored as item {}", id),
    }
    app.pool.close().await;
    Ok(())
}

/// `ingest show`
pub async fn run_show(config: Config, id: ItemId) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let store = app.store.as_ref();
    let Some(item) = store.get(id).await else {
        app.pool.close().await;
        bail!("Item not found: {}", id);
    };

    println!("Item {}", item.id);
    println!("  type:     {}", item.kind);
    println!("  target:   {}", item.target);
    println!("  stage:    {}", item.stage);
    println!("  created:  {}", format_ts(item.created_at));
    println!("  updated:  {}", format_ts(item.updated_at));

    let payload = store.read_raw_payload(id).await;
    println!();
    println!("raw_payload:");
    println!("{}", serde_json::to_string_pretty(&Value::Object(payload))?);

    for key in SHOW_KEYS {
        if let Some(text) = store.read_text(id, key).await {
            println!();
            println!("{}:", key);
            match serde_json::from_str::<Value>(&text) {
                Ok(v @ Value::Object(_)) => println!("{}", serde_json::to_string_pretty(&v)?),
                _ => println!("{}", text),
            }
        }
    }

    app.pool.close().await;
    Ok(())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// `ingest reset`
pub async fn run_reset(config: Config, soft: bool) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let store = app.store.as_ref();
    let ids = store.select(&ItemFilter::default()).await;

    let mut changed = 0;
    for id in &ids {
        let ok = if soft {
            soft_reset(store, *id).await
        } else {
            store.delete(*id).await
        };
        if ok {
            changed += 1;
        }
    }

    if soft {
        println!("Rewound {} of {} items to stage new.", changed, ids.len());
    } else {
        println!("Deleted {} of {} items.", changed, ids.len());
    }
    app.pool.close().await;
    Ok(())
}

async fn soft_reset(store: &dyn RecordStore, id: ItemId) -> bool {
    for key in SOFT_RESET_KEYS {
        store.delete_field(id, key).await;
    }
    store.advance(id, Stage::New, &[]).await
}

/// `ingest scrub`
pub async fn run_scrub(config: Config, action: ScrubAction, dry_run: bool) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let store = app.store.as_ref();

    let mut matched = Vec::new();
    for id in store.select(&ItemFilter::default()).await {
        let Some(item) = store.get(id).await else {
            continue;
        };
        if item.target == TargetType::City || item.stage == Stage::Published {
            continue;
        }
        let payload = store.read_raw_payload(id).await;
        if is_city_like(&payload) {
            let name = crate::places::display_name(&payload)
                .unwrap_or("(unnamed)")
                .to_string();
            matched.push((id, name));
        }
    }

    for (id, name) in &matched {
        if dry_run {
            println!("would {} item {}  {}", verb(action), id, name);
            continue;
        }
        match action {
            ScrubAction::Retag => store.set_target(*id, TargetType::City).await,
            ScrubAction::Delete => {
                store.delete(*id).await;
            }
        }
        println!("{} item {}  {}", past(action), id, name);
    }

    println!(
        "{} city-like item(s) {}.",
        matched.len(),
        if dry_run { "found" } else { past(action) }
    );
    app.pool.close().await;
    Ok(())
}

fn verb(action: ScrubAction) -> &'static str {
    match action {
        ScrubAction::Retag => "retag",
        ScrubAction::Delete => "delete",
    }
}

fn past(action: ScrubAction) -> &'static str {
    match action {
        ScrubAction::Retag => "retagged",
        ScrubAction::Delete => "deleted",
    }
}

/// `ingest scrub-secrets`
///
/// Removes stored credentials that a deployment constant already supplies.
pub async fn run_scrub_secrets(config: Config) -> Result<()> {
    let app = App::bootstrap(config).await?;
    let mut removed = 0;

    for key in SECRET_KEYS {
        let stored = app.options.get(key).await?;
        if stored.is_none() {
            continue;
        }
        if constant_value(key, &process_env).is_some() {
            app.options.unset(key).await?;
            println!("removed {} (defined as a constant)", key);
            removed += 1;
        } else {
            println!("kept {} (no constant defined)", key);
        }
    }

    println!("{} stored secret(s) removed.", removed);
    app.pool.close().await;
    Ok(())
}

/// `ingest reimport`
pub async fn run_reimport(
    config: Config,
    post_type: Option<&str>,
    limit: Option<usize>,
    ids: Vec<String>,
    dry_run: bool,
) -> Result<()> {
    let target = post_type.map(str::parse::<TargetType>).transpose()?;
    let app = App::bootstrap(config).await?;

    let listings = app
        .listings
        .list(&ListingQuery {
            target,
            ids,
            limit,
        })
        .await?;

    let mut created = 0;
    let mut skipped = 0;
    for listing in &listings {
        if let Some(existing) = app.store.find_active_reimport(&listing.id).await {
            println!(
                "skip {}  {} (re-import in progress as item {})",
                listing.id, listing.title, existing
            );
            skipped += 1;
            continue;
        }
        if dry_run {
            println!("would re-import {}  {}", listing.id, listing.title);
            continue;
        }

        let payload = reimport_payload(&listing.payload, &listing.title, &listing.content);
        let kind = match listing.target {
            TargetType::LocalEvent => ItemKind::Event,
            _ => ItemKind::Place,
        };
        let Some(id) = app.store.create(&payload, kind, listing.target).await else {
            eprintln!("Warning: failed to create item for listing {}", listing.id);
            continue;
        };
        let marked = app
            .store
            .advance(
                id,
                Stage::New,
                &[
                    (keys::SOURCE_POST_ID, json!(listing.id)),
                    (keys::IS_REIMPORT, json!(true)),
                ],
            )
            .await;
        if !marked {
            eprintln!("Warning: failed to mark item {} as a re-import", id);
        }
        println!("re-imported {}  {} as item {}", listing.id, listing.title, id);
        created += 1;
    }

    println!(
        "{} listing(s): {} re-imported, {} skipped{}.",
        listings.len(),
        created,
        skipped,
        if dry_run { " (dry run)" } else { "" }
    );
    app.pool.close().await;
    Ok(())
}

/// The original raw payload kept on the listing, or one rebuilt from the
/// published fields.
fn reimport_payload(listing_payload: &crate::models::Mapping, title: &str, content: &str) -> Value {
    match listing_payload.get("raw") {
        Some(Value::Object(raw)) if !raw.is_empty() => Value::Object(raw.clone()),
        _ => json!({ "name": title, "description": content }),
    }
}
