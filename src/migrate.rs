use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Ingest items: one row per record moving through the pipeline
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('event', 'place')),
            target_type TEXT NOT NULL CHECK (target_type IN ('local_place', 'local_event', 'city')),
            stage TEXT NOT NULL DEFAULT 'new' CHECK (stage IN (
                'new', 'classified', 'enriched', 'rewritten', 'scored',
                'published', 'ready_for_review', 'error_publish'
            )),
            body TEXT,
            payload_hash TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Item metadata: scalars, native arrays, and JSON-encoded objects
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_meta (
            item_id INTEGER NOT NULL,
            meta_key TEXT NOT NULL,
            value_kind TEXT NOT NULL CHECK (value_kind IN ('scalar', 'array', 'json')),
            value TEXT,
            PRIMARY KEY (item_id, meta_key),
            FOREIGN KEY (item_id) REFERENCES ingest_items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Published listings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listings (
            id TEXT PRIMARY KEY,
            target_type TEXT NOT NULL,
            slug TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            score INTEGER NOT NULL,
            source_item_id INTEGER,
            source_key TEXT,
            payload_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(target_type, slug)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Persisted options bag
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS options (
            option_key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_stage ON ingest_items(stage, id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_payload_hash ON ingest_items(payload_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_meta_key_value ON item_meta(meta_key, value)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_listings_updated_at ON listings(updated_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_listings_source ON listings(target_type, source_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_listings_source_item ON listings(source_item_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
