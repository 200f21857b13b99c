//! Application wiring.
//!
//! Builds every long-lived component once, from the config file, the
//! persisted options bag and the environment, and hands them out as shared
//! handles. Nothing in the pipeline reaches for global state.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::context_sources::create_sources;
use crate::db;
use crate::gateway::Gateway;
use crate::ingestors::{InboxIngestor, Ingestor};
use crate::listings::SqliteListings;
use crate::migrate;
use crate::options::OptionsStore;
use crate::runner::Runner;
use crate::settings::Settings;
use crate::stages::{Pipeline, StageContext};
use crate::store::sqlite::SqliteStore;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub options: OptionsStore,
    pub settings: Settings,
    pub gateway: Arc<Gateway>,
    pub store: Arc<SqliteStore>,
    pub listings: Arc<SqliteListings>,
    pub pipeline: Arc<Pipeline>,
}

impl App {
    /// Connect, migrate, resolve settings and construct the pipeline.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool)
            .await
            .context("Failed to prepare database schema")?;

        let options = OptionsStore::new(pool.clone());
        let bag = options.load_all().await?;
        let settings = Settings::from_environment(&config, &bag);

        let gateway = Arc::new(Gateway::from_settings(&settings.llm));
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let listings = Arc::new(SqliteListings::new(pool.clone()));

        let ctx = StageContext {
            store: store.clone(),
            gateway: gateway.clone(),
            listings: listings.clone(),
            sources: create_sources(&config.enrich)?,
            publish_threshold: AtomicI64::new(settings.publish_threshold),
        };
        let pipeline = Arc::new(Pipeline::standard(ctx));

        tracing::debug!(
            provider = %settings.llm.provider,
            model = %settings.llm.effective_model(),
            threshold = settings.publish_threshold,
            enabled = settings.agent_enabled,
            "application ready"
        );

        Ok(Self {
            config,
            pool,
            options,
            settings,
            gateway,
            store,
            listings,
            pipeline,
        })
    }

    /// Ingestors enabled in `[ingest]`.
    pub fn ingestors(&self) -> Result<Vec<Box<dyn Ingestor>>> {
        let mut ingestors: Vec<Box<dyn Ingestor>> = Vec::new();
        if let Some(inbox) = InboxIngestor::from_config(&self.config.ingest)? {
            ingestors.push(Box::new(inbox));
        }
        Ok(ingestors)
    }

    /// The scheduled runner over this app's pipeline.
    pub fn runner(&self) -> Result<Runner> {
        Ok(Runner::new(
            self.pipeline.clone(),
            self.ingestors()?,
            self.settings.agent_enabled,
            self.config.agent.tick_cap,
            self.config.agent.early_exit_probability,
        ))
    }

    /// Re-read the options bag, swap in a provider built from the result
    /// and apply the new publish threshold.
    pub async fn reload_settings(&mut self) -> Result<()> {
        let bag = self.options.load_all().await?;
        self.settings = Settings::from_environment(&self.config, &bag);
        self.gateway.reload(&self.settings.llm);
        self.pipeline
            .context()
            .publish_threshold
            .store(self.settings.publish_threshold, Ordering::Relaxed);
        Ok(())
    }
}
