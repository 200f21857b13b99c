//! External context for the enrichment stage.
//!
//! A [`ContextSource`] looks up background information about a place or
//! event (an encyclopedia summary, demographic notes) and returns it as a
//! mapping that Enrich stores under `enrichment.context.<name>`.
//! Sources are optional and their failures never fail an item.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::EnrichConfig;
use crate::models::Mapping;

/// What a source is asked about.
#[derive(Debug, Clone)]
pub struct ContextQuery {
    pub name: String,
    pub city: Option<String>,
    pub category: Option<String>,
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    fn name(&self) -> &str;

    /// Context for `query`, or `None` when the source knows nothing about it.
    async fn lookup(&self, query: &ContextQuery) -> Result<Option<Mapping>>;
}

/// Build the sources enabled in `[enrich]`.
pub fn create_sources(config: &EnrichConfig) -> Result<Vec<Box<dyn ContextSource>>> {
    let mut sources: Vec<Box<dyn ContextSource>> = Vec::new();
    if config.wikipedia {
        sources.push(Box::new(WikipediaSource::new(
            &config.wikipedia_base_url,
            config.timeout_secs,
        )?));
    }
    Ok(sources)
}

/// Page summaries from the Wikipedia REST API.
pub struct WikipediaSource {
    base_url: String,
    client: reqwest::Client,
}

impl WikipediaSource {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("listing-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Wikipedia titles use underscores for spaces; everything else is
    /// percent-encoded as one path segment.
    fn summary_url(&self, title: &str) -> String {
        let title = title.trim().replace(' ', "_");
        format!(
            "{}/page/summary/{}",
            self.base_url,
            urlencoding::encode(&title)
        )
    }
}

/// Keep the fields worth storing from a summary response.
fn parse_summary(body: &Value) -> Option<Mapping> {
    if body.get("type").and_then(|t| t.as_str()) == Some("disambiguation") {
        return None;
    }
    let extract = body.get("extract").and_then(|e| e.as_str())?.trim();
    if extract.is_empty() {
        return None;
    }
    let mut out = Mapping::new();
    out.insert("summary".to_string(), json!(extract));
    if let Some(title) = body.get("title") {
        out.insert("title".to_string(), title.clone());
    }
    if let Some(url) = body
        .get("content_urls")
        .and_then(|c| c.get("desktop"))
        .and_then(|d| d.get("page"))
    {
        out.insert("url".to_string(), url.clone());
    }
    Some(out)
}

#[async_trait]
impl ContextSource for WikipediaSource {
    fn name(&self) -> &str {
        "wikipedia"
    }

    async fn lookup(&self, query: &ContextQuery) -> Result<Option<Mapping>> {
        // Venue pages are rare; the city page is the useful fallback.
        let mut candidates = vec![query.name.clone()];
        if let Some(city) = &query.city {
            candidates.push(city.clone());
        }

        for title in candidates.iter().filter(|t| !t.trim().is_empty()) {
            let response = self.client.get(self.summary_url(title)).send().await?;
            let status = response.status();
            if status.as_u16() == 404 {
                continue;
            }
            if !status.is_success() {
                bail!("Wikipedia API error {} for '{}'", status, title);
            }
            let body: Value = response.json().await?;
            if let Some(summary) = parse_summary(&body) {
                return Ok(Some(summary));
            }
        }
        Ok(None)
    }
}
