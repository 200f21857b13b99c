//! TOML configuration parsing.
//!
//! This is the *local config file* layer of the settings stack. Values here
//! are the lowest-priority source: the persisted options bag and deployment
//! constants (environment variables) override them, see [`crate::settings`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_publish_threshold")]
    pub publish_threshold: i64,
    /// Default `--batch-size` for `agent run`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum items handled by one scheduled tick.
    #[serde(default = "default_tick_cap")]
    pub tick_cap: usize,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_early_exit_probability")]
    pub early_exit_probability: f64,
    /// Pause between items in operator batch runs.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            publish_threshold: default_publish_threshold(),
            batch_size: default_batch_size(),
            tick_cap: default_tick_cap(),
            tick_interval_secs: default_tick_interval_secs(),
            early_exit_probability: default_early_exit_probability(),
            throttle_ms: default_throttle_ms(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_publish_threshold() -> i64 {
    80
}
fn default_batch_size() -> usize {
    10
}
fn default_tick_cap() -> usize {
    10
}
fn default_tick_interval_secs() -> u64 {
    600
}
fn default_early_exit_probability() -> f64 {
    0.05
}
fn default_throttle_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub openai_base_url: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub custom_base_url: Option<String>,
    #[serde(default)]
    pub custom_api_key: Option<String>,
    #[serde(default)]
    pub custom_model: Option<String>,
    #[serde(default)]
    pub custom_auth_header: Option<String>,
    #[serde(default)]
    pub custom_auth_format: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            openai_api_key: None,
            openai_base_url: None,
            anthropic_api_key: None,
            custom_base_url: None,
            custom_api_key: None,
            custom_model: None,
            custom_auth_header: None,
            custom_auth_format: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "none".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    /// Attach encyclopedia summaries during enrichment.
    #[serde(default)]
    pub wikipedia: bool,
    #[serde(default = "default_wikipedia_base_url")]
    pub wikipedia_base_url: String,
    #[serde(default = "default_enrich_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            wikipedia: false,
            wikipedia_base_url: default_wikipedia_base_url(),
            timeout_secs: default_enrich_timeout_secs(),
        }
    }
}

fn default_wikipedia_base_url() -> String {
    "https://en.wikipedia.org/api/rest_v1".to_string()
}
fn default_enrich_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    /// Directory scanned for JSON envelopes on every tick.
    #[serde(default)]
    pub inbox: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

impl Config {
    /// A config with every section at its default, used by tests and by
    /// commands that only need a database path.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            agent: AgentConfig::default(),
            llm: LlmConfig::default(),
            enrich: EnrichConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !(0..=100).contains(&config.agent.publish_threshold) {
        bail!("agent.publish_threshold must be in [0, 100]");
    }
    if config.agent.batch_size == 0 {
        bail!("agent.batch_size must be > 0");
    }
    if config.agent.tick_cap == 0 {
        bail!("agent.tick_cap must be > 0");
    }
    if config.agent.tick_interval_secs == 0 {
        bail!("agent.tick_interval_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&config.agent.early_exit_probability) {
        bail!("agent.early_exit_probability must be in [0.0, 1.0]");
    }

    match config.llm.provider.as_str() {
        "none" | "openai" | "anthropic" | "custom" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be none, openai, anthropic, or custom.",
            other
        ),
    }

    Ok(())
}
