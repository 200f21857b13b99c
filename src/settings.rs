//! Resolved runtime settings.
//!
//! Every recognized option can come from three places. The first one that
//! supplies a non-empty value wins:
//!
//! | Priority | Source | Example |
//! |----------|--------|---------|
//! | 1 | deployment constant (environment) | `LISTING_AGENT_OPENAI_API_KEY`, `OPENAI_API_KEY` |
//! | 2 | options bag (`options` table) | `listing-agent option set llm_provider openai` |
//! | 3 | local config file (TOML) | `[llm] provider = "openai"` |
//!
//! The provenance of each value is kept so `agent status` can report where
//! a credential came from and `ingest scrub-secrets` can tell which stored
//! keys are shadowed by a constant.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::Config;

/// Option keys understood by the pipeline.
pub const OPTION_KEYS: &[&str] = &[
    "agent_enabled",
    "llm_provider",
    "llm_model",
    "openai_api_key",
    "openai_base_url",
    "anthropic_api_key",
    "custom_base_url",
    "custom_api_key",
    "custom_model",
    "custom_auth_header",
    "custom_auth_format",
    "publish_threshold",
];

/// Option keys holding credentials. Masked when listed.
pub const SECRET_KEYS: &[&str] = &["openai_api_key", "anthropic_api_key", "custom_api_key"];

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";
pub const DEFAULT_AUTH_FORMAT: &str = "Bearer {key}";

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    Constant,
    Options,
    File,
    Default,
}

impl fmt::Display for SettingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettingSource::Constant => "constant",
            SettingSource::Options => "options",
            SettingSource::File => "config file",
            SettingSource::Default => "default",
        })
    }
}

/// Environment variable names that can define `key` as a deployment constant.
pub fn constant_names(key: &str) -> Vec<String> {
    let mut names = vec![format!("LISTING_AGENT_{}", key.to_ascii_uppercase())];
    match key {
        "openai_api_key" => names.push("OPENAI_API_KEY".to_string()),
        "anthropic_api_key" => names.push("ANTHROPIC_API_KEY".to_string()),
        _ => {}
    }
    names
}

/// Look up a deployment constant for `key` through `env`.
pub fn constant_value(key: &str, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    constant_names(key)
        .iter()
        .filter_map(|name| env(name))
        .find(|v| !v.trim().is_empty())
}

/// Read the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Provider-specific settings handed to the model gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: String,
    pub model: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub custom_base_url: Option<String>,
    pub custom_api_key: Option<String>,
    pub custom_model: Option<String>,
    pub custom_auth_header: String,
    pub custom_auth_format: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl LlmSettings {
    /// Whether the selected provider has the credential it needs.
    pub fn has_credential(&self) -> bool {
        match self.provider.as_str() {
            "openai" => self.openai_api_key.is_some(),
            "anthropic" => self.anthropic_api_key.is_some(),
            "custom" => self.custom_base_url.is_some(),
            _ => false,
        }
    }

    /// True when a real provider (not `none`) is selected and usable.
    pub fn is_configured(&self) -> bool {
        self.provider != "none" && self.has_credential()
    }

    /// Model name the selected provider will use.
    pub fn effective_model(&self) -> String {
        match self.provider.as_str() {
            "anthropic" => self
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            "custom" => self
                .custom_model
                .clone()
                .or_else(|| self.model.clone())
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            "openai" => self
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            _ => "none".to_string(),
        }
    }

    /// Option key of the credential the selected provider needs.
    pub fn credential_key(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "openai" => Some("openai_api_key"),
            "anthropic" => Some("anthropic_api_key"),
            "custom" => Some("custom_base_url"),
            _ => None,
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub agent_enabled: bool,
    pub publish_threshold: i64,
    pub llm: LlmSettings,
    sources: BTreeMap<String, SettingSource>,
}

impl Settings {
    /// Resolve settings from the process environment, the options bag, and
    /// the config file.
    pub fn from_environment(file: &Config, options: &BTreeMap<String, String>) -> Self {
        Self::resolve(file, options, &process_env)
    }

    /// Resolve settings with an explicit environment lookup.
    pub fn resolve(
        file: &Config,
        options: &BTreeMap<String, String>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Self {
        let mut sources = BTreeMap::new();
        let mut get = |key: &str| -> Option<String> {
            let found = lookup(key, file, options, env);
            let source = found
                .as_ref()
                .map(|(_, s)| *s)
                .unwrap_or(SettingSource::Default);
            sources.insert(key.to_string(), source);
            found.map(|(v, _)| v)
        };

        let agent_enabled = get("agent_enabled")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(file.agent.enabled);
        let publish_threshold = get("publish_threshold")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|v| v.clamp(0, 100))
            .unwrap_or(file.agent.publish_threshold);

        let llm = LlmSettings {
            provider: get("llm_provider")
                .map(|p| p.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "none".to_string()),
            model: get("llm_model"),
            openai_api_key: get("openai_api_key"),
            openai_base_url: get("openai_base_url")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            anthropic_api_key: get("anthropic_api_key"),
            custom_base_url: get("custom_base_url"),
            custom_api_key: get("custom_api_key"),
            custom_model: get("custom_model"),
            custom_auth_header: get("custom_auth_header")
                .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string()),
            custom_auth_format: get("custom_auth_format")
                .unwrap_or_else(|| DEFAULT_AUTH_FORMAT.to_string()),
            timeout_secs: file.llm.timeout_secs,
            max_retries: file.llm.max_retries,
        };

        Self {
            agent_enabled,
            publish_threshold,
            llm,
            sources,
        }
    }

    /// Where the value for `key` came from.
    pub fn source_of(&self, key: &str) -> SettingSource {
        self.sources
            .get(key)
            .copied()
            .unwrap_or(SettingSource::Default)
    }
}

fn lookup(
    key: &str,
    file: &Config,
    options: &BTreeMap<String, String>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<(String, SettingSource)> {
    if let Some(v) = constant_value(key, env) {
        return Some((v, SettingSource::Constant));
    }
    if let Some(v) = options.get(key).filter(|v| !v.trim().is_empty()) {
        return Some((v.clone(), SettingSource::Options));
    }
    file_value(file, key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| (v, SettingSource::File))
}

fn file_value(file: &Config, key: &str) -> Option<String> {
    let llm = &file.llm;
    match key {
        "agent_enabled" => Some(file.agent.enabled.to_string()),
        "publish_threshold" => Some(file.agent.publish_threshold.to_string()),
        "llm_provider" => Some(llm.provider.clone()),
        "llm_model" => llm.model.clone(),
        "openai_api_key" => llm.openai_api_key.clone(),
        "openai_base_url" => llm.openai_base_url.clone(),
        "anthropic_api_key" => llm.anthropic_api_key.clone(),
        "custom_base_url" => llm.custom_base_url.clone(),
        "custom_api_key" => llm.custom_api_key.clone(),
        "custom_model" => llm.custom_model.clone(),
        "custom_auth_header" => llm.custom_auth_header.clone(),
        "custom_auth_format" => llm.custom_auth_format.clone(),
        _ => None,
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(value = other, "ignoring unparseable boolean option");
            None
        }
    }
}

/// Mask a secret for display, keeping the last four characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_llm(toml_llm: &str) -> Config {
        toml::from_str(&format!("[db]\npath = \"x\"\n[llm]\n{}", toml_llm)).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn constant_beats_options_beats_file() {
        let file = file_with_llm("provider = \"openai\"\nopenai_api_key = \"file-key\"\n");
        let mut options = BTreeMap::new();
        options.insert("openai_api_key".to_string(), "option-key".to_string());

        let s = Settings::resolve(&file, &options, &no_env);
        assert_eq!(s.llm.openai_api_key.as_deref(), Some("option-key"));
        assert_eq!(s.source_of("openai_api_key"), SettingSource::Options);

        let env = |name: &str| (name == "OPENAI_API_KEY").then(|| "env-key".to_string());
        let s = Settings::resolve(&file, &options, &env);
        assert_eq!(s.llm.openai_api_key.as_deref(), Some("env-key"));
        assert_eq!(s.source_of("openai_api_key"), SettingSource::Constant);

        let s = Settings::resolve(&file, &BTreeMap::new(), &no_env);
        assert_eq!(s.llm.openai_api_key.as_deref(), Some("file-key"));
        assert_eq!(s.source_of("openai_api_key"), SettingSource::File);
    }

    #[test]
    fn empty_values_fall_through() {
        let file = file_with_llm("provider = \"anthropic\"\nanthropic_api_key = \"file-key\"\n");
        let mut options = BTreeMap::new();
        options.insert("anthropic_api_key".to_string(), "   ".to_string());
        let env = |name: &str| (name == "ANTHROPIC_API_KEY").then(String::new);
        let s = Settings::resolve(&file, &options, &env);
        assert_eq!(s.llm.anthropic_api_key.as_deref(), Some("file-key"));
    }

    #[test]
    fn options_override_threshold_and_enabled() {
        let file = file_with_llm("");
        let mut options = BTreeMap::new();
        options.insert("publish_threshold".to_string(), "65".to_string());
        options.insert("agent_enabled".to_string(), "no".to_string());
        let s = Settings::resolve(&file, &options, &no_env);
        assert_eq!(s.publish_threshold, 65);
        assert!(!s.agent_enabled);
    }

    #[test]
    fn credential_presence_follows_provider() {
        let s = Settings::resolve(&file_with_llm(""), &BTreeMap::new(), &no_env);
        assert_eq!(s.llm.provider, "none");
        assert!(!s.llm.is_configured());

        let s = Settings::resolve(
            &file_with_llm("provider = \"custom\"\ncustom_base_url = \"http://localhost:8080/v1\"\n"),
            &BTreeMap::new(),
            &no_env,
        );
        assert!(s.llm.is_configured());
        assert_eq!(s.llm.custom_auth_header, "Authorization");
        assert_eq!(s.llm.custom_auth_format, "Bearer {key}");
    }

    #[test]
    fn mask_keeps_tail() {
        assert_eq!(mask_secret("sk-abcdef1234"), "****1234");
        assert_eq!(mask_secret("abc"), "****");
    }
}
