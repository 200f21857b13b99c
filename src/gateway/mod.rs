//! Provider-agnostic model gateway.
//!
//! Stage handlers talk to language models exclusively through [`Gateway`],
//! which wraps one [`ModelProvider`]:
//!
//! - **[`NullProvider`]**: no provider registered; JSON calls return a stub
//!   marker object and text calls return [`TEXT_SENTINEL`].
//! - **[`UnconfiguredProvider`]**: a provider was selected but its
//!   credential is missing; every call comes back error-shaped.
//! - **[`OpenAiAdapter`]**: OpenAI chat completions.
//! - **[`AnthropicAdapter`]**: Anthropic messages API.
//! - **[`CustomAdapter`]**: any OpenAI-compatible endpoint with a
//!   configurable auth header.
//!
//! # Return shapes
//!
//! The gateway never returns an error. Callers treat both shapes as normal
//! results:
//!
//! | Call | Success | Failure |
//! |------|---------|---------|
//! | [`Gateway::json_call`] | JSON object | `{ "error": "<message>" }` |
//! | [`Gateway::text_call`] | text | `"Error: <message>"` |
//!
//! Use [`json_error`], [`is_stub`], [`text_error`] and [`is_sentinel`] to
//! tell them apart.
//!
//! # Provider selection
//!
//! The provider is built once from [`LlmSettings`] at startup and injected
//! wherever it is needed. [`Gateway::reload`] builds a fresh provider from
//! new settings and swaps it in.

mod anthropic;
mod http;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use openai::{CustomAdapter, OpenAiAdapter};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};

use crate::settings::LlmSettings;

/// Marker key present in the stub object returned when no provider is
/// registered.
pub const STUB_KEY: &str = "_stub";

/// Text returned by [`Gateway::text_call`] when no provider is registered.
pub const TEXT_SENTINEL: &str = "[no model provider registered]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A language model backend.
///
/// Implementations may fail freely; [`Gateway`] converts failures into
/// error-shaped results.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider identifier (`"openai"`, `"anthropic"`, `"custom"`, `"none"`).
    fn name(&self) -> &str;

    /// Model the provider sends requests to.
    fn model(&self) -> &str;

    /// Request a JSON object conforming (loosely) to `schema`.
    async fn json_call(&self, messages: &[ChatMessage], schema: &Value) -> Result<Value>;

    /// Request free text.
    async fn text_call(&self, messages: &[ChatMessage]) -> Result<String>;

    /// `false` when every call is known to fail for lack of configuration.
    fn is_configured(&self) -> bool {
        true
    }
}

// ============ Null Provider ============

/// Provider used when none is registered. Lets the pipeline run end to end
/// without a model.
pub struct NullProvider;

#[async_trait]
impl ModelProvider for NullProvider {
    fn name(&self) -> &str {
        "none"
    }

    fn model(&self) -> &str {
        "none"
    }

    async fn json_call(&self, _messages: &[ChatMessage], _schema: &Value) -> Result<Value> {
        Ok(json!({ STUB_KEY: true, "message": "no model provider registered" }))
    }

    async fn text_call(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok(TEXT_SENTINEL.to_string())
    }
}

// ============ Unconfigured Provider ============

/// Provider standing in for one whose credential could not be resolved.
pub struct UnconfiguredProvider {
    provider: String,
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        "unconfigured"
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn json_call(&self, _messages: &[ChatMessage], _schema: &Value) -> Result<Value> {
        bail!("LLM provider '{}' is not configured: {}", self.provider, self.reason)
    }

    async fn text_call(&self, _messages: &[ChatMessage]) -> Result<String> {
        bail!("LLM provider '{}' is not configured: {}", self.provider, self.reason)
    }
}

// ============ Provider construction ============

/// Build the provider selected by `llm.provider`.
///
/// # Errors
///
/// Returns an error for unknown provider names and for providers whose
/// required credential is missing.
pub fn try_create_provider(llm: &LlmSettings) -> Result<Arc<dyn ModelProvider>> {
    match llm.provider.as_str() {
        "none" | "" => Ok(Arc::new(NullProvider)),
        "openai" => Ok(Arc::new(OpenAiAdapter::new(llm)?)),
        "anthropic" => Ok(Arc::new(AnthropicAdapter::new(llm)?)),
        "custom" => Ok(Arc::new(CustomAdapter::new(llm)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Build the selected provider, falling back to an [`UnconfiguredProvider`]
/// (and logging why) when it cannot be constructed.
pub fn create_provider(llm: &LlmSettings) -> Arc<dyn ModelProvider> {
    match try_create_provider(llm) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!(provider = %llm.provider, error = %e, "model provider unavailable");
            Arc::new(UnconfiguredProvider::new(llm.provider.clone(), e.to_string()))
        }
    }
}

// ============ Gateway ============

/// Result of [`Gateway::test_connection`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    pub response: Option<String>,
}

/// Entry point for all model calls made by the pipeline.
pub struct Gateway {
    provider: RwLock<Arc<dyn ModelProvider>>,
}

impl Gateway {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider: RwLock::new(provider),
        }
    }

    /// A gateway with no provider registered.
    pub fn null() -> Self {
        Self::new(Arc::new(NullProvider))
    }

    pub fn from_settings(llm: &LlmSettings) -> Self {
        Self::new(create_provider(llm))
    }

    /// Replace the provider with one built from `llm`.
    pub fn reload(&self, llm: &LlmSettings) {
        self.replace(create_provider(llm));
    }

    pub fn replace(&self, provider: Arc<dyn ModelProvider>) {
        *self
            .provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = provider;
    }

    /// The current provider.
    pub fn provider(&self) -> Arc<dyn ModelProvider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the current provider can serve calls at all.
    pub fn model_available(&self) -> bool {
        self.provider().is_configured()
    }

    /// Structured extraction. Never fails; see the module docs for shapes.
    pub async fn json_call(&self, messages: &[ChatMessage], schema: &Value) -> Value {
        let provider = self.provider();
        match provider.json_call(messages, schema).await {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                tracing::warn!(provider = provider.name(), "model returned non-object JSON");
                json!({ "error": format!("expected a JSON object, got: {}", other) })
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "json call failed");
                json!({ "error": e.to_string() })
            }
        }
    }

    /// Free-text generation. Never fails; see the module docs for shapes.
    pub async fn text_call(&self, messages: &[ChatMessage]) -> String {
        let provider = self.provider();
        match provider.text_call(messages).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "text call failed");
                format!("Error: {}", e)
            }
        }
    }

    /// Send a minimal greeting and report whether a real answer came back.
    pub async fn test_connection(&self) -> ConnectionReport {
        let provider = self.provider();
        let reply = self
            .text_call(&[
                ChatMessage::system("You are a connectivity check. Answer briefly."),
                ChatMessage::user("Say hello in one short sentence."),
            ])
            .await;

        if is_sentinel(&reply) {
            return ConnectionReport {
                success: false,
                message: "No model provider registered".to_string(),
                response: None,
            };
        }
        if let Some(err) = text_error(&reply) {
            return ConnectionReport {
                success: false,
                message: err.to_string(),
                response: None,
            };
        }
        ConnectionReport {
            success: true,
            message: format!("Connected to {} ({})", provider.name(), provider.model()),
            response: Some(reply.trim().to_string()),
        }
    }
}

/// The error message of an error-shaped JSON result.
pub fn json_error(value: &Value) -> Option<&str> {
    value.get("error").and_then(|e| e.as_str())
}

/// Whether a JSON result is the no-provider stub.
pub fn is_stub(value: &Value) -> bool {
    value.get(STUB_KEY).and_then(|v| v.as_bool()) == Some(true)
}

/// The error message of an error-shaped text result.
pub fn text_error(text: &str) -> Option<&str> {
    text.strip_prefix("Error: ")
}

/// Whether a text result is the no-provider sentinel.
pub fn is_sentinel(text: &str) -> bool {
    text == TEXT_SENTINEL
}

/// Append an instruction asking for a single JSON object matching `schema`.
pub(crate) fn with_schema_instruction(messages: &[ChatMessage], schema: &Value) -> Vec<ChatMessage> {
    let mut out = messages.to_vec();
    out.push(ChatMessage::system(format!(
        "Respond with valid JSON only: a single object matching this JSON schema. \
         No markdown code blocks, no explanations.\n{}",
        schema
    )));
    out
}

/// Pull a JSON object out of model output, tolerating code fences and
/// surrounding prose.
pub fn extract_json_object(text: &str) -> Result<Value> {
    let text = text.trim();

    let fenced = if text.contains("```json") {
        text.split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
    } else if text.contains("```") {
        text.split("```").nth(1)
    } else {
        None
    };
    let candidate = fenced.unwrap_or(text).trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            match serde_json::from_str::<Value>(&candidate[start..=end]) {
                Ok(value @ Value::Object(_)) => Ok(value),
                Ok(_) => bail!("model output is not a JSON object"),
                Err(e) => bail!("model output is not valid JSON: {}", e),
            }
        }
        _ => bail!("no JSON object found in model output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FailingProvider;

    #[async_trait]
    impl ModelProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }
        fn model(&self) -> &str {
            "test"
        }
        async fn json_call(&self, _m: &[ChatMessage], _s: &Value) -> Result<Value> {
            bail!("connection reset")
        }
        async fn text_call(&self, _m: &[ChatMessage]) -> Result<String> {
            bail!("timed out")
        }
    }

    struct EchoProvider;

    #[async_trait]
    impl ModelProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        fn model(&self) -> &str {
            "echo-1"
        }
        async fn json_call(&self, _m: &[ChatMessage], _s: &Value) -> Result<Value> {
            Ok(json!({"category": "cafe"}))
        }
        async fn text_call(&self, messages: &[ChatMessage]) -> Result<String> {
            Ok(messages.last().map(|m| m.content.clone()).unwrap_or_default())
        }
    }

    fn llm_settings(provider: &str) -> LlmSettings {
        let file = crate::config::Config::minimal("x.sqlite");
        let mut options = BTreeMap::new();
        options.insert("llm_provider".to_string(), provider.to_string());
        crate::settings::Settings::resolve(&file, &options, &|_| None).llm
    }

    #[tokio::test]
    async fn null_gateway_degrades_to_stub_and_sentinel() {
        let gateway = Gateway::null();
        let json = gateway.json_call(&[ChatMessage::user("hi")], &json!({})).await;
        assert!(is_stub(&json));
        assert!(json_error(&json).is_none());

        let text = gateway.text_call(&[ChatMessage::user("hi")]).await;
        assert!(is_sentinel(&text));
        assert!(text_error(&text).is_none());
    }

    #[tokio::test]
    async fn provider_errors_become_error_shapes() {
        let gateway = Gateway::new(Arc::new(FailingProvider));
        let json = gateway.json_call(&[], &json!({})).await;
        assert_eq!(json_error(&json), Some("connection reset"));

        let text = gateway.text_call(&[]).await;
        assert_eq!(text_error(&text), Some("timed out"));

        let report = gateway.test_connection().await;
        assert!(!report.success);
        assert_eq!(report.message, "timed out");
    }

    #[tokio::test]
    async fn missing_credential_yields_unconfigured_results() {
        let gateway = Gateway::from_settings(&llm_settings("openai"));
        assert_eq!(gateway.provider().model(), "unconfigured");
        assert!(!gateway.model_available());
        assert!(Gateway::null().model_available());
        let json = gateway.json_call(&[], &json!({})).await;
        assert!(json_error(&json).unwrap().contains("not configured"));
        assert!(text_error(&gateway.text_call(&[]).await).is_some());
    }

    #[tokio::test]
    async fn replace_swaps_provider() {
        let gateway = Gateway::null();
        gateway.replace(Arc::new(EchoProvider));
        let report = gateway.test_connection().await;
        assert!(report.success);
        assert_eq!(report.message, "Connected to echo (echo-1)");
        assert_eq!(
            report.response.as_deref(),
            Some("Say hello in one short sentence.")
        );

        gateway.reload(&llm_settings("none"));
        assert_eq!(gateway.provider().name(), "none");
    }

    #[test]
    fn extracts_json_from_fences_and_prose() {
        let v = extract_json_object("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
        let v = extract_json_object("Sure! Here it is: {\"b\": true} Hope that helps.").unwrap();
        assert_eq!(v["b"], true);
        assert!(extract_json_object("[1, 2, 3]").is_err());
        assert!(extract_json_object("no json here").is_err());
    }

    #[test]
    fn schema_instruction_is_appended() {
        let msgs = with_schema_instruction(&[ChatMessage::user("x")], &json!({"type": "object"}));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::System);
        assert!(msgs[1].content.contains("\"type\":\"object\""));
    }
}
