//! Anthropic messages API adapter.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{build_client, post_json};
use super::{extract_json_object, with_schema_instruction, ChatMessage, ModelProvider, Role};
use crate::settings::LlmSettings;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    headers: Vec<(String, String)>,
    model: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

impl AnthropicAdapter {
    pub fn new(llm: &LlmSettings) -> Result<Self> {
        let api_key = llm
            .anthropic_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY not set"))?;

        Ok(Self {
            headers: vec![
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), API_VERSION.to_string()),
            ],
            model: llm.effective_model(),
            max_retries: llm.max_retries,
            client: build_client(llm.timeout_secs)?,
        })
    }

    async fn call_api(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = request_body(&self.model, messages);
        let response = post_json(
            &self.client,
            "Anthropic",
            MESSAGES_URL,
            &self.headers,
            &body,
            self.max_retries,
        )
        .await?;

        let parsed: MessagesResponse = serde_json::from_value(response)?;
        parsed
            .content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| anyhow!("Empty response from Anthropic"))
    }
}

/// System turns go in the top-level `system` field; the rest stay in order.
fn request_body(model: &str, messages: &[ChatMessage]) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let mut body = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": turns,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    body
}

#[async_trait]
impl ModelProvider for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn json_call(&self, messages: &[ChatMessage], schema: &Value) -> Result<Value> {
        // No json_object mode; the schema instruction carries the constraint.
        let messages = with_schema_instruction(messages, schema);
        let text = self.call_api(&messages).await?;
        extract_json_object(&text)
    }

    async fn text_call(&self, messages: &[ChatMessage]) -> Result<String> {
        self.call_api(messages).await
    }
}
