//! OpenAI chat completions and OpenAI-compatible endpoints.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{build_client, post_json};
use super::{extract_json_object, with_schema_instruction, ChatMessage, ModelProvider};
use crate::settings::LlmSettings;

/// Request target and auth shared by both adapters in this file.
struct ChatEndpoint {
    label: &'static str,
    url: String,
    model: String,
    headers: Vec<(String, String)>,
    max_retries: u32,
    client: reqwest::Client,
}

impl ChatEndpoint {
    async fn complete(&self, messages: &[ChatMessage], json_mode: bool) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = post_json(
            &self.client,
            self.label,
            &self.url,
            &self.headers,
            &body,
            self.max_retries,
        )
        .await?;
        parse_chat_response(&response)
    }
}

/// Extract `choices[0].message.content` from a chat completions response.
fn parse_chat_response(response: &Value) -> Result<String> {
    response
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

fn chat_url(base: &str) -> String {
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

// ============ OpenAI ============

pub struct OpenAiAdapter {
    endpoint: ChatEndpoint,
}

impl OpenAiAdapter {
    pub fn new(llm: &LlmSettings) -> Result<Self> {
        let api_key = llm
            .openai_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set"))?;

        Ok(Self {
            endpoint: ChatEndpoint {
                label: "OpenAI",
                url: chat_url(&llm.openai_base_url),
                model: llm.effective_model(),
                headers: vec![("Authorization".to_string(), format!("Bearer {}", api_key))],
                max_retries: llm.max_retries,
                client: build_client(llm.timeout_secs)?,
            },
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn json_call(&self, messages: &[ChatMessage], schema: &Value) -> Result<Value> {
        let messages = with_schema_instruction(messages, schema);
        let text = self.endpoint.complete(&messages, true).await?;
        extract_json_object(&text)
    }

    async fn text_call(&self, messages: &[ChatMessage]) -> Result<String> {
        self.endpoint.complete(messages, false).await
    }
}

// ============ Custom ============

/// Any endpoint speaking the OpenAI chat completions protocol.
///
/// The auth header name and value format are configurable; `{key}` in the
/// format is replaced by the API key. Without a key no auth header is sent.
pub struct CustomAdapter {
    endpoint: ChatEndpoint,
}

impl CustomAdapter {
    pub fn new(llm: &LlmSettings) -> Result<Self> {
        let base_url = llm
            .custom_base_url
            .as_deref()
            .ok_or_else(|| anyhow!("custom_base_url not set"))?;

        let headers = match llm.custom_api_key.as_deref() {
            Some(key) => vec![(
                llm.custom_auth_header.clone(),
                llm.custom_auth_format.replace("{key}", key),
            )],
            None => Vec::new(),
        };

        Ok(Self {
            endpoint: ChatEndpoint {
                label: "Custom",
                url: chat_url(base_url),
                model: llm.effective_model(),
                headers,
                max_retries: llm.max_retries,
                client: build_client(llm.timeout_secs)?,
            },
        })
    }
}

#[async_trait]
impl ModelProvider for CustomAdapter {
    fn name(&self) -> &str {
        "custom"
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    // Compatible servers often reject `response_format`, so JSON is requested
    // through the prompt alone.
    async fn json_call(&self, messages: &[ChatMessage], schema: &Value) -> Result<Value> {
        let messages = with_schema_instruction(messages, schema);
        let text = self.endpoint.complete(&messages, false).await?;
        extract_json_object(&text)
    }

    async fn text_call(&self, messages: &[ChatMessage]) -> Result<String> {
        self.endpoint.complete(messages, false).await
    }
}
