use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::ClassifierConfig;

/// Minimal OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(cfg: &ClassifierConfig) -> Result<Self> {
        let timeout = Duration::from_millis(cfg.timeout_ms.max(1_000));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed creating chat completions client")?;
        Ok(Self {
            client,
            endpoint: resolve_chat_completion_endpoint(&cfg.endpoint),
            model: cfg.model.clone(),
            api_key: cfg
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToOwned::to_owned),
        })
    }

    /// Sends one completion request and returns the parsed response body.
    /// Transport failures, non-2xx statuses and unparseable bodies are errors.
    pub async fn complete(&self, messages: Vec<Value>, tools: &[Value]) -> Result<Value> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
            payload["tool_choice"] = json!("auto");
            payload["parallel_tool_calls"] = json!(false);
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{}: transport error", self.endpoint))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("{}: failed reading response body", self.endpoint))?;
        if !status.is_success() {
            anyhow::bail!(
                "{}: status={} body={}",
                self.endpoint,
                status.as_u16(),
                truncate_text(&body, 240)
            );
        }
        serde_json::from_str(&body).with_context(|| {
            format!(
                "{}: response is not JSON: {}",
                self.endpoint,
                truncate_text(&body, 240)
            )
        })
    }

    /// Plain prompt → assistant text, used by the extraction operations.
    pub async fn ask(&self, messages: Vec<Value>) -> Result<String> {
        let response = self.complete(messages, &[]).await?;
        let content = first_message_content(&response)
            .context("chat completion returned no message content")?;
        Ok(content)
    }
}

pub fn first_message_content(response: &Value) -> Option<String> {
    let content = response.pointer("/choices/0/message/content")?;
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn resolve_chat_completion_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/v1/chat/completions".to_owned();
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.contains("/chat/completions") {
        return trimmed.to_owned();
    }
    if lower.ends_with("/v1") {
        return format!("{trimmed}/chat/completions");
    }
    format!("{trimmed}/v1/chat/completions")
}

pub fn truncate_text(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_owned();
    }
    let mut end = max_len;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = value[..end].to_owned();
    out.push_str("...");
    out
}
