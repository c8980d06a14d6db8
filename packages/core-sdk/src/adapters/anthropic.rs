use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{base_headers, header_value, non_empty, ProviderAdapter, RequestOptions};
use crate::error::AiError;
use crate::models::{Message, ProviderConfig, Role};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const VISION_MODELS: &[&str] = &[
    "claude-3",
    "claude-3.5",
    "claude-3-opus",
    "claude-3-sonnet",
    "claude-3-haiku",
];

/**
 * \brief Anthropic Messages 协议。system 消息提升为顶层字段。
 */
pub struct AnthropicAdapter {
    config: ProviderConfig,
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

fn anthropic_message(msg: &Message) -> Value {
    let role = match msg.role() {
        Role::Assistant => "assistant",
        _ => "user",
    };
    if msg.images().is_empty() {
        return json!({ "role": role, "content": msg.content.text() });
    }

    let mut content = Vec::new();
    let text = msg.content.text();
    if let Some(text) = non_empty(&text) {
        content.push(json!({ "type": "text", "text": text }));
    }
    for url in msg.images() {
        content.push(json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }));
    }
    json!({ "role": role, "content": content })
}

impl ProviderAdapter for AnthropicAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_url(&self, _model_id: &str) -> String {
        self.config.effective_base_url().to_string()
    }

    fn request_headers(&self, streaming: bool) -> Result<HeaderMap, AiError> {
        let mut headers = base_headers(streaming);
        headers.insert(
            "x-api-key",
            header_value(self.config.api_key().unwrap_or_default())?,
        );
        headers.insert("anthropic-version", header_value(ANTHROPIC_VERSION)?);
        Ok(headers)
    }

    fn request_body(&self, messages: &[Message], model_id: &str, options: &RequestOptions) -> Value {
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role() != Role::System)
            .map(anthropic_message)
            .collect();

        let mut body = json!({
            "model": model_id,
            "messages": turns,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": options.stream,
        });
        if let Some(system) = messages.iter().find(|m| m.role() == Role::System) {
            body["system"] = json!(system.content.text());
        }
        body
    }

    fn parse_response(&self, response: &Value) -> Option<String> {
        response
            .get("content")?
            .get(0)?
            .get("text")?
            .as_str()
            .map(|s| s.to_string())
    }

    fn parse_stream_chunk(&self, event: &Value) -> Option<String> {
        // content_block_delta 与其他带 delta.text 的事件同样处理
        event
            .get("delta")?
            .get("text")?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn supports_files(&self, model_id: &str) -> bool {
        VISION_MODELS.iter().any(|m| model_id.contains(m))
    }
}
