use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde_json::{json, Value};

use super::{base_headers, header_value, non_empty, ProviderAdapter, RequestOptions};
use crate::error::AiError;
use crate::models::{Message, MessageContent, ProviderConfig};

const VISION_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-4-vision-preview",
    "gpt-4o-mini",
    "gpt-4",
    "gpt-4-1106-preview",
    "gpt-4-0125-preview",
];

/**
 * \brief OpenAI 兼容协议（OpenAI、Groq、Cerebras 等）。
 */
pub struct OpenAiAdapter {
    config: ProviderConfig,
}

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

fn openai_message(msg: &Message) -> Value {
    let role = msg.role().as_str();
    if msg.images().is_empty() {
        let content = match &msg.content {
            MessageContent::Text(text) => json!(text),
            MessageContent::Parts(parts) => json!(parts),
        };
        return json!({ "role": role, "content": content });
    }

    let mut content = Vec::new();
    let text = msg.content.text();
    if let Some(text) = non_empty(&text) {
        content.push(json!({ "type": "text", "text": text }));
    }
    for url in msg.images() {
        content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
    }
    json!({ "role": role, "content": content })
}

impl ProviderAdapter for OpenAiAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_url(&self, _model_id: &str) -> String {
        self.config.effective_base_url().to_string()
    }

    fn request_headers(&self, streaming: bool) -> Result<HeaderMap, AiError> {
        let mut headers = base_headers(streaming);
        if let Some(key) = self.config.api_key() {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {key}"))?);
        }
        Ok(headers)
    }

    fn request_body(&self, messages: &[Message], model_id: &str, options: &RequestOptions) -> Value {
        json!({
            "model": model_id,
            "messages": messages.iter().map(openai_message).collect::<Vec<_>>(),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": options.stream,
        })
    }

    fn parse_response(&self, response: &Value) -> Option<String> {
        response
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(|s| s.to_string())
    }

    fn parse_stream_chunk(&self, event: &Value) -> Option<String> {
        event
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn supports_files(&self, model_id: &str) -> bool {
        VISION_MODELS.iter().any(|m| model_id.contains(m))
    }
}
