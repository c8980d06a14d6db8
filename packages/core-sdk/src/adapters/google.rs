use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{base_headers, non_empty, ProviderAdapter, RequestOptions};
use crate::error::AiError;
use crate::models::{ContentPart, Message, MessageContent, ProviderConfig, Role};

const FALLBACK_MIME: &str = "image/jpeg";

/**
 * \brief Google AI (Gemini) generateContent 协议。
 *
 * 角色只有 user/model 两种，system 消息单独放到 systemInstruction。
 * 图片以 inlineData 形式内联，API Key 通过查询参数传递。
 */
pub struct GoogleAiAdapter {
    config: ProviderConfig,
}

impl GoogleAiAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self, model_id: &str, method: &str, query: &str) -> String {
        format!(
            "{}/{}:{}?{}key={}",
            self.config.effective_base_url(),
            model_id,
            method,
            query,
            self.config.api_key().unwrap_or_default()
        )
    }
}

/** \brief 拆分 data URL：返回 (mimeType, base64 数据)。非 data URL 原样作为数据。 */
fn inline_data(url: &str) -> Value {
    let (mime, data) = match url.split_once(',') {
        Some((header, data)) => {
            let mime = header
                .strip_prefix("data:")
                .and_then(|rest| rest.split(';').next())
                .filter(|m| !m.is_empty())
                .unwrap_or(FALLBACK_MIME);
            (mime, data)
        }
        None => (FALLBACK_MIME, url),
    };
    json!({ "inlineData": { "mimeType": mime, "data": data } })
}

fn google_parts(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "text": text }),
                ContentPart::ImageUrl { image_url } => inline_data(&image_url.url),
            })
            .collect(),
        MessageContent::Text(text) if !msg.images().is_empty() => {
            let mut parts = Vec::new();
            if let Some(text) = non_empty(text) {
                parts.push(json!({ "text": text }));
            }
            parts.extend(msg.images().iter().map(|url| inline_data(url)));
            parts
        }
        MessageContent::Text(text) => vec![json!({ "text": text })],
    }
}

fn joined_parts(candidate: &Value) -> Option<String> {
    let parts = candidate.get("content")?.get("parts")?.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
    )
}

impl ProviderAdapter for GoogleAiAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_url(&self, model_id: &str) -> String {
        self.endpoint(model_id, "generateContent", "")
    }

    fn stream_request_url(&self, model_id: &str) -> String {
        self.endpoint(model_id, "streamGenerateContent", "alt=sse&")
    }

    fn request_headers(&self, streaming: bool) -> Result<HeaderMap, AiError> {
        Ok(base_headers(streaming))
    }

    fn request_body(&self, messages: &[Message], _model_id: &str, options: &RequestOptions) -> Value {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        for msg in messages {
            let role = match msg.role() {
                Role::System => {
                    system_instruction = Some(msg.content.text());
                    continue;
                }
                Role::Assistant => "model",
                Role::User => "user",
            };
            let parts = google_parts(msg);
            if !parts.is_empty() {
                contents.push(json!({ "role": role, "parts": parts }));
            }
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            }
        });
        if let Some(system) = system_instruction.filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn parse_response(&self, response: &Value) -> Option<String> {
        joined_parts(response.get("candidates")?.get(0)?)
    }

    fn parse_stream_chunk(&self, event: &Value) -> Option<String> {
        joined_parts(event.get("candidates")?.get(0)?).filter(|s| !s.is_empty())
    }

    fn supports_files(&self, _model_id: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::provider;
    use crate::models::ProviderType;

    fn adapter() -> GoogleAiAdapter {
        GoogleAiAdapter::new(provider(
            "google",
            ProviderType::GoogleAi,
            "https://generativelanguage.googleapis.com/v1beta/models",
        ))
    }

    #[test]
    fn test_urls_carry_key_and_sse_flag() {
        let a = adapter();
        assert_eq!(
            a.request_url("gemini-pro"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=sk-test"
        );
        assert!(a
            .stream_request_url("gemini-pro")
            .ends_with("gemini-pro:streamGenerateContent?alt=sse&key=sk-test"));
    }

    #[test]
    fn test_roles_and_system_instruction() {
        let messages = vec![
            Message::system("you are terse"),
            Message::user("hi"),
            Message::new("ai", "hello"),
        ];
        let body = adapter().request_body(&messages, "gemini-pro", &RequestOptions::default());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "you are terse");
        assert_eq!(body["contents"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4000);
    }

    #[test]
    fn test_inline_data_keeps_real_mime() {
        let messages = vec![Message::user("see")
            .with_images(vec!["data:image/png;base64,QUJD".into(), "RAW".into()])];
        let body = adapter().request_body(&messages, "gemini-pro", &RequestOptions::default());
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "see");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "QUJD");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[2]["inlineData"]["data"], "RAW");
    }

    #[test]
    fn test_parse_joins_candidate_parts() {
        let a = adapter();
        let resp = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(a.parse_response(&resp).as_deref(), Some("ab"));
        assert_eq!(a.parse_stream_chunk(&resp).as_deref(), Some("ab"));
        assert_eq!(a.parse_response(&json!({"promptFeedback": {}})), None);
        assert!(a.supports_files("anything"));
    }
}
