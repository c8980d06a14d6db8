use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde_json::{json, Value};

use super::{base_headers, header_value, ProviderAdapter, RequestOptions};
use crate::error::AiError;
use crate::models::{Message, ProviderConfig, Role};

const DIFY_USER: &str = "modelrace";

/**
 * \brief Dify 应用的 chat-messages 接口。
 *
 * Dify 自己维护会话，这里只发送最后一条用户消息。
 */
pub struct DifyAdapter {
    config: ProviderConfig,
}

impl DifyAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl ProviderAdapter for DifyAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_url(&self, _model_id: &str) -> String {
        format!("{}/chat-messages", self.config.effective_base_url())
    }

    fn request_headers(&self, streaming: bool) -> Result<HeaderMap, AiError> {
        let mut headers = base_headers(streaming);
        if let Some(key) = self.config.api_key() {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {key}"))?);
        }
        Ok(headers)
    }

    fn request_body(&self, messages: &[Message], _model_id: &str, options: &RequestOptions) -> Value {
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(|m| m.content.text())
            .unwrap_or_default();
        json!({
            "inputs": {},
            "query": query,
            "response_mode": if options.stream { "streaming" } else { "blocking" },
            "user": DIFY_USER,
            "conversation_id": "",
        })
    }

    fn parse_response(&self, response: &Value) -> Option<String> {
        response.get("answer")?.as_str().map(|s| s.to_string())
    }

    fn parse_stream_chunk(&self, event: &Value) -> Option<String> {
        match event.get("event").and_then(Value::as_str) {
            Some("message") | Some("agent_message") => event
                .get("answer")?
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::provider;
    use crate::models::ProviderType;

    fn adapter() -> DifyAdapter {
        DifyAdapter::new(provider("dify", ProviderType::Dify, "https://api.dify.ai/v1/"))
    }

    #[test]
    fn test_body_sends_last_user_turn() {
        let a = adapter();
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::assistant("trailing"),
        ];
        let body = a.request_body(
            &messages,
            "app",
            &RequestOptions {
                stream: true,
                ..Default::default()
            },
        );
        assert_eq!(body["query"], "second");
        assert_eq!(body["response_mode"], "streaming");
        assert_eq!(body["conversation_id"], "");
        assert_eq!(a.request_url("app"), "https://api.dify.ai/v1/chat-messages");
    }

    #[test]
    fn test_stream_events_and_files() {
        let a = adapter();
        let msg = json!({"event": "message", "answer": "hi"});
        let agent = json!({"event": "agent_message", "answer": "yo"});
        let end = json!({"event": "message_end", "answer": "ignored"});
        assert_eq!(a.parse_stream_chunk(&msg).as_deref(), Some("hi"));
        assert_eq!(a.parse_stream_chunk(&agent).as_deref(), Some("yo"));
        assert_eq!(a.parse_stream_chunk(&end), None);
        assert_eq!(
            a.parse_response(&json!({"answer": "done"})).as_deref(),
            Some("done")
        );
        assert!(!a.supports_files("app"));
    }
}
