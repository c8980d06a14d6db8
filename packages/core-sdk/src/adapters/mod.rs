use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::error::AiError;
use crate::models::{Message, ProviderConfig, ProviderType};
use crate::registry::is_keyless;

mod anthropic;
mod dify;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use dify::DifyAdapter;
pub use google::GoogleAiAdapter;
pub use openai::OpenAiAdapter;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/** \brief 单次请求的生成参数，已按 Provider 默认值合并。 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: false,
        }
    }
}

/**
 * \brief 各类 Provider 共同实现的适配接口。
 */
pub trait ProviderAdapter: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn request_url(&self, model_id: &str) -> String;

    /** \brief 流式响应使用的地址。 */
    fn stream_request_url(&self, model_id: &str) -> String {
        self.request_url(model_id)
    }

    fn request_headers(&self, streaming: bool) -> Result<HeaderMap, AiError>;

    fn request_body(&self, messages: &[Message], model_id: &str, options: &RequestOptions) -> Value;

    /** \brief 非流式响应的文本；结构无法识别时返回 None。 */
    fn parse_response(&self, response: &Value) -> Option<String>;

    /** \brief 单个流事件携带的增量文本。 */
    fn parse_stream_chunk(&self, event: &Value) -> Option<String>;

    fn supports_files(&self, _model_id: &str) -> bool {
        false
    }

    fn validate_config(&self) -> Result<(), AiError> {
        let config = self.config();
        if config.api_key().is_none() && !is_keyless(&config.provider_id) {
            return Err(AiError::Config(format!(
                "API key is required for {}",
                config.provider_id
            )));
        }
        Ok(())
    }
}

/**
 * \brief 按 provider_type 选择适配器，未知类型按 OpenAI 兼容格式处理。
 */
pub fn create_adapter(config: ProviderConfig) -> Box<dyn ProviderAdapter> {
    match ProviderType::parse(config.provider_type.as_str()) {
        ProviderType::Anthropic => Box::new(AnthropicAdapter::new(config)),
        ProviderType::GoogleAi => Box::new(GoogleAiAdapter::new(config)),
        ProviderType::Dify => Box::new(DifyAdapter::new(config)),
        ProviderType::OpenaiCompatible | ProviderType::Other(_) => {
            Box::new(OpenAiAdapter::new(config))
        }
    }
}

fn base_headers(streaming: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if streaming {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    headers
}

fn header_value(raw: &str) -> Result<HeaderValue, AiError> {
    HeaderValue::from_str(raw).map_err(|e| AiError::Config(format!("invalid header value: {e}")))
}

fn non_empty(text: &str) -> Option<&str> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
