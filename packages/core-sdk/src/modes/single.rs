use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Engine;
use crate::adapters::{create_adapter, ProviderAdapter, RequestOptions, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::error::{is_file_support_message, AiError};
use crate::models::{ExecutionConfig, ExecutionResult, FullModelId, Message, ProviderConfig};
use crate::processor::{has_files, process_messages, system_message_count, ProcessOptions};
use crate::registry::is_keyless;
use crate::simulator::simulate_streaming;
use crate::stream::{decode_stream, strip_thinking, StreamSink};

impl Engine {
    /**
     * \brief 单模型执行。
     *
     * 提供 sink 时请求流式响应；若 Provider 仍返回普通 JSON，
     * 解析后经模拟器回放，结果标记为 `streamed: false`。
     * 调用方取消或超时会立即终止请求。
     */
    pub async fn execute_single(
        &self,
        full_model_id: &str,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, AiError> {
        let id = FullModelId::parse(full_model_id)?;
        let provider = self.registry().get_provider(&id.provider_id).ok_or_else(|| {
            AiError::NotFound {
                message: self.text("errorProviderConfigNotFound", &[("providerId", &id.provider_id)]),
                provider: id.provider_id.clone(),
            }
        })?;
        if provider.api_key().is_none() && !is_keyless(&id.provider_id) {
            return Err(AiError::Auth {
                message: self.text("errorApiKeyNotConfigured", &[("name", &provider.name)]),
                provider: id.provider_id.clone(),
            });
        }

        let adapter = create_adapter(provider.clone());
        adapter.validate_config()?;

        let work = self.request(adapter.as_ref(), &provider, &id, messages, config, sink);
        let bounded = async {
            match config.timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
                    .await
                    .unwrap_or_else(|_| Err(AiError::timeout())),
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(model = %full_model_id, "request cancelled");
                Err(self.cancelled())
            }
            result = bounded => result,
        }
    }

    async fn request(
        &self,
        adapter: &dyn ProviderAdapter,
        provider: &ProviderConfig,
        id: &FullModelId,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: Option<&StreamSink>,
    ) -> Result<ExecutionResult, AiError> {
        let processed = process_messages(messages, ProcessOptions::default());
        let streaming = sink.is_some();
        let url = if streaming {
            adapter.stream_request_url(&id.model_id)
        } else {
            adapter.request_url(&id.model_id)
        };
        let options = RequestOptions {
            temperature: config
                .temperature
                .or(provider.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: config
                .max_tokens
                .or(provider.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            stream: streaming,
        };
        let body = adapter.request_body(&processed, &id.model_id, &options);
        debug!(
            model = %id,
            streaming,
            messages = processed.len(),
            system = system_message_count(&processed),
            "sending provider request"
        );

        let response = self
            .http
            .post(&url)
            .headers(adapter.request_headers(streaming)?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.classify_failure(response, provider, id, messages).await);
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let result = |content: &str, streamed: bool| ExecutionResult {
            content: content.trim().to_string(),
            provider_id: id.provider_id.clone(),
            full_model_id: id.to_string(),
            streamed,
        };

        match sink {
            Some(sink) if is_event_stream => {
                let content = decode_stream(
                    Box::pin(response.bytes_stream()),
                    |event| Ok(adapter.parse_stream_chunk(event)),
                    Some(sink),
                )
                .await?;
                sink.done(content.trim());
                Ok(result(&content, true))
            }
            _ => {
                let value: Value = response.json().await?;
                debug!(model = %id, "received buffered response");
                let content = adapter
                    .parse_response(&value)
                    .map(|text| strip_thinking(&text).trim().to_string())
                    .ok_or_else(|| AiError::Stream(self.text("errorApiExtractContent", &[])))?;
                if let Some(sink) = sink {
                    simulate_streaming(&content, sink, self.simulator).await;
                }
                Ok(result(&content, false))
            }
        }
    }

    /** \brief 把非 2xx 响应归类为具体错误，优先识别“不支持文件”。 */
    async fn classify_failure(
        &self,
        response: Response,
        provider: &ProviderConfig,
        id: &FullModelId,
        messages: &[Message],
    ) -> AiError {
        let status = response.status();
        let fallback = status.canonical_reason().unwrap_or("request failed").to_string();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let provider_message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(fallback);

        if has_files(messages) && is_file_support_message(&provider_message) {
            return AiError::FileSupport(self.text("errorModelNotSupportImages", &[]));
        }
        let message = match status.as_u16() {
            429 => self.text("errorApi429", &[]),
            401 => self.text("errorApi401", &[]),
            404 => self.text("errorApi404", &[("modelId", &id.model_id)]),
            _ => provider_message,
        };
        AiError::from_status(status.as_u16(), message, provider.name.clone())
    }
}
