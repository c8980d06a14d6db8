use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Response;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecutionClient, RemoteRequest};
use crate::config::RemoteConfig;
use crate::error::AiError;
use crate::models::{DispatchOutput, ExecutionConfig, ExecutionMode, ExecutionResult, Message, RaceEntry};
use crate::stream::{decode_stream, StreamSink};

const SERVER: &str = "Server";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/**
 * \brief 把请求转发给远程执行服务。
 *
 * 每次尝试有独立超时；失败后按 `retry_delay * attempt` 线性退避重试，
 * 取消、鉴权失败与请求错误不重试。流式请求只在拿到响应头之前重试。
 */
#[derive(Debug, Clone)]
pub struct RemoteClient {
    server_url: String,
    http: reqwest::Client,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl RemoteClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            server_url: config.server_url.trim().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: config.timeout(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /** \brief GET /health，任意 2xx 视为可达。 */
    pub async fn health_check(&self) -> Result<(), AiError> {
        let response = self
            .http
            .get(format!("{}/health", self.server_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AiError::from_status(
                response.status().as_u16(),
                format!("Server returned status {}", response.status().as_u16()),
                SERVER,
            ))
        }
    }

    async fn with_retry<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt_fn: F) -> Result<T, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let mut attempt = 1;
        loop {
            let bounded = async {
                tokio::time::timeout(self.timeout, attempt_fn())
                    .await
                    .unwrap_or_else(|_| Err(AiError::timeout()))
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AiError::Cancelled("Request cancelled".to_string())),
                result = bounded => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.retry_attempts => return Err(err),
                Err(err) => {
                    let wait = self.retry_delay * attempt;
                    warn!(attempt, ?wait, error = %err, "remote attempt failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AiError::Cancelled("Request cancelled".to_string()));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /** \brief 发送一次请求，非 2xx 转成分类错误。 */
    async fn send(&self, path: &str, body: &RemoteRequest) -> Result<Response, AiError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.server_url, path))
            .json(body);
        if body.stream == Some(true) {
            request = request.header(ACCEPT, "text/event-stream");
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(classify_status(response).await)
    }
}

async fn classify_status(response: Response) -> AiError {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let detail = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Server error: {status}"));
    let message = match status {
        401 => "Unauthorized - Check server authentication".to_string(),
        403 => "Forbidden - Server rejected request".to_string(),
        429 => "Rate limit exceeded".to_string(),
        500..=599 => "Server error".to_string(),
        _ => detail,
    };
    AiError::from_status(status, message, SERVER)
}

/** \brief 解析 /api/ai/execute 的响应：结果对象或 `{results: [...]}`。 */
fn parse_execute_body(body: Value) -> Result<DispatchOutput, AiError> {
    if let Some(results) = body.get("results") {
        let entries: Vec<RaceEntry> = serde_json::from_value(results.clone())
            .map_err(|e| AiError::Stream(format!("Invalid server response format: {e}")))?;
        return Ok(DispatchOutput::TestRace(entries));
    }
    if !body.is_object() {
        return Err(AiError::Stream("Invalid server response format".to_string()));
    }
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| AiError::Stream("Server response missing content field".to_string()))?;
    let text = |key: &str| body.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
    Ok(DispatchOutput::Completion(ExecutionResult {
        content: content.to_string(),
        provider_id: text("providerId").unwrap_or("server").to_string(),
        full_model_id: text("fullModelId")
            .or_else(|| text("usedFullModelId"))
            .unwrap_or("server/unknown")
            .to_string(),
        streamed: body.get("streamed").and_then(Value::as_bool).unwrap_or(false),
    }))
}

/** \brief 远程 SSE 事件：`{"chunk"}` 为增量，`{"error", "statusCode"}` 为失败。 */
fn remote_chunk(event: &Value) -> Result<Option<String>, AiError> {
    if let Some(error) = event.get("error").and_then(Value::as_str) {
        let status = event
            .get("statusCode")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        return Err(AiError::from_status(status, error, SERVER));
    }
    Ok(event
        .get("chunk")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

fn request_body(
    mode: ExecutionMode,
    messages: &[Message],
    config: &ExecutionConfig,
    stream: bool,
) -> RemoteRequest {
    RemoteRequest {
        mode: mode.as_str().to_string(),
        messages: messages.to_vec(),
        config: config.clone(),
        stream: stream.then_some(true),
    }
}

#[async_trait]
impl ExecutionClient for RemoteClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError> {
        let body = request_body(mode, messages, config, false);
        debug!(server = %self.server_url, %mode, "remote execute");
        let body = &body;
        self.with_retry(cancel, move || async move {
            let response = self.send("/api/ai/execute", body).await?;
            let value: Value = response
                .json()
                .await
                .map_err(|e| AiError::Stream(format!("Invalid server response format: {e}")))?;
            parse_execute_body(value)
        })
        .await
    }

    async fn execute_stream(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: &StreamSink,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError> {
        let body = request_body(mode, messages, config, true);
        debug!(server = %self.server_url, %mode, "remote execute_stream");
        let body = &body;
        let response = self
            .with_retry(cancel, move || self.send("/api/ai/stream", body))
            .await?;

        let decode = decode_stream(Box::pin(response.bytes_stream()), remote_chunk, Some(sink));
        let content = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AiError::Cancelled("Request cancelled".to_string())),
            content = decode => content?,
        };
        sink.done(&content);
        Ok(DispatchOutput::Completion(ExecutionResult {
            content,
            provider_id: "server".to_string(),
            full_model_id: "server/stream".to_string(),
            streamed: true,
        }))
    }
}
