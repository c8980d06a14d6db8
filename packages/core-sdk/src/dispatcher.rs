use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ExecutionClient, LocalClient, RemoteClient};
use crate::config::{RemoteConfig, RemoteConfigSource, StaticRemoteConfig};
use crate::error::AiError;
use crate::models::{DispatchOutput, ExecutionConfig, ExecutionMode, Message};
use crate::modes::Engine;
use crate::stream::StreamSink;
use crate::telemetry;

/**
 * \brief 一次调度请求。
 */
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub mode: ExecutionMode,
    pub messages: Vec<Message>,
    pub config: ExecutionConfig,
    /** \brief 提供时按事件流输出，并保证恰好一个终止事件 */
    pub stream: Option<StreamSink>,
    pub cancel: Option<CancellationToken>,
    /** \brief 忽略远程配置，始终本地执行 */
    pub force_local: bool,
}

impl ExecutionRequest {
    pub fn new(mode: ExecutionMode, messages: Vec<Message>, config: ExecutionConfig) -> Self {
        Self {
            mode,
            messages,
            config,
            stream: None,
            cancel: None,
            force_local: false,
        }
    }

    pub fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn force_local(mut self) -> Self {
        self.force_local = true;
        self
    }
}

struct RemoteState {
    config: RemoteConfig,
    client: Option<RemoteClient>,
}

/**
 * \brief 调度器：持有本地客户端与惰性加载的远程状态。
 *
 * 远程配置在第一次调度时读取，此后整个生命周期内不再变化。
 */
pub struct Dispatcher {
    local: LocalClient,
    remote_source: Arc<dyn RemoteConfigSource>,
    remote: OnceCell<RemoteState>,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(engine: Engine, remote_source: Arc<dyn RemoteConfigSource>) -> Self {
        Self {
            local: LocalClient::new(engine),
            remote_source,
            remote: OnceCell::new(),
            http: reqwest::Client::new(),
        }
    }

    /** \brief 不带远程配置的调度器（服务端与测试使用）。 */
    pub fn local_only(engine: Engine) -> Self {
        Self::new(engine, Arc::new(StaticRemoteConfig::default()))
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn engine(&self) -> &Engine {
        self.local.engine()
    }

    pub async fn remote_config(&self) -> &RemoteConfig {
        &self.remote_state().await.config
    }

    /** \brief 远程已启用且地址合法时返回远程客户端。 */
    pub async fn remote_client(&self) -> Option<&RemoteClient> {
        self.remote_state().await.client.as_ref()
    }

    async fn remote_state(&self) -> &RemoteState {
        self.remote
            .get_or_init(|| async move {
                let config = match self.remote_source.load_remote_config().await {
                    Ok(config) => config,
                    Err(err) => {
                        warn!(error = %err, "failed to load remote config, executing locally");
                        telemetry::log_error("remote", &format!("config load failed: {err:#}"));
                        RemoteConfig::default()
                    }
                };
                let client = config
                    .is_usable()
                    .then(|| RemoteClient::new(&config).with_http_client(self.http.clone()));
                debug!(enabled = config.enabled, usable = client.is_some(), "remote config loaded");
                RemoteState { config, client }
            })
            .await
    }

    /**
     * \brief 调度一次请求。
     *
     * 远程失败时，只有在配置允许、不是取消、且尚未向调用方输出任何事件时才回退本地。
     * 提供 sink 时无论成败都恰好收到一个终止事件。
     */
    pub async fn dispatch(&self, request: ExecutionRequest) -> Result<DispatchOutput, AiError> {
        let ExecutionRequest {
            mode,
            messages,
            config,
            stream,
            cancel,
            force_local,
        } = request;
        let cancel = cancel.unwrap_or_default();
        let sink = stream.as_ref();

        let outcome = self
            .route(mode, &messages, &config, sink, &cancel, force_local)
            .await;

        if let Some(sink) = sink {
            match &outcome {
                Ok(DispatchOutput::Completion(result)) => sink.done(&result.content),
                Ok(DispatchOutput::TestRace(_)) => sink.done(""),
                Err(err) => sink.error(&err.to_string()),
            };
        }
        match &outcome {
            Ok(DispatchOutput::Completion(result)) => telemetry::log_event(
                "dispatch",
                &format!("{mode} answered by {} (streamed={})", result.full_model_id, result.streamed),
            ),
            Ok(DispatchOutput::TestRace(entries)) => {
                telemetry::log_event("race", &format!("test-race finished with {} entries", entries.len()))
            }
            Err(err) => telemetry::log_error("dispatch", &format!("{mode} failed: {err}")),
        }
        outcome
    }

    async fn route(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
        force_local: bool,
    ) -> Result<DispatchOutput, AiError> {
        if messages.is_empty() {
            return Err(AiError::Validation("Messages are required".to_string()));
        }

        if !force_local {
            if let Some(remote) = self.remote_client().await {
                info!(server = %remote.server_url(), %mode, "executing remotely");
                match execute_with(remote, mode, messages, config, sink, cancel).await {
                    Ok(output) => return Ok(output),
                    Err(err) => {
                        let fallback = self.remote_config().await.fallback_to_local;
                        let emitted = sink.is_some_and(StreamSink::has_emitted);
                        if !fallback || emitted || matches!(err, AiError::Cancelled(_)) {
                            warn!(error = %err, fallback, emitted, "remote execution failed");
                            return Err(err);
                        }
                        warn!(error = %err, "remote execution failed, falling back to local");
                        telemetry::log_error("remote", &format!("falling back to local: {err}"));
                    }
                }
            }
        }

        debug!(%mode, models = config.models.len(), "executing locally");
        execute_with(&self.local, mode, messages, config, sink, cancel).await
    }
}

/** \brief test-race 的结果不走事件流，其余模式有 sink 时走流式接口。 */
async fn execute_with(
    client: &dyn ExecutionClient,
    mode: ExecutionMode,
    messages: &[Message],
    config: &ExecutionConfig,
    sink: Option<&StreamSink>,
    cancel: &CancellationToken,
) -> Result<DispatchOutput, AiError> {
    match sink {
        Some(sink) if mode != ExecutionMode::TestRace => {
            client
                .execute_stream(mode, messages, config, sink, cancel)
                .await
        }
        _ => client.execute(mode, messages, config, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::lang::DefaultLang;
    use crate::registry::InMemoryRegistry;
    use crate::stream::{drain_events, StreamEvent};

    fn engine() -> Engine {
        Engine::new(Arc::new(InMemoryRegistry::default()), Arc::new(DefaultLang))
    }

    #[derive(Default)]
    struct CountingSource {
        loads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RemoteConfigSource for CountingSource {
        async fn load_remote_config(&self) -> anyhow::Result<RemoteConfig> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("db unavailable"));
            }
            Ok(RemoteConfig {
                enabled: true,
                server_url: "not a url".into(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_empty_messages_fail_with_terminal_event() {
        let dispatcher = Dispatcher::local_only(engine());
        let (sink, mut rx) = StreamSink::channel();
        let request = ExecutionRequest::new(
            ExecutionMode::Single,
            vec![],
            ExecutionConfig::with_models(["openai/gpt-4o"]),
        )
        .with_stream(sink);
        let err = dispatcher.dispatch(request).await.expect_err("no messages");
        assert_eq!(err, AiError::Validation("Messages are required".into()));
        assert_eq!(
            drain_events(&mut rx),
            vec![StreamEvent::Error {
                error: "Messages are required".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_remote_config_is_loaded_once() {
        let source = Arc::new(CountingSource::default());
        let dispatcher = Dispatcher::new(engine(), source.clone());
        for _ in 0..3 {
            let request = ExecutionRequest::new(
                ExecutionMode::Single,
                vec![Message::user("hi")],
                ExecutionConfig::with_models(["missing/model"]),
            );
            let err = dispatcher.dispatch(request).await.expect_err("unknown provider");
            assert!(matches!(err, AiError::NotFound { .. }), "{err:?}");
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(dispatcher.remote_client().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_config_source_degrades_to_local() {
        let source = Arc::new(CountingSource {
            fail: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(engine(), source);
        assert_eq!(dispatcher.remote_config().await, &RemoteConfig::default());
        assert!(dispatcher.remote_client().await.is_none());
    }
}
