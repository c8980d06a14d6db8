use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AiError;
use crate::lang::Lang;
use crate::models::{DispatchOutput, ExecutionConfig, ExecutionMode, Message};
use crate::processor::{filter_models_supporting_files, has_files};
use crate::registry::ProviderRegistry;
use crate::simulator::SimulatorOptions;
use crate::stream::StreamSink;

mod race;
mod single;

pub use race::{race_first_success, race_status, Discarded, RaceOutcome};

/**
 * \brief 本地执行引擎：持有注册表、HTTP 客户端与文案表。
 *
 * 克隆代价很低（内部全部是 Arc / 连接池句柄）。
 */
#[derive(Clone)]
pub struct Engine {
    registry: Arc<dyn ProviderRegistry>,
    lang: Arc<dyn Lang>,
    http: reqwest::Client,
    simulator: SimulatorOptions,
}

impl Engine {
    pub fn new(registry: Arc<dyn ProviderRegistry>, lang: Arc<dyn Lang>) -> Self {
        Self {
            registry,
            lang,
            http: reqwest::Client::new(),
            simulator: SimulatorOptions::default(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_simulator(mut self, simulator: SimulatorOptions) -> Self {
        self.simulator = simulator;
        self
    }

    fn with_registry(&self, registry: Arc<dyn ProviderRegistry>) -> Self {
        Self {
            registry,
            ..self.clone()
        }
    }

    pub fn registry(&self) -> &dyn ProviderRegistry {
        self.registry.as_ref()
    }

    pub fn lang(&self) -> &dyn Lang {
        self.lang.as_ref()
    }

    pub(crate) fn text(&self, key: &str, params: &[(&str, &str)]) -> String {
        self.lang.get(key, params)
    }

    pub(crate) fn cancelled(&self) -> AiError {
        AiError::Cancelled(self.text("errorRequestCancelled", &[]))
    }

    /**
     * \brief 按模式执行，并保证 sink 收到恰好一个终止事件。
     */
    pub async fn run(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError> {
        let scoped;
        let engine = match self.registry.snapshot().await {
            Some(snapshot) => {
                scoped = self.with_registry(Arc::new(snapshot));
                &scoped
            }
            None => self,
        };
        let outcome = engine.route(mode, messages, config, sink, cancel).await;
        if let Some(sink) = sink {
            match &outcome {
                Ok(DispatchOutput::Completion(result)) => sink.done(&result.content),
                Ok(DispatchOutput::TestRace(_)) => sink.done(""),
                Err(err) => sink.error(&err.to_string()),
            };
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
    ) -> Result<DispatchOutput, AiError> {
        let models = &config.models;
        match mode {
            ExecutionMode::Single => {
                if models.len() != 1 {
                    return Err(AiError::Validation(
                        "Single mode requires exactly one model".to_string(),
                    ));
                }
                debug!(model = %models[0], "dispatching to single mode");
                self.execute_single(&models[0], messages, config, sink, cancel)
                    .await
                    .map(DispatchOutput::Completion)
            }
            ExecutionMode::RunRace => {
                if models.len() < 2 {
                    return Err(AiError::Validation(
                        "Run Race mode requires at least 2 models".to_string(),
                    ));
                }
                let models = self.narrow_for_files(models, messages)?;
                if let [only] = models.as_slice() {
                    info!(model = %only, "one file-capable model left, running single");
                    return self
                        .execute_single(only, messages, config, sink, cancel)
                        .await
                        .map(DispatchOutput::Completion);
                }
                debug!(?models, "dispatching to run-race mode");
                self.run_race(&models, messages, config, sink, cancel)
                    .await
                    .map(DispatchOutput::Completion)
            }
            ExecutionMode::TestRace => {
                if models.is_empty() {
                    return Err(AiError::Validation(
                        "Test Race mode requires at least one model".to_string(),
                    ));
                }
                debug!(?models, "dispatching to test-race mode");
                Ok(DispatchOutput::TestRace(
                    self.test_race(models, messages, config, cancel).await,
                ))
            }
        }
    }

    /** \brief 带文件的请求只保留支持文件的模型。 */
    fn narrow_for_files(&self, models: &[String], messages: &[Message]) -> Result<Vec<String>, AiError> {
        if !has_files(messages) {
            return Ok(models.to_vec());
        }
        let (supporting, not_supporting) = filter_models_supporting_files(models, self.registry());
        if supporting.is_empty() {
            return Err(AiError::FileSupport(
                self.text("errorModelNotSupportImagesRaceMode", &[]),
            ));
        }
        if !not_supporting.is_empty() {
            info!(dropped = ?not_supporting, "dropping models without file support from race");
        }
        Ok(supporting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::provider;
    use crate::lang::DefaultLang;
    use crate::models::ProviderType;
    use crate::registry::InMemoryRegistry;
    use crate::stream::{drain_events, StreamEvent};

    fn engine() -> Engine {
        let registry = InMemoryRegistry::new(vec![
            provider("openai", ProviderType::OpenaiCompatible, "http://127.0.0.1:9"),
            provider("dify", ProviderType::Dify, "http://127.0.0.1:9"),
        ]);
        Engine::new(Arc::new(registry), Arc::new(DefaultLang))
    }

    #[tokio::test]
    async fn test_model_count_preconditions() {
        let engine = engine();
        let token = CancellationToken::new();
        let messages = vec![Message::user("hi")];
        let cases = [
            (ExecutionMode::Single, vec!["openai/a", "openai/b"]),
            (ExecutionMode::Single, vec![]),
            (ExecutionMode::RunRace, vec!["openai/a"]),
            (ExecutionMode::TestRace, vec![]),
        ];
        for (mode, models) in cases {
            let config = ExecutionConfig::with_models(models);
            let err = engine
                .run(mode, &messages, &config, None, &token)
                .await
                .expect_err("precondition");
            assert!(matches!(err, AiError::Validation(_)), "{mode}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_race_with_files_and_no_capable_model() {
        let engine = engine();
        let (sink, mut rx) = StreamSink::channel();
        let messages = vec![Message::user("look").with_images(vec!["data:image/png;base64,AA".into()])];
        let config = ExecutionConfig::with_models(["openai/gpt-3.5-turbo", "dify/app"]);
        let err = engine
            .run(ExecutionMode::RunRace, &messages, &config, Some(&sink), &CancellationToken::new())
            .await
            .expect_err("no capable model");
        let expected = DefaultLang.get("errorModelNotSupportImagesRaceMode", &[]);
        assert_eq!(err, AiError::FileSupport(expected.clone()));
        assert_eq!(drain_events(&mut rx), vec![StreamEvent::Error { error: expected }]);
    }
}
