use std::future::Future;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::AiError;
use crate::models::{ExecutionConfig, ExecutionResult, FullModelId, Message, RaceEntry, RaceStatus};
use crate::processor::has_files;
use crate::simulator::simulate_streaming;
use crate::stream::StreamSink;

/**
 * \brief 竞速中失败（或被淘汰）的参与者。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Discarded {
    pub full_model_id: String,
    pub error: AiError,
}

/**
 * \brief 竞速结果：第一个成功者，以及在它之前已经失败的参与者。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct RaceOutcome<T> {
    pub full_model_id: String,
    pub winner: T,
    pub discarded: Vec<Discarded>,
}

/**
 * \brief 并发运行所有参与者，第一个成功者获胜。
 *
 * 每个参与者持有一个从 `parent` 派生的独立取消令牌；
 * 出现赢家后其余令牌立即取消，未完成的请求随之被丢弃。
 * 全部失败时按失败先后返回错误列表。
 */
pub async fn race_first_success<T, F, Fut>(
    ids: &[String],
    parent: &CancellationToken,
    run: F,
) -> Result<RaceOutcome<T>, Vec<Discarded>>
where
    F: Fn(String, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let tokens: Vec<CancellationToken> = ids.iter().map(|_| parent.child_token()).collect();
    let mut pending: FuturesUnordered<_> = ids
        .iter()
        .zip(&tokens)
        .enumerate()
        .map(|(index, (id, token))| {
            let participant = run(id.clone(), token.clone());
            async move { (index, participant.await) }
        })
        .collect();

    let mut discarded = Vec::new();
    while let Some((index, result)) = pending.next().await {
        match result {
            Ok(winner) => {
                for (i, token) in tokens.iter().enumerate() {
                    if i != index && !token.is_cancelled() {
                        token.cancel();
                        debug!(model = %ids[i], "cancelled race participant");
                    }
                }
                return Ok(RaceOutcome {
                    full_model_id: ids[index].clone(),
                    winner,
                    discarded,
                });
            }
            Err(error) => {
                debug!(model = %ids[index], %error, "race participant failed");
                discarded.push(Discarded {
                    full_model_id: ids[index].clone(),
                    error,
                });
            }
        }
    }
    Err(discarded)
}

/** \brief 错误到 test-race 状态的映射。 */
pub fn race_status(error: &AiError) -> RaceStatus {
    if matches!(error, AiError::Cancelled(_)) {
        RaceStatus::Aborted
    } else if error.is_timeout() {
        RaceStatus::Timeout
    } else if let Some(code) = error.status_code() {
        RaceStatus::Error(code)
    } else {
        RaceStatus::NetworkOrOther
    }
}

impl Engine {
    /**
     * \brief run-race：首个成功的模型获胜，其余请求被取消。
     *
     * 参与者从不原生流式；提供 sink 时赢家的内容经模拟器回放。
     */
    pub async fn run_race(
        &self,
        models: &[String],
        messages: &[Message],
        config: &ExecutionConfig,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, AiError> {
        if models.len() < 2 {
            return Err(AiError::Validation(
                "Run Race mode requires at least 2 models".to_string(),
            ));
        }

        let outcome = race_first_success(models, cancel, move |id, token| async move {
            self.execute_single(&id, messages, config, None, &token).await
        })
        .await;

        match outcome {
            Ok(RaceOutcome {
                full_model_id,
                winner,
                discarded,
            }) => {
                info!(winner = %full_model_id, failed_before_win = discarded.len(), "race won");
                if let Some(sink) = sink {
                    simulate_streaming(&winner.content, sink, self.simulator).await;
                }
                Ok(winner)
            }
            Err(failures) => Err(self.race_failure(failures, messages, cancel)),
        }
    }

    fn race_failure(
        &self,
        failures: Vec<Discarded>,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> AiError {
        warn!(failed = failures.len(), "all race participants failed");
        if cancel.is_cancelled() {
            return self.cancelled();
        }
        if has_files(messages)
            && !failures.is_empty()
            && failures.iter().all(|f| f.error.is_file_support())
        {
            return AiError::FileSupport(self.text("errorModelNotSupportImagesRaceMode", &[]));
        }
        let prefix = self.text("errorRaceModeFailed", &[]);
        match failures.into_iter().next() {
            Some(first) => first.error.prefixed(&prefix),
            None => AiError::Validation(prefix),
        }
    }

    /**
     * \brief test-race：所有模型跑到结束，逐个记录延迟与状态。
     *
     * 不会互相取消，也不会向调用方抛出单个模型的错误。
     */
    pub async fn test_race(
        &self,
        models: &[String],
        messages: &[Message],
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Vec<RaceEntry> {
        join_all(
            models
                .iter()
                .map(|id| self.probe(id, messages, config, cancel)),
        )
        .await
    }

    async fn probe(
        &self,
        full_model_id: &str,
        messages: &[Message],
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> RaceEntry {
        let (name, provider) = self.display_names(full_model_id);
        let started = Instant::now();
        let result = self
            .execute_single(full_model_id, messages, config, None, cancel)
            .await;
        let latency = started.elapsed().as_millis() as u64;

        let (status, error) = match result {
            Ok(_) => (RaceStatus::Ok, None),
            Err(err) => {
                let status = race_status(&err);
                warn!(model = %full_model_id, %status, error = %err, "test-race participant failed");
                (status, Some(err.to_string()))
            }
        };
        RaceEntry {
            full_model_id: full_model_id.to_string(),
            name,
            provider,
            latency,
            status,
            error,
        }
    }

    /** \brief (模型显示名, Provider 名)，查不到时为 "Unknown"。 */
    fn display_names(&self, full_model_id: &str) -> (String, String) {
        let unknown = || ("Unknown".to_string(), "Unknown".to_string());
        let Ok(id) = FullModelId::parse(full_model_id) else {
            return unknown();
        };
        match self.registry().get_provider(&id.provider_id) {
            Some(provider) => {
                let name = provider
                    .model(&id.model_id)
                    .map(|m| m.display_name.clone())
                    .unwrap_or_else(|| id.model_id.clone());
                (name, provider.name)
            }
            None => unknown(),
        }
    }
}
