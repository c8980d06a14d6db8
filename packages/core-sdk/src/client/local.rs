use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::ExecutionClient;
use crate::error::AiError;
use crate::models::{DispatchOutput, ExecutionConfig, ExecutionMode, Message};
use crate::modes::Engine;
use crate::stream::StreamSink;

/**
 * \brief 进程内执行，直接调用本地执行引擎。
 */
#[derive(Clone)]
pub struct LocalClient {
    engine: Engine,
}

impl LocalClient {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[async_trait]
impl ExecutionClient for LocalClient {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError> {
        self.engine.run(mode, messages, config, None, cancel).await
    }

    async fn execute_stream(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: &StreamSink,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError> {
        self.engine.run(mode, messages, config, Some(sink), cancel).await
    }
}
