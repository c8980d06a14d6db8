use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AiError;
use crate::models::{DispatchOutput, ExecutionConfig, ExecutionMode, Message};
use crate::stream::StreamSink;

mod local;
mod remote;

pub use local::LocalClient;
pub use remote::RemoteClient;

/**
 * \brief 本地与远程执行共用的客户端接口。
 */
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError>;

    /** \brief 同 execute，增量输出写入 sink。 */
    async fn execute_stream(
        &self,
        mode: ExecutionMode,
        messages: &[Message],
        config: &ExecutionConfig,
        sink: &StreamSink,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutput, AiError>;
}

/**
 * \brief 远程执行接口的请求体：`{mode, messages, config, stream?}`。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}
