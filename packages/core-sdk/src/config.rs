use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AiError;

/**
 * \brief 远程执行配置，缺失字段取默认值。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub server_url: String,
    /** \brief 单次尝试超时（毫秒） */
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    /** \brief 线性退避的基础间隔（毫秒），第 n 次重试前等待 n 倍 */
    pub retry_delay_ms: u64,
    pub fallback_to_local: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            timeout_ms: 60_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            fallback_to_local: true,
        }
    }
}

impl RemoteConfig {
    /** \brief 已启用且地址合法时才会使用远程执行。 */
    pub fn is_usable(&self) -> bool {
        self.enabled && validate_server_url(&self.server_url).is_ok()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/**
 * \brief 校验远程服务地址，只接受 http/https。
 */
pub fn validate_server_url(raw: &str) -> Result<Url, AiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AiError::Config("Server URL is required".to_string()));
    }
    let parsed =
        Url::parse(raw).map_err(|_| AiError::Config("Invalid server URL format".to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(AiError::Config(
            "Server URL must use http or https protocol".to_string(),
        )),
    }
}

/**
 * \brief 远程配置来源。Dispatcher 在首次请求时读取一次。
 */
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    async fn load_remote_config(&self) -> Result<RemoteConfig>;
}

/** \brief 固定配置，常用于测试与服务端（服务端总是本地执行）。 */
#[derive(Debug, Clone, Default)]
pub struct StaticRemoteConfig(pub RemoteConfig);

#[async_trait]
impl RemoteConfigSource for StaticRemoteConfig {
    async fn load_remote_config(&self) -> Result<RemoteConfig> {
        Ok(self.0.clone())
    }
}
