use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AiError;

/**
 * \brief Provider 协议族，决定使用哪一个 Adapter。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    OpenaiCompatible,
    Anthropic,
    GoogleAi,
    Dify,
    /** \brief 未识别的类型，按 OpenAI 兼容格式处理。 */
    #[serde(untagged)]
    Other(String),
}

impl ProviderType {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderType::OpenaiCompatible => "openai-compatible",
            ProviderType::Anthropic => "anthropic",
            ProviderType::GoogleAi => "google-ai",
            ProviderType::Dify => "dify",
            ProviderType::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai-compatible" => ProviderType::OpenaiCompatible,
            "anthropic" => ProviderType::Anthropic,
            "google-ai" => ProviderType::GoogleAi,
            "dify" => ProviderType::Dify,
            _ => ProviderType::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief Provider 下的单个模型描述。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /** \brief 模型 ID，在同一 Provider 内唯一 */
    pub id: String,
    /** \brief 显示名称 */
    pub display_name: String,
}

/**
 * \brief Provider 配置模型，执行期间只读。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /** \brief Provider 标识，例如 "openai" */
    pub provider_id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 协议类型 */
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /** \brief API Key（部分 Provider 可为空） */
    #[serde(default)]
    pub api_key: Option<String>,
    /** \brief 用户配置的请求地址 */
    #[serde(default, rename = "baseURL")]
    pub base_url: String,
    /** \brief 默认请求地址 */
    #[serde(default, rename = "defaultBaseURL")]
    pub default_base_url: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl ProviderConfig {
    /** \brief 优先使用用户地址，否则回退到默认地址。 */
    pub fn effective_base_url(&self) -> &str {
        if self.base_url.trim().is_empty() {
            self.default_base_url.trim_end_matches('/')
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

/**
 * \brief `providerId/modelId` 组合标识。
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullModelId {
    pub provider_id: String,
    pub model_id: String,
}

impl FullModelId {
    pub fn parse(raw: &str) -> Result<Self, AiError> {
        let mut halves = raw.split('/');
        match (halves.next(), halves.next(), halves.next()) {
            (Some(provider), Some(model), None) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self {
                    provider_id: provider.to_string(),
                    model_id: model.to_string(),
                })
            }
            _ => Err(AiError::Config(format!("Invalid full model ID format: {raw}"))),
        }
    }
}

impl FromStr for FullModelId {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FullModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/**
 * \brief 归一化后的消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /** \brief `ai`/`assistant` 视为助手，`system` 保留，其余（含缺省）视为用户。 */
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ai" | "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/**
 * \brief 多模态内容片段，OpenAI 风格。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/**
 * \brief 消息正文：纯文本或片段列表。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /** \brief 拼接全部文本片段。 */
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

/**
 * \brief 附件元数据。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /** \brief data URL 或远程地址 */
    #[serde(default)]
    pub url: Option<String>,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /** \brief 角色：system/user/assistant（兼容 ai） */
    #[serde(default)]
    pub role: String,
    /** \brief 内容 */
    #[serde(default)]
    pub content: MessageContent,
    /** \brief 图片 data URL */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_files: Option<Vec<Attachment>>,
}

impl Message {
    pub fn new(role: &str, content: impl Into<MessageContent>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: None,
            attached_files: None,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new("system", content)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_attachments(mut self, files: Vec<Attachment>) -> Self {
        self.attached_files = Some(files);
        self
    }

    pub fn role(&self) -> Role {
        Role::normalize(&self.role)
    }

    pub fn images(&self) -> &[String] {
        self.images.as_deref().unwrap_or(&[])
    }

    pub fn attachments(&self) -> &[Attachment] {
        self.attached_files.as_deref().unwrap_or(&[])
    }
}

/**
 * \brief 执行模式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Single,
    RunRace,
    TestRace,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Single => "single",
            ExecutionMode::RunRace => "run-race",
            ExecutionMode::TestRace => "test-race",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(AiError::Validation("Mode is required".to_string())),
            "single" => Ok(ExecutionMode::Single),
            "run-race" => Ok(ExecutionMode::RunRace),
            "test-race" => Ok(ExecutionMode::TestRace),
            other => Err(AiError::Validation(format!("Unsupported mode: {other}"))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 单次请求的模型选择与参数。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /** \brief `providerId/modelId` 列表 */
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_race_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /** \brief 本地单模型超时（毫秒），缺省不限时 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutionConfig {
    pub fn with_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/**
 * \brief 一次成功执行的结果，返回后不再修改。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub content: String,
    pub provider_id: String,
    pub full_model_id: String,
    pub streamed: bool,
}

/**
 * \brief test-race 中单个模型的状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceStatus {
    Ok,
    Error(u16),
    Aborted,
    Timeout,
    NetworkOrOther,
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceStatus::Ok => f.write_str("OK"),
            RaceStatus::Error(code) => write!(f, "Error ({code})"),
            RaceStatus::Aborted => f.write_str("Aborted"),
            RaceStatus::Timeout => f.write_str("Timeout"),
            RaceStatus::NetworkOrOther => f.write_str("Error (Network/Other)"),
        }
    }
}

impl FromStr for RaceStatus {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(RaceStatus::Ok),
            "Aborted" => Ok(RaceStatus::Aborted),
            "Timeout" => Ok(RaceStatus::Timeout),
            "Error (Network/Other)" => Ok(RaceStatus::NetworkOrOther),
            other => other
                .strip_prefix("Error (")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|code| code.parse().ok())
                .map(RaceStatus::Error)
                .ok_or_else(|| AiError::Stream(format!("unknown race status: {other}"))),
        }
    }
}

impl Serialize for RaceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RaceStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/**
 * \brief test-race 的单个模型报告。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceEntry {
    pub full_model_id: String,
    pub name: String,
    pub provider: String,
    /** \brief 毫秒 */
    pub latency: u64,
    pub status: RaceStatus,
    pub error: Option<String>,
}

/**
 * \brief Dispatcher 的输出：普通结果或 test-race 报告。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutput {
    Completion(ExecutionResult),
    TestRace(Vec<RaceEntry>),
}

impl DispatchOutput {
    pub fn into_completion(self) -> Result<ExecutionResult, AiError> {
        match self {
            DispatchOutput::Completion(result) => Ok(result),
            DispatchOutput::TestRace(_) => Err(AiError::Validation(
                "test-race produces a diagnostic report, not a completion".to_string(),
            )),
        }
    }

    pub fn into_race_report(self) -> Result<Vec<RaceEntry>, AiError> {
        match self {
            DispatchOutput::TestRace(entries) => Ok(entries),
            DispatchOutput::Completion(_) => Err(AiError::Validation(
                "only test-race produces a diagnostic report".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_model_id_parses_two_halves() {
        let id = FullModelId::parse("openai/gpt-4o").expect("parse");
        assert_eq!(id.provider_id, "openai");
        assert_eq!(id.model_id, "gpt-4o");
        assert_eq!(id.to_string(), "openai/gpt-4o");
    }

    #[test]
    fn test_full_model_id_rejects_malformed() {
        for raw in ["", "openai", "/gpt", "openai/", "a/b/c", "/"] {
            let err = FullModelId::parse(raw).expect_err(raw);
            assert!(matches!(err, AiError::Config(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn test_role_normalization() {
        assert_eq!(Role::normalize("ai"), Role::Assistant);
        assert_eq!(Role::normalize("assistant"), Role::Assistant);
        assert_eq!(Role::normalize("system"), Role::System);
        assert_eq!(Role::normalize(""), Role::User);
        assert_eq!(Role::normalize("tool"), Role::User);
    }

    #[test]
    fn test_provider_type_unknown_is_kept() {
        let parsed: ProviderType = serde_json::from_str("\"groq-native\"").expect("deserialize");
        assert_eq!(parsed, ProviderType::Other("groq-native".to_string()));
        let known: ProviderType = serde_json::from_str("\"google-ai\"").expect("deserialize");
        assert_eq!(known, ProviderType::GoogleAi);
    }

    #[test]
    fn test_race_status_text() {
        assert_eq!(RaceStatus::Error(429).to_string(), "Error (429)");
        assert_eq!("Error (503)".parse::<RaceStatus>().unwrap(), RaceStatus::Error(503));
        assert_eq!("Aborted".parse::<RaceStatus>().unwrap(), RaceStatus::Aborted);
        assert!("Weird".parse::<RaceStatus>().is_err());
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::user("hi").with_images(vec!["data:image/png;base64,AA".into()]);
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
        assert!(value.get("attachedFiles").is_none());
        let back: Message = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
    }
}
