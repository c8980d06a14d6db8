use thiserror::Error;

/** \brief 表示模型不接受多模态输入的错误关键字。 */
const FILE_SUPPORT_KEYWORDS: &[&str] = &[
    "image",
    "file",
    "attachment",
    "document",
    "multimodal",
    "unsupported",
    "not support",
];

/**
 * \brief 执行引擎的错误分类。
 *
 * 适配器、执行模式、客户端与调度器统一返回该类型。
 */
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AiError {
    /** \brief 缺少凭据或 providerId/modelId 格式错误 */
    #[error("{0}")]
    Config(String),

    /** \brief Provider 不存在 */
    #[error("{message}")]
    NotFound { message: String, provider: String },

    /** \brief 模型不支持附带的图片或文件 */
    #[error("{0}")]
    FileSupport(String),

    #[error("{message}")]
    RateLimit { message: String, provider: String },

    #[error("{message}")]
    Auth { message: String, provider: String },

    #[error("{message}")]
    Forbidden { message: String, provider: String },

    #[error("{message}")]
    Server {
        message: String,
        provider: String,
        status: u16,
    },

    /** \brief 传输失败或超时 */
    #[error("{0}")]
    Network(String),

    /** \brief 其他 HTTP 错误，保留 Provider 与状态码 */
    #[error("{message}")]
    Api {
        message: String,
        provider: String,
        status: u16,
    },

    /** \brief 调用方取消 */
    #[error("{0}")]
    Cancelled(String),

    /** \brief 请求不合法，如缺少消息或模型数量不符 */
    #[error("{0}")]
    Validation(String),

    /** \brief 响应体无法解析 */
    #[error("{0}")]
    Stream(String),
}

impl AiError {
    /**
     * \brief 按 HTTP 状态码归类非 2xx 响应。
     */
    pub fn from_status(status: u16, message: impl Into<String>, provider: impl Into<String>) -> Self {
        let message = message.into();
        let provider = provider.into();
        match status {
            401 => AiError::Auth { message, provider },
            403 => AiError::Forbidden { message, provider },
            404 => AiError::NotFound { message, provider },
            429 => AiError::RateLimit { message, provider },
            500..=599 => AiError::Server {
                message,
                provider,
                status,
            },
            _ => AiError::Api {
                message,
                provider,
                status,
            },
        }
    }

    pub fn timeout() -> Self {
        AiError::Network("timeout".to_string())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            AiError::NotFound { .. } => Some(404),
            AiError::RateLimit { .. } => Some(429),
            AiError::Auth { .. } => Some(401),
            AiError::Forbidden { .. } => Some(403),
            AiError::Server { status, .. } | AiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            AiError::NotFound { provider, .. }
            | AiError::RateLimit { provider, .. }
            | AiError::Auth { provider, .. }
            | AiError::Forbidden { provider, .. }
            | AiError::Server { provider, .. }
            | AiError::Api { provider, .. } => Some(provider.as_str()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AiError::Network(msg) if msg.to_ascii_lowercase().contains("timeout"))
    }

    /** \brief 远程重试跳过取消、鉴权失败与请求错误。 */
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AiError::Cancelled(_)
                | AiError::Auth { .. }
                | AiError::Forbidden { .. }
                | AiError::Config(_)
                | AiError::Validation(_)
        )
    }

    pub fn is_file_support(&self) -> bool {
        matches!(self, AiError::FileSupport(_)) || is_file_support_message(&self.to_string())
    }

    /**
     * \brief 保持错误类型、Provider 与状态码，在消息前加 `prefix: `。
     */
    pub fn prefixed(self, prefix: &str) -> Self {
        let join = |message: String| format!("{prefix}: {message}");
        match self {
            AiError::Config(m) => AiError::Config(join(m)),
            AiError::NotFound { message, provider } => AiError::NotFound {
                message: join(message),
                provider,
            },
            AiError::FileSupport(m) => AiError::FileSupport(join(m)),
            AiError::RateLimit { message, provider } => AiError::RateLimit {
                message: join(message),
                provider,
            },
            AiError::Auth { message, provider } => AiError::Auth {
                message: join(message),
                provider,
            },
            AiError::Forbidden { message, provider } => AiError::Forbidden {
                message: join(message),
                provider,
            },
            AiError::Server {
                message,
                provider,
                status,
            } => AiError::Server {
                message: join(message),
                provider,
                status,
            },
            AiError::Network(m) => AiError::Network(join(m)),
            AiError::Api {
                message,
                provider,
                status,
            } => AiError::Api {
                message: join(message),
                provider,
                status,
            },
            AiError::Cancelled(m) => AiError::Cancelled(join(m)),
            AiError::Validation(m) => AiError::Validation(join(m)),
            AiError::Stream(m) => AiError::Stream(join(m)),
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiError::timeout()
        } else if err.is_decode() {
            AiError::Stream(err.to_string())
        } else {
            AiError::Network(err.to_string())
        }
    }
}

/** \brief 根据错误文本判断是否为文件或图片不受支持。 */
pub fn is_file_support_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    FILE_SUPPORT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
