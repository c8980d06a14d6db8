use crate::adapters::create_adapter;
use crate::models::{FullModelId, Message, Role};
use crate::registry::ProviderRegistry;

/**
 * \brief 消息预处理选项。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /** \brief 保留最后一条消息上的图片 */
    pub include_images: bool,
    /** \brief 保留附件 */
    pub include_attached_files: bool,
    /** \brief 归一化角色名 */
    pub convert_roles: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            include_attached_files: true,
            convert_roles: true,
        }
    }
}

/**
 * \brief 按策略整理消息列表，纯函数。
 *
 * 图片只保留在最后一条消息上；`include_images` 关闭时全部移除。
 * 角色转换：ai/assistant -> assistant，缺省或 user -> user，system 保持不变。
 */
pub fn process_messages(messages: &[Message], options: ProcessOptions) -> Vec<Message> {
    let last = messages.len().saturating_sub(1);
    messages
        .iter()
        .enumerate()
        .map(|(index, msg)| {
            let mut processed = msg.clone();

            if options.convert_roles {
                processed.role = msg.role().as_str().to_string();
            }

            processed.images = if options.include_images && index == last && !msg.images().is_empty() {
                msg.images.clone()
            } else {
                None
            };

            processed.attached_files = if options.include_attached_files && !msg.attachments().is_empty() {
                msg.attached_files.clone()
            } else {
                None
            };

            processed
        })
        .collect()
}

/** \brief 是否有任一消息携带图片或附件。 */
pub fn has_files(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|m| !m.images().is_empty() || !m.attachments().is_empty())
}

/**
 * \brief 按 Adapter 的 supports_files 拆分模型列表。
 *
 * 格式错误的 ID 被跳过；找不到 Provider 的模型归入不支持。
 * \return (支持, 不支持)，各自保持原有顺序
 */
pub fn filter_models_supporting_files(
    full_model_ids: &[String],
    registry: &dyn ProviderRegistry,
) -> (Vec<String>, Vec<String>) {
    let mut supporting = Vec::new();
    let mut not_supporting = Vec::new();

    for raw in full_model_ids {
        let Ok(id) = FullModelId::parse(raw) else {
            continue;
        };
        let supports = registry
            .get_provider(&id.provider_id)
            .map(|config| create_adapter(config).supports_files(&id.model_id))
            .unwrap_or(false);
        if supports {
            supporting.push(raw.clone());
        } else {
            not_supporting.push(raw.clone());
        }
    }

    (supporting, not_supporting)
}

/** \brief 仅用于日志：统计系统消息条数。 */
pub(crate) fn system_message_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.role() == Role::System).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::provider;
    use crate::models::{Attachment, ProviderType};
    use crate::registry::InMemoryRegistry;

    fn conversation() -> Vec<Message> {
        vec![
            Message::new("", "first"),
            Message::new("ai", "second"),
            Message::user("third").with_images(vec!["data:image/png;base64,AA".into()]),
        ]
    }

    #[test]
    fn test_images_stripped_everywhere_when_disabled() {
        let out = process_messages(
            &conversation(),
            ProcessOptions {
                include_images: false,
                ..Default::default()
            },
        );
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|m| m.images.is_none()));
    }

    #[test]
    fn test_images_kept_only_on_last() {
        let mut messages = conversation();
        messages[0].images = Some(vec!["data:image/png;base64,BB".into()]);
        let out = process_messages(&messages, ProcessOptions::default());
        assert!(out[0].images.is_none());
        assert_eq!(out[2].images().len(), 1);
        assert_eq!(out[0].role, "user");
        assert_eq!(out[1].role, "assistant");
    }

    #[test]
    fn test_attachments_follow_flag() {
        let file = Attachment {
            name: "a.pdf".into(),
            mime_type: Some("application/pdf".into()),
            url: None,
        };
        let messages = vec![Message::user("x").with_attachments(vec![file]), Message::user("y")];
        assert!(has_files(&messages));
        let kept = process_messages(&messages, ProcessOptions::default());
        assert_eq!(kept[0].attachments().len(), 1);
        let dropped = process_messages(
            &messages,
            ProcessOptions {
                include_attached_files: false,
                ..Default::default()
            },
        );
        assert!(!has_files(&dropped));
        assert!(!has_files(&[Message::user("plain")]));
    }

    #[test]
    fn test_filter_models_supporting_files() {
        let registry = InMemoryRegistry::new(vec![
            provider("openai", ProviderType::OpenaiCompatible, "https://o"),
            provider("google", ProviderType::GoogleAi, "https://g"),
        ]);
        let ids: Vec<String> = [
            "openai/gpt-4o",
            "openai/gpt-3.5-turbo",
            "google/gemini-pro",
            "ghost/model",
            "malformed",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (yes, no) = filter_models_supporting_files(&ids, &registry);
        assert_eq!(yes, vec!["openai/gpt-4o", "google/gemini-pro"]);
        assert_eq!(no, vec!["openai/gpt-3.5-turbo", "ghost/model"]);
    }
}
