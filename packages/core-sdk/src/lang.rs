/**
 * \brief 本地化文案查询接口，只用于拼装错误/状态文本。
 */
pub trait Lang: Send + Sync {
    fn get(&self, key: &str, params: &[(&str, &str)]) -> String;
}

const DEFAULT_STRINGS: &[(&str, &str)] = &[
    (
        "errorProviderConfigNotFound",
        "Provider configuration not found: {providerId}",
    ),
    (
        "errorApiKeyNotConfigured",
        "API key is not configured for {name}",
    ),
    (
        "errorModelNotSupportImages",
        "This model does not support images or attached files.",
    ),
    (
        "errorModelNotSupportImagesRaceMode",
        "None of the models in the race support images or attached files.",
    ),
    ("errorApi401", "Invalid API key or unauthorized (401)."),
    ("errorApi404", "Model {modelId} was not found (404)."),
    ("errorApi429", "Rate limit exceeded (429). Please try again later."),
    (
        "errorApiExtractContent",
        "Could not extract content from the API response.",
    ),
    ("errorRaceModeFailed", "Race mode failed"),
    ("errorRequestCancelled", "Request cancelled"),
];

/**
 * \brief 内置英文文案表；未知 key 原样返回。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLang;

impl Lang for DefaultLang {
    fn get(&self, key: &str, params: &[(&str, &str)]) -> String {
        let template = DEFAULT_STRINGS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(key);
        fill(template, params)
    }
}

/** \brief 替换 `{name}` 占位符。 */
pub fn fill(template: &str, params: &[(&str, &str)]) -> String {
    params.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}
