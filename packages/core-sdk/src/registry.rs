use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::ProviderConfig;

/** \brief 无需 API Key 即可调用的 Provider。 */
pub const KEYLESS_PROVIDERS: &[&str] = &["cerebras"];

pub fn is_keyless(provider_id: &str) -> bool {
    KEYLESS_PROVIDERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(provider_id))
}

/**
 * \brief Provider 注册表（只读）。
 *
 * 查询是同步的；落盘的实现通过 snapshot 在执行前一次性载入内存。
 */
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    fn get_provider(&self, provider_id: &str) -> Option<ProviderConfig>;
    fn all_providers(&self) -> Vec<ProviderConfig>;

    /**
     * \brief 单次执行使用的内存快照。
     * \return None 表示自身已在内存中，直接使用即可
     */
    async fn snapshot(&self) -> Option<InMemoryRegistry> {
        None
    }
}

/**
 * \brief 内存注册表，常用于测试或一次性加载的快照。
 */
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    providers: HashMap<String, ProviderConfig>,
    order: Vec<String>,
}

impl InMemoryRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            registry.insert(provider);
        }
        registry
    }

    pub fn insert(&mut self, provider: ProviderConfig) {
        if !self.providers.contains_key(&provider.provider_id) {
            self.order.push(provider.provider_id.clone());
        }
        self.providers.insert(provider.provider_id.clone(), provider);
    }
}

#[async_trait]
impl ProviderRegistry for InMemoryRegistry {
    fn get_provider(&self, provider_id: &str) -> Option<ProviderConfig> {
        self.providers.get(provider_id).cloned()
    }

    fn all_providers(&self) -> Vec<ProviderConfig> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id).cloned())
            .collect()
    }
}
