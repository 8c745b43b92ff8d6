//! Provider 注册表：纯查找组件，不含业务规则
//!
//! 保持注册顺序，使路由在配置不变时结果确定。

use std::sync::{PoisonError, RwLock};

use super::types::{ProviderCapabilities, ProviderConfig};

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<ProviderConfig>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 id upsert；返回 true 表示替换了已有配置
    pub fn register(&self, config: ProviderConfig) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        match providers.iter_mut().find(|p| p.id == config.id) {
            Some(existing) => {
                *existing = config;
                true
            }
            None => {
                tracing::debug!(provider = %config.id, "Provider registered");
                providers.push(config);
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProviderConfig> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn list_enabled(&self) -> Vec<ProviderConfig> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    pub fn find_by_capability<F>(&self, predicate: F) -> Vec<ProviderConfig>
    where
        F: Fn(&ProviderCapabilities) -> bool,
    {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| predicate(&p.capabilities))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
