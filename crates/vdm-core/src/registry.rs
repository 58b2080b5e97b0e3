use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProviderConfig;

/// Read-only provider index, shared across requests after startup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderConfig>>,
}

impl ProviderRegistry {
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Self {
        let providers = configs
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(config)))
            .collect();
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderConfig>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// All providers, sorted by name.
    pub fn list(&self) -> Vec<Arc<ProviderConfig>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        providers
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
