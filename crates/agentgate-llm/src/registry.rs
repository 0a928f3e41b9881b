use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::ProviderAdapter;
use crate::select::{pick_provider, Provider};

/// Immutable provider-binding table, built once at startup. Lookups take
/// no lock; the table never changes after wiring.
#[derive(Clone, Default)]
pub struct Registry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    pub fn adapter(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Select a provider for the model and look up its adapter. `None`
    /// means the identity is known but no binding is configured.
    pub fn resolve(&self, model: &str) -> (Provider, Option<Arc<dyn ProviderAdapter>>) {
        let provider = pick_provider(model);
        (provider, self.adapter(provider))
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.adapters.keys().copied().collect();
        providers.sort_by_key(|provider| provider.as_str());
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
