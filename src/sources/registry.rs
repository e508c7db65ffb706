use std::collections::HashMap;
use std::sync::Arc;

use super::{CloudProvider, ProviderResult};
use crate::models::{CloudConfig, Source, SourceType};

/// Builds a provider client for one source
pub trait ProviderFactory: Send + Sync {
    fn build(&self, source: &Source, config: &CloudConfig) -> ProviderResult<Arc<dyn CloudProvider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&Source, &CloudConfig) -> ProviderResult<Arc<dyn CloudProvider>> + Send + Sync,
{
    fn build(&self, source: &Source, config: &CloudConfig) -> ProviderResult<Arc<dyn CloudProvider>> {
        self(source, config)
    }
}

/// Static table of provider factories per cloud source type
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: HashMap<SourceType, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a cloud type; static sources are never registered
    pub fn register(mut self, kind: SourceType, factory: impl ProviderFactory + 'static) -> Self {
        if kind.is_cloud() {
            self.factories.insert(kind, Arc::new(factory));
        }
        self
    }

    /// Register a closure as the factory for a cloud type
    pub fn register_fn<F>(self, kind: SourceType, f: F) -> Self
    where
        F: Fn(&Source, &CloudConfig) -> ProviderResult<Arc<dyn CloudProvider>>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, f)
    }

    pub fn get(&self, kind: SourceType) -> Option<&Arc<dyn ProviderFactory>> {
        self.factories.get(&kind)
    }

    /// Cloud types with a registered factory
    pub fn registered(&self) -> Vec<SourceType> {
        SourceType::ALL
            .into_iter()
            .filter(|k| self.factories.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::FakeProvider;

    #[test]
    fn test_register_ignores_static() {
        let provider: Arc<dyn CloudProvider> = Arc::new(FakeProvider::new());
        let registry = ProviderRegistry::new()
            .register_fn(SourceType::Linode, {
                let provider = provider.clone();
                move |_, _| Ok(provider.clone())
            })
            .register_fn(SourceType::Static, move |_, _| Ok(provider.clone()));

        assert_eq!(registry.registered(), vec![SourceType::Linode]);
        assert!(registry.get(SourceType::Static).is_none());
        assert!(registry.get(SourceType::DigitalOcean).is_none());
    }
}
