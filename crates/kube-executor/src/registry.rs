//! Executor registration table
//!
//! Built once by the composition root and handed to whatever dispatches
//! jobs; there is no process-wide registry.

use crate::cluster::ClusterClient;
use crate::error::{Error, Result};
use crate::executor::{Executor, KubernetesExecutor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Name the Kubernetes executor registers under
pub const KUBERNETES_EXECUTOR: &str = "kubernetes";

/// Job features an executor can honour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeaturesInfo {
    pub variables: bool,
    pub image: bool,
    pub services: bool,
    pub artifacts: bool,
    pub cache: bool,
}

/// Creates executors of one kind
pub trait ExecutorProvider: Send + Sync {
    /// Fresh executor for one job
    fn create(&self) -> Box<dyn Executor>;

    /// Features advertised to the framework
    fn features(&self) -> FeaturesInfo;

    /// Job option keys this executor understands
    fn supported_options(&self) -> &'static [&'static str];
}

/// Provider for [`KubernetesExecutor`]
#[derive(Clone, Default)]
pub struct KubernetesProvider {
    client: Option<Arc<dyn ClusterClient>>,
}

impl KubernetesProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one client across every executor this provider creates
    #[must_use]
    pub fn with_client(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client: Some(client),
        }
    }
}

impl ExecutorProvider for KubernetesProvider {
    fn create(&self) -> Box<dyn Executor> {
        match &self.client {
            Some(client) => Box::new(KubernetesExecutor::with_client(client.clone())),
            None => Box::new(KubernetesExecutor::new()),
        }
    }

    fn features(&self) -> FeaturesInfo {
        FeaturesInfo {
            variables: true,
            image: true,
            services: true,
            artifacts: true,
            cache: true,
        }
    }

    fn supported_options(&self) -> &'static [&'static str] {
        &["image", "services", "artifacts", "cache"]
    }
}

/// Executors available to the job framework, by name
#[derive(Default)]
pub struct ExecutorRegistry {
    providers: BTreeMap<String, Arc<dyn ExecutorProvider>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing the Kubernetes executor
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(KUBERNETES_EXECUTOR, Arc::new(KubernetesProvider::new()));
        registry
    }

    /// Add or replace a provider
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ExecutorProvider>) {
        let name = name.into();
        debug!(executor = %name, "Registering executor provider");
        self.providers.insert(name, provider);
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&Arc<dyn ExecutorProvider>> {
        self.providers.get(name)
    }

    /// New executor instance for `name`
    pub fn create(&self, name: &str) -> Result<Box<dyn Executor>> {
        self.provider(name)
            .map(|p| p.create())
            .ok_or_else(|| Error::Config(format!("executor '{name}' is not registered")))
    }

    /// Registered executor names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_kubernetes() {
        let registry = ExecutorRegistry::with_defaults();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["kubernetes"]);

        let provider = registry.provider(KUBERNETES_EXECUTOR).unwrap();
        let features = provider.features();
        assert!(features.variables && features.image && features.services);
        assert!(features.artifacts && features.cache);
        assert_eq!(
            provider.supported_options(),
            &["image", "services", "artifacts", "cache"]
        );
    }

    #[test]
    fn unknown_executor_is_a_config_error() {
        let registry = ExecutorRegistry::new();
        let err = registry.create("docker").err().unwrap();
        assert!(err.to_string().contains("'docker' is not registered"));
    }
}
