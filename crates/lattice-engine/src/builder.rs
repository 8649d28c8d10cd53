//! Builder pattern for the view processor.

use std::sync::Arc;

use dashmap::DashMap;

use lattice_traits::{EngineConfig, EntitlementSource, FunctionRegistry};

use crate::error::EngineError;
use crate::executor::{executor_for, DependencyGraphExecutor};
use crate::graph::GraphCompiler;
use crate::permission::{permission_provider_for, ViewPermissionProvider};
use crate::process::ProcessResources;
use crate::processor::ViewProcessor;

/// Builder for constructing a [`ViewProcessor`].
pub struct ViewProcessorBuilder {
    config: Option<EngineConfig>,
    registry: Option<Arc<dyn FunctionRegistry>>,
    executor: Option<Arc<dyn DependencyGraphExecutor>>,
    permission: Option<Arc<dyn ViewPermissionProvider>>,
    entitlements: Option<Arc<dyn EntitlementSource>>,
}

impl ViewProcessorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
            executor: None,
            permission: None,
            entitlements: None,
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the function registry.
    pub fn with_function_registry(mut self, registry: Arc<dyn FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this executor instead of the one the configuration names.
    pub fn with_executor(mut self, executor: Arc<dyn DependencyGraphExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use this permission provider instead of the configured policy.
    pub fn with_permission_provider(mut self, provider: Arc<dyn ViewPermissionProvider>) -> Self {
        self.permission = Some(provider);
        self
    }

    /// Set the entitlement source used by the entitlement policy.
    pub fn with_entitlements(mut self, source: Arc<dyn EntitlementSource>) -> Self {
        self.entitlements = Some(source);
        self
    }

    /// Build the view processor.
    pub fn build(self) -> Result<ViewProcessor, EngineError> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| EngineError::ConfigError(e.to_string()))?;

        let registry = self
            .registry
            .ok_or_else(|| EngineError::ConfigError("function_registry not configured".into()))?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => executor_for(&config.executor)?,
        };

        let permission = match self.permission {
            Some(permission) => permission,
            None => permission_provider_for(config.permission, self.entitlements)?,
        };

        let resources = ProcessResources {
            compiler: Arc::new(GraphCompiler::new(registry, config.graph_cache_size)),
            executor,
            cycles: Arc::new(DashMap::new()),
            cycle_retention: config.cycle_retention,
            cycle_notice_capacity: config.cycle_notice_capacity,
        };

        tracing::debug!(
            name = %config.name,
            executor = resources.executor.name(),
            permission = permission.name(),
            "View processor built"
        );
        Ok(ViewProcessor::new(config, resources, permission))
    }
}

impl Default for ViewProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_traits::{ExecutorStrategy, PermissionPolicy};

    use crate::function::FunctionRepository;

    fn registry() -> Arc<dyn FunctionRegistry> {
        Arc::new(FunctionRepository::new())
    }

    #[test]
    fn test_registry_required() {
        assert!(matches!(
            ViewProcessorBuilder::new().build(),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_executor_from_config() {
        let config = EngineConfig {
            executor: ExecutorStrategy::JobDispatch { calc_nodes: 2 },
            ..Default::default()
        };
        let processor = ViewProcessorBuilder::new()
            .with_config(config)
            .with_function_registry(registry())
            .build()
            .unwrap();
        assert_eq!(processor.permission_provider().name(), "permissive");
        assert!(!processor.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            cycle_retention: 0,
            ..Default::default()
        };
        assert!(matches!(
            ViewProcessorBuilder::new()
                .with_config(config)
                .with_function_registry(registry())
                .build(),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_entitlement_policy_needs_source() {
        let config = EngineConfig {
            permission: PermissionPolicy::Entitlement,
            ..Default::default()
        };
        assert!(ViewProcessorBuilder::new()
            .with_config(config.clone())
            .with_function_registry(registry())
            .build()
            .is_err());

        let source = |_: &lattice_traits::UserPrincipal,
                      _: &lattice_traits::ComputationTarget|
         -> Result<bool, lattice_traits::TraitError> { Ok(true) };
        let processor = ViewProcessorBuilder::new()
            .with_config(config)
            .with_function_registry(registry())
            .with_entitlements(Arc::new(source))
            .build()
            .unwrap();
        assert_eq!(processor.permission_provider().name(), "entitlement");
    }
}
