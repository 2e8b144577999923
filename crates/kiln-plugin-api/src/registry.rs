//! Registry of service locators for loaded plugins.
//!
//! The registry builds one locator per plugin and tears down everything the
//! runtime holds for a plugin when it unloads.

use kiln_runtime::PermissionSet;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::config::ConfigMap;
use crate::locator::{RuntimeServices, ServiceLocator};

/// What [`ServiceRegistry::unload`] cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// A locator was registered for the plugin.
    pub had_locator: bool,
    pub subscriptions_removed: usize,
    pub jobs_cancelled: usize,
    pub metrics_cleared: usize,
}

/// Builds and caches one [`ServiceLocator`] per plugin id.
pub struct ServiceRegistry {
    services: Arc<RuntimeServices>,
    locators: RwLock<HashMap<String, Arc<ServiceLocator>>>,
}

impl ServiceRegistry {
    pub fn new(services: Arc<RuntimeServices>) -> Self {
        Self {
            services,
            locators: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    /// Locator for `plugin_id`, created on first call.
    ///
    /// A plugin that is already registered keeps its original permissions
    /// and defaults; unload it first to change them.
    pub fn register(
        &self,
        plugin_id: &str,
        permissions: PermissionSet,
        config_defaults: ConfigMap,
    ) -> Arc<ServiceLocator> {
        let mut locators = self.locators.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locators.get(plugin_id) {
            warn!(plugin = %plugin_id, "Plugin already registered, reusing its locator");
            return Arc::clone(existing);
        }

        let locator = Arc::new(ServiceLocator::new(
            plugin_id,
            permissions,
            config_defaults,
            Arc::clone(&self.services),
        ));
        locators.insert(plugin_id.to_string(), Arc::clone(&locator));
        info!(plugin = %plugin_id, "Registered plugin services");
        locator
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<ServiceLocator>> {
        self.locators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .cloned()
    }

    /// Ids of all registered plugins, sorted.
    pub fn plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .locators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Release everything the runtime holds for `plugin_id`.
    ///
    /// Drops the locator, removes the plugin's subscriptions, cancels its
    /// live jobs, resets its circuit breaker and forgets its log level and
    /// metrics. Safe to call for plugins that were never registered.
    pub fn unload(&self, plugin_id: &str) -> UnloadReport {
        let had_locator = self
            .locators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id)
            .is_some();

        let services = &self.services;
        let subscriptions_removed = services.event_bus().unsubscribe_plugin(plugin_id);

        let jobs = services.jobs();
        let jobs_cancelled = jobs
            .list(None, Some(plugin_id))
            .iter()
            .filter(|job| !job.is_terminal())
            .filter(|job| jobs.cancel(&job.id))
            .count();

        jobs.circuit_breakers().reset(plugin_id);
        services.log_levels().clear_plugin(plugin_id);
        let metrics_cleared = services.metrics().clear_plugin(plugin_id);

        let report = UnloadReport {
            had_locator,
            subscriptions_removed,
            jobs_cancelled,
            metrics_cleared,
        };
        info!(plugin = %plugin_id, report = ?report, "Unloaded plugin services");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::{
        callback, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Event, EventBus,
        JobManager, JobManagerConfig, Permission,
    };
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ServiceRegistry {
        let bus = Arc::new(EventBus::new());
        let jobs = JobManager::new(
            JobManagerConfig::default(),
            Arc::clone(&bus),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            })),
        );
        ServiceRegistry::new(Arc::new(RuntimeServices::new(bus, jobs)))
    }

    #[test]
    fn test_register_returns_cached_locator() {
        let registry = registry();
        let first = registry.register("a", PermissionSet::new(), ConfigMap::new());
        let second = registry.register(
            "a",
            PermissionSet::new().with(Permission::RunCommands),
            ConfigMap::new(),
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.has_permission(&Permission::RunCommands));
        assert_eq!(registry.plugins(), vec!["a".to_string()]);
    }

    #[test]
    fn test_unload_unknown_plugin_is_harmless() {
        let registry = registry();
        assert_eq!(registry.unload("ghost"), UnloadReport::default());
    }

    #[tokio::test]
    async fn test_unload_releases_plugin_state() {
        let registry = registry();
        let locator = registry.register(
            "flaky",
            PermissionSet::new().with(Permission::SubmitJobs),
            ConfigMap::new(),
        );

        let bus = locator.get_event_bus();
        bus.subscribe("x", callback(|_event: &Event| Ok(())));
        bus.subscribe(kiln_runtime::WILDCARD, callback(|_event: &Event| Ok(())));
        locator.record_metric("runs", &json!(1));

        let id = locator
            .submit_job(
                "boom",
                |_ctx| async { Err::<kiln_runtime::JobOutput, _>(kiln_runtime::JobError::new("x")) },
                None,
            )
            .unwrap();
        let services = Arc::clone(registry.services());
        services.jobs().wait(&id).await.unwrap();
        assert_eq!(
            services.jobs().circuit_breakers().get_state("flaky"),
            CircuitState::Open
        );

        let report = registry.unload("flaky");
        assert!(report.had_locator);
        assert_eq!(report.subscriptions_removed, 2);
        assert_eq!(report.metrics_cleared, 1);
        assert!(registry.get("flaky").is_none());
        assert_eq!(
            services.jobs().circuit_breakers().get_state("flaky"),
            CircuitState::Closed
        );
    }
}
