//! Runtime lifecycle.
//!
//! [`Runtime::init`] builds every shared service from the daemon
//! configuration and wires them together. Nothing is global: collaborators
//! receive the services through the [`Runtime`] accessors or the
//! [`RuntimeApi`] façade.

use anyhow::{Context, Result};
use kiln_plugin_api::{
    FileConfigStore, LogLevels, RuntimeServices, ServiceRegistry, StaticProjectRoot,
};
use kiln_runtime::{CircuitBreakerRegistry, EventBus, JobManager, MetricsCollector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::RuntimeApi;
use crate::config::Config;

/// The shared plugin runtime services of one daemon.
pub struct Runtime {
    bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    registry: Arc<ServiceRegistry>,
    cancel_grace: Duration,
    export_dir: PathBuf,
}

impl Runtime {
    /// Construct the event bus, circuit breakers, job manager, metrics
    /// collector and service registry from `config`.
    pub fn init(config: &Config) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::with_config(config.event_bus_config()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker_config()));
        let jobs = JobManager::new(
            config.job_manager_config(),
            Arc::clone(&bus),
            Arc::clone(&breakers),
        );

        let config_dir = config
            .plugin_config_dir()
            .context("Failed to resolve plugin config directory")?;
        let export_dir = config
            .export_dir()
            .context("Failed to resolve job export directory")?;

        let project_root = Arc::new(StaticProjectRoot::new(config.plugins.project_root.clone()));
        let services = RuntimeServices::new(Arc::clone(&bus), jobs)
            .with_metrics(Arc::new(MetricsCollector::new()))
            .with_log_levels(Arc::new(LogLevels::new(config.plugin_log_floor())))
            .with_config_store(Arc::new(FileConfigStore::new(
                &config_dir,
                project_root.clone(),
            )))
            .with_project_root(project_root)
            .with_runner_policy(config.runner_policy());

        info!(
            config_dir = %config_dir.display(),
            export_dir = %export_dir.display(),
            "Runtime services initialized"
        );

        Ok(Self {
            bus,
            breakers,
            registry: Arc::new(ServiceRegistry::new(Arc::new(services))),
            cancel_grace: config.job_manager_config().cancel_grace,
            export_dir,
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn jobs(&self) -> &JobManager {
        self.registry.services().jobs()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.registry.services().metrics()
    }

    /// Registry that hands out per-plugin service locators.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// API façade for collaborators such as a transport layer.
    pub fn api(&self) -> RuntimeApi {
        RuntimeApi::new(
            Arc::clone(&self.bus),
            self.jobs().clone(),
            Arc::clone(&self.breakers),
            Arc::clone(self.metrics()),
            self.export_dir.clone(),
        )
    }

    /// Stop the runtime: cancel live jobs, unload every plugin and drop all
    /// subscriptions and hooks.
    ///
    /// Returns the number of jobs that were cancelled.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.jobs().shutdown(self.cancel_grace).await;
        for plugin_id in self.registry.plugins() {
            self.registry.unload(&plugin_id);
        }
        self.bus.clear_subscriptions();

        info!(cancelled, "Runtime shut down");
        cancelled
    }
}
