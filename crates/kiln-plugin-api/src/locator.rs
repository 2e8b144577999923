//! Per-plugin service locator.
//!
//! A [`ServiceLocator`] is built once per plugin when it loads. It carries the
//! plugin's identity and permissions and hands out capability objects that
//! are created lazily and kept for the locator's lifetime.

use kiln_runtime::{
    EventBus, JobContext, JobError, JobHandler, JobManager, JobOutput, MetricsCollector,
    Permission, PermissionSet, RuntimeResult, Serializable,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::bus::PluginEventBus;
use crate::config::{ConfigMap, ConfigProxy, ConfigStore, MemoryConfigStore};
use crate::logger::{LogLevels, PluginLogger};
use crate::runner::{ProjectRootResolver, RunnerPolicy, SecureRunner, StaticProjectRoot};

/// Shared host services every locator draws from.
pub struct RuntimeServices {
    bus: Arc<EventBus>,
    jobs: JobManager,
    metrics: Arc<MetricsCollector>,
    log_levels: Arc<LogLevels>,
    config_store: Arc<dyn ConfigStore>,
    project_root: Arc<dyn ProjectRootResolver>,
    runner_policy: RunnerPolicy,
}

impl RuntimeServices {
    /// Services around an existing bus and job manager. Everything else
    /// starts from defaults: in-memory config, no project, no allow-list.
    pub fn new(bus: Arc<EventBus>, jobs: JobManager) -> Self {
        Self {
            bus,
            jobs,
            metrics: Arc::new(MetricsCollector::new()),
            log_levels: Arc::new(LogLevels::default()),
            config_store: Arc::new(MemoryConfigStore::new()),
            project_root: Arc::new(StaticProjectRoot::default()),
            runner_policy: RunnerPolicy::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_log_levels(mut self, log_levels: Arc<LogLevels>) -> Self {
        self.log_levels = log_levels;
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = store;
        self
    }

    pub fn with_project_root(mut self, resolver: Arc<dyn ProjectRootResolver>) -> Self {
        self.project_root = resolver;
        self
    }

    pub fn with_runner_policy(mut self, policy: RunnerPolicy) -> Self {
        self.runner_policy = policy;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn log_levels(&self) -> &Arc<LogLevels> {
        &self.log_levels
    }

    pub fn project_root(&self) -> &Arc<dyn ProjectRootResolver> {
        &self.project_root
    }
}

/// Capability façade scoped to one plugin.
pub struct ServiceLocator {
    plugin_id: String,
    permissions: PermissionSet,
    config_defaults: ConfigMap,
    services: Arc<RuntimeServices>,
    logger: OnceLock<PluginLogger>,
    runner: OnceLock<SecureRunner>,
    config: OnceLock<ConfigProxy>,
}

impl ServiceLocator {
    pub fn new(
        plugin_id: impl Into<String>,
        permissions: PermissionSet,
        config_defaults: ConfigMap,
        services: Arc<RuntimeServices>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            config_defaults,
            services,
            logger: OnceLock::new(),
            runner: OnceLock::new(),
            config: OnceLock::new(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.permissions.has(permission)
    }

    /// Fail with `PermissionDenied` naming `permission` if it is not held.
    pub fn require_permission(&self, permission: Permission) -> RuntimeResult<()> {
        self.permissions.require(&self.plugin_id, permission)
    }

    pub fn get_logger(&self) -> &PluginLogger {
        self.logger.get_or_init(|| {
            PluginLogger::new(&self.plugin_id, Arc::clone(&self.services.log_levels))
        })
    }

    /// Command runner. The `run_commands` check happens on every `run`.
    pub fn get_runner(&self) -> &SecureRunner {
        self.runner.get_or_init(|| {
            SecureRunner::new(
                &self.plugin_id,
                self.permissions.clone(),
                self.services.runner_policy.clone(),
                Arc::clone(&self.services.project_root),
            )
        })
    }

    pub fn get_config(&self) -> &ConfigProxy {
        self.config.get_or_init(|| {
            debug!(plugin = %self.plugin_id, "Building plugin config view");
            ConfigProxy::new(
                &self.plugin_id,
                self.permissions.clone(),
                self.config_defaults.clone(),
                Arc::clone(&self.services.config_store),
            )
        })
    }

    pub fn get_event_bus(&self) -> PluginEventBus {
        PluginEventBus::new(&self.plugin_id, Arc::clone(&self.services.bus))
    }

    /// Submit a job attributed to this plugin. Requires `submit_jobs`.
    pub fn submit_job<F, Fut>(
        &self,
        name: &str,
        handler: F,
        metadata: Option<Map<String, Value>>,
    ) -> RuntimeResult<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        self.require_permission(Permission::SubmitJobs)?;
        self.services
            .jobs
            .submit(name, handler, Some(&self.plugin_id), metadata)
    }

    pub fn submit_handler(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        metadata: Option<Map<String, Value>>,
    ) -> RuntimeResult<String> {
        self.require_permission(Permission::SubmitJobs)?;
        self.services
            .jobs
            .submit_handler(name, handler, Some(&self.plugin_id), metadata)
    }

    /// Cancel one of this plugin's own jobs.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let owned = self
            .services
            .jobs
            .get(job_id)
            .is_some_and(|job| job.plugin_id.as_deref() == Some(self.plugin_id.as_str()));
        owned && self.services.jobs.cancel(job_id)
    }

    pub fn record_metric(&self, name: &str, value: &dyn Serializable) {
        self.services.metrics.record(&self.plugin_id, name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogLevel;
    use kiln_runtime::{CircuitBreakerRegistry, JobManagerConfig, JobStatus, RuntimeError};
    use serde_json::json;

    fn services() -> Arc<RuntimeServices> {
        let bus = Arc::new(EventBus::new());
        let jobs = JobManager::new(
            JobManagerConfig::default(),
            Arc::clone(&bus),
            Arc::new(CircuitBreakerRegistry::default()),
        );
        Arc::new(
            RuntimeServices::new(bus, jobs)
                .with_log_levels(Arc::new(LogLevels::new(LogLevel::Warn))),
        )
    }

    fn locator(permissions: PermissionSet) -> ServiceLocator {
        let defaults = match json!({"depth": 3}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        ServiceLocator::new("scanner", permissions, defaults, services())
    }

    #[test]
    fn test_capabilities_are_memoized() {
        let locator = locator(PermissionSet::new());
        assert!(std::ptr::eq(locator.get_logger(), locator.get_logger()));
        assert!(std::ptr::eq(locator.get_config(), locator.get_config()));
        assert!(std::ptr::eq(locator.get_runner(), locator.get_runner()));
        assert_eq!(locator.get_config().get("depth"), Some(json!(3)));
    }

    #[test]
    fn test_logger_respects_global_floor() {
        let locator = locator(PermissionSet::new());
        let logger = locator.get_logger();
        logger.set_level(LogLevel::Debug);
        assert!(!logger.is_enabled(LogLevel::Debug));
        assert!(!logger.is_enabled(LogLevel::Info));
        assert!(logger.is_enabled(LogLevel::Error));
    }

    #[test]
    fn test_require_permission_names_missing_permission() {
        let locator = locator(PermissionSet::new().with(Permission::ReadFiles));
        assert!(locator.has_permission(&Permission::ReadFiles));
        assert!(locator.require_permission(Permission::ReadFiles).is_ok());

        let err = locator
            .require_permission(Permission::WriteFiles)
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PermissionDenied { ref plugin_id, permission: Permission::WriteFiles }
                if plugin_id == "scanner"
        ));
    }

    #[tokio::test]
    async fn test_submit_job_is_attributed_and_gated() {
        let denied = locator(PermissionSet::new());
        assert!(matches!(
            denied.submit_job("scan", |_ctx| async { Ok::<_, JobError>(JobOutput::Empty) }, None),
            Err(RuntimeError::PermissionDenied { .. })
        ));

        let locator = locator(PermissionSet::new().with(Permission::SubmitJobs));
        let id = locator
            .submit_job("scan", |_ctx| async { Ok::<_, JobError>(JobOutput::Empty) }, None)
            .unwrap();
        let job = locator.services.jobs.wait(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.plugin_id.as_deref(), Some("scanner"));
        assert!(!locator.cancel_job(&id));
    }

    #[test]
    fn test_record_metric_is_scoped() {
        let locator = locator(PermissionSet::new());
        locator.record_metric("files", &json!(12));
        assert_eq!(
            locator.services.metrics.get("scanner", "files").unwrap().value,
            json!(12)
        );
    }
}
