//! Transport-neutral API façade over the runtime services.
//!
//! Every method returns JSON-compatible values so a transport (JSON-RPC,
//! HTTP, a local socket) can forward them without further mapping.

use anyhow::{Context, Result};
use chrono::Utc;
use kiln_runtime::{
    CircuitBreakerRegistry, EventBus, EventCallback, ExportFormat, JobExport, JobManager,
    JobStatus, MetricsCollector,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Read and control access to jobs, events and breakers.
#[derive(Clone)]
pub struct RuntimeApi {
    bus: Arc<EventBus>,
    jobs: JobManager,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsCollector>,
    export_dir: PathBuf,
}

fn parse_status(status: Option<&str>) -> Result<Option<JobStatus>> {
    status
        .map(|s| JobStatus::parse(s).with_context(|| format!("Unknown job status: {}", s)))
        .transpose()
}

impl RuntimeApi {
    pub fn new(
        bus: Arc<EventBus>,
        jobs: JobManager,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsCollector>,
        export_dir: PathBuf,
    ) -> Self {
        Self {
            bus,
            jobs,
            breakers,
            metrics,
            export_dir,
        }
    }

    // ==========================================================================
    // Jobs
    // ==========================================================================

    /// Jobs in submission order, filtered by status name and plugin.
    pub fn list_jobs(&self, status: Option<&str>, plugin_id: Option<&str>) -> Result<Value> {
        let status = parse_status(status)?;
        let jobs = self.jobs.list(status, plugin_id);
        Ok(serde_json::to_value(jobs)?)
    }

    /// Full snapshot of one job, including `duration_ms`.
    pub fn get_job(&self, job_id: &str) -> Result<Value> {
        match self.jobs.export_job(job_id, None)? {
            JobExport::Data(record) => Ok(record),
            JobExport::Written(path) => Ok(json!({ "path": path })),
        }
    }

    pub fn cancel_job(&self, job_id: &str) -> Value {
        json!({ "job_id": job_id, "cancelled": self.jobs.cancel(job_id) })
    }

    /// Export one job to `path`, or return its snapshot when no path is given.
    pub fn export_job(&self, job_id: &str, path: Option<&Path>) -> Result<Value> {
        match self.jobs.export_job(job_id, path)? {
            JobExport::Written(path) => Ok(json!({ "job_id": job_id, "path": path })),
            JobExport::Data(record) => Ok(record),
        }
    }

    /// Export matching jobs to a file.
    ///
    /// Without a path the document goes to a timestamped file in the export
    /// directory. Without a format name it is inferred from the path.
    pub fn export_jobs(
        &self,
        path: Option<&Path>,
        status: Option<&str>,
        plugin_id: Option<&str>,
        format: Option<&str>,
    ) -> Result<Value> {
        let status = parse_status(status)?;
        let format = match format {
            Some(name) => Some(
                ExportFormat::parse(name)
                    .with_context(|| format!("Unknown export format: {}", name))?,
            ),
            None => None,
        };

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let extension = match format.unwrap_or_default() {
                    ExportFormat::Json => "json",
                    ExportFormat::Yaml => "yaml",
                };
                self.export_dir.join(format!(
                    "jobs-{}.{}",
                    Utc::now().format("%Y%m%d-%H%M%S"),
                    extension
                ))
            }
        };
        let format = format.unwrap_or_else(|| ExportFormat::from_path(&path));

        let written = self.jobs.export_jobs(&path, status, plugin_id, format)?;
        Ok(json!({ "path": written, "format": format }))
    }

    pub fn job_stats(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.jobs.get_stats())?)
    }

    // ==========================================================================
    // Events
    // ==========================================================================

    /// Newest `limit` events, oldest first, optionally for one topic.
    pub fn event_history(&self, topic: Option<&str>, limit: usize) -> Result<Value> {
        Ok(serde_json::to_value(self.bus.get_history(topic, limit))?)
    }

    /// Register an external propagation sink.
    pub fn add_event_hook(&self, hook: EventCallback) {
        self.bus.add_websocket_hook(hook);
        debug!("Event hook registered");
    }

    pub fn remove_event_hook(&self, hook: &EventCallback) -> bool {
        self.bus.remove_websocket_hook(hook)
    }

    // ==========================================================================
    // Breakers and metrics
    // ==========================================================================

    pub fn circuit_states(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.breakers.snapshots())?)
    }

    /// Close a plugin's breaker by hand. Returns whether one existed.
    pub fn reset_circuit(&self, plugin_id: &str) -> bool {
        self.breakers.reset(plugin_id)
    }

    pub fn metrics(&self, plugin_id: Option<&str>) -> Value {
        self.metrics.snapshot(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::{callback, CircuitBreakerConfig, Event, JobError, JobManagerConfig, JobOutput};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn api(export_dir: &Path) -> RuntimeApi {
        let bus = Arc::new(EventBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }));
        let jobs = JobManager::new(
            JobManagerConfig::default(),
            Arc::clone(&bus),
            Arc::clone(&breakers),
        );
        RuntimeApi::new(
            bus,
            jobs,
            breakers,
            Arc::new(MetricsCollector::new()),
            export_dir.to_path_buf(),
        )
    }

    async fn finished_job(api: &RuntimeApi, plugin_id: &str, fail: bool) -> String {
        let id = api
            .jobs
            .submit(
                "task",
                move |_ctx| async move {
                    if fail {
                        Err(JobError::new("bad input"))
                    } else {
                        Ok(JobOutput::from(json!({"ok": true})))
                    }
                },
                Some(plugin_id),
                None,
            )
            .unwrap();
        api.jobs.wait(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_list_and_get_jobs() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        let ok = finished_job(&api, "a", false).await;
        finished_job(&api, "b", true).await;

        let all = api.list_jobs(None, None).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        let failed = api.list_jobs(Some("failed"), None).unwrap();
        assert_eq!(failed[0]["plugin_id"], json!("b"));
        assert_eq!(failed[0]["error"], json!("bad input"));

        let job = api.get_job(&ok).unwrap();
        assert_eq!(job["status"], json!("completed"));
        assert!(job["duration_ms"].is_number());

        assert!(api.list_jobs(Some("sleeping"), None).is_err());
        assert!(api.get_job("missing").is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_stats() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        let id = finished_job(&api, "a", false).await;

        assert_eq!(api.cancel_job(&id)["cancelled"], json!(false));
        let stats = api.job_stats().unwrap();
        assert_eq!(stats["total"], json!(1));
        assert_eq!(stats["completed"], json!(1));
    }

    #[tokio::test]
    async fn test_export_jobs_to_default_dir() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        finished_job(&api, "a", false).await;

        let result = api.export_jobs(None, None, None, Some("yaml")).unwrap();
        assert_eq!(result["format"], json!("yaml"));
        let path = PathBuf::from(result["path"].as_str().unwrap());
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().unwrap(), "yaml");

        let document: Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["total_jobs"], json!(1));

        assert!(api.export_jobs(None, None, None, Some("xml")).is_err());
    }

    #[tokio::test]
    async fn test_export_single_job() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        let id = finished_job(&api, "a", false).await;

        let data = api.export_job(&id, None).unwrap();
        assert_eq!(data["id"], json!(id));

        let target = dir.path().join("one.json");
        let written = api.export_job(&id, Some(&target)).unwrap();
        assert_eq!(written["path"], json!(target));
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_circuit_states_and_reset() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        finished_job(&api, "flaky", true).await;

        let states = api.circuit_states().unwrap();
        assert_eq!(states[0]["plugin_id"], json!("flaky"));
        assert_eq!(states[0]["state"], json!("open"));

        assert!(api.reset_circuit("flaky"));
        assert_eq!(api.circuit_states().unwrap()[0]["state"], json!("closed"));
    }

    #[test]
    fn test_event_hooks_and_history() {
        let dir = TempDir::new().unwrap();
        let api = api(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook = callback(move |event: &Event| {
            sink.lock().unwrap().push(event.topic.clone());
            Ok(())
        });

        api.add_event_hook(Arc::clone(&hook));
        api.bus.emit("file.saved", json!({"path": "a.rs"}), Some("fmt"));
        assert!(api.remove_event_hook(&hook));
        api.bus.emit("file.saved", json!({"path": "b.rs"}), None);

        assert_eq!(*seen.lock().unwrap(), vec!["file.saved".to_string()]);

        let history = api.event_history(Some("file.saved"), 1).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["payload"]["path"], json!("b.rs"));
    }
}
