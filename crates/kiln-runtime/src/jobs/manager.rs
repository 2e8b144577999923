use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::{CancelToken, JobContext, JobHandler};
use super::export::{self, ExportFormat, JobExport};
use super::{topics, Job, JobError, JobStats, JobStatus};
use crate::circuit::CircuitBreakerRegistry;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event_bus::EventBus;
use crate::serializable::JobOutput;

/// Job manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    /// Terminal jobs retained before the oldest are evicted.
    pub max_history: usize,
    /// Upper bound on concurrently running handlers. `None` is unbounded.
    pub max_concurrent: Option<usize>,
    /// How long a cancelled handler may keep running before it is aborted.
    pub cancel_grace: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            max_concurrent: None,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

struct JobEntry {
    job: Job,
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
    /// This job was admitted as its plugin's half-open trial.
    holds_trial: bool,
    /// Snapshot published once the terminal event has been delivered.
    settled: watch::Sender<Option<Job>>,
}

impl JobEntry {
    fn is_settled(&self) -> bool {
        self.settled.borrow().is_some()
    }
}

struct QueuedEvent {
    job_id: String,
    topic: &'static str,
    payload: Value,
    source: Option<String>,
    terminal: bool,
}

impl QueuedEvent {
    fn for_job(job: &Job, topic: &'static str, extra: Value, terminal: bool) -> Self {
        let mut payload = Map::new();
        payload.insert("job_id".into(), json!(job.id));
        payload.insert("name".into(), json!(job.name));
        payload.insert("plugin_id".into(), json!(job.plugin_id));
        if let Value::Object(extra) = extra {
            payload.extend(extra);
        }
        Self {
            job_id: job.id.clone(),
            topic,
            payload: Value::Object(payload),
            source: job.plugin_id.clone(),
            terminal,
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    /// Submission order, used for listing.
    order: VecDeque<String>,
    /// Settled jobs in the order they settled, used for eviction.
    finished: VecDeque<String>,
    /// Lifecycle events waiting to be emitted, in transition order.
    outbox: VecDeque<QueuedEvent>,
    draining: bool,
}

impl JobTable {
    fn unique_id(&self) -> String {
        loop {
            let candidate: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
            if !self.jobs.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Drop the earliest settled jobs beyond `max_history`.
    ///
    /// Only settled jobs are candidates, so a job is never evicted before
    /// its waiters have seen the terminal snapshot.
    fn evict(&mut self, max_history: usize) {
        if self.finished.len() <= max_history {
            return;
        }

        while self.finished.len() > max_history {
            let Some(id) = self.finished.pop_front() else {
                break;
            };
            self.jobs.remove(&id);
            if let Some(position) = self.order.iter().position(|queued| *queued == id) {
                self.order.remove(position);
            }
        }
        debug!(max_history, "Evicted settled jobs from history");
    }
}

struct Inner {
    config: JobManagerConfig,
    bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    table: Mutex<JobTable>,
    slots: Option<Arc<Semaphore>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit queued lifecycle events without holding the table lock.
    ///
    /// Only one caller drains at a time, so events reach the bus in the
    /// order their transitions were recorded.
    fn flush_events(&self) {
        {
            let mut table = self.lock();
            if table.draining {
                return;
            }
            table.draining = true;
        }

        loop {
            let event = {
                let mut table = self.lock();
                match table.outbox.pop_front() {
                    Some(event) => event,
                    None => {
                        table.draining = false;
                        break;
                    }
                }
            };

            self.bus
                .emit(event.topic, event.payload, event.source.as_deref());

            if event.terminal {
                self.settle(&event.job_id);
            }
        }
    }

    /// Publish the terminal snapshot to waiters, then apply history limits.
    fn settle(&self, job_id: &str) {
        let mut table = self.lock();
        let Some(entry) = table.jobs.get(job_id) else {
            return;
        };
        entry.settled.send_replace(Some(entry.job.clone()));
        table.finished.push_back(job_id.to_string());
        table.evict(self.config.max_history);
    }

    /// Move a pending job to running. `None` if it was cancelled meanwhile.
    fn start(&self, job_id: &str) -> Option<Job> {
        let job = {
            let mut table = self.lock();
            let entry = table.jobs.get_mut(job_id)?;
            if entry.job.status != JobStatus::Pending {
                return None;
            }
            entry.job.status = JobStatus::Running;
            entry.job.started_at = Some(Utc::now());
            let job = entry.job.clone();
            let event = QueuedEvent::for_job(&job, topics::STARTED, json!({}), false);
            table.outbox.push_back(event);
            job
        };

        debug!(job_id = %job_id, name = %job.name, "Job started");
        self.flush_events();
        Some(job)
    }

    fn report_progress(&self, job_id: &str, percent: i64) {
        let percent = percent.clamp(0, 100) as u8;
        {
            let mut table = self.lock();
            let Some(entry) = table.jobs.get_mut(job_id) else {
                return;
            };
            if entry.job.status != JobStatus::Running {
                return;
            }
            entry.job.progress = percent;
            let event = QueuedEvent::for_job(
                &entry.job,
                topics::PROGRESS,
                json!({ "progress": percent }),
                false,
            );
            table.outbox.push_back(event);
        }
        self.flush_events();
    }

    /// Move a running job to cancelled.
    ///
    /// Returns `true` when the job was cancelled here or is still pending,
    /// in which case its task finishes the transition. Returns `false` for
    /// unknown and terminal jobs.
    fn cancel_running(&self, job_id: &str) -> bool {
        let released = {
            let mut table = self.lock();
            let Some(entry) = table.jobs.get_mut(job_id) else {
                return false;
            };
            match entry.job.status {
                JobStatus::Running => {}
                JobStatus::Pending => return true,
                _ => return false,
            }

            entry.job.status = JobStatus::Cancelled;
            entry.job.completed_at = Some(Utc::now());
            let event = QueuedEvent::for_job(
                &entry.job,
                topics::CANCELLED,
                json!({ "progress": entry.job.progress }),
                true,
            );
            let released = entry
                .job
                .plugin_id
                .clone()
                .filter(|_| entry.holds_trial);
            table.outbox.push_back(event);
            released
        };

        // A cancelled trial yields no verdict; the next admitted job is the new trial.
        if let Some(plugin_id) = released {
            self.breakers.release(&plugin_id);
        }
        info!(job_id = %job_id, "Job cancelled");
        self.flush_events();
        true
    }

    /// Record what the handler returned.
    fn finish(&self, job_id: &str, result: Result<JobOutput, JobError>) {
        let (succeeded, plugin_id, trial) = {
            let mut table = self.lock();
            let Some(entry) = table.jobs.get_mut(job_id) else {
                return;
            };
            let trial = entry.holds_trial;
            let job = &mut entry.job;

            if job.status == JobStatus::Cancelled {
                // Already terminal; keep whatever the handler returned within grace.
                if let Ok(output) = result {
                    if let Some(value) = output.into_value() {
                        job.result = Some(value);
                    }
                }
                return;
            }

            job.completed_at = Some(Utc::now());
            let (event, succeeded) = match result {
                Ok(output) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.result = output.into_value();
                    info!(job_id = %job.id, name = %job.name, "Job completed");
                    let extra = json!({ "result": job.result });
                    (QueuedEvent::for_job(job, topics::COMPLETED, extra, true), true)
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.message);
                    job.error_type = err.error_type;
                    warn!(
                        job_id = %job.id,
                        name = %job.name,
                        error = ?job.error,
                        "Job failed"
                    );
                    let extra = json!({ "error": job.error, "error_type": job.error_type });
                    (QueuedEvent::for_job(job, topics::FAILED, extra, true), false)
                }
            };

            let plugin_id = job.plugin_id.clone();
            table.outbox.push_back(event);
            (succeeded, plugin_id, trial)
        };

        if let Some(plugin_id) = plugin_id.as_deref() {
            if succeeded {
                self.breakers.record_success(plugin_id, trial);
            } else {
                self.breakers.record_failure(plugin_id, trial);
            }
        }
        self.flush_events();
    }
}

/// Owns every job record and drives handlers on the tokio runtime.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        config: JobManagerConfig,
        bus: Arc<EventBus>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let slots = config
            .max_concurrent
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                breakers,
                table: Mutex::new(JobTable::default()),
                slots,
            }),
        }
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    /// Submit `handler` for background execution and return the new job id.
    ///
    /// Fails with [`RuntimeError::CircuitOpen`] when the plugin's breaker
    /// refuses admission, and with [`RuntimeError::NoAsyncRuntime`] outside a
    /// tokio runtime. Handler failures never surface here; they are recorded
    /// on the job.
    pub fn submit<F, Fut>(
        &self,
        name: &str,
        handler: F,
        plugin_id: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> RuntimeResult<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        let runtime =
            Handle::try_current().map_err(|_| RuntimeError::NoAsyncRuntime(name.to_string()))?;

        let holds_trial = match plugin_id {
            Some(plugin_id) => self.inner.breakers.acquire(plugin_id)?,
            None => false,
        };

        let cancel = CancelToken::new();
        let job_id = {
            let mut table = self.inner.lock();
            let job_id = table.unique_id();
            let job = Job::new(job_id.clone(), name, plugin_id, metadata.unwrap_or_default());
            table.jobs.insert(
                job_id.clone(),
                JobEntry {
                    job,
                    cancel: cancel.clone(),
                    task: None,
                    holds_trial,
                    settled: watch::channel(None).0,
                },
            );
            table.order.push_back(job_id.clone());
            job_id
        };

        info!(job_id = %job_id, name = %name, plugin = ?plugin_id, "Job submitted");

        let task = runtime.spawn(run_job(
            Arc::clone(&self.inner),
            job_id.clone(),
            cancel,
            handler,
        ));
        if let Some(entry) = self.inner.lock().jobs.get_mut(&job_id) {
            entry.task = Some(task);
        }

        Ok(job_id)
    }

    /// Submit a [`JobHandler`] implementation.
    pub fn submit_handler(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        plugin_id: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> RuntimeResult<String> {
        self.submit(
            name,
            move |ctx| async move { handler.run(ctx).await },
            plugin_id,
            metadata,
        )
    }

    /// Record progress for a running job; ignored in any other state.
    pub fn report_progress(&self, job_id: &str, percent: i64) {
        self.inner.report_progress(job_id, percent);
    }

    /// Cancel a pending or running job.
    ///
    /// Returns `false` for unknown or already terminal jobs, and for a
    /// pending job whose cancellation was already requested. A running job
    /// becomes `cancelled` immediately; a pending job is moved through
    /// `running` to `cancelled` by its task without invoking the handler.
    pub fn cancel(&self, job_id: &str) -> bool {
        let token = {
            let table = self.inner.lock();
            match table.jobs.get(job_id) {
                Some(entry) if !entry.job.is_terminal() && !entry.cancel.is_cancelled() => {
                    entry.cancel.clone()
                }
                _ => return false,
            }
        };

        token.cancel();
        let cancelled = self.inner.cancel_running(job_id);
        if cancelled {
            info!(job_id = %job_id, "Job cancellation requested");
        }
        cancelled
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().jobs.get(job_id).map(|entry| entry.job.clone())
    }

    /// Jobs in submission order, optionally filtered by status and plugin.
    pub fn list(&self, status: Option<JobStatus>, plugin_id: Option<&str>) -> Vec<Job> {
        let table = self.inner.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .map(|entry| &entry.job)
            .filter(|job| status.map_or(true, |status| job.status == status))
            .filter(|job| plugin_id.map_or(true, |plugin| job.plugin_id.as_deref() == Some(plugin)))
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> JobStats {
        let table = self.inner.lock();
        let mut stats = JobStats::default();
        for entry in table.jobs.values() {
            stats.count(entry.job.status);
        }
        stats
    }

    /// Remove every settled job. Returns how many were removed.
    pub fn clear_history(&self) -> usize {
        let mut table = self.inner.lock();
        let before = table.jobs.len();
        table.jobs.retain(|_, entry| !entry.is_settled());
        let JobTable {
            jobs,
            order,
            finished,
            ..
        } = &mut *table;
        order.retain(|id| jobs.contains_key(id));
        finished.clear();
        let removed = before - jobs.len();
        debug!(removed, "Cleared job history");
        removed
    }

    /// Wait until the job's terminal event has been emitted.
    ///
    /// The job is returned even if it has been evicted from history since.
    pub async fn wait(&self, job_id: &str) -> RuntimeResult<Job> {
        let mut settled = {
            let table = self.inner.lock();
            let entry = table
                .jobs
                .get(job_id)
                .ok_or_else(|| RuntimeError::JobNotFound(job_id.to_string()))?;
            entry.settled.subscribe()
        };

        let snapshot = settled
            .wait_for(|job| job.is_some())
            .await
            .map_err(|_| RuntimeError::JobNotFound(job_id.to_string()))?
            .clone();

        // The live record may carry a result returned within the cancel grace.
        self.get(job_id)
            .or(snapshot)
            .ok_or_else(|| RuntimeError::JobNotFound(job_id.to_string()))
    }

    /// Export one job. With a path the snapshot is written there (format
    /// picked from the extension); without one the snapshot is returned.
    pub fn export_job(&self, job_id: &str, path: Option<&Path>) -> RuntimeResult<JobExport> {
        let job = self
            .get(job_id)
            .ok_or_else(|| RuntimeError::JobNotFound(job_id.to_string()))?;
        let record = export::job_record(&job)?;

        match path {
            Some(path) => {
                export::write_document(path, &record, ExportFormat::from_path(path))?;
                info!(job_id = %job_id, path = %path.display(), "Exported job");
                Ok(JobExport::Written(path.to_path_buf()))
            }
            None => Ok(JobExport::Data(record)),
        }
    }

    /// Export every matching job as `{total_jobs, jobs}`.
    pub fn export_jobs(
        &self,
        path: &Path,
        status: Option<JobStatus>,
        plugin_id: Option<&str>,
        format: ExportFormat,
    ) -> RuntimeResult<PathBuf> {
        let jobs = self.list(status, plugin_id);
        let document = export::jobs_document(&jobs)?;
        export::write_document(path, &document, format)?;
        info!(count = jobs.len(), path = %path.display(), "Exported jobs");
        Ok(path.to_path_buf())
    }

    /// Cancel every live job and wait up to `grace` for their tasks to end.
    ///
    /// Returns the number of jobs that were cancelled.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let (live, tasks): (Vec<String>, Vec<JoinHandle<()>>) = {
            let mut table = self.inner.lock();
            let live = table
                .order
                .iter()
                .filter(|id| table.jobs.get(*id).is_some_and(|entry| !entry.job.is_terminal()))
                .cloned()
                .collect();
            let tasks = table
                .jobs
                .values_mut()
                .filter_map(|entry| entry.task.take())
                .collect();
            (live, tasks)
        };

        let cancelled = live.iter().filter(|id| self.cancel(id)).count();

        let deadline = tokio::time::Instant::now() + grace;
        for task in tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("Job tasks still running after shutdown grace period");
                break;
            }
        }

        info!(cancelled, "Job manager shut down");
        cancelled
    }
}

async fn run_job<F, Fut>(inner: Arc<Inner>, job_id: String, cancel: CancelToken, handler: F)
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
{
    let _permit = match inner.slots.clone() {
        Some(slots) => tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = slots.acquire_owned() => permit.ok(),
        },
        None => None,
    };

    let Some(job) = inner.start(&job_id) else {
        return;
    };
    if cancel.is_cancelled() {
        inner.cancel_running(&job_id);
        return;
    }

    let progress_inner = Arc::clone(&inner);
    let progress_id = job_id.clone();
    let ctx = JobContext::new(
        job_id.clone(),
        job.plugin_id.clone(),
        cancel.clone(),
        Arc::new(move |percent| progress_inner.report_progress(&progress_id, percent)),
    );

    // Separate task so a panicking handler surfaces as a JoinError.
    let mut work = tokio::spawn(async move { handler(ctx).await });

    let joined = tokio::select! {
        joined = &mut work => Some(joined),
        _ = cancel.cancelled() => None,
    };

    let joined = match joined {
        Some(joined) => joined,
        None => {
            // The token can also be fired through the handler's own context.
            inner.cancel_running(&job_id);
            match tokio::time::timeout(inner.config.cancel_grace, &mut work).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(job_id = %job_id, "Handler ignored cancellation, aborting");
                    work.abort();
                    return;
                }
            }
        }
    };

    let result = joined.map_err(|join_error| {
        error!(job_id = %job_id, error = %join_error, "Job handler crashed");
        crash_error(join_error)
    })
    .and_then(|result| result);
    inner.finish(&job_id, result);
}

fn crash_error(error: JoinError) -> JobError {
    if !error.is_panic() {
        return JobError::new("handler task was aborted").with_type("JoinError");
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    JobError::new(message).with_type("panic")
}
