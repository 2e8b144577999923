//! Execution context handed to job handlers.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::JobError;
use crate::serializable::JobOutput;

/// Cooperative cancellation signal shared between the manager and a handler.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) type ProgressFn = Arc<dyn Fn(i64) + Send + Sync>;

/// Handle given to a running handler: identity, progress reporting and
/// the cancellation signal.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    plugin_id: Option<String>,
    cancel: CancelToken,
    progress: ProgressFn,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        plugin_id: Option<String>,
        cancel: CancelToken,
        progress: ProgressFn,
    ) -> Self {
        Self {
            job_id,
            plugin_id,
            cancel,
            progress,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    /// Report progress; values are clamped to 0..=100.
    pub fn progress(&self, percent: i64) {
        (self.progress)(percent);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("plugin_id", &self.plugin_id)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Unit of work a plugin can implement instead of passing a closure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
