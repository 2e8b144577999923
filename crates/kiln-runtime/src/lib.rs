//! # kiln-runtime
//!
//! Shared runtime services for Kiln plugins.
//!
//! This crate provides:
//! - An in-process topic event bus with history, pause/resume and
//!   external propagation hooks
//! - Per-plugin circuit breakers that gate job admission
//! - A background job manager with progress, cooperative cancellation and
//!   JSON/YAML export
//! - A per-plugin metrics collector
//!
//! ## Wiring
//!
//! Nothing here is global. The host constructs one [`EventBus`], one
//! [`CircuitBreakerRegistry`] and one [`JobManager`] and hands them to
//! whatever needs them:
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_runtime::{CircuitBreakerRegistry, EventBus, JobManager, JobManagerConfig};
//!
//! let bus = Arc::new(EventBus::new());
//! let breakers = Arc::new(CircuitBreakerRegistry::default());
//! let jobs = JobManager::new(JobManagerConfig::default(), bus, breakers);
//! # let _ = jobs;
//! ```
//!
//! Job lifecycle transitions are published on the bus under the topics in
//! [`jobs::topics`].

pub mod circuit;
pub mod error;
pub mod event_bus;
pub mod jobs;
pub mod metrics;
pub mod permission;
pub mod serializable;

pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use error::{RuntimeError, RuntimeResult};
pub use event_bus::{callback, Event, EventBus, EventBusConfig, EventCallback, Subscription, WILDCARD};
pub use jobs::{
    CancelToken, ExportFormat, Job, JobContext, JobError, JobExport, JobHandler, JobManager,
    JobManagerConfig, JobStats, JobStatus,
};
pub use metrics::{MetricValue, MetricsCollector};
pub use permission::{Permission, PermissionSet};
pub use serializable::{JobOutput, Serializable};
