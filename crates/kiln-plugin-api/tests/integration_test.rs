//! Integration tests for kiln-plugin-api.
//!
//! These tests cover:
//! - Full plugin lifecycle: register → use capabilities → unload
//! - Config layering backed by files on disk
//! - Permission enforcement across capabilities

use kiln_plugin_api::{
    ConfigMap, FileConfigStore, LogLevel, LogLevels, Permission, PermissionSet, RunnerPolicy,
    RuntimeServices, ServiceRegistry, StaticProjectRoot,
};
use kiln_runtime::jobs::topics;
use kiln_runtime::{
    callback, CircuitBreakerRegistry, Event, EventBus, JobError, JobManager, JobManagerConfig,
    JobOutput, JobStatus, RuntimeError,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

struct Host {
    registry: ServiceRegistry,
    _config_dir: TempDir,
    project_dir: TempDir,
}

fn host(allowlist: Option<Vec<&str>>) -> Host {
    let config_dir = TempDir::new().unwrap();
    let project_dir = TempDir::new().unwrap();
    let project_root = Arc::new(StaticProjectRoot::new(Some(project_dir.path().to_path_buf())));

    let bus = Arc::new(EventBus::new());
    let jobs = JobManager::new(
        JobManagerConfig::default(),
        Arc::clone(&bus),
        Arc::new(CircuitBreakerRegistry::default()),
    );
    let services = RuntimeServices::new(bus, jobs)
        .with_log_levels(Arc::new(LogLevels::new(LogLevel::Info)))
        .with_config_store(Arc::new(FileConfigStore::new(
            config_dir.path(),
            project_root.clone(),
        )))
        .with_project_root(project_root)
        .with_runner_policy(RunnerPolicy {
            allowlist: allowlist.map(|prefixes| prefixes.into_iter().map(String::from).collect()),
            ..Default::default()
        });

    Host {
        registry: ServiceRegistry::new(Arc::new(services)),
        _config_dir: config_dir,
        project_dir,
    }
}

fn write_project_override(project: &Path, plugin_id: &str, content: &str) {
    let dir = project.join(".kiln/plugins");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.toml", plugin_id)), content).unwrap();
}

fn defaults(value: Value) -> ConfigMap {
    match value {
        Value::Object(map) => map,
        _ => panic!("defaults must be an object"),
    }
}

// ==============================================================================
// Lifecycle
// ==============================================================================

#[tokio::test]
async fn test_plugin_lifecycle() {
    let host = host(None);
    let services = Arc::clone(host.registry.services());
    let finished = Arc::new(Mutex::new(Vec::<Event>::new()));
    let sink = Arc::clone(&finished);
    services.event_bus().subscribe(
        topics::COMPLETED,
        callback(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }),
        None,
    );

    let locator = host.registry.register(
        "indexer",
        PermissionSet::from_strings(["submit_jobs", "run_commands"]),
        defaults(json!({"batch": 10})),
    );

    // Capabilities
    locator.get_logger().info("starting");
    assert_eq!(locator.get_config().get("batch"), Some(json!(10)));
    let output = locator.get_runner().run("pwd", None, None).await.unwrap();
    assert!(output.success());

    // Jobs are attributed to the plugin and announced on the bus.
    let id = locator
        .submit_job(
            "index",
            |ctx| async move {
                ctx.progress(50);
                Ok::<_, JobError>(JobOutput::from(json!({"indexed": 3})))
            },
            None,
        )
        .unwrap();
    let job = services.jobs().wait(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    {
        let finished = finished.lock().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].source_plugin.as_deref(), Some("indexer"));
    }

    // Unload clears everything the runtime kept for the plugin.
    locator
        .get_event_bus()
        .subscribe("repo.changed", callback(|_event: &Event| Ok(())));
    let report = host.registry.unload("indexer");
    assert!(report.had_locator);
    assert_eq!(report.subscriptions_removed, 1);
    assert!(host.registry.plugins().is_empty());
    assert_eq!(services.event_bus().subscriber_count("repo.changed"), 0);
}

#[tokio::test]
async fn test_unload_cancels_live_jobs() {
    let host = host(None);
    let locator = host.registry.register(
        "watcher",
        PermissionSet::new().with(Permission::SubmitJobs),
        ConfigMap::new(),
    );

    let id = locator
        .submit_job(
            "watch",
            |ctx| async move {
                ctx.cancelled().await;
                Ok::<_, JobError>(JobOutput::Empty)
            },
            None,
        )
        .unwrap();

    let report = host.registry.unload("watcher");
    assert_eq!(report.jobs_cancelled, 1);

    let jobs = host.registry.services().jobs();
    assert_eq!(jobs.wait(&id).await.unwrap().status, JobStatus::Cancelled);
}

// ==============================================================================
// Configuration
// ==============================================================================

#[test]
fn test_config_layers_from_disk() {
    let host = host(None);
    write_project_override(
        host.project_dir.path(),
        "fmt",
        "[style]\nindent = 2\n",
    );

    let locator = host.registry.register(
        "fmt",
        PermissionSet::new().with(Permission::WriteConfig),
        defaults(json!({"style": {"indent": 4, "quotes": "double"}})),
    );
    let config = locator.get_config();
    config.set_global("style.quotes", json!("single")).unwrap();

    assert_eq!(config.get_as::<u32>("style.indent").unwrap(), Some(2));
    assert_eq!(config.get("style.quotes"), Some(json!("single")));
    assert_eq!(
        config.all(),
        json!({"style": {"indent": 2, "quotes": "single"}})
    );
}

// ==============================================================================
// Permissions
// ==============================================================================

#[tokio::test]
async fn test_capabilities_enforce_permissions() {
    let host = host(Some(vec!["git "]));
    let locator = host
        .registry
        .register("viewer", PermissionSet::new(), ConfigMap::new());

    let err = locator.get_runner().run("git status", None, None).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::PermissionDenied { permission: Permission::RunCommands, .. }
    ));

    let err = locator.get_config().set_global("a", json!(1)).unwrap_err();
    assert!(err.to_string().contains("write_config"));

    let err = locator
        .submit_job("x", |_ctx| async { Ok::<_, JobError>(JobOutput::Empty) }, None)
        .unwrap_err();
    assert!(err.to_string().contains("viewer"));
}

#[tokio::test]
async fn test_allowlist_applies_to_every_plugin() {
    let host = host(Some(vec!["echo "]));
    let locator = host.registry.register(
        "shell",
        PermissionSet::new().with(Permission::RunCommands),
        ConfigMap::new(),
    );

    let output = locator.get_runner().run("echo ok", None, None).await.unwrap();
    assert_eq!(output.stdout.trim(), "ok");

    let err = locator.get_runner().run("curl example.com", None, None).await.unwrap_err();
    assert!(matches!(err, RuntimeError::CommandNotAllowed { .. }));
}
