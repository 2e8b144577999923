//! # kiln-daemon
//!
//! The Kiln plugin host daemon.
//!
//! This daemon is responsible for:
//! - Owning the shared plugin runtime services (event bus, circuit breakers,
//!   job manager, metrics)
//! - Handing each plugin a permission-scoped service locator
//! - Stopping jobs and releasing plugin state on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kiln-daemon                           │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Event Bus   │◄─┤ Job Manager  ├─►│   Circuit    │      │
//! │  │              │  │              │  │   Breakers   │      │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘      │
//! │         │                 │                                  │
//! │  ┌──────┴─────────────────┴───────────────────────────┐    │
//! │  │        Service Registry / Service Locators          │    │
//! │  │     (logger, runner, config, plugin event bus)      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!           ┌──────────────────┼──────────────────┐
//!           ▼                  ▼                  ▼
//!      ┌─────────┐      ┌─────────────┐    ┌──────────┐
//!      │ Plugin  │      │   Plugin    │    │   API    │
//!      │    A    │      │      B      │    │ clients  │
//!      └─────────┘      └─────────────┘    └──────────┘
//! ```
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/kiln/config.toml`.
//! A commented default file is written on first run.
//!
//! ## Running
//!
//! ```bash
//! # Start the daemon
//! cargo run --bin kiln-daemon
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin kiln-daemon
//! ```

use anyhow::Result;
use kiln_runtime::{callback, Event};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kiln_daemon::config::Config;
use kiln_daemon::runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let loaded = Config::load_default();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting kiln-daemon v{}", env!("CARGO_PKG_VERSION"));

    match &loaded {
        Ok(_) => info!("Loaded configuration from default path"),
        Err(e) => warn!("Failed to load config, using defaults: {:#}", e),
    }

    let runtime = Runtime::init(&config)?;
    let api = runtime.api();

    // Trace every event until a transport registers its own hooks.
    let trace_hook = callback(|event: &Event| {
        debug!(
            topic = %event.topic,
            source = ?event.source_plugin,
            "Event dispatched"
        );
        Ok(())
    });
    api.add_event_hook(trace_hook.clone());

    info!("Daemon startup complete");
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    api.remove_event_hook(&trace_hook);

    let cancelled = runtime.shutdown().await;
    if cancelled > 0 {
        info!("Cancelled {} running job(s)", cancelled);
    }

    info!("Daemon stopped");
    Ok(())
}
