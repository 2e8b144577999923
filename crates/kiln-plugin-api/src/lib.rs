//! # kiln-plugin-api
//!
//! Capability layer between Kiln plugins and the shared runtime services.
//!
//! Each loaded plugin gets a [`ServiceLocator`] scoped to its identity. The
//! locator hands out:
//!
//! - a [`PluginLogger`] whose level is bounded by a global floor
//! - a [`SecureRunner`] for permission-checked shell commands
//! - a [`ConfigProxy`] merging defaults, global and project configuration
//! - a [`PluginEventBus`] that tags emitted events with the plugin id
//!
//! Locators are created and torn down through the [`ServiceRegistry`].
//!
//! ## Security Model
//!
//! Plugins are granted a [`PermissionSet`] at load time and every capability
//! checks it before acting. The checks are cooperative and do not sandbox
//! native code.

pub mod bus;
pub mod config;
pub mod locator;
pub mod logger;
pub mod registry;
pub mod runner;

pub use bus::PluginEventBus;
pub use config::{ConfigMap, ConfigProxy, ConfigStore, FileConfigStore, MemoryConfigStore};
pub use kiln_runtime::{Permission, PermissionSet};
pub use locator::{RuntimeServices, ServiceLocator};
pub use logger::{LogLevel, LogLevels, PluginLogger};
pub use registry::{ServiceRegistry, UnloadReport};
pub use runner::{CommandOutput, ProjectRootResolver, RunnerPolicy, SecureRunner, StaticProjectRoot};
