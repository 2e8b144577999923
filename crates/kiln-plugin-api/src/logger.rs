//! Plugin-scoped logging.
//!
//! Every plugin logs through `tracing` with a `[plugin:<id>]` prefix. The
//! level that actually applies is `max(global_floor, plugin_level)`: the
//! floor can silence a plugin, but a plugin can never ask for more verbosity
//! than the floor allows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, trace, warn};

/// Log level for plugin logging, ordered from most to least verbose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Case-insensitive; accepts `warning` and `critical` as aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "critical" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct LevelState {
    floor: LogLevel,
    plugins: HashMap<String, LogLevel>,
}

/// Global floor plus the levels individual plugins asked for.
#[derive(Debug)]
pub struct LogLevels {
    state: RwLock<LevelState>,
}

impl LogLevels {
    pub fn new(floor: LogLevel) -> Self {
        Self {
            state: RwLock::new(LevelState {
                floor,
                plugins: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LevelState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LevelState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn floor(&self) -> LogLevel {
        self.read().floor
    }

    pub fn set_floor(&self, floor: LogLevel) {
        self.write().floor = floor;
        debug!(floor = %floor, "Plugin log floor changed");
    }

    pub fn plugin_level(&self, plugin_id: &str) -> Option<LogLevel> {
        self.read().plugins.get(plugin_id).copied()
    }

    pub fn set_plugin_level(&self, plugin_id: &str, level: LogLevel) {
        self.write().plugins.insert(plugin_id.to_string(), level);
    }

    /// Forget the plugin's requested level. Returns whether one was set.
    pub fn clear_plugin(&self, plugin_id: &str) -> bool {
        self.write().plugins.remove(plugin_id).is_some()
    }

    pub fn effective(&self, plugin_id: &str) -> LogLevel {
        let state = self.read();
        match state.plugins.get(plugin_id) {
            Some(level) => (*level).max(state.floor),
            None => state.floor,
        }
    }
}

impl Default for LogLevels {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

/// Logger handed to one plugin.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
    levels: Arc<LogLevels>,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>, levels: Arc<LogLevels>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            levels,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Request a level for this plugin. The floor still applies.
    pub fn set_level(&self, level: LogLevel) {
        self.levels.set_plugin_level(&self.plugin_id, level);
    }

    pub fn effective_level(&self) -> LogLevel {
        self.levels.effective(&self.plugin_id)
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level >= self.effective_level()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.is_enabled(level) {
            return;
        }
        let plugin = self.plugin_id.as_str();
        match level {
            LogLevel::Trace => trace!(plugin = %plugin, "[plugin:{}] {}", plugin, message),
            LogLevel::Debug => debug!(plugin = %plugin, "[plugin:{}] {}", plugin, message),
            LogLevel::Info => info!(plugin = %plugin, "[plugin:{}] {}", plugin, message),
            LogLevel::Warn => warn!(plugin = %plugin, "[plugin:{}] {}", plugin, message),
            LogLevel::Error => error!(plugin = %plugin, "[plugin:{}] {}", plugin, message),
        }
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}
