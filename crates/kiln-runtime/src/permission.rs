//! Permission model for plugins.
//!
//! Plugins are granted a set of permissions when they are loaded. Every
//! capability accessor checks the set before doing any work. The checks are
//! cooperative: they keep well-behaved plugins honest, they do not sandbox
//! native code.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::error::{RuntimeError, RuntimeResult};

/// A permission that a plugin can be granted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Execute shell commands through the secure runner.
    RunCommands,

    /// Read files from the active project.
    ReadFiles,

    /// Write files in the active project.
    WriteFiles,

    /// Persist changes to the plugin's global configuration.
    WriteConfig,

    /// Submit background jobs.
    SubmitJobs,

    /// Access to network.
    Network,

    /// Custom permission for extension.
    Custom(String),
}

impl Permission {
    /// Parse a permission from a string.
    pub fn parse(s: &str) -> Self {
        match s {
            "run_commands" => Permission::RunCommands,
            "read_files" => Permission::ReadFiles,
            "write_files" => Permission::WriteFiles,
            "write_config" => Permission::WriteConfig,
            "submit_jobs" => Permission::SubmitJobs,
            "network" => Permission::Network,
            other => Permission::Custom(other.to_string()),
        }
    }

    /// Convert permission to string representation.
    pub fn as_str(&self) -> &str {
        match self {
            Permission::RunCommands => "run_commands",
            Permission::ReadFiles => "read_files",
            Permission::WriteFiles => "write_files",
            Permission::WriteConfig => "write_config",
            Permission::SubmitJobs => "submit_jobs",
            Permission::Network => "network",
            Permission::Custom(s) => s,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    /// Create an empty permission set.
    pub fn new() -> Self {
        Self {
            permissions: HashSet::new(),
        }
    }

    /// Create a permission set from a list of permission strings.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let permissions = strings
            .into_iter()
            .map(|s| Permission::parse(s.as_ref()))
            .collect();
        Self { permissions }
    }

    /// Add a permission to the set.
    pub fn grant(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    /// Builder-style variant of [`PermissionSet::grant`].
    pub fn with(mut self, permission: Permission) -> Self {
        self.grant(permission);
        self
    }

    /// Check if the set contains a permission.
    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Fail with [`RuntimeError::PermissionDenied`] naming `permission` when
    /// the set does not contain it.
    pub fn require(&self, plugin_id: &str, permission: Permission) -> RuntimeResult<()> {
        if self.has(&permission) {
            return Ok(());
        }
        warn!(plugin = %plugin_id, permission = %permission, "Permission denied");
        Err(RuntimeError::PermissionDenied {
            plugin_id: plugin_id.to_string(),
            permission,
        })
    }

    /// Get all permissions in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}
