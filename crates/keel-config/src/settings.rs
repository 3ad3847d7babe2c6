//! Engine settings parsing.
//!
//! Settings come from the `settings` block of a stack file and are then
//! overridden by `KEEL_*` environment variables.

use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::kdl_ext::{first_string_arg, u64_arg};
use crate::{ConfigError, ConfigResult};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum number of nodes applied at once.
    pub concurrency: usize,
    /// Directory holding the durable stores.
    pub state_dir: PathBuf,
    /// Container CLI used for build-and-push.
    pub container_tool: String,
    /// Timeout for a fingerprint scan.
    pub scan_timeout: Duration,
    /// Timeout for each build/push step.
    pub action_timeout: Duration,
    /// Timeout for a provisioning call.
    pub call_timeout: Duration,
    /// Registry login, read from the environment only.
    #[serde(skip)]
    pub registry: Option<RegistryCredentials>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            state_dir: PathBuf::from(".keel"),
            container_tool: "docker".to_string(),
            scan_timeout: Duration::from_secs(60),
            action_timeout: Duration::from_secs(1800),
            call_timeout: Duration::from_secs(300),
            registry: None,
        }
    }
}

/// Credentials for the container registry login step.
#[derive(Clone, PartialEq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Settings {
    /// Apply a `settings { ... }` block on top of the current values.
    pub fn apply_kdl(&mut self, node: &KdlNode) -> ConfigResult<()> {
        let Some(children) = node.children() else {
            return Ok(());
        };

        for child in children.nodes() {
            match child.name().value() {
                "concurrency" => {
                    self.concurrency = positive(child.name().value(), u64_arg(child)?)?;
                }
                "state-dir" => {
                    self.state_dir = first_string_arg(child)
                        .map(PathBuf::from)
                        .ok_or_else(|| ConfigError::MissingField("state-dir".to_string()))?;
                }
                "container-tool" => {
                    self.container_tool = first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("container-tool".to_string()))?;
                }
                "scan-timeout" => self.scan_timeout = seconds(child)?,
                "action-timeout" => self.action_timeout = seconds(child)?,
                "call-timeout" => self.call_timeout = seconds(child)?,
                _ => {} // Ignore unknown settings
            }
        }
        Ok(())
    }

    /// Apply `KEEL_*` environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KEEL_CONCURRENCY") {
            let n = v.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                field: "KEEL_CONCURRENCY".to_string(),
                message: e.to_string(),
            })?;
            self.concurrency = positive("KEEL_CONCURRENCY", n)?;
        }
        if let Some(v) = lookup("KEEL_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KEEL_CONTAINER_TOOL") {
            self.container_tool = v;
        }

        match (
            lookup("KEEL_REGISTRY_USERNAME"),
            lookup("KEEL_REGISTRY_PASSWORD"),
        ) {
            (Some(username), Some(password)) => {
                self.registry = Some(RegistryCredentials { username, password });
            }
            (Some(_), None) => {
                return Err(ConfigError::MissingEnv("KEEL_REGISTRY_PASSWORD".to_string()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> ConfigResult<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }
}

fn positive(field: &str, n: u64) -> ConfigResult<usize> {
    if n == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    usize::try_from(n).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn seconds(node: &KdlNode) -> ConfigResult<Duration> {
    Ok(Duration::from_secs(u64_arg(node)?))
}
