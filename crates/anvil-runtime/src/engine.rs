//! Container engine abstraction

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Everything needed to create one action container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command override; empty uses the image default
    pub command: Vec<String>,
    /// Volume bindings (`host:container[:mode]`)
    pub volumes: Vec<String>,
    /// Environment variables
    pub environment: HashMap<String, String>,
    /// PID namespace mode
    pub pid: Option<String>,
}

impl ContainerSpec {
    /// Create a spec from a name and image
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the command
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Add a volume binding
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the PID namespace mode
    pub fn with_pid(mut self, pid: Option<String>) -> Self {
        self.pid = pid;
        self
    }
}

/// Options for removing a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOptions {
    /// Kill the container if it is still running
    pub force: bool,
    /// Remove a legacy link instead of a container; the id must then name
    /// the link (`/parent/alias`), so plain container ids leave this off
    pub remove_links: bool,
    /// Remove anonymous volumes associated with the container
    pub remove_volumes: bool,
}

impl RemoveOptions {
    /// Force removal including anonymous volumes
    pub fn force() -> Self {
        Self {
            force: true,
            remove_links: false,
            remove_volumes: true,
        }
    }
}

/// Container status as reported by inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Engine status string ("created", "running", "exited", ...)
    pub status: String,
    /// Exit code once the container has exited
    pub exit_code: Option<i64>,
}

impl ContainerStatus {
    /// Whether the container is still running
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Exit code of a container that has stopped for good
    pub fn terminal_exit_code(&self) -> Option<i64> {
        match self.status.as_str() {
            "exited" | "dead" => self.exit_code,
            _ => None,
        }
    }
}

/// Low-level container operations
///
/// Implementations only talk to the engine; argument validation and outcome
/// classification live in [`crate::ContainerAdapter`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for logging
    fn name(&self) -> &str;

    /// Create a container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container
    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container exits and return its exit code
    async fn wait_exit(&self, id: &str) -> Result<i64>;

    /// Inspect the container
    async fn inspect(&self, id: &str) -> Result<ContainerStatus>;

    /// Remove the container
    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = ContainerSpec::new("anvil-wipe", "alpine")
            .with_command(vec!["wipefs".to_string(), "-a".to_string()])
            .with_volume("/dev:/dev")
            .with_env("DEST_DISK", "/dev/sda")
            .with_pid(Some("host".to_string()));

        assert_eq!(spec.command.len(), 2);
        assert_eq!(spec.volumes, vec!["/dev:/dev"]);
        assert_eq!(spec.environment["DEST_DISK"], "/dev/sda");
        assert_eq!(spec.pid.as_deref(), Some("host"));
    }

    #[test]
    fn test_remove_options() {
        let opts = RemoveOptions::force();
        assert!(opts.force);
        assert!(opts.remove_volumes);
        assert!(!opts.remove_links);
        assert!(!RemoveOptions::default().force);
    }

    #[test]
    fn test_terminal_exit_code() {
        let status = |s: &str, code| ContainerStatus {
            status: s.to_string(),
            exit_code: code,
        };
        assert_eq!(status("exited", Some(0)).terminal_exit_code(), Some(0));
        assert_eq!(status("dead", Some(137)).terminal_exit_code(), Some(137));
        assert_eq!(status("running", Some(0)).terminal_exit_code(), None);
        assert_eq!(status("exited", None).terminal_exit_code(), None);
    }
}
