//! Docker engine driven through the `docker` CLI

use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, RemoveOptions};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Container engine that shells out to a Docker-compatible CLI
///
/// Any binary that accepts the Docker command surface works (`docker`,
/// `podman`, `nerdctl`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Use a specific CLI binary
    pub fn new(binary: impl Into<String>) -> Result<Self> {
        let binary = binary.into();
        if binary.trim().is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "container CLI binary is empty".to_string(),
            ));
        }
        Ok(Self { binary })
    }

    /// Binary in use
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        debug!(binary = %self.binary, ?args, "Running container CLI");

        // A cancelled `docker wait` must not outlive the future
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::engine(operation, format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(RuntimeError::NotFound(stderr.trim().to_string()));
            }
            return Err(RuntimeError::engine(operation, stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments for `docker create`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(pid) = &spec.pid {
        args.push("--pid".to_string());
        args.push(pid.clone());
    }

    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }

    let mut env: Vec<_> = spec.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Arguments for `docker rm`
///
/// `remove_links` maps to `--link`, which removes the named link rather than
/// a container.
pub fn remove_args(id: &str, options: RemoveOptions) -> Vec<String> {
    let mut args = vec!["rm".to_string()];
    if options.force {
        args.push("--force".to_string());
    }
    if options.remove_links {
        args.push("--link".to_string());
    }
    if options.remove_volumes {
        args.push("--volumes".to_string());
    }
    args.push(id.to_string());
    args
}

fn parse_status(output: &str) -> Result<ContainerStatus> {
    let mut parts = output.split_whitespace();
    let status = parts
        .next()
        .ok_or_else(|| RuntimeError::engine("inspect", "empty inspect output"))?
        .to_string();
    let exit_code = match status.as_str() {
        "exited" | "dead" => parts.next().and_then(|c| c.parse().ok()),
        _ => None,
    };
    Ok(ContainerStatus { status, exit_code })
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.run("create", &create_args(spec)).await?;
        // Pull progress can precede the id on stdout
        id.lines()
            .last()
            .map(str::to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RuntimeError::engine("create", "no container id returned"))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run("start", &["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn wait_exit(&self, id: &str) -> Result<i64> {
        let output = self
            .run("wait", &["wait".to_string(), id.to_string()])
            .await?;
        output
            .parse()
            .map_err(|_| RuntimeError::engine("wait", format!("unexpected exit code '{}'", output)))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        let output = self
            .run(
                "inspect",
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                    id.to_string(),
                ],
            )
            .await?;
        parse_status(&output)
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()> {
        self.run("remove", &remove_args(id, options)).await.map(|_| ())
    }
}
