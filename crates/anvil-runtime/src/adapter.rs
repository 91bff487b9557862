//! Validating adapter over a container engine
//!
//! The adapter turns engine-level results into the three terminal action
//! outcomes. A cancelled wait inspects the container first: one that has
//! already exited keeps its exit outcome, anything else is a timeout. The
//! container is left for the caller to remove.

use crate::engine::{ContainerEngine, ContainerSpec, RemoveOptions};
use crate::error::{Result, RuntimeError};
use anvil_crd::ActionState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static VOLUME_BINDING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9/:-]+$").expect("volume pattern is valid"));

/// Terminal result of waiting on a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    /// SUCCESS, FAILED or TIMEOUT
    pub state: ActionState,
    /// Exit code, when the container exited
    pub exit_code: Option<i64>,
    /// Human readable detail for the status report
    pub message: String,
}

impl WaitOutcome {
    fn exited(code: i64) -> Self {
        if code == 0 {
            Self {
                state: ActionState::StateSuccess,
                exit_code: Some(0),
                message: "container exited with code 0".to_string(),
            }
        } else {
            Self {
                state: ActionState::StateFailed,
                exit_code: Some(code),
                message: format!("container exited with code {}", code),
            }
        }
    }
}

/// Container adapter used by the worker
#[derive(Clone, Default)]
pub struct ContainerAdapter {
    engine: Option<Arc<dyn ContainerEngine>>,
}

impl std::fmt::Debug for ContainerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerAdapter")
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

impl ContainerAdapter {
    /// Create an adapter over an engine
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    fn engine(&self) -> Result<&Arc<dyn ContainerEngine>> {
        self.engine
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidArgument("container engine is not set".to_string()))
    }

    fn check_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "container id is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a container and return its id
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let engine = self.engine()?;
        if spec.name.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "container name is empty".to_string(),
            ));
        }
        if spec.image.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "container image is empty".to_string(),
            ));
        }
        for volume in &spec.volumes {
            validate_volume(volume)?;
        }

        let id = engine.create(spec).await?;
        debug!(container = %id, name = %spec.name, image = %spec.image, "Container created");
        Ok(id)
    }

    /// Start a created container
    pub async fn start(&self, id: &str) -> Result<()> {
        let engine = self.engine()?;
        Self::check_id(id)?;
        engine.start(id).await?;
        debug!(container = %id, "Container started");
        Ok(())
    }

    /// Wait for the container to reach a terminal outcome
    ///
    /// Only argument problems are errors; engine failures while waiting are
    /// reported as a FAILED outcome.
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<WaitOutcome> {
        let engine = self.engine()?;
        Self::check_id(id)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                match engine.inspect(id).await {
                    Ok(status) => {
                        if let Some(code) = status.terminal_exit_code() {
                            debug!(container = %id, code, "Container exited before cancellation");
                            return Ok(WaitOutcome::exited(code));
                        }
                        info!(
                            container = %id,
                            status = %status.status,
                            "Wait cancelled before container exited"
                        );
                    }
                    Err(e) => warn!(container = %id, error = %e, "Inspect after cancellation failed"),
                }
                Ok(WaitOutcome {
                    state: ActionState::StateTimeout,
                    exit_code: None,
                    message: "action timed out".to_string(),
                })
            }
            result = engine.wait_exit(id) => match result {
                Ok(code) => Ok(WaitOutcome::exited(code)),
                Err(e) => {
                    warn!(container = %id, error = %e, "Waiting on container failed");
                    Ok(WaitOutcome {
                        state: ActionState::StateFailed,
                        exit_code: None,
                        message: e.to_string(),
                    })
                }
            },
        }
    }

    /// Remove a container
    pub async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let engine = self.engine()?;
        Self::check_id(id)?;
        engine.remove(id, options).await?;
        debug!(container = %id, force = options.force, "Container removed");
        Ok(())
    }
}

/// Check a volume binding against the allowed character set
pub fn validate_volume(binding: &str) -> Result<()> {
    if VOLUME_BINDING.is_match(binding) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidArgument(format!(
            "invalid volume binding '{}'",
            binding
        )))
    }
}

/// Container name for an action of a workflow
///
/// Docker names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]*`; anything else in the
/// action name becomes a dash.
pub fn container_name(workflow_id: &str, action_name: &str) -> String {
    let action: String = action_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("anvil-{}-{}", workflow_id, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use std::time::Duration;

    fn adapter(engine: MockEngine) -> (ContainerAdapter, Arc<MockEngine>) {
        let engine = Arc::new(engine);
        (ContainerAdapter::new(engine.clone()), engine)
    }

    async fn run(adapter: &ContainerAdapter, name: &str, cancel: &CancellationToken) -> WaitOutcome {
        let id = adapter
            .create(&ContainerSpec::new(name, "alpine"))
            .await
            .unwrap();
        adapter.start(&id).await.unwrap();
        let outcome = adapter.wait(&id, cancel).await.unwrap();
        adapter.remove(&id, RemoveOptions::force()).await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_exit_zero_is_success() {
        let (adapter, _) = adapter(MockEngine::new());
        let outcome = run(&adapter, "anvil-wf-ok", &CancellationToken::new()).await;
        assert_eq!(outcome.state, ActionState::StateSuccess);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (adapter, _) = adapter(MockEngine::new().with_exit_code("killed", 137));
        let outcome = run(&adapter, "anvil-wf-killed", &CancellationToken::new()).await;
        assert_eq!(outcome.state, ActionState::StateFailed);
        assert_eq!(outcome.exit_code, Some(137));
        assert!(outcome.message.contains("137"));
    }

    #[tokio::test]
    async fn test_cancel_before_exit_is_timeout() {
        let (adapter, engine) =
            adapter(MockEngine::new().with_delay("slow", Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = run(&adapter, "anvil-wf-slow", &cancel).await;
        assert_eq!(outcome.state, ActionState::StateTimeout);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(engine.live_containers(), 0);
    }

    /// Wait once to completion, then again with an already cancelled token
    async fn wait_after_exit(adapter: &ContainerAdapter, name: &str) -> WaitOutcome {
        let id = adapter
            .create(&ContainerSpec::new(name, "alpine"))
            .await
            .unwrap();
        adapter.start(&id).await.unwrap();
        adapter.wait(&id, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = adapter.wait(&id, &cancel).await.unwrap();
        adapter.remove(&id, RemoveOptions::force()).await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_cancel_after_exit_keeps_success() {
        let (adapter, _) = adapter(MockEngine::new());
        let outcome = wait_after_exit(&adapter, "anvil-wf-ok").await;
        assert_eq!(outcome.state, ActionState::StateSuccess);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_after_exit_keeps_failure() {
        let (adapter, _) = adapter(MockEngine::new().with_exit_code("late", 3));
        let outcome = wait_after_exit(&adapter, "anvil-wf-late").await;
        assert_eq!(outcome.state, ActionState::StateFailed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_cancelled_wait_on_created_container_is_timeout() {
        let (adapter, _) = adapter(MockEngine::new());
        let id = adapter
            .create(&ContainerSpec::new("anvil-wf-idle", "alpine"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = adapter.wait(&id, &cancel).await.unwrap();
        assert_eq!(outcome.state, ActionState::StateTimeout);
    }

    #[tokio::test]
    async fn test_missing_engine_rejected() {
        let adapter = ContainerAdapter::default();
        let err = adapter
            .create(&ContainerSpec::new("a", "alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let (adapter, _) = adapter(MockEngine::new());
        let cancel = CancellationToken::new();

        assert!(matches!(
            adapter.start("").await,
            Err(RuntimeError::InvalidArgument(_))
        ));
        assert!(matches!(
            adapter.wait("", &cancel).await,
            Err(RuntimeError::InvalidArgument(_))
        ));
        assert!(matches!(
            adapter.remove("", RemoveOptions::force()).await,
            Err(RuntimeError::InvalidArgument(_))
        ));
        assert!(matches!(
            adapter.create(&ContainerSpec::new("", "alpine")).await,
            Err(RuntimeError::InvalidArgument(_))
        ));
        assert!(matches!(
            adapter.create(&ContainerSpec::new("a", "")).await,
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_volume_validation() {
        let (adapter, engine) = adapter(MockEngine::new());
        let spec = ContainerSpec::new("anvil-wf-v", "alpine").with_volume("/dev:/dev:rw");
        assert!(adapter.create(&spec).await.is_ok());

        for bad in ["", "/tmp/$(reboot):/x", "/a b:/b", "/data;rm:/d"] {
            let spec = ContainerSpec::new("anvil-wf-v", "alpine").with_volume(bad);
            assert!(
                matches!(adapter.create(&spec).await, Err(RuntimeError::InvalidArgument(_))),
                "binding '{}' should be rejected",
                bad
            );
        }
        assert_eq!(engine.created().len(), 1);
    }

    #[test]
    fn test_container_name() {
        assert_eq!(
            container_name("0190a", "stream image/v2"),
            "anvil-0190a-stream-image-v2"
        );
        assert_eq!(container_name("wf", "disk_wipe.1"), "anvil-wf-disk_wipe.1");
    }
}
