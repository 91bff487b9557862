//! In-memory container engine for tests
//!
//! Behaviour is keyed by container name suffix: the worker names action
//! containers `anvil-<workflow>-<action>` and hook containers
//! `anvil-<workflow>-<action>-on-failure` / `-on-timeout`, so `"wipe"`
//! selects the action container and `"wipe-on-failure"` its hook.

use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, RemoveOptions};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Scripted outcome for matching containers
#[derive(Debug, Clone, Default)]
pub struct MockBehaviour {
    /// Exit code returned by `wait_exit`
    pub exit_code: i64,
    /// How long the container "runs" before exiting
    pub delay: Duration,
    /// Fail the create call
    pub fail_create: bool,
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    status: String,
    exit_code: Option<i64>,
}

/// Container engine that never touches a real runtime
#[derive(Default)]
pub struct MockEngine {
    rules: Vec<(String, MockBehaviour)>,
    default: MockBehaviour,
    containers: Mutex<HashMap<String, MockContainer>>,
    created: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
}

impl MockEngine {
    /// Engine where every container exits 0 immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit code for containers whose name ends with `suffix`
    pub fn with_exit_code(mut self, suffix: impl Into<String>, code: i64) -> Self {
        self.rule(suffix.into()).exit_code = code;
        self
    }

    /// Run time for containers whose name ends with `suffix`
    pub fn with_delay(mut self, suffix: impl Into<String>, delay: Duration) -> Self {
        self.rule(suffix.into()).delay = delay;
        self
    }

    /// Make create fail for containers whose name ends with `suffix`
    pub fn with_create_error(mut self, suffix: impl Into<String>) -> Self {
        self.rule(suffix.into()).fail_create = true;
        self
    }

    fn rule(&mut self, suffix: String) -> &mut MockBehaviour {
        let pos = match self.rules.iter().position(|(s, _)| *s == suffix) {
            Some(pos) => pos,
            None => {
                self.rules.push((suffix, MockBehaviour::default()));
                self.rules.len() - 1
            }
        };
        &mut self.rules[pos].1
    }

    /// Longest matching suffix wins, so hook rules beat action rules
    fn behaviour(&self, name: &str) -> &MockBehaviour {
        self.rules
            .iter()
            .filter(|(suffix, _)| name.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, b)| b)
            .unwrap_or(&self.default)
    }

    /// Specs of every container created so far, in order
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Ids of every container removed so far
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of containers that exist right now
    pub fn live_containers(&self) -> usize {
        self.containers.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn with_container<T>(
        &self,
        operation: &'static str,
        id: &str,
        f: impl FnOnce(&mut MockContainer) -> Result<T>,
    ) -> Result<T> {
        let mut containers = self
            .containers
            .lock()
            .map_err(|e| RuntimeError::engine(operation, e.to_string()))?;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        f(container)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.behaviour(&spec.name).fail_create {
            return Err(RuntimeError::engine("create", "scripted create failure"));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        self.containers
            .lock()
            .map_err(|e| RuntimeError::engine("create", e.to_string()))?
            .insert(
                id.clone(),
                MockContainer {
                    spec: spec.clone(),
                    status: "created".to_string(),
                    exit_code: None,
                },
            );
        self.created
            .lock()
            .map_err(|e| RuntimeError::engine("create", e.to_string()))?
            .push(spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.with_container("start", id, |c| {
            c.status = "running".to_string();
            Ok(())
        })
    }

    async fn wait_exit(&self, id: &str) -> Result<i64> {
        let name = self.with_container("wait", id, |c| Ok(c.spec.name.clone()))?;
        let behaviour = self.behaviour(&name).clone();

        tokio::time::sleep(behaviour.delay).await;

        self.with_container("wait", id, |c| {
            c.status = "exited".to_string();
            c.exit_code = Some(behaviour.exit_code);
            Ok(behaviour.exit_code)
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        self.with_container("inspect", id, |c| {
            Ok(ContainerStatus {
                status: c.status.clone(),
                exit_code: c.exit_code,
            })
        })
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let running = self.with_container("remove", id, |c| Ok(c.status == "running"))?;
        if running && !options.force {
            return Err(RuntimeError::engine(
                "remove",
                "cannot remove a running container without force",
            ));
        }

        self.containers
            .lock()
            .map_err(|e| RuntimeError::engine("remove", e.to_string()))?
            .remove(id);
        self.removed
            .lock()
            .map_err(|e| RuntimeError::engine("remove", e.to_string()))?
            .push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = MockEngine::new().with_exit_code("wipe", 3);
        let id = engine
            .create(&ContainerSpec::new("anvil-wf-wipe", "alpine"))
            .await
            .unwrap();
        assert_eq!(engine.inspect(&id).await.unwrap().status, "created");

        engine.start(&id).await.unwrap();
        assert!(engine.inspect(&id).await.unwrap().is_running());

        assert_eq!(engine.wait_exit(&id).await.unwrap(), 3);
        let status = engine.inspect(&id).await.unwrap();
        assert_eq!(status.exit_code, Some(3));

        engine.remove(&id, RemoveOptions::default()).await.unwrap();
        assert_eq!(engine.removed(), vec![id]);
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_longest_suffix_wins() {
        let engine = MockEngine::new()
            .with_exit_code("wipe", 1)
            .with_exit_code("wipe-on-failure", 0);
        assert_eq!(engine.behaviour("anvil-wf-wipe").exit_code, 1);
        assert_eq!(engine.behaviour("anvil-wf-wipe-on-failure").exit_code, 0);
        assert_eq!(engine.behaviour("anvil-wf-other").exit_code, 0);
    }

    #[tokio::test]
    async fn test_running_container_needs_force() {
        let engine = MockEngine::new();
        let id = engine
            .create(&ContainerSpec::new("anvil-wf-a", "alpine"))
            .await
            .unwrap();
        engine.start(&id).await.unwrap();

        assert!(engine.remove(&id, RemoveOptions::default()).await.is_err());
        engine.remove(&id, RemoveOptions::force()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_error() {
        let engine = MockEngine::new().with_create_error("broken");
        let err = engine
            .create(&ContainerSpec::new("anvil-wf-broken", "alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Engine { operation: "create", .. }));
        assert!(engine.created().is_empty());
    }
}
