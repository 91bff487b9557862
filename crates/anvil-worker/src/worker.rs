//! Worker execution loop
//!
//! The worker polls the orchestrator for contexts addressed to it and runs
//! one execution fiber per workflow in a [`JoinSet`]. A fiber walks the
//! action list from the context's next action, reporting IN_PROGRESS before
//! and the terminal state after each container run, and stops at the first
//! action that does not belong to this worker, fails, or times out.
//!
//! All fibers share the worker's [`CancellationToken`]. Cancelling it stops
//! polling, aborts running containers without reporting them, and waits for
//! every fiber to return.

use crate::client::OrchestratorClient;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use anvil_crd::{ActionState, ActionStatusReport, WorkflowAction, WorkflowContext};
use anvil_runtime::{container_name, ContainerAdapter, ContainerSpec, RemoveOptions, WaitOutcome};
use anvil_workflow::ErrorCode;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mount point of the shared data directory inside action containers
pub const DATA_MOUNT: &str = "/workflow";

/// File inside the shared directory holding the workflow data
pub const DATA_FILE: &str = "data";

/// Why an execution fiber returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// The last action succeeded
    Completed,
    /// The next action belongs to another worker
    HandedOff { next_worker: String },
    /// An action failed or timed out; the workflow stays in that state
    Stopped { action: String, state: ActionState },
    /// The worker is shutting down
    Cancelled,
    /// The context kept moving away from this worker's view
    Abandoned { reason: String },
}

/// Shared data directory state of one workflow
struct SharedData {
    dir: PathBuf,
    last: Vec<u8>,
}

impl SharedData {
    fn file(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn binding(&self) -> String {
        format!("{}:{}", self.dir.display(), DATA_MOUNT)
    }
}

/// The per-machine worker
#[derive(Clone)]
pub struct Worker {
    client: Arc<dyn OrchestratorClient>,
    adapter: ContainerAdapter,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker; fails when the config is incomplete
    pub fn new(
        client: Arc<dyn OrchestratorClient>,
        adapter: ContainerAdapter,
        config: WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            adapter,
            config,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll and execute until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            worker = %self.config.worker_id,
            poll_interval = ?self.config.poll_interval,
            "Worker started"
        );

        let mut fibers: JoinSet<(String, Result<WorkflowOutcome>)> = JoinSet::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = fibers.join_next() => match joined {
                    Ok((workflow_id, outcome)) => {
                        active.remove(&workflow_id);
                        log_outcome(&workflow_id, &outcome);
                    }
                    Err(e) => error!(error = %e, "Workflow fiber panicked"),
                },
                _ = ticker.tick() => {
                    let contexts = match self.client.get_workflow_contexts(&self.config.worker_id).await {
                        Ok(contexts) => contexts,
                        Err(e) => {
                            warn!(worker = %self.config.worker_id, error = %e, "Polling for work failed");
                            continue;
                        }
                    };
                    for context in contexts {
                        if !active.insert(context.workflow_id.clone()) {
                            continue;
                        }
                        debug!(workflow = %context.workflow_id, "Picked up workflow");
                        let worker = self.clone();
                        let token = cancel.child_token();
                        fibers.spawn(async move {
                            let workflow_id = context.workflow_id.clone();
                            let outcome = worker.execute_workflow(context, token).await;
                            (workflow_id, outcome)
                        });
                    }
                }
            }
        }

        while let Some(joined) = fibers.join_next().await {
            if let Ok((workflow_id, outcome)) = joined {
                log_outcome(&workflow_id, &outcome);
            }
        }
        info!(worker = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Execute this worker's consecutive actions of one workflow
    pub async fn execute_workflow(
        &self,
        mut context: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome> {
        let workflow_id = context.workflow_id.clone();
        let actions = self
            .with_backoff("get actions", || self.client.get_workflow_actions(&workflow_id))
            .await?;
        let mut shared = self.seed_data(&workflow_id).await;
        let mut resyncs = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(WorkflowOutcome::Cancelled);
            }
            let Some(index) = context.next_action_index() else {
                return Ok(WorkflowOutcome::Completed);
            };
            let action = actions.get(index).ok_or_else(|| WorkerError::Rpc {
                code: ErrorCode::Internal,
                message: format!("context points at action {} of {}", index, actions.len()),
            })?;
            if action.worker_id != self.config.worker_id {
                return Ok(WorkflowOutcome::HandedOff {
                    next_worker: action.worker_id.clone(),
                });
            }

            // Announce the action
            let running = ActionStatusReport::new(&workflow_id, action, ActionState::StateRunning);
            match self.report(&running).await {
                Ok(committed) => context = committed,
                Err(e) if e.needs_resync() => {
                    let current = self.resync(&workflow_id, &e).await?;
                    let acknowledged = is_acknowledged(&current, index, action, ActionState::StateRunning);
                    context = current;
                    if !acknowledged {
                        resyncs += 1;
                        if resyncs > self.config.max_resyncs {
                            return Ok(WorkflowOutcome::Abandoned {
                                reason: e.to_string(),
                            });
                        }
                        continue;
                    }
                }
                Err(e) => return Err(e),
            }
            resyncs = 0;

            info!(
                workflow = %workflow_id,
                task = %action.task_name,
                action = %action.name,
                image = %action.image,
                "Executing action"
            );
            let started = Instant::now();
            let outcome = self
                .run_container(
                    &workflow_id,
                    action,
                    &action.name,
                    &action.command,
                    shared.as_ref(),
                    &cancel,
                )
                .await;
            let elapsed = started.elapsed().as_secs();

            if cancel.is_cancelled() {
                // Shutting down; the action is re-run when the worker returns
                return Ok(WorkflowOutcome::Cancelled);
            }

            match outcome.state {
                ActionState::StateSuccess => {
                    if let Some(shared) = shared.as_mut() {
                        self.upload_data(&workflow_id, action, shared).await;
                    }
                }
                state => self.run_hook(&workflow_id, action, state, shared.as_ref(), &cancel).await,
            }

            let done = ActionStatusReport::new(&workflow_id, action, outcome.state)
                .with_seconds(elapsed)
                .with_message(outcome.message.clone());
            match self.report(&done).await {
                Ok(committed) => context = committed,
                Err(e) if e.needs_resync() => {
                    let current = self.resync(&workflow_id, &e).await?;
                    if !is_acknowledged(&current, index, action, outcome.state) {
                        return Ok(WorkflowOutcome::Abandoned {
                            reason: e.to_string(),
                        });
                    }
                    context = current;
                }
                Err(e) => return Err(e),
            }

            if outcome.state != ActionState::StateSuccess {
                return Ok(WorkflowOutcome::Stopped {
                    action: action.name.clone(),
                    state: outcome.state,
                });
            }
        }
    }

    /// Create, start, wait on and remove one container
    ///
    /// Never fails: runtime errors become a FAILED outcome. The container
    /// is always removed once it was created.
    async fn run_container(
        &self,
        workflow_id: &str,
        action: &WorkflowAction,
        name: &str,
        command: &[String],
        shared: Option<&SharedData>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let mut spec = ContainerSpec::new(container_name(workflow_id, name), &action.image)
            .with_command(command.to_vec())
            .with_pid(action.pid.clone());
        for volume in &action.volumes {
            spec = spec.with_volume(volume);
        }
        if let Some(shared) = shared {
            spec = spec.with_volume(shared.binding());
        }
        for (key, value) in &action.environment {
            spec = spec.with_env(key, value);
        }

        let id = match self.adapter.create(&spec).await {
            Ok(id) => id,
            Err(e) => return failed(e.to_string()),
        };

        let outcome = match self.adapter.start(&id).await {
            Ok(()) => {
                let deadline = cancel.child_token();
                let timer = (action.timeout > 0).then(|| {
                    let deadline = deadline.clone();
                    let timeout = Duration::from_secs(action.timeout);
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        deadline.cancel();
                    })
                });
                let outcome = self.adapter.wait(&id, &deadline).await;
                if let Some(timer) = timer {
                    timer.abort();
                }
                outcome.unwrap_or_else(|e| failed(e.to_string()))
            }
            Err(e) => failed(e.to_string()),
        };

        if let Err(e) = self.adapter.remove(&id, RemoveOptions::force()).await {
            warn!(container = %id, error = %e, "Removing container failed");
        }
        outcome
    }

    /// Run the on-failure or on-timeout command of an action
    async fn run_hook(
        &self,
        workflow_id: &str,
        action: &WorkflowAction,
        state: ActionState,
        shared: Option<&SharedData>,
        cancel: &CancellationToken,
    ) {
        let (suffix, command) = match state {
            ActionState::StateTimeout => ("on-timeout", &action.on_timeout),
            ActionState::StateFailed => ("on-failure", &action.on_failure),
            _ => return,
        };
        if command.is_empty() {
            return;
        }

        let name = format!("{}-{}", action.name, suffix);
        let outcome = self
            .run_container(workflow_id, action, &name, command, shared, cancel)
            .await;
        info!(
            workflow = %workflow_id,
            action = %action.name,
            hook = suffix,
            state = %outcome.state,
            "Hook finished"
        );
    }

    /// Report with retries for transient errors
    async fn report(&self, report: &ActionStatusReport) -> Result<WorkflowContext> {
        let context = self
            .with_backoff("report", || self.client.report_action_status(report))
            .await?;
        debug!(
            workflow = %report.workflow_id,
            action = %report.action_name,
            state = %report.action_state,
            "Report acknowledged"
        );
        Ok(context)
    }

    /// Re-read the context after a rejected report
    async fn resync(&self, workflow_id: &str, rejection: &WorkerError) -> Result<WorkflowContext> {
        warn!(workflow = %workflow_id, error = %rejection, "Report rejected, resynchronizing");
        self.with_backoff("get context", || self.client.get_workflow_context(workflow_id))
            .await
    }

    async fn with_backoff<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!(call = what, attempt, delay = ?delay, error = %e, "Retrying orchestrator call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the shared directory and write the latest data version into it
    async fn seed_data(&self, workflow_id: &str) -> Option<SharedData> {
        let root = self.config.data_dir.as_ref()?;
        let dir = root.join(workflow_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(workflow = %workflow_id, error = %e, "Creating data directory failed");
            return None;
        }

        let mut shared = SharedData {
            dir,
            last: Vec::new(),
        };
        match self
            .with_backoff("get data", || self.client.get_workflow_data(workflow_id, 0))
            .await
        {
            Ok(data) if data.version > 0 => {
                if let Err(e) = tokio::fs::write(shared.file(), &data.data).await {
                    warn!(workflow = %workflow_id, error = %e, "Writing workflow data failed");
                } else {
                    debug!(workflow = %workflow_id, version = data.version, "Seeded workflow data");
                    shared.last = data.data;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(workflow = %workflow_id, error = %e, "Fetching workflow data failed"),
        }
        Some(shared)
    }

    /// Upload the shared data file when an action changed it
    async fn upload_data(&self, workflow_id: &str, action: &WorkflowAction, shared: &mut SharedData) {
        let current = match tokio::fs::read(shared.file()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "Reading workflow data failed");
                return;
            }
        };
        if current == shared.last {
            return;
        }

        let metadata = serde_json::json!({
            "action": action.name,
            "task": action.task_name,
            "worker": self.config.worker_id,
        });
        match self
            .with_backoff("update data", || {
                self.client
                    .update_workflow_data(workflow_id, metadata.clone(), current.clone())
            })
            .await
        {
            Ok(meta) => {
                info!(workflow = %workflow_id, version = meta.version, "Uploaded workflow data");
                shared.last = current;
            }
            Err(e) => warn!(workflow = %workflow_id, error = %e, "Uploading workflow data failed"),
        }
    }
}

fn failed(message: String) -> WaitOutcome {
    WaitOutcome {
        state: ActionState::StateFailed,
        exit_code: None,
        message,
    }
}

/// Whether the orchestrator already recorded `state` for `action`
fn is_acknowledged(
    context: &WorkflowContext,
    index: usize,
    action: &WorkflowAction,
    state: ActionState,
) -> bool {
    context.current_action_index == index
        && context.current_task == action.task_name
        && context.current_action == action.name
        && context.current_action_state == state
}

fn log_outcome(workflow_id: &str, outcome: &Result<WorkflowOutcome>) {
    match outcome {
        Ok(WorkflowOutcome::Completed) => info!(workflow = %workflow_id, "Workflow completed"),
        Ok(WorkflowOutcome::HandedOff { next_worker }) => {
            info!(workflow = %workflow_id, next_worker = %next_worker, "Workflow handed off")
        }
        Ok(WorkflowOutcome::Stopped { action, state }) => {
            warn!(workflow = %workflow_id, action = %action, state = %state, "Workflow stopped")
        }
        Ok(WorkflowOutcome::Cancelled) => debug!(workflow = %workflow_id, "Workflow execution cancelled"),
        Ok(WorkflowOutcome::Abandoned { reason }) => {
            warn!(workflow = %workflow_id, reason = %reason, "Workflow abandoned")
        }
        Err(e) => error!(workflow = %workflow_id, error = %e, "Workflow execution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalClient;
    use anvil_crd::{HardwareTarget, Template};
    use anvil_runtime::MockEngine;
    use anvil_workflow::{MemoryStore, Orchestrator};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    const INSTALL: &str = r#"
version: "0.1"
name: install
tasks:
  - name: provision
    worker: "{{.device_1}}"
    actions:
      - name: wipe
        image: alpine
        timeout: 60
      - name: stream
        image: alpine
        timeout: 1
        on-timeout: ["echo", "timed out"]
        on-failure: ["echo", "failed"]
      - name: reboot
        image: alpine
"#;

    const HANDOFF: &str = r#"
version: "0.1"
name: handoff
tasks:
  - name: first
    worker: "{{.device_1}}"
    actions:
      - name: wipe
        image: alpine
  - name: second
    worker: "{{.device_2}}"
    actions:
      - name: verify
        image: alpine
"#;

    async fn orchestrator(raw: &str) -> (Arc<Orchestrator>, String) {
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(MemoryStore::new())));
        orchestrator
            .put_template(Template::new("tpl", raw))
            .await
            .unwrap();
        let devices: HashMap<String, String> = [("device_1", "W1"), ("device_2", "W2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let id = orchestrator
            .create_workflow("tpl", HardwareTarget::Devices(devices))
            .await
            .unwrap();
        (orchestrator, id)
    }

    fn worker(orchestrator: &Arc<Orchestrator>, engine: &Arc<MockEngine>, config: WorkerConfig) -> Worker {
        Worker::new(
            Arc::new(LocalClient::new(orchestrator.clone())),
            ContainerAdapter::new(engine.clone()),
            config.with_retries(3, Duration::from_millis(1)),
        )
        .unwrap()
    }

    async fn execute(worker: &Worker, orchestrator: &Orchestrator, id: &str) -> WorkflowOutcome {
        let context = orchestrator.get_workflow_context(id).await.unwrap();
        worker
            .execute_workflow(context, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_all_actions() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let engine = Arc::new(MockEngine::new());
        let worker = worker(&orchestrator, &engine, WorkerConfig::new("W1"));

        assert_eq!(execute(&worker, &orchestrator, &id).await, WorkflowOutcome::Completed);

        let details = orchestrator.get_workflow(&id).await.unwrap();
        assert_eq!(details.context.current_action_index, 2);
        assert_eq!(details.context.current_action_state, ActionState::StateSuccess);
        assert_eq!(details.progress_percent, 100);

        let events = orchestrator.get_workflow_events(&id).await.unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(engine.created().len(), 3);
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_and_runs_hook() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let engine = Arc::new(MockEngine::new().with_exit_code("stream", 2));
        let worker = worker(&orchestrator, &engine, WorkerConfig::new("W1"));

        assert_eq!(
            execute(&worker, &orchestrator, &id).await,
            WorkflowOutcome::Stopped {
                action: "stream".to_string(),
                state: ActionState::StateFailed
            }
        );

        let ctx = orchestrator.get_workflow_context(&id).await.unwrap();
        assert_eq!(ctx.current_action_index, 1);
        assert_eq!(ctx.current_action_state, ActionState::StateFailed);

        let names: Vec<String> = engine.created().into_iter().map(|s| s.name).collect();
        assert!(names.iter().any(|n| n.ends_with("stream-on-failure")));
        assert!(!names.iter().any(|n| n.ends_with("reboot")));
        assert_eq!(engine.live_containers(), 0);

        let events = orchestrator.get_workflow_events(&id).await.unwrap();
        let last = events.last().unwrap();
        assert!(last.message.contains("code 2"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let engine = Arc::new(MockEngine::new().with_delay("stream", Duration::from_secs(30)));
        let worker = worker(&orchestrator, &engine, WorkerConfig::new("W1"));

        assert_eq!(
            execute(&worker, &orchestrator, &id).await,
            WorkflowOutcome::Stopped {
                action: "stream".to_string(),
                state: ActionState::StateTimeout
            }
        );
        let names: Vec<String> = engine.created().into_iter().map(|s| s.name).collect();
        assert!(names.iter().any(|n| n.ends_with("stream-on-timeout")));
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_create_error_is_failed() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let engine = Arc::new(MockEngine::new().with_create_error("wipe"));
        let worker = worker(&orchestrator, &engine, WorkerConfig::new("W1"));

        let outcome = execute(&worker, &orchestrator, &id).await;
        assert_eq!(
            outcome,
            WorkflowOutcome::Stopped {
                action: "wipe".to_string(),
                state: ActionState::StateFailed
            }
        );
    }

    #[tokio::test]
    async fn test_hands_off_to_next_worker() {
        let (orchestrator, id) = orchestrator(HANDOFF).await;
        let engine = Arc::new(MockEngine::new());
        let w1 = worker(&orchestrator, &engine, WorkerConfig::new("W1"));
        let w2 = worker(&orchestrator, &engine, WorkerConfig::new("W2"));

        assert_eq!(
            execute(&w1, &orchestrator, &id).await,
            WorkflowOutcome::HandedOff {
                next_worker: "W2".to_string()
            }
        );
        assert_eq!(orchestrator.get_workflow_contexts("W2").await.unwrap().len(), 1);
        assert_eq!(execute(&w2, &orchestrator, &id).await, WorkflowOutcome::Completed);
    }

    #[tokio::test]
    async fn test_resumes_after_restart() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let first = orchestrator.get_workflow_actions(&id).await.unwrap()[0].clone();
        // A previous worker process announced the first action and died
        orchestrator
            .report_action_status(ActionStatusReport::new(&id, &first, ActionState::StateRunning))
            .await
            .unwrap();

        let engine = Arc::new(MockEngine::new());
        let worker = worker(&orchestrator, &engine, WorkerConfig::new("W1"));
        assert_eq!(execute(&worker, &orchestrator, &id).await, WorkflowOutcome::Completed);
        assert_eq!(engine.created().len(), 3);
    }

    #[tokio::test]
    async fn test_data_is_seeded_and_uploaded() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        orchestrator
            .update_workflow_data(&id, serde_json::Value::Null, b"seed".to_vec())
            .await
            .unwrap();

        let root = tempfile::Builder::new().prefix("anvil-data-").tempdir().unwrap();
        // wipe runs long enough for the stand-in below to write its output
        let engine = Arc::new(MockEngine::new().with_delay("wipe", Duration::from_millis(300)));
        let worker = worker(
            &orchestrator,
            &engine,
            WorkerConfig::new("W1").with_data_dir(root.path()),
        );

        let context = orchestrator.get_workflow_context(&id).await.unwrap();
        let writer = root.path().join(&id).join(DATA_FILE);
        let action = tokio::spawn(async move {
            loop {
                if tokio::fs::read(&writer).await.map(|b| b == b"seed").unwrap_or(false) {
                    tokio::fs::write(&writer, b"written by wipe").await.unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let outcome = worker
            .execute_workflow(context, CancellationToken::new())
            .await
            .unwrap();
        action.await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed);

        let binding = format!("{}:{}", root.path().join(&id).display(), DATA_MOUNT);
        assert!(engine.created()[0].volumes.contains(&binding));

        let latest = orchestrator.get_workflow_data(&id, 0).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.data, b"written by wipe");
        assert_eq!(latest.metadata["action"], "wipe");
    }

    struct FlakyClient {
        inner: LocalClient,
        failures: AtomicU32,
    }

    #[async_trait]
    impl OrchestratorClient for FlakyClient {
        async fn get_workflow_contexts(&self, worker_id: &str) -> Result<Vec<WorkflowContext>> {
            self.inner.get_workflow_contexts(worker_id).await
        }

        async fn get_workflow_context(&self, workflow_id: &str) -> Result<WorkflowContext> {
            self.inner.get_workflow_context(workflow_id).await
        }

        async fn get_workflow_actions(&self, workflow_id: &str) -> Result<Vec<WorkflowAction>> {
            self.inner.get_workflow_actions(workflow_id).await
        }

        async fn report_action_status(&self, report: &ActionStatusReport) -> Result<WorkflowContext> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(WorkerError::Transport("connection reset".into()));
            }
            self.failures.store(0, Ordering::SeqCst);
            self.inner.report_action_status(report).await
        }

        async fn get_workflow_data(&self, workflow_id: &str, version: u32) -> Result<anvil_crd::WorkflowData> {
            self.inner.get_workflow_data(workflow_id, version).await
        }

        async fn update_workflow_data(
            &self,
            workflow_id: &str,
            metadata: serde_json::Value,
            data: Vec<u8>,
        ) -> Result<anvil_crd::DataMetadata> {
            self.inner.update_workflow_data(workflow_id, metadata, data).await
        }
    }

    #[tokio::test]
    async fn test_transient_report_errors_are_retried() {
        let (orchestrator, id) = orchestrator(HANDOFF).await;
        let client = Arc::new(FlakyClient {
            inner: LocalClient::new(orchestrator.clone()),
            failures: AtomicU32::new(2),
        });
        let worker = Worker::new(
            client,
            ContainerAdapter::new(Arc::new(MockEngine::new())),
            WorkerConfig::new("W1").with_retries(4, Duration::from_millis(1)),
        )
        .unwrap();

        assert_eq!(
            execute(&worker, &orchestrator, &id).await,
            WorkflowOutcome::HandedOff {
                next_worker: "W2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_run_loop_and_shutdown() {
        let (orchestrator, id) = orchestrator(INSTALL).await;
        let engine = Arc::new(MockEngine::new());
        let worker = worker(
            &orchestrator,
            &engine,
            WorkerConfig::new("W1").with_poll_interval(Duration::from_millis(10)),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        let mut finished = false;
        for _ in 0..200 {
            let ctx = orchestrator.get_workflow_context(&id).await.unwrap();
            if ctx.is_finished() {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        // Each action ran exactly once
        assert_eq!(engine.created().len(), 3);
    }
}
