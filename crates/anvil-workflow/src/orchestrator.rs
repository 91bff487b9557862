//! Workflow orchestrator
//!
//! Owns the authoritative [`WorkflowContext`] of every workflow. Reports
//! for one workflow are serialized by an in-process lock and committed with
//! a compare-and-swap on the context version, retrying a bounded number of
//! times when another process won the race.

use crate::error::{Result, StoreError, WorkflowError};
use crate::store::WorkflowStore;
use anvil_crd::{
    compile, flatten, render, ActionState, ActionStatusReport, DataMetadata, Hardware,
    HardwareTarget, Template, WorkflowAction, WorkflowContext, WorkflowData, WorkflowRecord,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Change notification emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Workflow created
    Created { workflow_id: String },
    /// A status report was committed
    ActionReported {
        workflow_id: String,
        action: String,
        state: ActionState,
        index: usize,
    },
    /// A new data version was written
    DataUpdated { workflow_id: String, version: u32 },
    /// Workflow deleted
    Deleted { workflow_id: String },
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempts at a transition when the version check keeps failing
    pub max_commit_attempts: u32,
    /// Buffered contexts per watch stream
    pub stream_buffer: usize,
    /// How often a watch stream re-reads the store without a wake-up
    pub watch_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 5,
            stream_buffer: 16,
            watch_interval: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// Set the number of commit attempts
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    /// Set the watch stream buffer size
    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer.max(1);
        self
    }

    /// Set the watch re-read interval
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }
}

/// Workflow record with its live context and projected progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetails {
    pub workflow: WorkflowRecord,
    pub context: WorkflowContext,
    pub progress_percent: u8,
}

/// Server-side authority for workflow progress
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    config: OrchestratorConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    actions: RwLock<HashMap<String, Arc<Vec<WorkflowAction>>>>,
    event_sender: broadcast::Sender<WorkflowEvent>,
}

impl Orchestrator {
    /// Create an orchestrator over a store
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self::with_config(store, OrchestratorConfig::default())
    }

    /// Create an orchestrator with explicit tuning
    pub fn with_config(store: Arc<dyn WorkflowStore>, config: OrchestratorConfig) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_sender.subscribe()
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    // === Templates ===

    /// Validate and store a template
    pub async fn put_template(&self, mut template: Template) -> Result<Template> {
        template.validate()?;
        if let Some(existing) = self.store.get_template(&template.metadata.name).await? {
            template.metadata.uid = existing.metadata.uid;
            template.metadata.creation_timestamp = existing.metadata.creation_timestamp;
        }
        template.metadata.stamp();
        self.store.put_template(&template).await?;
        info!(template = %template.metadata.name, "Template stored");
        Ok(template)
    }

    pub async fn get_template(&self, name: &str) -> Result<Template> {
        self.store
            .get_template(name)
            .await?
            .ok_or_else(|| WorkflowError::TemplateNotFound(name.to_string()))
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        Ok(self.store.list_templates().await?)
    }

    pub async fn delete_template(&self, name: &str) -> Result<()> {
        if !self.store.delete_template(name).await? {
            return Err(WorkflowError::TemplateNotFound(name.to_string()));
        }
        info!(template = %name, "Template deleted");
        Ok(())
    }

    // === Hardware ===

    /// Validate and store a hardware record
    pub async fn put_hardware(&self, mut hardware: Hardware) -> Result<Hardware> {
        hardware.validate()?;
        if let Some(existing) = self.store.get_hardware(&hardware.metadata.name).await? {
            hardware.metadata.uid = existing.metadata.uid;
            hardware.metadata.creation_timestamp = existing.metadata.creation_timestamp;
        }
        hardware.metadata.stamp();
        self.store.put_hardware(&hardware).await?;
        info!(hardware = %hardware.metadata.name, "Hardware stored");
        Ok(hardware)
    }

    pub async fn get_hardware(&self, name: &str) -> Result<Hardware> {
        self.store
            .get_hardware(name)
            .await?
            .ok_or_else(|| WorkflowError::HardwareNotFound(name.to_string()))
    }

    pub async fn list_hardware(&self) -> Result<Vec<Hardware>> {
        Ok(self.store.list_hardware().await?)
    }

    pub async fn delete_hardware(&self, name: &str) -> Result<()> {
        if !self.store.delete_hardware(name).await? {
            return Err(WorkflowError::HardwareNotFound(name.to_string()));
        }
        info!(hardware = %name, "Hardware deleted");
        Ok(())
    }

    // === Workflows ===

    /// Bind a template to a hardware target and persist the workflow
    ///
    /// The template is rendered with the target's device map, compiled and
    /// flattened; nothing is stored unless every step succeeds.
    pub async fn create_workflow(&self, template_ref: &str, target: HardwareTarget) -> Result<String> {
        if template_ref.is_empty() {
            return Err(WorkflowError::InvalidArgument(
                "template reference is empty".to_string(),
            ));
        }
        let template = self.get_template(template_ref).await?;

        let (hardware_ref, devices) = match target {
            HardwareTarget::Ref(name) => {
                if name.is_empty() {
                    return Err(WorkflowError::InvalidArgument(
                        "hardware reference is empty".to_string(),
                    ));
                }
                let hardware = self.get_hardware(&name).await?;
                (Some(name), hardware.device_map())
            }
            HardwareTarget::Devices(devices) => {
                if devices.is_empty() {
                    return Err(WorkflowError::InvalidArgument(
                        "hardware target has no devices".to_string(),
                    ));
                }
                (None, devices)
            }
        };

        let rendered = render(&template.spec.data, &devices)?;
        let document = compile(rendered.as_bytes())?;
        let actions = flatten(&document);

        let mut record = WorkflowRecord::new(template_ref, document.name.clone());
        record.hardware_ref = hardware_ref;
        record.hardware_map = devices;
        record.global_timeout = document.global_timeout;
        let context = WorkflowContext::new(record.id.clone(), &actions);

        self.store
            .create_workflow(&record, &actions, &context)
            .await?;
        self.actions
            .write()
            .await
            .insert(record.id.clone(), Arc::new(actions));

        info!(
            workflow = %record.id,
            template = %template_ref,
            actions = context.total_number_of_actions,
            "Workflow created"
        );
        self.emit(WorkflowEvent::Created {
            workflow_id: record.id.clone(),
        });
        Ok(record.id)
    }

    /// Fetch a workflow with its context and progress
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDetails> {
        require("workflow id", workflow_id)?;
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        let context = self.get_workflow_context(workflow_id).await?;
        Ok(WorkflowDetails {
            progress_percent: context.progress_percent(),
            workflow,
            context,
        })
    }

    /// All workflows in creation order
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDetails>> {
        let mut details = Vec::new();
        for workflow in self.store.list_workflows().await? {
            // Deleted between the two reads
            let Some(versioned) = self.store.get_context(&workflow.id).await? else {
                continue;
            };
            details.push(WorkflowDetails {
                progress_percent: versioned.context.progress_percent(),
                workflow,
                context: versioned.context,
            });
        }
        Ok(details)
    }

    /// Remove a workflow with its context, events and data
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        require("workflow id", workflow_id)?;
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        if !self.store.delete_workflow(workflow_id).await? {
            return Err(WorkflowError::NotFound(workflow_id.to_string()));
        }
        self.actions.write().await.remove(workflow_id);
        self.locks.lock().await.remove(workflow_id);

        info!(workflow = %workflow_id, "Workflow deleted");
        self.emit(WorkflowEvent::Deleted {
            workflow_id: workflow_id.to_string(),
        });
        Ok(())
    }

    /// The immutable, execution-ordered action list
    pub async fn get_workflow_actions(&self, workflow_id: &str) -> Result<Vec<WorkflowAction>> {
        require("workflow id", workflow_id)?;
        self.cached_actions(workflow_id)
            .await?
            .map(|actions| actions.as_ref().clone())
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// The live context of one workflow
    pub async fn get_workflow_context(&self, workflow_id: &str) -> Result<WorkflowContext> {
        require("workflow id", workflow_id)?;
        self.store
            .get_context(workflow_id)
            .await?
            .map(|v| v.context)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// Audit trail in commit order
    pub async fn get_workflow_events(&self, workflow_id: &str) -> Result<Vec<ActionStatusReport>> {
        require("workflow id", workflow_id)?;
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(WorkflowError::NotFound(workflow_id.to_string()));
        }
        Ok(self.store.list_events(workflow_id).await?)
    }

    async fn cached_actions(&self, workflow_id: &str) -> Result<Option<Arc<Vec<WorkflowAction>>>> {
        if let Some(actions) = self.actions.read().await.get(workflow_id) {
            return Ok(Some(actions.clone()));
        }
        let Some(actions) = self.store.get_actions(workflow_id).await? else {
            return Ok(None);
        };
        let actions = Arc::new(actions);
        self.actions
            .write()
            .await
            .insert(workflow_id.to_string(), actions.clone());
        Ok(Some(actions))
    }

    async fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(workflow_id.to_string())
            .or_default()
            .clone()
    }

    // === Worker polling ===

    /// Contexts whose next pending action is addressed to `worker_id`
    ///
    /// Finished workflows (last action succeeded, or any action failed or
    /// timed out) are never returned.
    pub async fn get_workflow_contexts(&self, worker_id: &str) -> Result<Vec<WorkflowContext>> {
        require("worker id", worker_id)?;

        let mut assigned = Vec::new();
        for context in self.store.list_contexts().await? {
            let Some(next) = context.next_action_index() else {
                continue;
            };
            let Some(actions) = self.cached_actions(&context.workflow_id).await? else {
                continue;
            };
            match actions.get(next) {
                Some(action) if action.worker_id == worker_id => assigned.push(context),
                Some(_) => {}
                None => warn!(
                    workflow = %context.workflow_id,
                    index = next,
                    "Context points past the end of its action list"
                ),
            }
        }
        Ok(assigned)
    }

    /// Stream of contexts addressed to `worker_id`
    ///
    /// A context is sent when it first becomes assigned to the worker and
    /// again whenever it changes. The stream is woken by orchestrator events
    /// and re-reads the store every `watch_interval` to pick up changes made
    /// by other processes. It ends when `cancel` fires or the receiver is
    /// dropped; the bounded channel applies backpressure to the producer.
    pub fn watch_contexts(
        self: &Arc<Self>,
        worker_id: &str,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<WorkflowContext>> {
        require("worker id", worker_id)?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let orchestrator = Arc::clone(self);
        let worker_id = worker_id.to_string();
        let mut events = self.subscribe();

        tokio::spawn(async move {
            let mut sent: HashMap<String, WorkflowContext> = HashMap::new();
            debug!(worker = %worker_id, "Context watch started");

            loop {
                match orchestrator.get_workflow_contexts(&worker_id).await {
                    Ok(contexts) => {
                        let live: Vec<String> =
                            contexts.iter().map(|c| c.workflow_id.clone()).collect();
                        for context in contexts {
                            if sent.get(&context.workflow_id) == Some(&context) {
                                continue;
                            }
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                res = tx.send(context.clone()) => {
                                    if res.is_err() {
                                        return;
                                    }
                                }
                            }
                            sent.insert(context.workflow_id.clone(), context);
                        }
                        sent.retain(|id, _| live.contains(id));
                    }
                    Err(e) => warn!(worker = %worker_id, error = %e, "Context watch read failed"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(orchestrator.config.watch_interval) => {}
                    event = events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                }
            }
            debug!(worker = %worker_id, "Context watch stopped");
        });

        Ok(ReceiverStream::new(rx))
    }

    // === Status reports ===

    /// Validate a report against the action list and commit it
    ///
    /// The candidate action is the current one, or the next one when an
    /// IN_PROGRESS report arrives after an action has already been recorded.
    /// Returns the committed context.
    pub async fn report_action_status(&self, report: ActionStatusReport) -> Result<WorkflowContext> {
        require("workflow id", &report.workflow_id)?;
        require("task name", &report.task_name)?;
        require("action name", &report.action_name)?;
        require("worker id", &report.worker_id)?;
        if report.action_state == ActionState::StatePending {
            return Err(WorkflowError::InvalidArgument(
                "cannot report an action as pending".to_string(),
            ));
        }

        let lock = self.lock_for(&report.workflow_id).await;
        let _guard = lock.lock().await;

        for attempt in 1..=self.config.max_commit_attempts {
            let Some(versioned) = self.store.get_context(&report.workflow_id).await? else {
                return Err(WorkflowError::InvalidArgument(format!(
                    "no context for workflow {}",
                    report.workflow_id
                )));
            };
            let Some(actions) = self.cached_actions(&report.workflow_id).await? else {
                return Err(WorkflowError::InvalidArgument(format!(
                    "no actions for workflow {}",
                    report.workflow_id
                )));
            };

            let next = transition(&versioned.context, &actions, &report)?;

            match self
                .store
                .commit_transition(versioned.version, &next, &report)
                .await
            {
                Ok(_) => {
                    info!(
                        workflow = %report.workflow_id,
                        task = %report.task_name,
                        action = %report.action_name,
                        worker = %report.worker_id,
                        state = %report.action_state,
                        index = next.current_action_index,
                        "Action status committed"
                    );
                    self.emit(WorkflowEvent::ActionReported {
                        workflow_id: report.workflow_id.clone(),
                        action: report.action_name.clone(),
                        state: report.action_state,
                        index: next.current_action_index,
                    });
                    return Ok(next);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(
                        workflow = %report.workflow_id,
                        attempt,
                        "Context changed underneath the report, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::Aborted(format!(
            "workflow {} kept changing during {} commit attempts",
            report.workflow_id, self.config.max_commit_attempts
        )))
    }

    // === Ephemeral data ===

    /// Append a new data version
    pub async fn update_workflow_data(
        &self,
        workflow_id: &str,
        metadata: serde_json::Value,
        data: Vec<u8>,
    ) -> Result<DataMetadata> {
        require("workflow id", workflow_id)?;

        for attempt in 1..=self.config.max_commit_attempts {
            match self.store.put_data(workflow_id, &metadata, &data).await {
                Ok(entry) => {
                    info!(
                        workflow = %workflow_id,
                        version = entry.version,
                        bytes = entry.data.len(),
                        "Workflow data updated"
                    );
                    self.emit(WorkflowEvent::DataUpdated {
                        workflow_id: workflow_id.to_string(),
                        version: entry.version,
                    });
                    return Ok(entry.describe());
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(WorkflowError::NotFound(workflow_id.to_string()))
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(workflow = %workflow_id, attempt, "Data version raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::Aborted(format!(
            "data for workflow {} kept changing",
            workflow_id
        )))
    }

    /// Fetch a data version; 0 means latest
    ///
    /// Asking for the latest version of a workflow that has none yields an
    /// empty version 0 entry.
    pub async fn get_workflow_data(&self, workflow_id: &str, version: u32) -> Result<WorkflowData> {
        require("workflow id", workflow_id)?;
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(WorkflowError::NotFound(workflow_id.to_string()));
        }

        match self.store.get_data(workflow_id, version).await? {
            Some(data) => Ok(data),
            None if version == 0 => Ok(WorkflowData {
                workflow_id: workflow_id.to_string(),
                version: 0,
                metadata: serde_json::Value::Null,
                data: Vec::new(),
                created_at: Utc::now(),
            }),
            None => Err(WorkflowError::DataNotFound {
                workflow_id: workflow_id.to_string(),
                version,
            }),
        }
    }

    /// Size and metadata of a data version, without the payload
    pub async fn get_workflow_metadata(&self, workflow_id: &str, version: u32) -> Result<DataMetadata> {
        Ok(self.get_workflow_data(workflow_id, version).await?.describe())
    }

    /// Latest data version, 0 when nothing has been written
    pub async fn get_workflow_data_version(&self, workflow_id: &str) -> Result<u32> {
        require("workflow id", workflow_id)?;
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(WorkflowError::NotFound(workflow_id.to_string()));
        }
        Ok(self.store.latest_data_version(workflow_id).await?)
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(WorkflowError::InvalidArgument(format!("{} is empty", what)));
    }
    Ok(())
}

/// Compute the context that results from accepting `report`
///
/// Pure function of the current context, the action list and the report;
/// rejections leave nothing to undo.
pub fn transition(
    context: &WorkflowContext,
    actions: &[WorkflowAction],
    report: &ActionStatusReport,
) -> Result<WorkflowContext> {
    let current = context.current_action_index;
    let candidate = if report.action_state == ActionState::StateRunning
        && !context.current_action.is_empty()
    {
        current + 1
    } else {
        current
    };

    let expected = actions.get(candidate).ok_or_else(|| {
        WorkflowError::FailedPrecondition(format!(
            "no action at index {} (workflow has {})",
            candidate,
            actions.len()
        ))
    })?;

    if expected.task_name != report.task_name || expected.name != report.action_name {
        return Err(WorkflowError::FailedPrecondition(format!(
            "expected {}/{} at index {}, got {}/{}",
            expected.task_name, expected.name, candidate, report.task_name, report.action_name
        )));
    }

    if expected.worker_id != report.worker_id {
        return Err(WorkflowError::FailedPrecondition(format!(
            "action {} belongs to worker {}, reported by {}",
            expected.name, expected.worker_id, report.worker_id
        )));
    }

    if candidate != current {
        // Moving on requires the previous action to have succeeded
        if context.current_action_state != ActionState::StateSuccess {
            return Err(WorkflowError::FailedPrecondition(format!(
                "cannot start {} while {} is {}",
                report.action_name, context.current_action, context.current_action_state
            )));
        }
    } else if !context.current_action.is_empty()
        && context.current_action_state.is_terminal()
        && report.action_state != context.current_action_state
    {
        return Err(WorkflowError::FailedPrecondition(format!(
            "action {} already finished as {}",
            context.current_action, context.current_action_state
        )));
    }

    Ok(WorkflowContext {
        workflow_id: context.workflow_id.clone(),
        current_worker: report.worker_id.clone(),
        current_task: report.task_name.clone(),
        current_action: report.action_name.clone(),
        current_action_state: report.action_state,
        current_action_index: candidate,
        total_number_of_actions: context.total_number_of_actions,
    })
}
