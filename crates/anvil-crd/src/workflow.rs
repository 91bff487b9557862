//! Workflow execution records
//!
//! A [`WorkflowRecord`] binds a template to hardware. Its flattened
//! [`WorkflowAction`] list is fixed at creation time, while the single
//! [`WorkflowContext`] tracks where execution currently stands and is only
//! ever changed by an accepted [`ActionStatusReport`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A template bound to a hardware target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    /// Workflow identifier
    pub id: String,

    /// Name of the template the workflow was created from
    pub template_ref: String,

    /// Name of the hardware record, when the target was a reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_ref: Option<String>,

    /// Device map the template was rendered with
    #[serde(default)]
    pub hardware_map: HashMap<String, String>,

    /// Workflow name from the template document
    pub name: String,

    /// Global timeout from the template document (seconds)
    #[serde(default)]
    pub global_timeout: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a record with a fresh time-ordered identifier
    pub fn new(template_ref: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            template_ref: template_ref.into(),
            hardware_ref: None,
            hardware_map: HashMap::new(),
            name: name.into(),
            global_timeout: 0,
            created_at: Utc::now(),
        }
    }
}

/// Where a workflow should run
///
/// Either the name of a registered Hardware record, or an inline device map
/// such as `{"device_1": "00:11:22:33:44:55"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HardwareTarget {
    /// Name of a registered Hardware record
    Ref(String),
    /// Inline device map
    Devices(HashMap<String, String>),
}

/// One entry of a workflow's flattened action list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAction {
    /// Task this action belongs to
    pub task_name: String,

    /// Action name
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Timeout in seconds; 0 means no deadline
    #[serde(default)]
    pub timeout: u64,

    /// Command override
    #[serde(default)]
    pub command: Vec<String>,

    /// Hook command for timeouts
    #[serde(default)]
    pub on_timeout: Vec<String>,

    /// Hook command for failures
    #[serde(default)]
    pub on_failure: Vec<String>,

    /// Worker that executes this action
    pub worker_id: String,

    /// Volume bindings (task volumes first)
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Environment (action entries override task entries)
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// PID namespace mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

/// Per-action execution state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    /// Not started
    #[default]
    StatePending,
    /// Container is running
    StateRunning,
    /// Exited with code 0
    StateSuccess,
    /// Exited non-zero or could not run
    StateFailed,
    /// Exceeded its timeout
    StateTimeout,
}

impl ActionState {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::StateSuccess | ActionState::StateFailed | ActionState::StateTimeout
        )
    }

    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::StatePending => "STATE_PENDING",
            ActionState::StateRunning => "STATE_RUNNING",
            ActionState::StateSuccess => "STATE_SUCCESS",
            ActionState::StateFailed => "STATE_FAILED",
            ActionState::StateTimeout => "STATE_TIMEOUT",
        }
    }

    /// Parse a wire name
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "STATE_PENDING" => Some(ActionState::StatePending),
            "STATE_RUNNING" => Some(ActionState::StateRunning),
            "STATE_SUCCESS" => Some(ActionState::StateSuccess),
            "STATE_FAILED" => Some(ActionState::StateFailed),
            "STATE_TIMEOUT" => Some(ActionState::StateTimeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative execution position of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub current_worker: String,
    pub current_task: String,
    pub current_action: String,
    pub current_action_state: ActionState,
    pub current_action_index: usize,
    pub total_number_of_actions: usize,
}

impl WorkflowContext {
    /// Fresh context for a newly created workflow
    ///
    /// The context points at the first action so that its worker can
    /// discover the workflow; `current_action` stays empty until the first
    /// report is accepted.
    pub fn new(workflow_id: impl Into<String>, actions: &[WorkflowAction]) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            current_worker: actions
                .first()
                .map(|a| a.worker_id.clone())
                .unwrap_or_default(),
            current_task: String::new(),
            current_action: String::new(),
            current_action_state: ActionState::StatePending,
            current_action_index: 0,
            total_number_of_actions: actions.len(),
        }
    }

    /// Index of the action that should run next, if any
    pub fn next_action_index(&self) -> Option<usize> {
        if self.total_number_of_actions == 0 {
            return None;
        }
        match self.current_action_state {
            ActionState::StateFailed | ActionState::StateTimeout => None,
            ActionState::StateSuccess => {
                let next = self.current_action_index + 1;
                (next < self.total_number_of_actions).then_some(next)
            }
            ActionState::StatePending | ActionState::StateRunning => {
                Some(self.current_action_index)
            }
        }
    }

    /// True once the last action succeeded or any action failed or timed out
    pub fn is_finished(&self) -> bool {
        self.next_action_index().is_none()
    }

    /// Projected completion percentage
    pub fn progress_percent(&self) -> u8 {
        progress_percent(
            self.current_action_index,
            self.total_number_of_actions,
            &self.current_action_state,
        )
    }
}

/// Completion percentage for a context position
pub fn progress_percent(index: usize, total: usize, state: &ActionState) -> u8 {
    let succeeded = *state == ActionState::StateSuccess;
    if total == 0 || (index == 0 && !succeeded) {
        return 0;
    }
    let completed = if succeeded { index + 1 } else { index };
    (completed * 100 / total).min(100) as u8
}

/// A status report sent by a worker for one action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatusReport {
    pub workflow_id: String,
    pub task_name: String,
    pub action_name: String,
    pub worker_id: String,
    pub action_state: ActionState,
    #[serde(default)]
    pub execution_seconds: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ActionStatusReport {
    /// Report for an action of a workflow
    pub fn new(
        workflow_id: impl Into<String>,
        action: &WorkflowAction,
        action_state: ActionState,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_name: action.task_name.clone(),
            action_name: action.name.clone(),
            worker_id: action.worker_id.clone(),
            action_state,
            execution_seconds: 0,
            message: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the execution time
    pub fn with_seconds(mut self, seconds: u64) -> Self {
        self.execution_seconds = seconds;
        self
    }

    /// Set a human readable message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// One version of the ephemeral data shared between actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowData {
    pub workflow_id: String,
    pub version: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowData {
    /// Metadata view without the payload
    pub fn describe(&self) -> DataMetadata {
        DataMetadata {
            workflow_id: self.workflow_id.clone(),
            version: self.version,
            size_bytes: self.data.len() as u64,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// Size and version of a data entry, without the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataMetadata {
    pub workflow_id: String,
    pub version: u32,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Data metadata as sent by clients
///
/// Older clients send the metadata object encoded as a JSON string; both
/// forms are accepted and normalized with [`MetadataPayload::into_value`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataPayload {
    /// JSON document encoded in a string
    Encoded(String),
    /// Plain JSON value
    Value(serde_json::Value),
}

impl Default for MetadataPayload {
    fn default() -> Self {
        MetadataPayload::Value(serde_json::Value::Null)
    }
}

impl MetadataPayload {
    /// Decode into a JSON value; an empty string is null
    pub fn into_value(self) -> crate::Result<serde_json::Value> {
        match self {
            MetadataPayload::Value(value) => Ok(value),
            MetadataPayload::Encoded(raw) if raw.trim().is_empty() => Ok(serde_json::Value::Null),
            MetadataPayload::Encoded(raw) => Ok(serde_json::from_str(&raw)?),
        }
    }
}

/// Request body for appending a data version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataUpload {
    #[serde(default)]
    pub metadata: MetadataPayload,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Serde helper encoding byte payloads as standard base64
pub mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
