//! Template resources and the workflow document they contain
//!
//! A stored [`Template`] keeps the raw YAML exactly as submitted, because
//! placeholders such as `{{.device_1}}` are only substituted when the
//! template is bound to hardware. The document shape itself is
//! [`Workflow`] / [`Task`] / [`Action`].
//!
//! ```yaml
//! version: "0.1"
//! name: ubuntu_provisioning
//! global_timeout: 6000
//! tasks:
//!   - name: os-installation
//!     worker: "{{.device_1}}"
//!     volumes:
//!       - /dev:/dev
//!     actions:
//!       - name: stream-image
//!         image: quay.io/tinkerbell-actions/image2disk:v1.0.0
//!         timeout: 600
//! ```

use crate::{compile, ObjectMeta, Result, TypeMeta};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Template resource holding a raw workflow document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Type metadata (apiVersion, kind)
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    /// Object metadata (name, uid, labels)
    pub metadata: ObjectMeta,

    /// Template specification
    pub spec: TemplateSpec,
}

impl Template {
    /// Create a new Template from raw YAML
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            type_meta: TypeMeta::template(),
            metadata: ObjectMeta::new(name),
            spec: TemplateSpec { data: data.into() },
        }
    }

    /// Validate the template by compiling its document
    ///
    /// Placeholders are left in place; they only need to be valid YAML
    /// scalars at this point.
    pub fn validate(&self) -> Result<Workflow> {
        if self.metadata.name.is_empty() {
            return Err(crate::CrdError::MissingField("metadata.name".to_string()));
        }
        compile(self.spec.data.as_bytes())
    }
}

/// Template specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TemplateSpec {
    /// Raw YAML document
    pub data: String,
}

/// A compiled workflow document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Document format version
    pub version: String,

    /// Workflow name
    pub name: String,

    /// Optional identifier carried by the document
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Global timeout for the whole workflow (seconds)
    #[serde(default)]
    pub global_timeout: u64,

    /// Tasks in execution order
    pub tasks: Vec<Task>,
}

impl Workflow {
    /// Create a new workflow document
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: "0.1".to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a task
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Set the global timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.global_timeout = seconds;
        self
    }

    /// Total number of actions across all tasks
    pub fn action_count(&self) -> usize {
        self.tasks.iter().map(|t| t.actions.len()).sum()
    }
}

/// A group of actions executed on one worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Task name, unique within the workflow
    pub name: String,

    /// Worker address, typically a rendered `{{.device_N}}`
    pub worker: String,

    /// Volumes mounted into every action of the task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    /// Environment shared by every action of the task
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    /// Actions to execute in order
    pub actions: Vec<Action>,
}

impl Task {
    /// Create a new task
    pub fn new(name: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker: worker.into(),
            ..Default::default()
        }
    }

    /// Add an action to the task
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Add a volume mount
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// A single containerized step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Action {
    /// Action name, unique within its task
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Timeout in seconds; 0 means no deadline
    #[serde(default)]
    pub timeout: u64,

    /// Command override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Command run in a follow-up container when the action times out
    #[serde(
        rename = "on-timeout",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub on_timeout: Vec<String>,

    /// Command run in a follow-up container when the action fails
    #[serde(
        rename = "on-failure",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub on_failure: Vec<String>,

    /// Volumes specific to this action
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    /// Environment specific to this action
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    /// PID namespace mode (e.g. "host")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

impl Action {
    /// Create a new action
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Set the command
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Add a volume mount
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }
}
