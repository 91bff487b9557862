//! Template rendering, compilation and flattening
//!
//! Compilation is a pure function over the input bytes: parsing is strict
//! (unknown fields are rejected) and validation fails on the first offending
//! name or image, so nothing is registered from a partially valid document.

use crate::{validate_image, Action, CrdError, Result, Task, Workflow, WorkflowAction};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Names must be strictly shorter than this many characters
pub const MAX_NAME_LENGTH: usize = 200;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Parse a workflow document without validating it
pub fn parse(raw: &[u8]) -> Result<Workflow> {
    Ok(serde_yaml::from_slice(raw)?)
}

/// Parse and validate a workflow document
pub fn compile(raw: &[u8]) -> Result<Workflow> {
    let workflow = parse(raw)?;
    validate(&workflow)?;
    Ok(workflow)
}

/// Validate a parsed workflow document
pub fn validate(workflow: &Workflow) -> Result<()> {
    check_name("workflow", &workflow.name)?;

    if workflow.tasks.is_empty() {
        return Err(CrdError::MissingField("tasks".to_string()));
    }

    let mut task_names = HashSet::new();
    for task in &workflow.tasks {
        check_name("task", &task.name)?;
        if !task_names.insert(task.name.as_str()) {
            return Err(CrdError::DuplicateName {
                kind: "task",
                name: task.name.clone(),
            });
        }
        validate_task(task)?;
    }

    Ok(())
}

fn validate_task(task: &Task) -> Result<()> {
    if task.worker.is_empty() {
        return Err(CrdError::MissingField(format!("tasks[{}].worker", task.name)));
    }
    if task.actions.is_empty() {
        return Err(CrdError::MissingField(format!("tasks[{}].actions", task.name)));
    }

    let mut action_names = HashSet::new();
    for action in &task.actions {
        check_name("action", &action.name)?;
        if !action_names.insert(action.name.as_str()) {
            return Err(CrdError::DuplicateName {
                kind: "action",
                name: action.name.clone(),
            });
        }
        validate_image(&action.image)?;
    }
    Ok(())
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CrdError::MissingField(format!("{} name", kind)));
    }
    let len = name.chars().count();
    if len >= MAX_NAME_LENGTH {
        return Err(CrdError::InvalidFieldValue {
            field: format!("{} name", kind),
            message: format!(
                "'{}...' is {} characters, must be shorter than {}",
                name.chars().take(16).collect::<String>(),
                len,
                MAX_NAME_LENGTH
            ),
        });
    }
    Ok(())
}

/// Substitute `{{.key}}` placeholders from a device map
///
/// Every placeholder must resolve; the first unknown key is an error.
pub fn render(raw: &str, devices: &HashMap<String, String>) -> Result<String> {
    if let Some(missing) = PLACEHOLDER
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|key| !devices.contains_key(*key))
    {
        return Err(CrdError::UnresolvedPlaceholder(missing.to_string()));
    }

    Ok(PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            devices.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// Flatten a workflow into its execution-ordered action list
///
/// Task volumes come first, followed by the action's own. Action
/// environment entries override task entries with the same key.
pub fn flatten(workflow: &Workflow) -> Vec<WorkflowAction> {
    workflow
        .tasks
        .iter()
        .flat_map(|task| task.actions.iter().map(move |action| flatten_action(task, action)))
        .collect()
}

fn flatten_action(task: &Task, action: &Action) -> WorkflowAction {
    let mut environment = task.environment.clone();
    environment.extend(action.environment.clone());

    WorkflowAction {
        task_name: task.name.clone(),
        name: action.name.clone(),
        image: action.image.clone(),
        timeout: action.timeout,
        command: action.command.clone(),
        on_timeout: action.on_timeout.clone(),
        on_failure: action.on_failure.clone(),
        worker_id: task.worker.clone(),
        volumes: task
            .volumes
            .iter()
            .chain(action.volumes.iter())
            .cloned()
            .collect(),
        environment,
        pid: action.pid.clone(),
    }
}
