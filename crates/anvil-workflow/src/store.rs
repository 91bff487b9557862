//! Workflow state storage
//!
//! The store keeps four kinds of workflow rows: the record with its frozen
//! action list, one mutable context per workflow guarded by a version
//! counter, an append-only event log, and versioned data blobs. Templates
//! and hardware records live alongside them.

use crate::error::StoreError;
use crate::sqlite::SqliteStore;
use anvil_crd::{
    ActionStatusReport, Hardware, Template, WorkflowAction, WorkflowContext, WorkflowData,
    WorkflowRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Result type for store operations
pub(crate) type Result<T> = std::result::Result<T, StoreError>;

/// A context together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedContext {
    pub context: WorkflowContext,
    pub version: u64,
}

/// Storage backend for the orchestrator
///
/// The trait is object-safe and used as `Arc<dyn WorkflowStore>`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // === Templates ===

    async fn get_template(&self, name: &str) -> Result<Option<Template>>;

    async fn put_template(&self, template: &Template) -> Result<()>;

    async fn list_templates(&self) -> Result<Vec<Template>>;

    /// Returns false if the template did not exist
    async fn delete_template(&self, name: &str) -> Result<bool>;

    // === Hardware ===

    async fn get_hardware(&self, name: &str) -> Result<Option<Hardware>>;

    async fn put_hardware(&self, hardware: &Hardware) -> Result<()>;

    async fn list_hardware(&self) -> Result<Vec<Hardware>>;

    /// Returns false if the hardware did not exist
    async fn delete_hardware(&self, name: &str) -> Result<bool>;

    // === Workflows ===

    /// Persist a new workflow, its action list and its initial context
    /// atomically; the context starts at version 0
    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        actions: &[WorkflowAction],
        context: &WorkflowContext,
    ) -> Result<()>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>>;

    /// Workflows in creation order
    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>>;

    /// Remove the workflow and every row that belongs to it
    async fn delete_workflow(&self, id: &str) -> Result<bool>;

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<WorkflowAction>>>;

    async fn get_context(&self, id: &str) -> Result<Option<VersionedContext>>;

    async fn list_contexts(&self) -> Result<Vec<WorkflowContext>>;

    /// Replace the context and append the report in one transaction
    ///
    /// Fails with [`StoreError::Conflict`] unless the stored version equals
    /// `expected_version`. Returns the new version.
    async fn commit_transition(
        &self,
        expected_version: u64,
        context: &WorkflowContext,
        event: &ActionStatusReport,
    ) -> Result<u64>;

    /// Reports in commit order
    async fn list_events(&self, id: &str) -> Result<Vec<ActionStatusReport>>;

    // === Ephemeral data ===

    /// Append a new data version (latest + 1)
    async fn put_data(
        &self,
        id: &str,
        metadata: &serde_json::Value,
        data: &[u8],
    ) -> Result<WorkflowData>;

    /// Fetch a data version; 0 means latest
    async fn get_data(&self, id: &str, version: u32) -> Result<Option<WorkflowData>>;

    /// Latest data version, 0 if nothing was written yet
    async fn latest_data_version(&self, id: &str) -> Result<u32>;
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// SQLite database file
    Sqlite { path: PathBuf },
}

/// Create a store from configuration
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn WorkflowStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path).await?)),
    }
}

#[derive(Debug, Clone)]
struct WorkflowRows {
    record: WorkflowRecord,
    actions: Vec<WorkflowAction>,
    context: WorkflowContext,
    version: u64,
    events: Vec<ActionStatusReport>,
    data: Vec<WorkflowData>,
}

/// In-memory storage backend
///
/// All workflow rows sit behind one lock so that a transition touches the
/// context and the event log atomically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    templates: RwLock<HashMap<String, Template>>,
    hardware: RwLock<HashMap<String, Hardware>>,
    workflows: RwLock<HashMap<String, WorkflowRows>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Lock(e.to_string())
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_template(&self, name: &str) -> Result<Option<Template>> {
        Ok(self.templates.read().map_err(poisoned)?.get(name).cloned())
    }

    async fn put_template(&self, template: &Template) -> Result<()> {
        self.templates
            .write()
            .map_err(poisoned)?
            .insert(template.metadata.name.clone(), template.clone());
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let mut templates: Vec<_> = self
            .templates
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(templates)
    }

    async fn delete_template(&self, name: &str) -> Result<bool> {
        Ok(self.templates.write().map_err(poisoned)?.remove(name).is_some())
    }

    async fn get_hardware(&self, name: &str) -> Result<Option<Hardware>> {
        Ok(self.hardware.read().map_err(poisoned)?.get(name).cloned())
    }

    async fn put_hardware(&self, hardware: &Hardware) -> Result<()> {
        self.hardware
            .write()
            .map_err(poisoned)?
            .insert(hardware.metadata.name.clone(), hardware.clone());
        Ok(())
    }

    async fn list_hardware(&self) -> Result<Vec<Hardware>> {
        let mut hardware: Vec<_> = self
            .hardware
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect();
        hardware.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(hardware)
    }

    async fn delete_hardware(&self, name: &str) -> Result<bool> {
        Ok(self.hardware.write().map_err(poisoned)?.remove(name).is_some())
    }

    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
        actions: &[WorkflowAction],
        context: &WorkflowContext,
    ) -> Result<()> {
        let mut workflows = self.workflows.write().map_err(poisoned)?;
        if workflows.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        workflows.insert(
            record.id.clone(),
            WorkflowRows {
                record: record.clone(),
                actions: actions.to_vec(),
                context: context.clone(),
                version: 0,
                events: Vec::new(),
                data: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        Ok(self
            .workflows
            .read()
            .map_err(poisoned)?
            .get(id)
            .map(|rows| rows.record.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        let mut records: Vec<_> = self
            .workflows
            .read()
            .map_err(poisoned)?
            .values()
            .map(|rows| rows.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        Ok(self.workflows.write().map_err(poisoned)?.remove(id).is_some())
    }

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<WorkflowAction>>> {
        Ok(self
            .workflows
            .read()
            .map_err(poisoned)?
            .get(id)
            .map(|rows| rows.actions.clone()))
    }

    async fn get_context(&self, id: &str) -> Result<Option<VersionedContext>> {
        Ok(self
            .workflows
            .read()
            .map_err(poisoned)?
            .get(id)
            .map(|rows| VersionedContext {
                context: rows.context.clone(),
                version: rows.version,
            }))
    }

    async fn list_contexts(&self) -> Result<Vec<WorkflowContext>> {
        let workflows = self.workflows.read().map_err(poisoned)?;
        let mut rows: Vec<_> = workflows.values().collect();
        rows.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));
        Ok(rows.into_iter().map(|r| r.context.clone()).collect())
    }

    async fn commit_transition(
        &self,
        expected_version: u64,
        context: &WorkflowContext,
        event: &ActionStatusReport,
    ) -> Result<u64> {
        let mut workflows = self.workflows.write().map_err(poisoned)?;
        let rows = workflows
            .get_mut(&context.workflow_id)
            .ok_or_else(|| StoreError::NotFound(context.workflow_id.clone()))?;

        if rows.version != expected_version {
            return Err(StoreError::Conflict {
                workflow_id: context.workflow_id.clone(),
                expected: expected_version,
            });
        }

        rows.context = context.clone();
        rows.version += 1;
        rows.events.push(event.clone());
        Ok(rows.version)
    }

    async fn list_events(&self, id: &str) -> Result<Vec<ActionStatusReport>> {
        Ok(self
            .workflows
            .read()
            .map_err(poisoned)?
            .get(id)
            .map(|rows| rows.events.clone())
            .unwrap_or_default())
    }

    async fn put_data(
        &self,
        id: &str,
        metadata: &serde_json::Value,
        data: &[u8],
    ) -> Result<WorkflowData> {
        let mut workflows = self.workflows.write().map_err(poisoned)?;
        let rows = workflows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let entry = WorkflowData {
            workflow_id: id.to_string(),
            version: rows.data.last().map(|d| d.version).unwrap_or(0) + 1,
            metadata: metadata.clone(),
            data: data.to_vec(),
            created_at: Utc::now(),
        };
        rows.data.push(entry.clone());
        Ok(entry)
    }

    async fn get_data(&self, id: &str, version: u32) -> Result<Option<WorkflowData>> {
        let workflows = self.workflows.read().map_err(poisoned)?;
        let Some(rows) = workflows.get(id) else {
            return Ok(None);
        };
        Ok(if version == 0 {
            rows.data.last().cloned()
        } else {
            rows.data.iter().find(|d| d.version == version).cloned()
        })
    }

    async fn latest_data_version(&self, id: &str) -> Result<u32> {
        Ok(self
            .workflows
            .read()
            .map_err(poisoned)?
            .get(id)
            .and_then(|rows| rows.data.last().map(|d| d.version))
            .unwrap_or(0))
    }
}
