//! Anvil Workflow Orchestrator
//!
//! The orchestrator is the single authority over workflow progress. Workers
//! poll it for contexts addressed to them and report every action transition
//! back; each report is checked against the immutable action list and
//! committed together with its audit event.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Orchestrator                        │
//! │  create ─▶ render ─▶ compile ─▶ flatten ─▶ persist   │
//! │  report ─▶ per-workflow lock ─▶ validate ─▶ CAS      │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │             WorkflowStore                   │    │
//! │  │        Memory | SQLite (sqlx)               │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                               │
//! │                      ▼                               │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │          WorkflowEvent broadcast            │    │
//! │  │   Created | ActionReported | Deleted        │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use anvil_workflow::{Orchestrator, MemoryStore};
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()));
//! let id = orchestrator.create_workflow("ubuntu", target).await?;
//! let contexts = orchestrator.get_workflow_contexts("00:11:22:33:44:55").await?;
//! ```

pub mod error;
pub mod orchestrator;
pub mod sqlite;
pub mod store;

pub use error::*;
pub use orchestrator::*;
pub use sqlite::SqliteStore;
pub use store::*;
