//! Anvil CRD Types
//!
//! This crate provides the resource and document types shared by the
//! orchestrator, the worker and the HTTP surface.
//!
//! # Resources
//!
//! - `Hardware` - Machine inventory records (network interfaces)
//! - `Template` - Stored provisioning templates (raw YAML)
//! - `Workflow` - A compiled template: tasks and actions in execution order
//! - `WorkflowRecord` / `WorkflowContext` - A template bound to hardware and
//!   its authoritative execution state
//!
//! # Compilation
//!
//! ```text
//!  raw YAML ──render(devices)──▶ concrete YAML ──compile──▶ Workflow ──flatten──▶ [WorkflowAction]
//! ```
//!
//! # Credit
//!
//! The template format follows Tinkerbell (tinkerbell.org) so existing
//! provisioning templates can be reused unchanged.

pub mod compile;
pub mod error;
pub mod hardware;
pub mod image;
pub mod metadata;
pub mod template;
pub mod workflow;

pub use compile::*;
pub use error::*;
pub use hardware::*;
pub use image::*;
pub use metadata::*;
pub use template::*;
pub use workflow::*;

/// API version for all Anvil resources
pub const API_VERSION: &str = "anvil.metal/v1";

/// API group for all Anvil resources
pub const API_GROUP: &str = "anvil.metal";

/// API version string
pub const VERSION: &str = "v1";
