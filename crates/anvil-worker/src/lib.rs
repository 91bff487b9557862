//! Anvil Worker
//!
//! The per-machine agent. It polls the orchestrator for workflow contexts
//! addressed to its worker id, runs each of its actions as a container and
//! reports every transition back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Worker                         │
//! │  poll ─▶ JoinSet (one fiber per workflow)         │
//! │            │                                      │
//! │            ▼                                      │
//! │  IN_PROGRESS ─▶ ContainerAdapter ─▶ terminal state│
//! │            │                                      │
//! │            ▼                                      │
//! │   OrchestratorClient (HTTP | in-process)          │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod worker;

pub use client::*;
pub use config::*;
pub use error::*;
pub use worker::*;
