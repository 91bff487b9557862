//! Anvil Container Runtime
//!
//! Every workflow action runs in its own container. This crate wraps a
//! container engine behind [`ContainerEngine`] and layers the validation and
//! outcome classification the worker relies on in [`ContainerAdapter`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ContainerAdapter              │
//! │  validate ids, names, volume bindings    │
//! │  classify exit: SUCCESS | FAILED | TIMEOUT│
//! └───────────────────┬──────────────────────┘
//!                     │
//!          ┌──────────┴──────────┐
//!          ▼                     ▼
//!     DockerCli             MockEngine
//!  (docker binary)        (scripted exits)
//! ```

pub mod adapter;
pub mod docker;
pub mod engine;
pub mod error;
pub mod mock;

pub use adapter::*;
pub use docker::*;
pub use engine::*;
pub use error::*;
pub use mock::*;
