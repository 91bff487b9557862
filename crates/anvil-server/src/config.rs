//! Server configuration

use anvil_workflow::{OrchestratorConfig, StoreConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default listen port
pub const DEFAULT_PORT: u16 = 42111;

/// Orchestrator server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    pub bind: SocketAddr,

    /// Workflow state storage
    pub store: StoreConfig,

    /// Orchestrator tuning
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            store: StoreConfig::Memory,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the bind address
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Persist state in a SQLite database file
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = StoreConfig::Sqlite { path: path.into() };
        self
    }

    /// Set the orchestrator tuning
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), DEFAULT_PORT);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_with_database() {
        let config = ServerConfig::default().with_database("/var/lib/anvil/anvil.db");
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/var/lib/anvil/anvil.db")
            }
        );
    }
}
