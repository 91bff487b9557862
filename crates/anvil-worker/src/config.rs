//! Worker configuration

use crate::error::{Result, WorkerError};
use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker identity; actions whose rendered worker matches are executed
    /// here (usually the primary MAC address)
    pub worker_id: String,

    /// Interval between context polls
    pub poll_interval: Duration,

    /// Root of the per-workflow shared data directories
    /// If None, workflow data is neither seeded nor uploaded
    pub data_dir: Option<PathBuf>,

    /// Attempts for an orchestrator call that fails with a retriable error
    pub max_attempts: u32,

    /// First backoff delay; doubles on every retry
    pub backoff_base: Duration,

    /// Consecutive rejected reports tolerated before abandoning a workflow
    pub max_resyncs: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            poll_interval: Duration::from_secs(5),
            data_dir: None,
            max_attempts: 4,
            backoff_base: Duration::from_millis(250),
            max_resyncs: 3,
        }
    }
}

impl WorkerConfig {
    /// Create a config for a worker identity
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable workflow data sharing under `dir`
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the retry policy for orchestrator calls
    pub fn with_retries(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Check the config before starting
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(WorkerError::Config("worker id is empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(WorkerError::Config("poll interval must be positive".to_string()));
        }
        Ok(())
    }
}
