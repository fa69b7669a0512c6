//! Partition replica configuration

use std::time::Duration;

/// Configuration of a partition replica
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How often an idle primary proposes a safe time sync
    pub idle_safe_time_propagation_period: Duration,

    /// Rows per build index command
    pub build_index_batch_size: usize,

    /// How many times a proposal rejected for safe time reorder is retried
    pub max_reorder_retries: u32,

    /// Upper bound for a read waiting on safe time
    pub wait_timeout: Duration,

    /// Log entries retained before a snapshot truncates the log
    pub log_retention: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            idle_safe_time_propagation_period: Duration::from_millis(500),
            build_index_batch_size: 100,
            max_reorder_retries: 10,
            wait_timeout: Duration::from_secs(10),
            log_retention: 1024,
        }
    }
}

impl ReplicaConfig {
    /// Create config for tests, with idle propagation effectively disabled
    pub fn for_testing() -> Self {
        Self {
            idle_safe_time_propagation_period: Duration::from_secs(3600),
            build_index_batch_size: 2,
            max_reorder_retries: 10,
            wait_timeout: Duration::from_secs(3),
            log_retention: 1024,
        }
    }

    pub fn with_idle_safe_time_propagation_period(mut self, period: Duration) -> Self {
        self.idle_safe_time_propagation_period = period;
        self
    }

    pub fn with_build_index_batch_size(mut self, size: usize) -> Self {
        self.build_index_batch_size = size.max(1);
        self
    }

    pub fn with_log_retention(mut self, entries: usize) -> Self {
        self.log_retention = entries.max(1);
        self
    }
}
