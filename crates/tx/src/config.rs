//! Transaction manager configuration

use std::time::Duration;

/// Timeouts and retry policy of the transaction manager
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// How long a lock request waits before failing with an acquire lock error
    pub lock_wait_timeout: Duration,

    /// Minimum time between two recovery attempts for the same abandoned transaction,
    /// also the period at which lock waiters re-check coordinator liveness
    pub abandoned_check_interval: Duration,

    /// Timeout of a single request to a replica
    pub rpc_timeout: Duration,

    /// Attempts made for a request that fails transiently
    pub retry_attempts: u32,

    /// Pause between two attempts
    pub retry_backoff: Duration,

    /// How long the volatile state of a finished transaction is kept. Also the
    /// period of the vacuum that evicts it.
    pub finished_state_ttl: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(10),
            abandoned_check_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(100),
            finished_state_ttl: Duration::from_secs(30),
        }
    }
}

impl TxConfig {
    /// Create config with short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(3),
            abandoned_check_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_secs(5),
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(20),
            finished_state_ttl: Duration::from_secs(30),
        }
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_abandoned_check_interval(mut self, interval: Duration) -> Self {
        self.abandoned_check_interval = interval;
        self
    }

    pub fn with_finished_state_ttl(mut self, ttl: Duration) -> Self {
        self.finished_state_ttl = ttl;
        self
    }
}
