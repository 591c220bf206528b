//! Test fixture utilities.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use broker_pool::{ConnectionConfig, PoolConfig, RetryPolicy};

static QUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Queue-name fixture that keeps concurrently running tests apart.
#[derive(Debug, Clone)]
pub struct QueueFixture {
    /// Prefix shared by every queue of this fixture.
    pub prefix: String,
    /// Queues handed out so far.
    pub queues: Vec<String>,
}

impl QueueFixture {
    /// Create a fixture; the prefix is suffixed with the process id.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: format!("{}_{}", prefix.into(), std::process::id()),
            queues: Vec::new(),
        }
    }

    /// A fresh, unique queue name.
    pub fn queue(&mut self, name: &str) -> String {
        let seq = QUEUE_SEQ.fetch_add(1, Ordering::Relaxed);
        let queue = format!("{}_{name}_{seq}", self.prefix);
        self.queues.push(queue.clone());
        queue
    }
}

/// Retry policy with no delay, for tests that exercise the retry bound.
#[must_use]
pub fn no_delay_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::fixed(Duration::ZERO).max_retries(max_retries)
}

/// Pool configuration with `pool_size` connections and no retry delay.
#[must_use]
pub fn pool_config(pool_size: u32, max_retries: u32) -> PoolConfig {
    PoolConfig::new()
        .pool_size(pool_size)
        .retry(no_delay_retry(max_retries))
}

/// Connection configuration for tests against a mock broker.
#[must_use]
pub fn mock_connection_config() -> ConnectionConfig {
    ConnectionConfig::new().host("mock-broker")
}
