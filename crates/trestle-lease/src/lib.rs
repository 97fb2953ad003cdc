// Process-local concurrency primitives for guarding shared, lazily built
// resources: a bounded lease pool with blocking acquisition and a
// reference-counted object cache with delayed eviction.
//
// Both types are constructed explicitly and passed by reference to their
// consumers; there is no hidden global instance.
use std::time::Duration;

mod cache;
mod pool;

pub use cache::ObjectCache;
pub use pool::LeaseManager;

pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(thiserror::Error, Debug)]
pub enum LeaseError {
    /// The pool stayed exhausted for the whole wait window. Callers are
    /// expected to catch this kind specifically and apply their own backoff.
    #[error("lease wait timed out after {0:?}")]
    Timeout(Duration),
    #[error("resource creation failed: {0}")]
    Create(#[source] anyhow::Error),
}

/// Tuning knobs for a [`LeaseManager`].
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// Cap on objects per pool; a full pool blocks new lease calls.
    pub max_pool_size: usize,
    /// How long a lease call may wait on a full pool.
    pub max_pool_wait: Duration,
    /// Idle objects older than this are evicted during lease scans.
    pub max_obj_age: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 15,
            max_pool_wait: Duration::from_secs(60),
            max_obj_age: Duration::from_secs(600),
        }
    }
}

/// Default grace delay before a cache refcount decrement takes effect.
pub const DEFAULT_CACHE_GRACE: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_config_defaults() {
        let config = LeaseConfig::default();
        assert_eq!(config.max_pool_size, 15);
        assert_eq!(config.max_pool_wait, Duration::from_secs(60));
        assert_eq!(config.max_obj_age, Duration::from_secs(600));
    }
}
