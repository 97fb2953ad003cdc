// Bounded lease pools with blocking acquisition and opportunistic age
// eviction.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::{LeaseConfig, LeaseError, Result};

struct LeaseEntry<T> {
    obj: Arc<T>,
    used: bool,
    t_created: Instant,
    t_leased: Option<Instant>,
    t_released: Option<Instant>,
}

struct Pool<T> {
    entries: Vec<LeaseEntry<T>>,
    // Single most-recently-released object; preferred on the next scan so a
    // hot resource stays hot.
    freed: Option<Arc<T>>,
    signal: Arc<Notify>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            freed: None,
            signal: Arc::new(Notify::new()),
        }
    }
}

/// Hands out exclusively held instances of an expensive resource, at most
/// `max_pool_size` live per pool id.
///
/// Pools are low-frequency control-plane state; one coarse lock per manager
/// guards all of them. The wait in [`LeaseManager::lease`] happens with the
/// lock released.
///
/// ```
/// use trestle_lease::{LeaseConfig, LeaseManager};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let manager: LeaseManager<String> = LeaseManager::new(LeaseConfig::default());
///     let obj = manager.lease("pool", || Ok("socket".to_string())).await.expect("lease");
///     manager.release(&obj, false);
/// });
/// ```
pub struct LeaseManager<T> {
    config: LeaseConfig,
    pools: Mutex<HashMap<String, Pool<T>>>,
}

// How often a blocked lease call re-checks the pool even without a release
// signal. Bounds the damage of a wake-up lost between unlock and re-wait.
const WAIT_SLICE: Duration = Duration::from_millis(250);

impl<T: Send + Sync + 'static> LeaseManager<T> {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Lease an object from `pool_id`, creating one via `creator` when the
    /// pool has room, or waiting up to `max_pool_wait` for a release.
    ///
    /// Returns [`LeaseError::Timeout`] if the wait window elapses with
    /// nothing available.
    pub async fn lease<F>(&self, pool_id: &str, creator: F) -> Result<Arc<T>>
    where
        F: Fn() -> anyhow::Result<T>,
    {
        let deadline = Instant::now() + self.config.max_pool_wait;
        loop {
            let signal = match self.try_lease(pool_id, &creator)? {
                Ok(obj) => return Ok(obj),
                Err(signal) => signal,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LeaseError::Timeout(self.config.max_pool_wait));
            }
            let wait = (deadline - now).min(WAIT_SLICE);
            // A timeout here is not an error; the loop re-scans either way.
            let _ = tokio::time::timeout(wait, signal.notified()).await;
        }
    }

    /// One scan under the lock: reuse, create, or report the pool's signal
    /// for the caller to wait on.
    fn try_lease<F>(
        &self,
        pool_id: &str,
        creator: &F,
    ) -> Result<std::result::Result<Arc<T>, Arc<Notify>>>
    where
        F: Fn() -> anyhow::Result<T>,
    {
        let mut pools = self.pools.lock();
        let pool = pools.entry(pool_id.to_string()).or_default();
        let max_obj_age = self.config.max_obj_age;

        // Evict idle objects that outlived their age bound before scanning.
        let before = pool.entries.len();
        pool.entries
            .retain(|entry| entry.used || entry.t_created.elapsed() <= max_obj_age);
        let evicted = before - pool.entries.len();
        if evicted > 0 {
            tracing::debug!(pool = pool_id, evicted, "evicted over-age idle objects");
        }

        // Prefer the most recently freed object.
        if let Some(freed) = pool.freed.take() {
            for entry in pool.entries.iter_mut() {
                if !entry.used && Arc::ptr_eq(&entry.obj, &freed) {
                    entry.used = true;
                    entry.t_leased = Some(Instant::now());
                    return Ok(Ok(Arc::clone(&entry.obj)));
                }
            }
        }

        // Any other idle object will do.
        for entry in pool.entries.iter_mut() {
            if !entry.used {
                entry.used = true;
                entry.t_leased = Some(Instant::now());
                return Ok(Ok(Arc::clone(&entry.obj)));
            }
        }

        if pool.entries.len() < self.config.max_pool_size {
            // Creation happens under the lock; creators are expected to be
            // cheap relative to the pooled resource's lifetime.
            let obj = Arc::new(creator().map_err(LeaseError::Create)?);
            pool.entries.push(LeaseEntry {
                obj: Arc::clone(&obj),
                used: true,
                t_created: Instant::now(),
                t_leased: Some(Instant::now()),
                t_released: None,
            });
            tracing::debug!(
                pool = pool_id,
                size = pool.entries.len(),
                "created pooled object"
            );
            return Ok(Ok(obj));
        }

        Ok(Err(Arc::clone(&pool.signal)))
    }

    /// Mark `obj` unleased and wake waiters on its pool. Releasing an object
    /// that is already free (or unknown) is a silent no-op so best-effort
    /// cleanup paths can always call this.
    ///
    /// With `delete` the object is removed from its pool entirely; the next
    /// lease on an emptied pool recreates.
    pub fn release(&self, obj: &Arc<T>, delete: bool) {
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            let Some(index) = pool
                .entries
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.obj, obj))
            else {
                continue;
            };
            if delete {
                pool.entries.remove(index);
            } else {
                let entry = &mut pool.entries[index];
                if entry.used {
                    entry.used = false;
                    entry.t_released = Some(Instant::now());
                    pool.freed = Some(Arc::clone(&entry.obj));
                }
            }
            pool.signal.notify_waiters();
            return;
        }
    }

    /// Number of live objects in a pool (leased or idle).
    pub fn pool_size(&self, pool_id: &str) -> usize {
        self.pools
            .lock()
            .get(pool_id)
            .map(|pool| pool.entries.len())
            .unwrap_or(0)
    }
}
