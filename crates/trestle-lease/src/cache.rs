// Reference-counted object cache with a grace delay before eviction.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const GLOBAL_NS: &str = "global";

struct CacheEntry<T> {
    obj: Arc<T>,
    refcount: usize,
}

struct CacheInner<T> {
    grace: Duration,
    entries: Mutex<HashMap<(String, String), CacheEntry<T>>>,
}

/// Shares one instance per `(namespace, oid)` among concurrent users.
///
/// Eviction is driven purely by the refcount returning to zero; each
/// decrement is deferred by a grace delay so rapid create/destroy churn does
/// not rebuild the object over and over. This is not an LRU.
///
/// ```
/// use std::time::Duration;
/// use trestle_lease::ObjectCache;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let cache: ObjectCache<String> = ObjectCache::new(Duration::ZERO);
///     let a = cache.get_obj("logger", || "log".to_string());
///     let b = cache.get_obj("logger", || unreachable!("cached"));
///     assert!(std::sync::Arc::ptr_eq(&a, &b));
/// });
/// ```
pub struct ObjectCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ObjectCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for ObjectCache<T> {
    /// A cache with the standard grace delay, [`crate::DEFAULT_CACHE_GRACE`].
    fn default() -> Self {
        Self::new(crate::DEFAULT_CACHE_GRACE)
    }
}

impl<T: Send + Sync + 'static> ObjectCache<T> {
    /// `grace` is how long a decrement is deferred; zero applies it
    /// immediately. Deferred decrements need a running tokio context.
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                grace,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The configured decrement delay.
    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Fetch or build the object for `oid` in the global namespace.
    pub fn get_obj<F>(&self, oid: &str, creator: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        self.get_obj_in(GLOBAL_NS, oid, creator)
    }

    /// Fetch or build the object for `(ns, oid)`, bumping its refcount.
    pub fn get_obj_in<F>(&self, ns: &str, oid: &str, creator: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let mut entries = self.inner.entries.lock();
        let key = (ns.to_string(), oid.to_string());
        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            return Arc::clone(&entry.obj);
        }
        let obj = Arc::new(creator());
        entries.insert(
            key,
            CacheEntry {
                obj: Arc::clone(&obj),
                refcount: 1,
            },
        );
        obj
    }

    /// Drop one reference to `obj` in the global namespace.
    pub fn rem_obj(&self, obj: &Arc<T>) -> bool {
        self.rem_obj_in(GLOBAL_NS, obj)
    }

    /// Drop one reference to `obj`, looked up by value identity — callers do
    /// not know their oid at release time. Returns whether the object was
    /// found. The refcount decrement lands after the grace delay; the entry
    /// is removed once it reaches zero.
    pub fn rem_obj_in(&self, ns: &str, obj: &Arc<T>) -> bool {
        let key = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .find(|((entry_ns, _), entry)| entry_ns == ns && Arc::ptr_eq(&entry.obj, obj))
                .map(|(key, _)| key.clone())
        };
        let Some(key) = key else {
            return false;
        };

        if self.inner.grace.is_zero() {
            decrement(&self.inner, &key);
        } else {
            let inner = Arc::clone(&self.inner);
            let grace = self.inner.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                decrement(&inner, &key);
            });
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

fn decrement<T>(inner: &CacheInner<T>, key: &(String, String)) {
    let mut entries = inner.entries.lock();
    if let Some(entry) = entries.get_mut(key) {
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            entries.remove(key);
            tracing::debug!(ns = %key.0, oid = %key.1, "evicted cached object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_cache_carries_the_standard_grace() {
        let cache: ObjectCache<u32> = ObjectCache::default();
        assert_eq!(cache.grace(), crate::DEFAULT_CACHE_GRACE);
        let explicit: ObjectCache<u32> = ObjectCache::new(Duration::from_secs(3));
        assert_eq!(explicit.grace(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn second_get_returns_the_identical_object() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::ZERO);
        let created = AtomicUsize::new(0);
        let a = cache.get_obj("x", || {
            created.fetch_add(1, Ordering::SeqCst);
            1
        });
        let b = cache.get_obj("x", || {
            created.fetch_add(1, Ordering::SeqCst);
            2
        });
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn object_survives_one_of_two_releases() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::ZERO);
        let a = cache.get_obj("x", || 1);
        let _b = cache.get_obj("x", || 2);

        assert!(cache.rem_obj(&a));
        assert_eq!(cache.len(), 1);

        // Refcount 2 -> 1: still served from cache.
        let c = cache.get_obj("x", || 3);
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn refcount_zero_evicts_and_recreates() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::ZERO);
        let a = cache.get_obj("x", || 1);
        let b = cache.get_obj("x", || 2);
        assert!(cache.rem_obj(&a));
        assert!(cache.rem_obj(&b));
        assert!(cache.is_empty());

        let fresh = cache.get_obj("x", || 9);
        assert!(!Arc::ptr_eq(&a, &fresh));
        assert_eq!(*fresh, 9);
    }

    #[tokio::test]
    async fn grace_delay_defers_the_decrement() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::from_millis(40));
        let a = cache.get_obj("x", || 1);
        assert!(cache.rem_obj(&a));

        // Inside the grace window the entry is still alive.
        assert_eq!(cache.len(), 1);
        let b = cache.get_obj("x", || 2);
        assert!(Arc::ptr_eq(&a, &b));

        // After the window, the earlier decrement lands (refcount 2 -> 1,
        // the re-get above bumped it back).
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.rem_obj(&b));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::ZERO);
        let a = cache.get_obj_in("ns1", "x", || 1);
        let b = cache.get_obj_in("ns2", "x", || 2);
        assert!(!Arc::ptr_eq(&a, &b));

        // Identity lookup is namespace-scoped.
        assert!(!cache.rem_obj_in("ns2", &a));
        assert!(cache.rem_obj_in("ns1", &a));
    }

    #[tokio::test]
    async fn removing_an_unknown_object_reports_not_found() {
        let cache: ObjectCache<u32> = ObjectCache::new(Duration::ZERO);
        let foreign = Arc::new(5u32);
        assert!(!cache.rem_obj(&foreign));
    }
}
