//! Fingerprint-keyed cache of expensive, shareable resources.
//!
//! Every fingerprint owns a slot holding a `tokio::sync::OnceCell`.  The map
//! lock is only held to find or insert the slot; construction happens inside
//! the cell, so concurrent callers for one fingerprint wait for a single
//! build while builds for different fingerprints proceed in parallel.
//! A constructor that fails leaves the cell empty, so the next caller
//! retries instead of inheriting the failure.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::Fingerprint;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Hit/miss counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub builds: u64,
    pub failed_builds: u64,
}

pub struct ResourceCache<T> {
    name: String,
    slots: DashMap<Fingerprint, Slot<T>>,
    hits: AtomicU64,
    builds: AtomicU64,
    failed_builds: AtomicU64,
}

impl<T> ResourceCache<T>
where
    T: Send + Sync + 'static,
{
    /// `name` labels the cache in log lines (e.g. `"agents"`).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: DashMap::new(),
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            failed_builds: AtomicU64::new(0),
        }
    }

    /// Return the resource for `fingerprint`, constructing it with `ctor` on
    /// the first request.  The constructor runs at most once per fingerprint
    /// even under concurrent callers.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        ctor: F,
    ) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = %self.name, fingerprint = %fingerprint, "resource cache hit");
            return Ok(value);
        }

        // Clone the slot out so no map guard is held across the await.
        let slot: Slot<T> = self
            .slots
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let constructed = AtomicBool::new(false);
        let constructed_ref = &constructed;
        let result = slot
            .get_or_try_init(move || async move {
                constructed_ref.store(true, Ordering::Relaxed);
                ctor().await.map(Arc::new)
            })
            .await;

        match result {
            Ok(value) => {
                if constructed.load(Ordering::Relaxed) {
                    self.builds.fetch_add(1, Ordering::Relaxed);
                    info!(cache = %self.name, fingerprint = %fingerprint, "resource constructed");
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Arc::clone(value))
            }
            Err(e) => {
                self.failed_builds.fetch_add(1, Ordering::Relaxed);
                // Other callers may already be waiting on this cell and will
                // retry inside it; only drop the slot when the map and this
                // call are its last holders.
                self.slots.remove_if(fingerprint, |_, s| {
                    Arc::ptr_eq(s, &slot) && Arc::strong_count(s) == 2 && !s.initialized()
                });
                Err(e)
            }
        }
    }

    /// Already-built resource, if any.  Never constructs.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<T>> {
        self.slots.get(fingerprint).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.get(fingerprint).is_some()
    }

    /// Drop the entry for `fingerprint`.  Used on the rebuild path when a
    /// cached resource turns out to be dead (e.g. its connection closed);
    /// the next `get_or_create` constructs a fresh one.
    pub fn evict(&self, fingerprint: &Fingerprint) -> Option<Arc<T>> {
        let (_, slot) = self.slots.remove(fingerprint)?;
        info!(cache = %self.name, fingerprint = %fingerprint, "resource evicted");
        slot.get().cloned()
    }

    /// Number of built resources.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.  Intended for tests; in production a process restart
    /// is the eviction mechanism.
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            failed_builds: self.failed_builds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentSignature;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct Agent {
        serial: usize,
    }

    fn fp(model: &str) -> Fingerprint {
        Fingerprint::new("acme", model, "sqlite", "/data/sales.db")
    }

    #[tokio::test]
    async fn second_call_hits() {
        let cache: ResourceCache<Agent> = ResourceCache::new("agents");
        let first = cache
            .get_or_create(&fp("m1"), || async { Ok::<_, String>(Agent { serial: 1 }) })
            .await
            .unwrap();
        let second = cache
            .get_or_create(&fp("m1"), || async { Ok::<_, String>(Agent { serial: 2 }) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.serial, 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, builds: 1, failed_builds: 0 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_construct_once() {
        let cache: Arc<ResourceCache<Agent>> = Arc::new(ResourceCache::new("agents"));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create(&fp("m1"), || async move {
                        let serial = calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(Agent { serial })
                    })
                    .await
                    .unwrap()
            }));
        }

        let agents: Vec<Arc<Agent>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(agents.iter().all(|a| Arc::ptr_eq(a, &agents[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_fingerprints_build_in_parallel() {
        // Both constructors must be inside `ctor` at the same time to pass
        // the barrier; a cache-wide lock would deadlock here.
        let cache: Arc<ResourceCache<Agent>> = Arc::new(ResourceCache::new("agents"));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let build = |model: &'static str, serial: usize| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                cache
                    .get_or_create(&fp(model), || async move {
                        barrier.wait().await;
                        Ok::<_, String>(Agent { serial })
                    })
                    .await
                    .unwrap()
            })
        };

        let a = build("m1", 1);
        let b = build("m2", 2);
        let joined = tokio::time::timeout(Duration::from_secs(5), async { (a.await, b.await) })
            .await
            .expect("parallel construction");
        assert_eq!(joined.0.unwrap().serial, 1);
        assert_eq!(joined.1.unwrap().serial, 2);
    }

    #[tokio::test]
    async fn changed_content_signature_misses() {
        let cache: ResourceCache<Agent> = ResourceCache::new("agents");
        let v1 = fp("m1").with_content(ContentSignature::File { len: 8, modified_ms: 100 });
        let v2 = fp("m1").with_content(ContentSignature::File { len: 12, modified_ms: 200 });

        cache.get_or_create(&v1, || async { Ok::<_, String>(Agent { serial: 1 }) }).await.unwrap();
        let rebuilt = cache
            .get_or_create(&v2, || async { Ok::<_, String>(Agent { serial: 2 }) })
            .await
            .unwrap();

        assert_eq!(rebuilt.serial, 2);
        assert_eq!(cache.stats().builds, 2);
        assert_eq!(cache.get(&v1).unwrap().serial, 1);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let cache: ResourceCache<Agent> = ResourceCache::new("agents");
        let err = cache
            .get_or_create(&fp("m1"), || async {
                Err::<Agent, _>("connection refused".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "connection refused");
        assert!(cache.is_empty());

        let ok = cache
            .get_or_create(&fp("m1"), || async { Ok::<_, String>(Agent { serial: 7 }) })
            .await
            .unwrap();
        assert_eq!(ok.serial, 7);
        assert_eq!(cache.stats().failed_builds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_retries_in_place_after_a_failed_build() {
        // A fails after 50ms while B waits on the same cell; B then builds for
        // 200ms and C arrives mid-build. C must share B's agent.
        let cache: Arc<ResourceCache<Agent>> = Arc::new(ResourceCache::new("agents"));
        let successes = Arc::new(AtomicUsize::new(0));

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_create(&fp("m1"), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<Agent, _>("connection refused".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let spawn_builder = |serial: usize, build_ms: u64| {
            let cache = Arc::clone(&cache);
            let successes = Arc::clone(&successes);
            tokio::spawn(async move {
                cache
                    .get_or_create(&fp("m1"), || async move {
                        tokio::time::sleep(Duration::from_millis(build_ms)).await;
                        successes.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(Agent { serial })
                    })
                    .await
                    .unwrap()
            })
        };

        let b = spawn_builder(1, 200);
        tokio::time::sleep(Duration::from_millis(90)).await;
        let c = spawn_builder(2, 10);

        assert!(a.await.unwrap().is_err());
        let b = b.await.unwrap();
        let c = c.await.unwrap();

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(b.serial, 1);
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(cache.stats().builds, 1);
        assert_eq!(cache.stats().failed_builds, 1);
    }

    #[tokio::test]
    async fn evict_forces_rebuild() {
        let cache: ResourceCache<Agent> = ResourceCache::new("agents");
        cache
            .get_or_create(&fp("m1"), || async { Ok::<_, String>(Agent { serial: 1 }) })
            .await
            .unwrap();

        let evicted = cache.evict(&fp("m1")).unwrap();
        assert_eq!(evicted.serial, 1);
        assert!(!cache.contains(&fp("m1")));

        let rebuilt = cache
            .get_or_create(&fp("m1"), || async { Ok::<_, String>(Agent { serial: 2 }) })
            .await
            .unwrap();
        assert_eq!(rebuilt.serial, 2);
    }
}
