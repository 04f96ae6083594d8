//! Contains the per-key state kept by a cache.
//!
//! A [CacheEntry] is little more than an atomically swappable value plus the logic to re-load
//! it via the [LoadStrategy](crate::strategy::LoadStrategy) of its owning cache. Entries are
//! created by the cache on the first lookup of a key and are never removed again - the same
//! entry is then re-used by all subsequent lookups and by all background refreshes.
//!
//! Two details are worth pointing out. First, an entry distinguishes "never loaded" from
//! "loaded, and the result was empty" via a dedicated flag, as both states present themselves
//! as an absent value. Second, refreshes replace the value wholesale via an atomic swap:
//! concurrent readers either observe the complete old value or the complete new value, never
//! a torn one - which is why routine refreshes do not need any locking at all.
use crate::scheduler::ScheduledTask;
use crate::stats::CacheStats;
use crate::strategy::LoadStrategy;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

/// Represents the cached state for a single key.
///
/// The entry keeps the key itself, the most recently loaded value and the strategy required
/// to refresh it. Being registered with the [Scheduler](crate::scheduler::Scheduler) as a
/// [ScheduledTask], the entry is also the unit of work executed by background refreshes.
pub struct CacheEntry<K, V> {
    key: K,
    value: ArcSwapOption<V>,
    cached_empty: AtomicBool,
    strategy: Arc<dyn LoadStrategy<K, V>>,
    stats: Arc<CacheStats>,
    init_lock: Mutex<()>,
}

impl<K, V> CacheEntry<K, V>
where
    K: Display + Send + Sync,
    V: Send + Sync,
{
    /// Creates a new entry in its "never loaded" state.
    pub(crate) fn new(
        key: K,
        strategy: Arc<dyn LoadStrategy<K, V>>,
        stats: Arc<CacheStats>,
    ) -> Self {
        CacheEntry {
            key,
            value: ArcSwapOption::empty(),
            cached_empty: AtomicBool::new(false),
            strategy,
            stats,
            init_lock: Mutex::new(()),
        }
    }

    /// Returns the key this entry caches the value for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the currently cached value.
    ///
    /// Note that an absent value either means that this entry has never completed a load or
    /// that the last successful load legitimately yielded no value - consult
    /// [is_cached_empty](CacheEntry::is_cached_empty) to tell the two apart.
    pub fn value(&self) -> Option<Arc<V>> {
        self.value.load_full()
    }

    /// Determines if the last successful load yielded no value.
    pub fn is_cached_empty(&self) -> bool {
        self.cached_empty.load(Ordering::Acquire)
    }

    /// Determines if this entry has ever completed a load (or was seeded with a value).
    pub fn has_loaded(&self) -> bool {
        self.value.load().is_some() || self.is_cached_empty()
    }

    /// Invokes the load strategy and installs the result.
    ///
    /// On success, the value and the empty flag are updated to reflect the result of the
    /// load. On failure, the previously cached state remains untouched - it is up to the
    /// caller to decide whether the error has to be surfaced or suppressed.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        log::debug!("Refreshing the value for {}...", self);

        let watch = Instant::now();
        match self.strategy.load(&self.key).await {
            Ok(Some(value)) => {
                self.value.store(Some(Arc::new(value)));
                self.cached_empty.store(false, Ordering::Release);
                self.stats.record_load(watch.elapsed());
                Ok(())
            }
            Ok(None) => {
                self.value.store(None);
                self.cached_empty.store(true, Ordering::Release);
                self.stats.record_load(watch.elapsed());
                Ok(())
            }
            Err(error) => {
                self.stats.record_failed_load();
                Err(error)
            }
        }
    }

    /// Installs the given value directly, bypassing the load strategy.
    ///
    /// This is used by the cache to seed an entry with the configured default value.
    pub(crate) fn set_value(&self, value: Arc<V>) {
        self.value.store(Some(value));
        self.cached_empty.store(false, Ordering::Release);
    }

    /// Acquires the lock guarding the initial-load decision of this entry.
    pub(crate) async fn lock_for_init(&self) -> MutexGuard<'_, ()> {
        self.init_lock.lock().await
    }
}

impl<K: Display, V> Display for CacheEntry<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry '{}'", self.key)
    }
}

#[async_trait]
impl<K, V> ScheduledTask for CacheEntry<K, V>
where
    K: Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn run(&self) {
        if let Err(error) = self.refresh().await {
            // Eat the error - the stale value remains visible to readers and the next
            // scheduled run will simply try again...
            log::error!("Failed to refresh the value for {}: {:#}", self, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::CacheEntry;
    use crate::scheduler::ScheduledTask;
    use crate::stats::CacheStats;
    use crate::strategy::LoadStrategy;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    enum Behavior {
        Value(String),
        Empty,
        Fail,
    }

    struct TestStrategy {
        behavior: Mutex<Behavior>,
    }

    impl TestStrategy {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(TestStrategy {
                behavior: Mutex::new(behavior),
            })
        }

        fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }
    }

    #[async_trait]
    impl LoadStrategy<String, String> for TestStrategy {
        async fn load(&self, _key: &String) -> anyhow::Result<Option<String>> {
            match &*self.behavior.lock().unwrap() {
                Behavior::Value(value) => Ok(Some(value.clone())),
                Behavior::Empty => Ok(None),
                Behavior::Fail => Err(anyhow::anyhow!("Simulated load failure")),
            }
        }
    }

    fn entry(strategy: Arc<TestStrategy>) -> CacheEntry<String, String> {
        CacheEntry::new("test".to_owned(), strategy, Arc::new(CacheStats::new()))
    }

    #[test]
    fn a_new_entry_has_never_loaded() {
        let entry = entry(TestStrategy::new(Behavior::Value("x".to_owned())));

        assert_eq!(entry.has_loaded(), false);
        assert_eq!(entry.is_cached_empty(), false);
        assert_eq!(entry.value().is_none(), true);
    }

    #[test]
    fn a_successful_load_installs_the_value() {
        test_async(async {
            let entry = entry(TestStrategy::new(Behavior::Value("x".to_owned())));

            entry.refresh().await.unwrap();

            assert_eq!(entry.has_loaded(), true);
            assert_eq!(entry.is_cached_empty(), false);
            assert_eq!(entry.value().unwrap().as_str(), "x");
        });
    }

    #[test]
    fn an_empty_result_is_recorded_as_such() {
        test_async(async {
            let strategy = TestStrategy::new(Behavior::Empty);
            let entry = entry(strategy.clone());

            entry.refresh().await.unwrap();

            // There is no value, but the entry counts as loaded...
            assert_eq!(entry.value().is_none(), true);
            assert_eq!(entry.is_cached_empty(), true);
            assert_eq!(entry.has_loaded(), true);

            // ...and a later non-empty load clears the empty flag again.
            strategy.set_behavior(Behavior::Value("x".to_owned()));
            entry.refresh().await.unwrap();
            assert_eq!(entry.value().unwrap().as_str(), "x");
            assert_eq!(entry.is_cached_empty(), false);
        });
    }

    #[test]
    fn a_failed_load_leaves_the_previous_state_untouched() {
        test_async(async {
            let strategy = TestStrategy::new(Behavior::Value("x".to_owned()));
            let entry = entry(strategy.clone());

            entry.refresh().await.unwrap();
            strategy.set_behavior(Behavior::Fail);

            // A direct refresh reports the failure but keeps the value...
            assert_eq!(entry.refresh().await.is_err(), true);
            assert_eq!(entry.value().unwrap().as_str(), "x");
            assert_eq!(entry.is_cached_empty(), false);

            // ...and a scheduled run swallows the failure entirely.
            entry.run().await;
            assert_eq!(entry.value().unwrap().as_str(), "x");
        });
    }
}
