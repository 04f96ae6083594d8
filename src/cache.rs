//! Provides a read-through cache which keeps its entries fresh via background refreshes.
//!
//! A [SelfRefreshingCache] loads the value for each key exactly once on its first access (all
//! concurrent first accesses are serialized so that only one of them performs the load) and
//! then registers the entry with a [Scheduler](crate::scheduler::Scheduler) for periodic
//! background refreshes. Readers therefore only ever pay the load latency once per key - all
//! later reads simply observe the most recently loaded value.
//!
//! # Staleness
//! No guarantees are made to the freshness of a value: a reader may observe a value which is
//! up to one refresh interval (plus the randomized scheduling offset) old. Also, a failure
//! during a background refresh delays the next update until the following tick while the stale
//! value remains visible. Both are accepted properties of this design, not bugs.
//!
//! # Handling of load failures
//! A failure during the *initial* load of a key is special: with no default value configured
//! it is surfaced to the caller as [CacheError::InitialLoadFailed] and the next access simply
//! retries the load. With a default value configured, the failure is absorbed - the default is
//! installed, an aggressive one-time retry is scheduled and the caller never notices. Failures
//! of scheduled refreshes are always logged and suppressed.
//!
//! # Example
//! ```
//! # use std::time::Duration;
//! # use async_trait::async_trait;
//! # use self_refreshing_cache::cache::SelfRefreshingCache;
//! # use self_refreshing_cache::strategy::LoadStrategy;
//! struct GreetingStrategy;
//!
//! #[async_trait]
//! impl LoadStrategy<String, String> for GreetingStrategy {
//!     async fn load(&self, key: &String) -> anyhow::Result<Option<String>> {
//!         // Most probably an expensive lookup in a remote system would happen here...
//!         Ok(Some(format!("Hello {}", key)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = SelfRefreshingCache::builder()
//!         .load_strategy(GreetingStrategy)
//!         .refresh_interval(Duration::from_secs(60))
//!         .build()
//!         .unwrap();
//!
//!     let value = cache.get(&"World".to_owned()).await.unwrap();
//!     assert_eq!(value.unwrap().as_str(), "Hello World");
//! }
//! ```
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::scheduler::Scheduler;
use crate::stats::CacheStats;
use crate::strategy::LoadStrategy;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Contains the minimal refresh interval permitted by default.
///
/// A cache refreshing its entries more often than this is most probably better off loading
/// its values directly. The limit can be lowered via
/// [min_refresh_interval](Builder::min_refresh_interval) where this reasoning does not apply
/// (e.g. in tests).
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Contains the default upper bound for the delay of the one-time retry which is scheduled
/// after an initial load failed and was absorbed by a configured default value.
pub const FAILED_INITIAL_LOAD_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

/// Determines the proportion of the refresh interval which is used as the upper bound of the
/// randomized delay before the first scheduled refresh of an entry.
///
/// Drawing the first delay uniformly from `[0, REFRESH_PERIOD_PROPORTION * refresh_interval)`
/// staggers the refresh schedules of entries which were created at the same wall-clock moment
/// (e.g. during application startup) so that they do not reload in one synchronized spike.
pub const REFRESH_PERIOD_PROPORTION: f64 = 0.5;

/// Contains the default capacity hint for the entry table.
const DEFAULT_CAPACITY: usize = 16;

/// A cache with loading semantics which keeps its entries fresh via scheduled background
/// refreshes.
///
/// Instances are created via [SelfRefreshingCache::builder]. A cache owns its entry table for
/// its whole lifetime; entries are created on first access and never removed. Note that the
/// capacity given to the builder is an allocation hint, not an enforced limit.
///
/// A cache is inherently shared: all methods take `&self` and the whole struct is `Send` and
/// `Sync`, so it is commonly wrapped into an `Arc` and handed to whoever needs it.
pub struct SelfRefreshingCache<K, V> {
    table: ArcSwap<HashMap<K, Arc<CacheEntry<K, V>>>>,
    create_lock: Mutex<()>,
    strategy: Arc<dyn LoadStrategy<K, V>>,
    scheduler: Arc<Scheduler>,
    refresh_interval: Duration,
    max_initial_delay: Duration,
    failed_initial_load_retry_delay: Duration,
    default_value: Option<Arc<V>>,
    use_default_value_for_initial_load: bool,
    stats: Arc<CacheStats>,
}

impl<K, V> SelfRefreshingCache<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a builder used to set up a new cache.
    pub fn builder() -> Builder<K, V> {
        Builder::new()
    }

    /// Returns the value associated with the given key, loading it on first access.
    ///
    /// For a key which has never been requested before, this creates an entry, performs the
    /// initial load synchronously (or seeds the configured default value instead, if so
    /// requested) and registers the entry for periodic background refreshes. All of this
    /// happens at most once per key, no matter how many callers request the same key
    /// concurrently - the losers of that race simply observe the state left behind by the
    /// winner.
    ///
    /// For an already loaded key this returns the most recently loaded value without ever
    /// invoking the load strategy. An absent result means that the strategy legitimately
    /// produced no value for this key.
    ///
    /// # Errors
    /// Fails with [CacheError::InitialLoadFailed] if the initial load fails and no default
    /// value is configured. The entry then remains unloaded, therefore the next call for the
    /// same key will retry the load.
    pub async fn get(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
        self.stats.record_read();

        let entry = match self.table.load().get(key) {
            Some(entry) => entry.clone(),
            None => self.create_entry(key),
        };

        {
            let _init_guard = entry.lock_for_init().await;

            if !entry.has_loaded() {
                log::debug!("Performing the first time setup for {}...", entry);

                match self
                    .default_value
                    .as_ref()
                    .filter(|_| self.use_default_value_for_initial_load)
                {
                    Some(default_value) => entry.set_value(default_value.clone()),
                    None => {
                        if let Err(error) = entry.refresh().await {
                            self.handle_initial_failure(&entry, error)?;
                        }
                    }
                }

                // Set up the periodic refresh schedule. The first run is delayed by a random
                // offset to stagger entries created at the same moment...
                self.scheduler.schedule_repeating(
                    entry.clone(),
                    self.random_delay_offset(self.max_initial_delay),
                    self.refresh_interval,
                );
            }
        }

        Ok(entry.value())
    }

    /// Forces a refresh of the value for the given key and returns the result.
    ///
    /// This bypasses both, the "already loaded" check and the cadence of the periodic
    /// schedule: the load strategy is invoked right away and its result is installed and
    /// returned. If no entry exists for the key yet, this simply behaves like
    /// [get](SelfRefreshingCache::get).
    ///
    /// # Errors
    /// In contrast to scheduled refreshes, a failure here is propagated to the caller as
    /// [CacheError::ForcedRefreshFailed]. The previously cached value remains untouched.
    pub async fn get_force_refresh(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
        let entry = self.table.load().get(key).cloned();

        match entry {
            Some(entry) => {
                self.stats.record_read();

                match entry.refresh().await {
                    Ok(()) => Ok(entry.value()),
                    Err(error) => Err(CacheError::ForcedRefreshFailed {
                        key: key.to_string(),
                        source: error,
                    }),
                }
            }
            None => self.get(key).await,
        }
    }

    /// Creates (or, in case another caller won the race, fetches) the entry for the given key.
    ///
    /// The table-wide lock is scoped strictly to this re-check and create-and-insert step -
    /// it is never held during a load.
    fn create_entry(&self, key: &K) -> Arc<CacheEntry<K, V>> {
        let _guard = self.create_lock.lock().unwrap();

        // Re-check under the lock - another caller might have created the entry in the
        // meantime...
        if let Some(entry) = self.table.load().get(key) {
            return entry.clone();
        }

        log::debug!("No entry for key '{}' is present yet, creating one...", key);

        let entry = Arc::new(CacheEntry::new(
            key.clone(),
            self.strategy.clone(),
            self.stats.clone(),
        ));

        let mut next_table = HashMap::clone(&self.table.load());
        let _ = next_table.insert(key.clone(), entry.clone());
        self.table.store(Arc::new(next_table));

        entry
    }

    /// Handles a failure of the initial load for the given entry.
    ///
    /// With a default value configured, the failure is absorbed: the default is installed and
    /// a one-time aggressive retry is scheduled (in addition to the regular periodic schedule
    /// which the caller registers afterwards - the two deliberately race each other, see the
    /// module documentation). Without a default value, the failure is fatal for this call.
    fn handle_initial_failure(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        error: anyhow::Error,
    ) -> Result<(), CacheError> {
        log::error!("The initial load for {} failed: {:#}", entry, error);

        if let Some(default_value) = &self.default_value {
            entry.set_value(default_value.clone());

            // Try to replace the default by a real value way before the regular schedule
            // would...
            self.scheduler.schedule_once(
                entry.clone(),
                self.random_delay_offset(self.failed_initial_load_retry_delay),
            );

            Ok(())
        } else {
            Err(CacheError::InitialLoadFailed {
                key: entry.key().to_string(),
                source: error,
            })
        }
    }

    /// Draws a random delay uniformly from `[0, bound)`.
    fn random_delay_offset(&self, bound: Duration) -> Duration {
        bound.mul_f64(rand::random::<f64>())
    }

    /// Returns the interval between two scheduled refreshes of an entry.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns the upper bound of the randomized delay before the first scheduled refresh of
    /// an entry.
    ///
    /// This is fixed to [REFRESH_PERIOD_PROPORTION] times the refresh interval.
    pub fn max_initial_delay(&self) -> Duration {
        self.max_initial_delay
    }

    /// Returns the number of entries in this cache.
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    /// Determines if this cache contains no entries at all.
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Provides access to the metrics recorded by this cache.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Sets up and creates a [SelfRefreshingCache].
///
/// A load strategy and a refresh interval always have to be given, everything else is
/// optional:
///
/// * `capacity`: a hint for the initial size of the entry table.
/// * `default_value`: a value to fall back to when an initial load fails. Without it, a
///   failing initial load is reported to the caller.
/// * `use_default_value_for_initial_load`: skips the synchronous initial load entirely and
///   seeds each entry with the default value - the first real value then arrives with the
///   first background refresh. This keeps first accesses fast if an approximate value is
///   acceptable for a while.
/// * `failed_initial_load_retry_delay`: bounds the delay of the one-time retry after an
///   absorbed initial load failure.
/// * `scheduler`: the worker pool to run background refreshes on. Construct one scheduler per
///   process and share it across all caches to bound the total refresh concurrency. If none
///   is given, the cache creates its own (honoring the pool size environment override).
pub struct Builder<K, V> {
    strategy: Option<Arc<dyn LoadStrategy<K, V>>>,
    refresh_interval: Option<Duration>,
    min_refresh_interval: Duration,
    capacity: usize,
    default_value: Option<Arc<V>>,
    use_default_value_for_initial_load: bool,
    failed_initial_load_retry_delay: Duration,
    scheduler: Option<Arc<Scheduler>>,
}

impl<K, V> Default for Builder<K, V> {
    fn default() -> Self {
        Builder::new()
    }
}

impl<K, V> Builder<K, V> {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            strategy: None,
            refresh_interval: None,
            min_refresh_interval: MIN_REFRESH_INTERVAL,
            capacity: DEFAULT_CAPACITY,
            default_value: None,
            use_default_value_for_initial_load: false,
            failed_initial_load_retry_delay: FAILED_INITIAL_LOAD_RETRY_DELAY,
            scheduler: None,
        }
    }

    /// Specifies the strategy used to load values.
    pub fn load_strategy<S>(mut self, strategy: S) -> Self
    where
        S: LoadStrategy<K, V> + 'static,
    {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Specifies the interval between two scheduled refreshes of an entry.
    ///
    /// Must be at least the minimal refresh interval (one minute unless overridden via
    /// [min_refresh_interval](Builder::min_refresh_interval)).
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = Some(refresh_interval);
        self
    }

    /// Overrides the minimal permitted refresh interval.
    ///
    /// The default of one minute is a sanity limit for production use - mainly tests want to
    /// lower it to keep their runtime down.
    pub fn min_refresh_interval(mut self, min_refresh_interval: Duration) -> Self {
        self.min_refresh_interval = min_refresh_interval;
        self
    }

    /// Specifies the capacity hint used to size the entry table.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Specifies the default value to fall back to when an initial load fails.
    pub fn default_value(mut self, default_value: V) -> Self {
        self.default_value = Some(Arc::new(default_value));
        self
    }

    /// Requests that entries are seeded with the default value instead of performing a
    /// synchronous initial load.
    ///
    /// Requires a [default_value](Builder::default_value) to be configured.
    pub fn use_default_value_for_initial_load(mut self) -> Self {
        self.use_default_value_for_initial_load = true;
        self
    }

    /// Overrides the upper bound for the delay of the one-time retry which is scheduled after
    /// an initial load failed and was absorbed by the default value.
    pub fn failed_initial_load_retry_delay(mut self, delay: Duration) -> Self {
        self.failed_initial_load_retry_delay = delay;
        self
    }

    /// Specifies the scheduler which executes the background refreshes of this cache.
    pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validates the settings and creates the cache.
    ///
    /// # Errors
    /// Fails with [CacheError::RefreshIntervalTooShort] if the given refresh interval is
    /// below the permitted minimum and with [CacheError::DefaultValueMissing] if seeding from
    /// the default value was requested without configuring one.
    ///
    /// # Panics
    /// Panics if no load strategy or no refresh interval has been specified, as there are no
    /// sane defaults for either of them.
    pub fn build(self) -> Result<SelfRefreshingCache<K, V>, CacheError> {
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => panic!("A load strategy is required to build a cache!"),
        };
        let refresh_interval = match self.refresh_interval {
            Some(refresh_interval) => refresh_interval,
            None => panic!("A refresh interval is required to build a cache!"),
        };

        if refresh_interval < self.min_refresh_interval {
            return Err(CacheError::RefreshIntervalTooShort {
                interval: refresh_interval,
                minimum: self.min_refresh_interval,
            });
        }

        if self.use_default_value_for_initial_load && self.default_value.is_none() {
            return Err(CacheError::DefaultValueMissing);
        }

        Ok(SelfRefreshingCache {
            table: ArcSwap::from_pointee(HashMap::with_capacity(self.capacity)),
            create_lock: Mutex::new(()),
            strategy,
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(Scheduler::default())),
            refresh_interval,
            max_initial_delay: refresh_interval.mul_f64(REFRESH_PERIOD_PROPORTION),
            failed_initial_load_retry_delay: self.failed_initial_load_retry_delay,
            default_value: self.default_value,
            use_default_value_for_initial_load: self.use_default_value_for_initial_load,
            stats: Arc::new(CacheStats::new()),
        })
    }
}
