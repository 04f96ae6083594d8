//! Defines the errors reported by a cache.
//!
//! Note that errors produced by a [LoadStrategy](crate::strategy::LoadStrategy) itself travel
//! as `anyhow::Error` and are wrapped into one of the variants below whenever they have to
//! cross the public API of the cache. Failures of background refreshes never surface here at
//! all - they are logged and suppressed so that a transient failure cannot terminate a refresh
//! schedule.
use std::time::Duration;
use thiserror::Error;

/// Enumerates the errors which a cache can report to its callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The very first load for a key failed and no default value was configured to absorb
    /// the failure.
    ///
    /// The affected entry remains in its never loaded state, therefore the next call to
    /// `get` for the same key will retry the load from scratch.
    #[error("Could not initialize the value for key '{key}'")]
    InitialLoadFailed {
        /// The key for which the initial load failed.
        key: String,
        /// The underlying error reported by the load strategy.
        #[source]
        source: anyhow::Error,
    },

    /// A forced refresh failed.
    ///
    /// In contrast to scheduled refreshes (which suppress failures), a forced refresh
    /// propagates the failure to the caller which requested it. The previously cached value
    /// remains untouched.
    #[error("Failed to refresh the value for key '{key}'")]
    ForcedRefreshFailed {
        /// The key for which the forced refresh failed.
        key: String,
        /// The underlying error reported by the load strategy.
        #[source]
        source: anyhow::Error,
    },

    /// The refresh interval given to the builder is below the permitted minimum.
    #[error("The refresh interval {interval:?} is shorter than the minimal permitted interval {minimum:?}")]
    RefreshIntervalTooShort {
        /// The interval which was requested.
        interval: Duration,
        /// The minimal interval permitted by the builder.
        minimum: Duration,
    },

    /// The builder was instructed to seed initial loads from the default value without a
    /// default value being configured.
    #[error("use_default_value_for_initial_load requires a default value to be configured")]
    DefaultValueMissing,
}
