//! Defines the strategy which tells a cache how to obtain values.
//!
//! A [LoadStrategy] is the single external collaborator of a
//! [SelfRefreshingCache](crate::cache::SelfRefreshingCache). It is invoked once when a key is
//! requested for the first time and then again for every background refresh of the entry. The
//! cache itself treats the strategy as entirely opaque - it neither interprets the errors being
//! returned nor does it enforce any timeout on a load. A strategy is therefore expected to
//! complete (or fail) in bounded time on its own.
use async_trait::async_trait;

/// Represents a strategy for loading values of type `V` provided a key of type `K`.
///
/// Note that a strategy has to be shareable across tasks (`Send + Sync`) as the background
/// refreshes run concurrently to all foreground callers.
#[async_trait]
pub trait LoadStrategy<K, V>: Send + Sync {
    /// Performs the actual load operation to produce the value associated with the given key.
    ///
    /// Returning `Ok(None)` is a legitimate result and signals that there simply is no value
    /// for this key. The cache records this as a cached empty result and will not invoke the
    /// strategy again before the next scheduled refresh.
    ///
    /// # Errors
    /// Any error is permitted here. How it is handled depends on the call path: a failure
    /// during the very first load of a key is surfaced to the caller (or absorbed by a
    /// configured default value), whereas a failure during a background refresh is logged and
    /// suppressed while the previously loaded value remains visible.
    async fn load(&self, key: &K) -> anyhow::Result<Option<V>>;
}
