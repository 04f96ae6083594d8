//! A read-through in-memory cache which keeps its entries fresh all by itself.
//!
//! # Introduction
//! Many applications keep semi-constant data (think of settings, feature flags or master data
//! fetched from a slow backend) in an in-memory cache. The classic *check cache, miss, load,
//! store* pattern has two well known problems: concurrent first accesses race each other into
//! performing the same expensive load several times, and every expired entry makes some unlucky
//! caller pay the full load latency again.
//!
//! This crate solves both problems at once. The [cache](crate::cache) loads each value exactly
//! once when it is requested for the first time and then registers the entry with a
//! [scheduler](crate::scheduler) which re-loads it periodically in the background. After the
//! first access, readers are therefore never blocked by a load again - they always observe the
//! most recently loaded value (which might be up to one refresh interval old, a documented and
//! accepted property of this design).
//!
//! # Features
//! * **At most one load per key** - concurrent first accesses for the same key are serialized
//!   so that only a single invocation of the [LoadStrategy](crate::strategy::LoadStrategy)
//!   takes place. All other callers simply observe the loaded value.
//! * **Background refreshes** - once loaded, an entry is refreshed periodically by a shared
//!   worker pool. Refresh failures are logged and suppressed, the last known good value remains
//!   visible to readers.
//! * **Staggered schedules** - the first refresh of each entry runs after a randomized delay so
//!   that caches being filled at application startup do not reload all their entries in one
//!   thundering herd.
//! * **Wait free reads** - cached values are replaced wholesale via atomic swaps
//!   ([arc-swap](https://crates.io/crates/arc-swap)). Readers never block on a refresh and never
//!   observe a partially constructed value.
//! * **100% Async/Await** - the whole crate builds upon [tokio](https://tokio.rs/) and
//!   async/await primitives as provided by Rust.
//!
//! # Modules
//! * **cache**: The central [SelfRefreshingCache](crate::cache::SelfRefreshingCache) along with
//!   its [Builder](crate::cache::Builder). See [crate::cache].
//! * **strategy**: The [LoadStrategy](crate::strategy::LoadStrategy) trait which has to be
//!   implemented to tell the cache how values are obtained. See [crate::strategy].
//! * **scheduler**: The shared worker pool which executes background refreshes. See
//!   [crate::scheduler].
//! * **entry**: The per-key state kept by a cache. See [crate::entry].
//! * **stats**: Some lock free metrics which each cache records. See [crate::stats].
//! * **error**: The errors reported by a cache. See [crate::error].
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod entry;
pub mod error;
pub mod scheduler;
pub mod stats;
pub mod strategy;

/// Initializes the logging system.
///
/// This installs **simplelog** to log to stdout. As we expect this crate to be embedded into
/// services running in docker containers, this is all that is needed for proper logging. The
/// date format being used is digestible by established tools like **greylog**.
///
/// Note that calling this is entirely optional - the crate itself only logs via the **log**
/// facade and happily works with whatever logger the embedding application has set up.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate self_refreshing_cache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. Currently this is the process environment, which is inspected by
        /// the scheduler to determine its worker pool size. Using this lock, we can
        /// still execute all other tests in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
