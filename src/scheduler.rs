//! Provides the shared worker pool which executes background refreshes.
//!
//! All refresh work of all caches within a process is intended to run on a single [Scheduler].
//! This bounds the number of concurrently executing load strategy invocations (and therefore
//! the pressure put on the backends being loaded from) no matter how many caches or entries
//! exist. A scheduler is explicitly injectable: construct one at process scope, hand it to each
//! [Builder](crate::cache::Builder) and invoke [shutdown](Scheduler::shutdown) when the process
//! terminates.
//!
//! The pool size can be overridden without recompiling by setting the environment variable
//! `SELF_REFRESHING_CACHE_POOL_SIZE`. If the variable is absent (or unparseable), the default
//! of 10 workers is used.
//!
//! Note that a scheduler only limits the number of tasks *running* at the same time. Timers of
//! due tasks simply wait for a free worker, they are never skipped.
use async_trait::async_trait;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

/// Contains the name of the environment variable which overrides the worker pool size.
pub const POOL_SIZE_ENV_VAR: &str = "SELF_REFRESHING_CACHE_POOL_SIZE";

/// Contains the number of workers being used unless overridden via the environment.
const DEFAULT_POOL_SIZE: usize = 10;

/// Describes a unit of work which can be handed to a [Scheduler].
///
/// The **Display** implementation is used in log messages whenever a schedule for the task is
/// created, discarded or dropped.
#[async_trait]
pub trait ScheduledTask: Display + Send + Sync + 'static {
    /// Executes the task.
    ///
    /// Note that this must not panic and has no way of reporting errors - a task is expected
    /// to handle (log and suppress) its own failures so that a single failed run never
    /// terminates a repeating schedule.
    async fn run(&self);
}

/// Executes scheduled tasks on a bounded pool of workers.
///
/// A scheduler supports two kinds of schedules: one-time execution after a delay
/// ([schedule_once](Scheduler::schedule_once)) and fixed-rate repetition after an initial delay
/// ([schedule_repeating](Scheduler::schedule_repeating)). Both are executed by tokio tasks
/// which compete for one of the `pool_size` worker permits before actually running, so that at
/// most `pool_size` tasks perform work at any point in time.
///
/// Once [shutdown](Scheduler::shutdown) has been invoked, all pending schedules are cancelled
/// and new schedules are silently discarded.
pub struct Scheduler {
    pool_size: usize,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(pool_size_from_env())
    }
}

/// Determines the worker pool size to use from the process environment.
fn pool_size_from_env() -> usize {
    match std::env::var(POOL_SIZE_ENV_VAR) {
        Ok(value) => match value.parse::<usize>() {
            Ok(pool_size) if pool_size > 0 => pool_size,
            _ => {
                log::error!(
                    "Ignoring invalid value '{}' in {} - using {} workers.",
                    value,
                    POOL_SIZE_ENV_VAR,
                    DEFAULT_POOL_SIZE
                );
                DEFAULT_POOL_SIZE
            }
        },
        Err(_) => DEFAULT_POOL_SIZE,
    }
}

impl Scheduler {
    /// Creates a new scheduler with the given number of workers.
    ///
    /// Note that in most cases [Scheduler::default] is the better choice as it also honors the
    /// environment override.
    pub fn new(pool_size: usize) -> Self {
        let (shutdown, _) = watch::channel(false);

        log::info!(
            "Starting refresh scheduler with {} worker(s) on {} core(s)...",
            pool_size,
            num_cpus::get()
        );

        Scheduler {
            pool_size,
            workers: Arc::new(Semaphore::new(pool_size)),
            shutdown,
        }
    }

    /// Returns the number of workers of this scheduler.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Determines if [shutdown](Scheduler::shutdown) has already been invoked.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Schedules the given task for a single execution after the given delay.
    ///
    /// If the scheduler is shut down before the delay has elapsed, the task is never run.
    pub fn schedule_once(&self, task: Arc<dyn ScheduledTask>, delay: Duration) {
        if self.is_shutdown() {
            log::debug!(
                "Scheduler is already shut down - discarding one-time schedule for {}...",
                task
            );
            return;
        }

        let workers = self.workers.clone();
        let mut shutdown = self.shutdown.subscribe();

        crate::spawn!(async move {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::debug!("Dropping pending one-time schedule for {}...", task);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Ok(_permit) = workers.acquire().await {
                        task.run().await;
                    }
                }
            }
        });
    }

    /// Schedules the given task to run after `initial_delay` and then every `interval`.
    ///
    /// The schedule runs at a fixed rate. However, if a run is delayed (e.g. because all
    /// workers were busy or the task itself was slow), subsequent runs are re-aligned rather
    /// than fired back to back. The schedule only terminates once the scheduler is shut down.
    pub fn schedule_repeating(
        &self,
        task: Arc<dyn ScheduledTask>,
        initial_delay: Duration,
        interval: Duration,
    ) {
        if self.is_shutdown() {
            log::debug!(
                "Scheduler is already shut down - discarding repeating schedule for {}...",
                task
            );
            return;
        }

        let workers = self.workers.clone();
        let mut shutdown = self.shutdown.subscribe();

        crate::spawn!(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + initial_delay, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        log::debug!("Terminating repeating schedule for {}...", task);
                        return;
                    }
                    _ = timer.tick() => {
                        match workers.acquire().await {
                            Ok(_permit) => task.run().await,
                            // The semaphore is closed, the scheduler is gone...
                            Err(_) => return,
                        }
                    }
                }
            }
        });
    }

    /// Shuts the scheduler down.
    ///
    /// This stops accepting new schedules and cancels all pending scheduled work. A run which
    /// is already executing is not interrupted, but no further runs will take place.
    pub fn shutdown(&self) {
        log::info!("Shutting down refresh scheduler...");

        self.workers.close();
        let _ = self.shutdown.send(true);
    }
}
