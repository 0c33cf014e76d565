//! Structured task group for per-task handlers.
//!
//! Every handler runs as its own tokio task inside a [`JoinSet`], so a panic
//! is contained to that task and surfaces as a join error. The task it was
//! processing is never deleted and comes back after the visibility timeout.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tracing::{error, info, warn};

use crate::{
    engine::StatsCounters,
    error::{DeliveryError, Result},
    worker::TaskOutcome,
};

/// Owns the handlers spawned by one poll loop.
pub struct HandlerPool {
    handlers: JoinSet<TaskOutcome>,
    permits: Option<Arc<Semaphore>>,
    stats: Arc<StatsCounters>,
}

impl HandlerPool {
    /// Creates a pool. `max_concurrency == 0` means unbounded.
    pub fn new(max_concurrency: usize, stats: Arc<StatsCounters>) -> Self {
        let permits = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency)));
        Self { handlers: JoinSet::new(), permits, stats }
    }

    /// Spawns a handler, waiting for a free slot when the pool is bounded.
    pub async fn spawn<F>(&mut self, handler: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let permit = match &self.permits {
            Some(permits) => match permits.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    error!("handler semaphore closed; running without a concurrency limit");
                    None
                },
            },
            None => None,
        };

        self.handlers.spawn(async move {
            let outcome = handler.await;
            drop(permit);
            outcome
        });
    }

    /// Number of handlers not yet reaped.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are tracked.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Collects finished handlers without waiting.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(joined) = self.handlers.try_join_next() {
            self.record(joined);
            reaped += 1;
        }
        reaped
    }

    /// Waits for every in-flight handler, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if handlers are still running
    /// when the timeout elapses; those handlers are aborted and their tasks
    /// come back through the visibility timeout.
    pub async fn drain(mut self, timeout: Duration) -> Result<()> {
        let in_flight = self.handlers.len();
        if in_flight > 0 {
            info!(in_flight, timeout_secs = timeout.as_secs(), "draining in-flight handlers");
        }

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.handlers.join_next().await {
                self.record(joined);
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_elapsed) => {
                let remaining = self.handlers.len();
                error!(remaining, "handlers still running after shutdown timeout; aborting");
                self.handlers.abort_all();
                Err(DeliveryError::ShutdownTimeout { timeout_secs: timeout.as_secs() })
            },
        }
    }

    fn record(&self, joined: std::result::Result<TaskOutcome, JoinError>) {
        match joined {
            Ok(outcome) => self.stats.record(&outcome),
            Err(join_error) if join_error.is_panic() => {
                let error = DeliveryError::HandlerPanic { message: join_error.to_string() };
                warn!(error = %error, "handler panicked; task left for redelivery");
                self.stats.record(&TaskOutcome::Abandoned(error));
            },
            Err(join_error) => {
                warn!(error = %join_error, "handler canceled before completion");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn explode() -> TaskOutcome {
        panic!("handler blew up")
    }

    #[tokio::test]
    async fn outcomes_are_recorded_when_reaped() {
        let stats = Arc::new(StatsCounters::default());
        let mut pool = HandlerPool::new(0, stats.clone());

        pool.spawn(async { TaskOutcome::Succeeded }).await;
        pool.spawn(async { TaskOutcome::Exhausted }).await;
        pool.drain(Duration::from_secs(1)).await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.exhausted, 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated_and_counted_abandoned() {
        let stats = Arc::new(StatsCounters::default());
        let mut pool = HandlerPool::new(0, stats.clone());

        pool.spawn(async { explode() }).await;
        pool.spawn(async { TaskOutcome::Succeeded }).await;
        pool.drain(Duration::from_secs(1)).await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.succeeded, 1);
    }

    #[tokio::test]
    async fn bounded_pool_limits_concurrency() {
        let stats = Arc::new(StatsCounters::default());
        let mut pool = HandlerPool::new(2, stats);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                TaskOutcome::Succeeded
            })
            .await;
        }
        pool.drain(Duration::from_secs(5)).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_on_stuck_handlers() {
        let stats = Arc::new(StatsCounters::default());
        let mut pool = HandlerPool::new(0, stats);

        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            TaskOutcome::Succeeded
        })
        .await;

        let err = pool.drain(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ShutdownTimeout { timeout_secs: 1 }));
    }
}
